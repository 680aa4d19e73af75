//! Relaying remote lifecycle events to listeners.
//!
//! Every inbound [`LifecycleEvent`] goes through [`ResultRelay::on_event`],
//! which first updates the shared [`RunTally`] and then calls the matching
//! [`RunListener`] method. Listener errors are logged and never stop the
//! relay; events are neither reordered nor coalesced.
//!
//! # Bookkeeping
//!
//! | Event | Effect on the tally |
//! |-------|---------------------|
//! | `RunStarted` | opens a run |
//! | `Started` | opens the test |
//! | `Finished` | closes the test, `total += 1` |
//! | `Failed` | closes the test, `total += 1`, `failures += 1` |
//! | `AssumptionFailed` | closes the test, `skipped += 1` |
//! | `Ignored` | `skipped += 1` |
//! | `RunFinished` | closes the run |
//!
//! A `Failed` for a class that was never started is a whole-run failure
//! (for example a class that could not be initialized) and still counts.
//! A `Failed` for a single test method that was never started is a violation.
//! Anything else out of order is recorded as a violation and surfaces as a
//! test mechanism failure when the run is finalized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::protocol::{Description, FailureInfo, LifecycleEvent, RunSummary};

/// Receives run notifications, one method per event kind.
///
/// All methods default to doing nothing.
#[async_trait]
pub trait RunListener: Send + Sync {
    async fn run_started(&self, _description: &Description) -> anyhow::Result<()> {
        Ok(())
    }

    async fn test_started(&self, _description: &Description) -> anyhow::Result<()> {
        Ok(())
    }

    async fn test_finished(&self, _description: &Description) -> anyhow::Result<()> {
        Ok(())
    }

    async fn test_failure(&self, _failure: &FailureInfo) -> anyhow::Result<()> {
        Ok(())
    }

    async fn test_assumption_failure(&self, _failure: &FailureInfo) -> anyhow::Result<()> {
        Ok(())
    }

    async fn test_ignored(&self, _description: &Description) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run_finished(&self, _summary: &RunSummary) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once when the whole run is over, whether it passed, failed or aborted.
    async fn run_complete(&self, _result: &RunResult) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Calls the listener method matching `event`.
pub async fn dispatch(listener: &dyn RunListener, event: &LifecycleEvent) -> anyhow::Result<()> {
    match event {
        LifecycleEvent::RunStarted(d) => listener.run_started(d).await,
        LifecycleEvent::Started(d) => listener.test_started(d).await,
        LifecycleEvent::Finished(d) => listener.test_finished(d).await,
        LifecycleEvent::Failed(f) => listener.test_failure(f).await,
        LifecycleEvent::AssumptionFailed(f) => listener.test_assumption_failure(f).await,
        LifecycleEvent::Ignored(d) => listener.test_ignored(d).await,
        LifecycleEvent::RunFinished(s) => listener.run_finished(s).await,
    }
}

/// A listener that ignores everything.
pub struct NullListener;

#[async_trait]
impl RunListener for NullListener {}

/// Fans out to several listeners in registration order.
///
/// Every listener is called even if an earlier one fails; the first error is returned.
#[derive(Default)]
pub struct MultiListener {
    listeners: Vec<Arc<dyn RunListener>>,
}

impl MultiListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener<L: RunListener + 'static>(mut self, listener: L) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn with_shared(mut self, listener: Arc<dyn RunListener>) -> Self {
        self.listeners.push(listener);
        self
    }
}

fn keep_first(acc: &mut anyhow::Result<()>, next: anyhow::Result<()>) {
    if acc.is_ok() {
        *acc = next;
    }
}

#[async_trait]
impl RunListener for MultiListener {
    async fn run_started(&self, description: &Description) -> anyhow::Result<()> {
        let mut result = Ok(());
        for l in &self.listeners {
            keep_first(&mut result, l.run_started(description).await);
        }
        result
    }

    async fn test_started(&self, description: &Description) -> anyhow::Result<()> {
        let mut result = Ok(());
        for l in &self.listeners {
            keep_first(&mut result, l.test_started(description).await);
        }
        result
    }

    async fn test_finished(&self, description: &Description) -> anyhow::Result<()> {
        let mut result = Ok(());
        for l in &self.listeners {
            keep_first(&mut result, l.test_finished(description).await);
        }
        result
    }

    async fn test_failure(&self, failure: &FailureInfo) -> anyhow::Result<()> {
        let mut result = Ok(());
        for l in &self.listeners {
            keep_first(&mut result, l.test_failure(failure).await);
        }
        result
    }

    async fn test_assumption_failure(&self, failure: &FailureInfo) -> anyhow::Result<()> {
        let mut result = Ok(());
        for l in &self.listeners {
            keep_first(&mut result, l.test_assumption_failure(failure).await);
        }
        result
    }

    async fn test_ignored(&self, description: &Description) -> anyhow::Result<()> {
        let mut result = Ok(());
        for l in &self.listeners {
            keep_first(&mut result, l.test_ignored(description).await);
        }
        result
    }

    async fn run_finished(&self, summary: &RunSummary) -> anyhow::Result<()> {
        let mut result = Ok(());
        for l in &self.listeners {
            keep_first(&mut result, l.run_finished(summary).await);
        }
        result
    }

    async fn run_complete(&self, run: &RunResult) -> anyhow::Result<()> {
        let mut result = Ok(());
        for l in &self.listeners {
            keep_first(&mut result, l.run_complete(run).await);
        }
        result
    }
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    pub start_time: Option<DateTime<Utc>>,
    pub duration: Duration,
    /// Finished plus failed tests.
    pub total: usize,
    pub failures: usize,
    /// Ignored tests and failed assumptions.
    pub skipped: usize,
    /// Display names of failed tests, in order.
    pub failed_tests: Vec<String>,
    /// Remote runs that reported completion.
    pub completed_runs: usize,
}

impl RunResult {
    pub fn passed(&self) -> usize {
        self.total - self.failures
    }

    pub fn success(&self) -> bool {
        self.failures == 0
    }
}

/// Accumulates a [`RunResult`] and checks event ordering.
#[derive(Debug)]
pub struct RunTally {
    result: RunResult,
    started_at: Instant,
    in_run: bool,
    open: HashMap<String, usize>,
    started: usize,
    closed: usize,
    violations: Vec<String>,
}

impl Default for RunTally {
    fn default() -> Self {
        Self::new()
    }
}

impl RunTally {
    pub fn new() -> Self {
        Self {
            result: RunResult {
                start_time: Some(Utc::now()),
                ..RunResult::default()
            },
            started_at: Instant::now(),
            in_run: false,
            open: HashMap::new(),
            started: 0,
            closed: 0,
            violations: Vec::new(),
        }
    }

    fn violation(&mut self, msg: String) {
        warn!("{}", msg);
        self.violations.push(msg);
    }

    fn close(&mut self, name: &str) -> bool {
        match self.open.get_mut(name) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    self.open.remove(name);
                }
                self.closed += 1;
                true
            }
            None => false,
        }
    }

    pub fn record(&mut self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::RunStarted(_) => {
                if self.in_run {
                    self.violation("Run started while another run is active".to_string());
                }
                self.in_run = true;
            }
            LifecycleEvent::Started(d) => {
                if !self.in_run {
                    self.violation(format!("{} started outside of a run", d.display_name));
                }
                self.started += 1;
                *self.open.entry(d.display_name.clone()).or_default() += 1;
            }
            LifecycleEvent::Finished(d) => {
                if !self.close(&d.display_name) {
                    self.violation(format!("{} finished without being started", d.display_name));
                }
                self.result.total += 1;
            }
            LifecycleEvent::Failed(f) => {
                let name = &f.description.display_name;
                if !self.close(name) {
                    if f.description.method_name().is_some() {
                        self.violation(format!("{} failed without being started", name));
                    } else {
                        debug!("Failure of {} counted as a whole-run failure", name);
                    }
                }
                self.result.total += 1;
                self.result.failures += 1;
                self.result.failed_tests.push(name.clone());
            }
            LifecycleEvent::AssumptionFailed(f) => {
                self.close(&f.description.display_name);
                self.result.skipped += 1;
            }
            LifecycleEvent::Ignored(_) => self.result.skipped += 1,
            LifecycleEvent::RunFinished(_) => {
                self.in_run = false;
                self.result.completed_runs += 1;
            }
        }
    }

    /// Counts so far, with the elapsed time filled in.
    pub fn snapshot(&self) -> RunResult {
        RunResult {
            duration: self.started_at.elapsed(),
            ..self.result.clone()
        }
    }

    /// Final result, or the bookkeeping problem that invalidates it.
    pub fn finish(&self) -> Result<RunResult, String> {
        if let Some(first) = self.violations.first() {
            return Err(first.clone());
        }
        if self.started != self.closed {
            let mut open: Vec<&String> = self.open.keys().collect();
            open.sort();
            return Err(format!(
                "{} tests started but {} ended (still open: {:?})",
                self.started, self.closed, open
            ));
        }
        Ok(self.snapshot())
    }
}

/// Forwards events to a listener while keeping the tally.
#[derive(Clone)]
pub struct ResultRelay {
    listener: Arc<dyn RunListener>,
    tally: Arc<Mutex<RunTally>>,
}

impl ResultRelay {
    pub fn new(listener: Arc<dyn RunListener>) -> Self {
        Self {
            listener,
            tally: Arc::new(Mutex::new(RunTally::new())),
        }
    }

    fn with_tally<T>(&self, f: impl FnOnce(&mut RunTally) -> T) -> T {
        let mut tally = self.tally.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut tally)
    }

    /// Records `event` and hands it to the listener.
    pub async fn on_event(&self, event: &LifecycleEvent) {
        self.with_tally(|t| t.record(event));
        if let Err(e) = dispatch(self.listener.as_ref(), event).await {
            warn!("Listener failed on {:?}: {:#}", event.result_type(), e);
        }
    }

    pub fn snapshot(&self) -> RunResult {
        self.with_tally(|t| t.snapshot())
    }

    pub fn finish(&self) -> Result<RunResult, String> {
        self.with_tally(|t| t.finish())
    }

    /// Tells the listener the run is over.
    pub async fn complete(&self, result: &RunResult) {
        if let Err(e) = self.listener.run_complete(result).await {
            warn!("Listener failed to complete the run: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn foo(method: &str) -> Description {
        Description::test("com.example.FooTest", method)
    }

    fn scripted_run() -> Vec<LifecycleEvent> {
        vec![
            LifecycleEvent::RunStarted(Description::new("com.example.FooTest")),
            LifecycleEvent::Started(foo("testA")),
            LifecycleEvent::Finished(foo("testA")),
            LifecycleEvent::Started(foo("testB")),
            LifecycleEvent::Failed(FailureInfo::new(foo("testB"), "boom", "java.lang.AssertionError: boom")),
            LifecycleEvent::Ignored(foo("testC")),
            LifecycleEvent::RunFinished(RunSummary::default()),
        ]
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RunListener for Recorder {
        async fn test_started(&self, d: &Description) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(format!("start {}", d.display_name));
            Ok(())
        }

        async fn test_failure(&self, f: &FailureInfo) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(format!("fail {}", f.description.display_name));
            Ok(())
        }
    }

    struct Exploding {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RunListener for Exploding {
        async fn test_started(&self, _d: &Description) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("reporter crashed")
        }
    }

    #[test]
    fn test_tally_counts() {
        let mut tally = RunTally::new();
        for event in scripted_run() {
            tally.record(&event);
        }
        let result = tally.finish().unwrap();
        assert_eq!(result.total, 2);
        assert_eq!(result.failures, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.passed(), 1);
        assert_eq!(result.failed_tests, vec!["testB(com.example.FooTest)"]);
        assert_eq!(result.completed_runs, 1);
    }

    #[test]
    fn test_total_matches_finished_plus_failed() {
        let mut tally = RunTally::new();
        tally.record(&LifecycleEvent::RunStarted(Description::default()));
        let mut finished = 0;
        let mut failed = 0;
        for i in 0..20 {
            let d = foo(&format!("test{}", i));
            tally.record(&LifecycleEvent::Started(d.clone()));
            if i % 3 == 0 {
                failed += 1;
                tally.record(&LifecycleEvent::Failed(FailureInfo::new(d, "x", "")));
            } else {
                finished += 1;
                tally.record(&LifecycleEvent::Finished(d));
            }
        }
        let result = tally.finish().unwrap();
        assert_eq!(result.total, finished + failed);
        assert_eq!(result.failures, failed);
    }

    #[test]
    fn test_whole_run_failure_is_not_a_violation() {
        let mut tally = RunTally::new();
        tally.record(&LifecycleEvent::RunStarted(Description::default()));
        tally.record(&LifecycleEvent::Failed(FailureInfo::new(
            Description::new("com.example.BrokenTest"),
            "initializationError",
            "",
        )));
        let result = tally.finish().unwrap();
        assert_eq!((result.total, result.failures), (1, 1));
    }

    #[test]
    fn test_unbalanced_events_are_violations() {
        let mut tally = RunTally::new();
        tally.record(&LifecycleEvent::Started(foo("testA")));
        assert!(tally.finish().unwrap_err().contains("outside of a run"));

        let mut tally = RunTally::new();
        tally.record(&LifecycleEvent::RunStarted(Description::default()));
        tally.record(&LifecycleEvent::Finished(foo("ghost")));
        assert!(tally.finish().unwrap_err().contains("without being started"));

        let mut tally = RunTally::new();
        tally.record(&LifecycleEvent::RunStarted(Description::default()));
        tally.record(&LifecycleEvent::Failed(FailureInfo::new(foo("testX"), "boom", "")));
        let err = tally.finish().unwrap_err();
        assert!(err.contains("testX(com.example.FooTest) failed without being started"));
        assert_eq!(tally.snapshot().failures, 1);

        let mut tally = RunTally::new();
        tally.record(&LifecycleEvent::RunStarted(Description::default()));
        tally.record(&LifecycleEvent::Started(foo("testA")));
        let err = tally.finish().unwrap_err();
        assert!(err.contains("1 tests started but 0 ended"));
        // The partial counts remain available.
        assert_eq!(tally.snapshot().total, 0);
    }

    #[tokio::test]
    async fn test_relay_preserves_order() {
        let recorder = Arc::new(Recorder::default());
        let relay = ResultRelay::new(recorder.clone());
        for event in scripted_run() {
            relay.on_event(&event).await;
        }
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![
                "start testA(com.example.FooTest)",
                "start testB(com.example.FooTest)",
                "fail testB(com.example.FooTest)",
            ]
        );
        assert_eq!(relay.finish().unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_listener_errors_do_not_stop_relay() {
        let exploding = Arc::new(Exploding {
            calls: AtomicUsize::new(0),
        });
        let recorder = Arc::new(Recorder::default());
        let multi = MultiListener::new()
            .with_shared(exploding.clone())
            .with_shared(recorder.clone());
        let relay = ResultRelay::new(Arc::new(multi));

        for event in scripted_run() {
            relay.on_event(&event).await;
        }
        assert_eq!(exploding.calls.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.seen.lock().unwrap().len(), 3);
        let result = relay.finish().unwrap();
        assert_eq!((result.total, result.failures), (2, 1));
    }
}
