//! JUnit XML report generation.
//!
//! Writes one file per test class, `TEST-<class>.xml`, in the layout that
//! surefire produces, so CI systems pick the results up unchanged:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites name="robovm-tests" tests="2" failures="1" skipped="0" time="0.412">
//!   <testsuite name="com.example.FooTest" tests="2" failures="1" errors="0" skipped="0" time="0.412" timestamp="2024-07-13T06:29:52">
//!     <testcase classname="com.example.FooTest" name="testA" time="0.101"/>
//!     <testcase classname="com.example.FooTest" name="testB" time="0.311">
//!       <failure message="boom" type="java.lang.AssertionError">java.lang.AssertionError: boom
//!   at com.example.FooTest.testB(FooTest.java:12)</failure>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::protocol::{Description, FailureInfo};
use crate::relay::{RunListener, RunResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum CaseOutcome {
    Passed,
    Failed { message: Option<String>, trace: String },
    Skipped { message: Option<String> },
}

#[derive(Debug, Clone)]
struct CaseRecord {
    name: String,
    time: Duration,
    outcome: CaseOutcome,
}

#[derive(Debug, Clone)]
struct SuiteRecord {
    timestamp: DateTime<Utc>,
    cases: Vec<CaseRecord>,
}

#[derive(Default)]
struct Collected {
    suites: BTreeMap<String, SuiteRecord>,
    running: HashMap<String, Instant>,
}

impl Collected {
    fn record(&mut self, description: &Description, outcome: CaseOutcome) {
        let time = self
            .running
            .remove(&description.display_name)
            .map(|start| start.elapsed())
            .unwrap_or_default();
        let name = description
            .method_name()
            .unwrap_or(&description.display_name)
            .to_string();
        self.suites
            .entry(description.class_name().to_string())
            .or_insert_with(|| SuiteRecord {
                timestamp: Utc::now(),
                cases: Vec::new(),
            })
            .cases
            .push(CaseRecord { name, time, outcome });
    }
}

/// Writes JUnit XML files when the run completes.
///
/// # Example
///
/// ```
/// use robovm_test::report::JUnitReporter;
///
/// let reporter = JUnitReporter::new("target/robovm-test-reports".into())
///     .with_testsuite_name("device-tests");
/// ```
pub struct JUnitReporter {
    output_dir: PathBuf,
    testsuite_name: String,
    collected: Mutex<Collected>,
}

impl JUnitReporter {
    pub fn new(output_dir: PathBuf) -> Self {
        Self {
            output_dir,
            testsuite_name: "robovm-tests".to_string(),
            collected: Mutex::new(Collected::default()),
        }
    }

    /// Sets the name of the `<testsuites>` element.
    pub fn with_testsuite_name(mut self, name: impl Into<String>) -> Self {
        self.testsuite_name = name.into();
        self
    }

    fn with_collected<T>(&self, f: impl FnOnce(&mut Collected) -> T) -> T {
        let mut collected = self
            .collected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut collected)
    }

    /// Classes seen so far, sorted.
    pub fn classes(&self) -> Vec<String> {
        self.with_collected(|c| c.suites.keys().cloned().collect())
    }

    /// Path of the report for `class_name`.
    pub fn report_path(&self, class_name: &str) -> PathBuf {
        self.output_dir.join(format!("TEST-{}.xml", class_name))
    }

    /// JUnit XML for one class.
    pub fn generate_xml(&self, class_name: &str) -> anyhow::Result<String> {
        let suite = self
            .with_collected(|c| c.suites.get(class_name).cloned())
            .with_context(|| format!("No results recorded for {}", class_name))?;
        self.suite_xml(class_name, &suite)
    }

    fn suite_xml(&self, class_name: &str, suite: &SuiteRecord) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let tests = suite.cases.len();
        let failures = suite
            .cases
            .iter()
            .filter(|c| matches!(c.outcome, CaseOutcome::Failed { .. }))
            .count();
        let skipped = suite
            .cases
            .iter()
            .filter(|c| matches!(c.outcome, CaseOutcome::Skipped { .. }))
            .count();
        let time: Duration = suite.cases.iter().map(|c| c.time).sum();
        let time = format!("{:.3}", time.as_secs_f64());

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("name", self.testsuite_name.as_str()));
        testsuites.push_attribute(("tests", tests.to_string().as_str()));
        testsuites.push_attribute(("failures", failures.to_string().as_str()));
        testsuites.push_attribute(("skipped", skipped.to_string().as_str()));
        testsuites.push_attribute(("time", time.as_str()));
        writer.write_event(Event::Start(testsuites))?;

        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", class_name));
        testsuite.push_attribute(("tests", tests.to_string().as_str()));
        testsuite.push_attribute(("failures", failures.to_string().as_str()));
        testsuite.push_attribute(("errors", "0"));
        testsuite.push_attribute(("skipped", skipped.to_string().as_str()));
        testsuite.push_attribute(("time", time.as_str()));
        testsuite.push_attribute((
            "timestamp",
            suite.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string().as_str(),
        ));
        writer.write_event(Event::Start(testsuite))?;

        for case in &suite.cases {
            write_testcase(&mut writer, class_name, case)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }

    fn write_reports(&self) -> anyhow::Result<usize> {
        let suites = self.with_collected(|c| c.suites.clone());
        if suites.is_empty() {
            return Ok(0);
        }
        std::fs::create_dir_all(&self.output_dir).with_context(|| {
            format!("Failed to create report directory: {}", self.output_dir.display())
        })?;
        for (class_name, suite) in &suites {
            let xml = self.suite_xml(class_name, suite)?;
            let path = self.report_path(class_name);
            std::fs::write(&path, xml)
                .with_context(|| format!("Failed to write JUnit XML: {}", path.display()))?;
        }
        Ok(suites.len())
    }
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    class_name: &str,
    case: &CaseRecord,
) -> anyhow::Result<()> {
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", class_name));
    testcase.push_attribute(("name", case.name.as_str()));
    testcase.push_attribute(("time", format!("{:.3}", case.time.as_secs_f64()).as_str()));

    match &case.outcome {
        CaseOutcome::Passed => {
            writer.write_event(Event::Empty(testcase))?;
        }
        CaseOutcome::Failed { message, trace } => {
            writer.write_event(Event::Start(testcase))?;

            let mut failure = BytesStart::new("failure");
            if let Some(msg) = message {
                failure.push_attribute(("message", sanitize(msg).as_str()));
            }
            failure.push_attribute(("type", exception_type(trace)));
            writer.write_event(Event::Start(failure))?;
            writer.write_event(Event::Text(BytesText::new(&sanitize(trace))))?;
            writer.write_event(Event::End(BytesEnd::new("failure")))?;

            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
        CaseOutcome::Skipped { message } => {
            writer.write_event(Event::Start(testcase))?;
            let mut skipped = BytesStart::new("skipped");
            if let Some(msg) = message {
                skipped.push_attribute(("message", sanitize(msg).as_str()));
            }
            writer.write_event(Event::Empty(skipped))?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
    }
    Ok(())
}

/// The exception class at the head of a Java stack trace.
fn exception_type(trace: &str) -> &str {
    let head = trace.lines().next().unwrap_or("");
    let head = head.split(':').next().unwrap_or("").trim();
    if head.is_empty() || head.contains(' ') {
        "java.lang.AssertionError"
    } else {
        head
    }
}

/// Drops characters that are not allowed in XML 1.0.
fn sanitize(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

#[async_trait]
impl RunListener for JUnitReporter {
    async fn test_started(&self, description: &Description) -> anyhow::Result<()> {
        self.with_collected(|c| {
            c.running
                .insert(description.display_name.clone(), Instant::now())
        });
        Ok(())
    }

    async fn test_finished(&self, description: &Description) -> anyhow::Result<()> {
        self.with_collected(|c| c.record(description, CaseOutcome::Passed));
        Ok(())
    }

    async fn test_failure(&self, failure: &FailureInfo) -> anyhow::Result<()> {
        let outcome = CaseOutcome::Failed {
            message: failure.message.clone(),
            trace: failure.trace.clone(),
        };
        self.with_collected(|c| c.record(&failure.description, outcome));
        Ok(())
    }

    async fn test_assumption_failure(&self, failure: &FailureInfo) -> anyhow::Result<()> {
        let outcome = CaseOutcome::Skipped {
            message: failure.message.clone(),
        };
        self.with_collected(|c| c.record(&failure.description, outcome));
        Ok(())
    }

    async fn test_ignored(&self, description: &Description) -> anyhow::Result<()> {
        self.with_collected(|c| c.record(description, CaseOutcome::Skipped { message: None }));
        Ok(())
    }

    async fn run_complete(&self, _result: &RunResult) -> anyhow::Result<()> {
        let written = self.write_reports()?;
        if written > 0 {
            tracing::info!(
                "JUnit XML for {} classes written to: {}",
                written,
                self.output_dir.display()
            );
        }
        Ok(())
    }
}
