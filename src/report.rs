//! Console output and JUnit XML reports.
//!
//! Both reporters are [`RunListener`]s; the CLI fans events out to them
//! through a [`MultiListener`](crate::relay::MultiListener).

pub mod junit;

pub use junit::JUnitReporter;

use std::sync::Mutex;

use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::RunFailure;
use crate::protocol::{Description, FailureInfo};
use crate::relay::{RunListener, RunResult};

/// Prints one line per finished test above a spinner.
///
/// Passing tests are only listed in verbose mode.
pub struct ConsoleReporter {
    progress: Mutex<Option<ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn line(&self, text: String) {
        let progress = self
            .progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match progress.as_ref() {
            Some(pb) => pb.println(text),
            None => println!("{}", text),
        }
    }

    fn tick(&self, message: &str) {
        let progress = self
            .progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(pb) = progress.as_ref() {
            pb.inc(1);
            pb.set_message(message.to_string());
        }
    }
}

#[async_trait]
impl RunListener for ConsoleReporter {
    async fn run_started(&self, description: &Description) -> anyhow::Result<()> {
        let mut progress = self
            .progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if progress.is_none() {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) =
                ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {pos} tests {msg}")
            {
                pb.set_style(style);
            }
            pb.enable_steady_tick(std::time::Duration::from_millis(120));
            *progress = Some(pb);
        }
        if self.verbose {
            if let Some(pb) = progress.as_ref() {
                pb.println(format!("Running: {}", description.display_name));
            }
        }
        Ok(())
    }

    async fn test_finished(&self, description: &Description) -> anyhow::Result<()> {
        if self.verbose {
            self.line(format!(
                "{} {}",
                console::style("PASS").green(),
                description.display_name
            ));
        }
        self.tick(&description.display_name);
        Ok(())
    }

    async fn test_failure(&self, failure: &FailureInfo) -> anyhow::Result<()> {
        self.line(format!(
            "{} {}",
            console::style("FAIL").red(),
            failure.description.display_name
        ));
        if let Some(msg) = &failure.message {
            self.line(format!("     {}", console::style(msg).dim()));
        }
        self.tick(&failure.description.display_name);
        Ok(())
    }

    async fn test_assumption_failure(&self, failure: &FailureInfo) -> anyhow::Result<()> {
        self.line(format!(
            "{} {}",
            console::style("SKIP").yellow(),
            failure.description.display_name
        ));
        Ok(())
    }

    async fn test_ignored(&self, description: &Description) -> anyhow::Result<()> {
        self.line(format!(
            "{} {}",
            console::style("SKIP").yellow(),
            description.display_name
        ));
        Ok(())
    }

    async fn run_complete(&self, result: &RunResult) -> anyhow::Result<()> {
        if let Some(pb) = self
            .progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            pb.finish_and_clear();
        }
        print_summary(result);
        Ok(())
    }
}

/// Prints the pass/fail counts of a run.
pub fn print_summary(result: &RunResult) {
    println!();
    println!("Test Results:");
    println!("  Total:   {}", result.total);
    println!("  Passed:  {}", console::style(result.passed()).green());
    println!("  Failed:  {}", console::style(result.failures).red());
    println!("  Skipped: {}", console::style(result.skipped).yellow());
    println!("  Duration: {:?}", result.duration);

    if !result.failed_tests.is_empty() {
        println!();
        println!("Failed tests:");
        for name in &result.failed_tests {
            println!("  {}", console::style(name).red());
        }
    }

    println!();
    if result.total == 0 && result.skipped == 0 {
        println!("{}", console::style("No tests were run.").yellow().bold());
    } else if result.success() {
        println!("{}", console::style("All tests passed!").green().bold());
    } else {
        println!("{}", console::style("Some tests failed.").red().bold());
    }
}

/// Prints an aborted run: the cause and the counts collected before it.
pub fn print_failure(failure: &RunFailure) {
    eprintln!();
    eprintln!(
        "{} {}",
        console::style("Run aborted:").red().bold(),
        failure.error
    );
    if failure.partial.total > 0 || failure.partial.skipped > 0 {
        eprintln!(
            "  {} tests, {} failures before abort",
            failure.partial.total, failure.partial.failures
        );
    }
}
