//! Console output for test runs

use colored::{ColoredString, Colorize};

use trpc_common::invoker::{CallOutcome, InvokeStats};
use trpc_common::syntax::TestMeta;
use trpc_common::{Diagnostic, Error, Invoke, RunObserver, RunOutcome, RunReport, Severity, SourceExcerpt};

const BANNER: &str = "===========================";

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("⚠️  {}", message);
}

/// Print info message
pub fn print_info(message: &str) {
    println!("ℹ️  {}", message);
}

fn paint(severity: Severity, text: &str) -> ColoredString {
    match severity {
        Severity::Panic => text.red(),
        Severity::Warn => text.yellow(),
        Severity::Ignore => text.dimmed(),
    }
}

fn sign(severity: Severity) -> &'static str {
    match severity {
        Severity::Panic => "⛔",
        Severity::Warn => "⚠️",
        Severity::Ignore => "❕",
    }
}

/// Failed expectation, colored by severity
pub fn render_diagnostic(diagnostic: &Diagnostic) -> String {
    let severity = diagnostic.severity;
    let mut lines = vec![
        paint(severity, &format!("Test \"{}\" failed !  {}", diagnostic.test_name, sign(severity))).to_string(),
        paint(severity, &format!("Description: {}", diagnostic.description)).to_string(),
    ];
    if let Some(goal) = diagnostic.goal.as_deref().filter(|g| !g.is_empty()) {
        lines.push(paint(severity, &format!("Goal: {goal}")).to_string());
    }
    lines.push(format!("{severity}: {}", diagnostic.message));
    lines.push(diagnostic.excerpt.to_string());
    lines.join("\n")
}

/// Fatal error with the specification line it points at, when known
pub fn render_error(err: &Error, excerpt: Option<&SourceExcerpt>) -> String {
    let heading = match err {
        Error::Syntax { .. } | Error::DuplicateInvoke { .. } | Error::Resolve { .. } => "Something went wrong!",
        Error::UnknownEndpoint { .. } => "Invalid code error :",
        _ => "",
    };
    let mut text = String::new();
    if !heading.is_empty() {
        text.push_str(heading);
        text.push('\n');
    }
    text.push_str(&err.to_string());
    if let Some(excerpt) = excerpt {
        text.push('\n');
        text.push_str(&excerpt.to_string());
    }
    text
}

/// Tally line of a run, when anything was tolerated
pub fn render_summary(report: &RunReport) -> Option<String> {
    (report.warnings + report.ignores > 0).then(|| {
        format!(
            "Test done with {} warning(s) and {} ignore(s)",
            report.warnings, report.ignores
        )
    })
}

/// [`RunObserver`] that prints progress and diagnostics to the terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleReporter;

impl ConsoleReporter {
    pub fn new() -> Self {
        Self
    }
}

impl RunObserver for ConsoleReporter {
    fn run_started(&mut self, meta: &TestMeta) {
        if meta.verbose > 0 {
            print_info(&format!("Running \"{}\": {}", meta.name, meta.description));
        }
    }

    fn invoke_started(&mut self, invoke: &Invoke, _meta: &TestMeta) {
        println!("{BANNER}\ninvoke:  {}", invoke.name());
    }

    fn call_completed(&mut self, invoke: &Invoke, outcome: &CallOutcome, stats: InvokeStats, verbose: i64) {
        if verbose >= 1 {
            println!(
                "{}: sent {} request(s), received {} response(s) ({} / {} in total)",
                invoke.symbol(),
                outcome.requests_sent,
                outcome.responses_received(),
                stats.requests_sent,
                stats.responses_received
            );
        }
        if verbose >= 2 {
            for (key, value) in &outcome.response_headers {
                println!("{} {key}: {value}", "header".dimmed());
            }
            for (key, value) in &outcome.trailers {
                println!("{} {key}: {value}", "trailer".dimmed());
            }
            println!("{}", invoke.response_json);
        }
        if !outcome.status.is_ok() && verbose >= 1 {
            print_warning(&format!("{:?}: {}", outcome.status.code, outcome.status.message));
        }
    }

    fn condition_recorded(&mut self, diagnostic: &Diagnostic) {
        println!("{}", render_diagnostic(diagnostic));
    }

    fn finished(&mut self, report: &RunReport) {
        if let Some(summary) = render_summary(report) {
            println!("{summary}");
        }
        match &report.outcome {
            RunOutcome::Passed => print_success(&format!("All tests passed as expected ({})", report.test_name)),
            RunOutcome::Failed { invoke, .. } => {
                print_error(&format!("Test \"{}\" failed at invoke {}", report.test_name, invoke))
            }
        }
    }
}
