//! Rendering of run results.

use crate::matcher::MAX_DIFF_PAIRS;
use crate::runner::{BlockResult, FileResult, Outcome, SuiteResult};
use clap::ValueEnum;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output with checkmarks
    #[default]
    Human,
    /// Machine-readable JSON output
    Json,
    /// JUnit XML output for CI systems
    Junit,
}

pub fn render(
    format: OutputFormat,
    suite: &SuiteResult,
    verbose: bool,
) -> Result<String, serde_json::Error> {
    Ok(match format {
        OutputFormat::Human => format_human(suite, verbose),
        OutputFormat::Json => format_json(suite)?,
        OutputFormat::Junit => format_junit_xml(suite),
    })
}

fn mark(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Pass => "✓",
        Outcome::Fail => "✗",
        Outcome::Skip => "-",
        Outcome::Cancelled => "!",
    }
}

fn indent(text: &str, prefix: &str) -> String {
    text.lines()
        .map(|l| format!("{prefix}{l}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn write_block(out: &mut String, block: &BlockResult, verbose: bool) {
    let _ = write!(
        out,
        "  {} {} ({:.2?})",
        mark(block.outcome),
        block.name,
        block.duration
    );
    match (&block.reason, block.outcome) {
        (Some(reason), Outcome::Skip) if verbose => {
            let _ = write!(out, " skipped: {reason}");
        }
        (_, Outcome::Cancelled) => out.push_str(" cancelled"),
        _ => {}
    }
    out.push('\n');
}

fn write_failure(out: &mut String, file: &FileResult, block: &BlockResult) {
    let _ = writeln!(
        out,
        "{} › {} [{}] (line {})",
        file.path.display(),
        block.name,
        block.kind,
        block.line
    );
    for failure in &block.failures {
        let _ = writeln!(out, "{}", indent(failure, "    "));
    }
    for diff in &block.diffs {
        let _ = writeln!(out, "{}", indent(&diff.render(MAX_DIFF_PAIRS), "    "));
    }
}

/// Per-file listing followed by the failure details and the totals.
pub fn format_human(suite: &SuiteResult, verbose: bool) -> String {
    let mut out = String::new();
    if verbose {
        let _ = writeln!(
            out,
            "shell version: {}",
            suite.version.as_deref().unwrap_or("unknown")
        );
    }
    for error in &suite.errors {
        let _ = writeln!(out, "✗ {error}");
    }

    for file in &suite.files {
        let _ = writeln!(out, "\n{}", file.path.display());
        for block in &file.blocks {
            write_block(&mut out, block, verbose);
        }
        for error in &file.errors {
            let _ = writeln!(out, "  ✗ {error}");
        }
        for error in &file.teardown_errors {
            let _ = writeln!(out, "  teardown: {error}");
        }
    }
    for error in &suite.teardown_errors {
        let _ = writeln!(out, "\nsuite teardown: {error}");
    }

    let failed: Vec<_> = suite
        .files
        .iter()
        .flat_map(|f| f.blocks.iter().map(move |b| (f, b)))
        .filter(|(_, b)| b.outcome == Outcome::Fail)
        .collect();
    if !failed.is_empty() {
        out.push_str("\nFailures:\n\n");
        for (file, block) in failed {
            write_failure(&mut out, file, block);
        }
    }

    let counts = suite.counts();
    let _ = write!(
        out,
        "\n{} passed, {} failed, {} skipped",
        counts.passed, counts.failed, counts.skipped
    );
    if counts.cancelled > 0 {
        let _ = write!(out, ", {} cancelled", counts.cancelled);
    }
    if counts.teardown_errors > 0 {
        let _ = write!(out, ", {} teardown errors", counts.teardown_errors);
    }
    let _ = writeln!(out, " ({:.2?})", suite.duration);
    if suite.interrupted {
        out.push_str("interrupted\n");
    }
    out
}

pub fn format_json(suite: &SuiteResult) -> Result<String, serde_json::Error> {
    let counts = suite.counts();
    let output = serde_json::json!({
        "passed": counts.passed,
        "failed": counts.failed,
        "skipped": counts.skipped,
        "cancelled": counts.cancelled,
        "teardown_errors": counts.teardown_errors,
        "interrupted": suite.interrupted,
        "version": suite.version,
        "errors": suite.errors,
        "results": suite.files,
    });
    serde_json::to_string_pretty(&output)
}

/// One `<testsuite>` per file, one `<testcase>` per block. File-level
/// errors become a synthetic `<file>` testcase.
pub fn format_junit_xml(suite: &SuiteResult) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");

    let counts = suite.counts();
    let total_tests: usize = suite
        .files
        .iter()
        .map(|f| f.blocks.len() + usize::from(!f.errors.is_empty()))
        .sum::<usize>()
        + usize::from(!suite.errors.is_empty());
    let _ = writeln!(
        xml,
        "<testsuites tests=\"{total_tests}\" failures=\"{}\" skipped=\"{}\" time=\"{:.3}\">",
        counts.failed,
        counts.skipped,
        suite.duration.as_secs_f64()
    );

    if !suite.errors.is_empty() {
        xml.push_str("  <testsuite name=\"suite\" tests=\"1\" failures=\"1\" skipped=\"0\" time=\"0.000\">\n");
        write_error_case(&mut xml, "<setup>", &suite.errors);
        xml.push_str("  </testsuite>\n");
    }

    for file in &suite.files {
        let tests = file.blocks.len() + usize::from(!file.errors.is_empty());
        let failures = file.count(Outcome::Fail) + usize::from(!file.errors.is_empty());
        let skipped = file.count(Outcome::Skip) + file.count(Outcome::Cancelled);
        let _ = writeln!(
            xml,
            "  <testsuite name=\"{}\" tests=\"{tests}\" failures=\"{failures}\" skipped=\"{skipped}\" time=\"{:.3}\">",
            escape_xml(&file.path.display().to_string()),
            file.duration.as_secs_f64()
        );

        for block in &file.blocks {
            let _ = writeln!(
                xml,
                "    <testcase name=\"{}\" classname=\"{}\" time=\"{:.3}\">",
                escape_xml(&block.name),
                escape_xml(&file.path.display().to_string()),
                block.duration.as_secs_f64()
            );
            match block.outcome {
                Outcome::Pass => {}
                Outcome::Fail => {
                    let message = block
                        .failures
                        .first()
                        .and_then(|s| s.lines().next())
                        .unwrap_or("Block failed");
                    let _ = writeln!(xml, "      <failure message=\"{}\">", escape_xml(message));
                    for failure in &block.failures {
                        let _ = writeln!(xml, "{}", escape_xml(failure));
                    }
                    for diff in &block.diffs {
                        let _ = writeln!(xml, "{}", escape_xml(&diff.render(MAX_DIFF_PAIRS)));
                    }
                    xml.push_str("      </failure>\n");
                }
                Outcome::Skip | Outcome::Cancelled => {
                    let reason = block.reason.as_deref().unwrap_or("skipped");
                    let _ = writeln!(xml, "      <skipped message=\"{}\"/>", escape_xml(reason));
                }
            }
            xml.push_str("    </testcase>\n");
        }
        if !file.errors.is_empty() {
            write_error_case(&mut xml, "<file>", &file.errors);
        }
        if !file.teardown_errors.is_empty() {
            let _ = writeln!(
                xml,
                "    <system-err>{}</system-err>",
                escape_xml(&file.teardown_errors.join("\n"))
            );
        }

        xml.push_str("  </testsuite>\n");
    }

    xml.push_str("</testsuites>\n");
    xml
}

fn write_error_case(xml: &mut String, name: &str, errors: &[String]) {
    let _ = writeln!(xml, "    <testcase name=\"{}\" time=\"0.000\">", escape_xml(name));
    let message = errors.first().map(String::as_str).unwrap_or("error");
    let _ = writeln!(xml, "      <failure message=\"{}\">", escape_xml(message));
    for error in errors {
        let _ = writeln!(xml, "{}", escape_xml(error));
    }
    xml.push_str("      </failure>\n");
    xml.push_str("    </testcase>\n");
}

/// Escape special XML characters.
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
