//! Output matcher.
//!
//! Expected bodies are matched line by line as an ordered subsequence of
//! the captured stream: every non-blank expected line must match some
//! captured line after the previous match, and extra captured lines are
//! allowed. Each expected line is compiled into an anchored regex from
//! these tokens:
//!
//! - `[[*]]` matches any run of characters within the line (non-greedy);
//!   an expected line that is only `[[*]]` matches nothing and is skipped,
//!   since extra captured lines are allowed anyway;
//! - `{{a|b}}` matches any one of the alternatives. Alternation binds
//!   outermost: the body between `{{` and the first `}}` is split on `|`
//!   and each alternative is itself tokenized, so `{{[[*]]ok|failed}}` is
//!   valid while nested `{{` is literal text;
//! - `<<<name>>>` is replaced by the literal context value before the
//!   pattern is built, so values never act as wildcards. An undefined
//!   name fails the match.
//!
//! Trailing whitespace is ignored on both sides and CRLF is read as LF.

use crate::context::{Context, ContextError};
use regex::Regex;
use serde::Serialize;
use std::fmt::{self, Write as _};

/// Number of mismatching line pairs kept in a [`Diff`].
pub const MAX_DIFF_PAIRS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
    Var(String),
    Alternation(Vec<Vec<Segment>>),
}

/// One expected line that could not be matched, next to the captured line
/// at which the search started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinePair {
    /// 1-based line inside the expected body.
    pub line: usize,
    pub expected: String,
    pub actual: Option<String>,
}

/// Structured description of a failed match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diff {
    pub stream: String,
    pub message: String,
    /// Number of expected lines that did not match. `pairs` holds at most
    /// [`MAX_DIFF_PAIRS`] of them.
    pub missing: usize,
    pub pairs: Vec<LinePair>,
}

impl Diff {
    fn message(stream: &str, message: impl Into<String>) -> Self {
        Self {
            stream: stream.to_string(),
            message: message.into(),
            missing: 0,
            pairs: Vec::new(),
        }
    }

    /// Render at most `max_pairs` expected/actual pairs.
    pub fn render(&self, max_pairs: usize) -> String {
        let mut out = format!("{}: {}", self.stream, self.message);
        for pair in self.pairs.iter().take(max_pairs) {
            let _ = write!(out, "\n  line {}:", pair.line);
            let _ = write!(out, "\n    expected: {}", pair.expected);
            match &pair.actual {
                Some(actual) => {
                    let _ = write!(out, "\n    actual:   {actual}");
                }
                None => out.push_str("\n    actual:   <end of output>"),
            }
        }
        let shown = self.pairs.len().min(max_pairs);
        if self.missing > shown {
            let _ = write!(out, "\n  ... {} more", self.missing - shown);
        }
        out
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(MAX_DIFF_PAIRS))
    }
}

fn tokenize(text: &str) -> Result<Vec<Segment>, ContextError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = text;

    let flush = |literal: &mut String, segments: &mut Vec<Segment>| {
        if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(literal)));
        }
    };

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("[[*]]") {
            flush(&mut literal, &mut segments);
            segments.push(Segment::Wildcard);
            rest = after;
        } else if let Some(after) = rest.strip_prefix("{{")
            && let Some(end) = after.find("}}")
        {
            flush(&mut literal, &mut segments);
            let alternatives = after[..end]
                .split('|')
                .map(tokenize)
                .collect::<Result<Vec<_>, _>>()?;
            segments.push(Segment::Alternation(alternatives));
            rest = &after[end + 2..];
        } else if let Some(after) = rest.strip_prefix("<<<") {
            let end = after
                .find(">>>")
                .ok_or_else(|| ContextError::Unclosed(rest.to_string()))?;
            flush(&mut literal, &mut segments);
            segments.push(Segment::Var(after[..end].trim().to_string()));
            rest = &after[end + 3..];
        } else {
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                literal.push(c);
            }
            rest = chars.as_str();
        }
    }
    flush(&mut literal, &mut segments);
    Ok(segments)
}

fn to_regex(segments: &[Segment], ctx: &Context, out: &mut String) -> Result<(), ContextError> {
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(&regex::escape(text)),
            Segment::Wildcard => out.push_str("[^\n]*?"),
            Segment::Var(name) => {
                let value = ctx
                    .get(name)
                    .ok_or_else(|| ContextError::Undefined(name.clone()))?;
                out.push_str(&regex::escape(value));
            }
            Segment::Alternation(alternatives) => {
                out.push_str("(?:");
                for (i, alt) in alternatives.iter().enumerate() {
                    if i > 0 {
                        out.push('|');
                    }
                    to_regex(alt, ctx, out)?;
                }
                out.push(')');
            }
        }
    }
    Ok(())
}

/// An expected line compiled against a context.
#[derive(Debug)]
pub struct LinePattern {
    regex: Option<Regex>,
}

impl LinePattern {
    /// Compile `line`. With `anchored` the pattern must cover the whole
    /// captured line; otherwise it may match anywhere.
    pub fn compile(line: &str, ctx: &Context, anchored: bool) -> Result<Self, String> {
        let segments = tokenize(line).map_err(|e| e.to_string())?;
        if anchored && segments == [Segment::Wildcard] {
            return Ok(Self { regex: None });
        }
        let mut pattern = String::new();
        if anchored {
            pattern.push('^');
        }
        to_regex(&segments, ctx, &mut pattern).map_err(|e| e.to_string())?;
        if anchored {
            pattern.push('$');
        }
        let regex = Regex::new(&pattern).map_err(|e| format!("bad pattern {line:?}: {e}"))?;
        Ok(Self { regex: Some(regex) })
    }

    /// True for a line that is only `[[*]]`.
    pub fn is_skip(&self) -> bool {
        self.regex.is_none()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.as_ref().is_none_or(|r| r.is_match(text))
    }
}

/// CRLF to LF and drop trailing whitespace on every line.
fn normalized_lines(text: &str) -> Vec<String> {
    text.replace("\r\n", "\n")
        .lines()
        .map(|l| l.trim_end().to_string())
        .collect()
}

/// Check that every non-blank line of `expected` matches, in order, some
/// line of `captured`.
pub fn check_subsequence(
    stream: &str,
    expected: &str,
    captured: &str,
    ctx: &Context,
) -> Result<(), Diff> {
    let captured_lines = normalized_lines(captured);
    let mut cursor = 0;
    let mut pairs = Vec::new();

    for (idx, line) in normalized_lines(expected).iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let pattern =
            LinePattern::compile(line, ctx, true).map_err(|e| Diff::message(stream, e))?;
        if pattern.is_skip() {
            continue;
        }
        match captured_lines[cursor..]
            .iter()
            .position(|c| pattern.is_match(c))
        {
            Some(offset) => cursor += offset + 1,
            None => pairs.push(LinePair {
                line: idx + 1,
                expected: line.clone(),
                actual: captured_lines.get(cursor).cloned(),
            }),
        }
    }

    if pairs.is_empty() {
        Ok(())
    } else {
        let missing = pairs.len();
        pairs.truncate(MAX_DIFF_PAIRS);
        Err(Diff {
            stream: stream.to_string(),
            message: format!("{missing} expected line(s) not found in order"),
            missing,
            pairs,
        })
    }
}

/// Check the `|stdout` and `||stderr` lines of a substring block. Order
/// does not matter and every substring must occur somewhere in its stream.
pub fn check_contains(body: &str, stdout: &str, stderr: &str, ctx: &Context) -> Result<(), Diff> {
    let stdout = stdout.replace("\r\n", "\n");
    let stderr = stderr.replace("\r\n", "\n");
    let mut pairs = Vec::new();
    let mut missing_streams = Vec::new();

    for (idx, raw) in body.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let (stream, haystack, needle) = if let Some(rest) = line.strip_prefix("||") {
            ("stderr", &stderr, rest.strip_suffix("||").unwrap_or(rest))
        } else if let Some(rest) = line.strip_prefix('|') {
            ("stdout", &stdout, rest.strip_suffix('|').unwrap_or(rest))
        } else {
            return Err(Diff::message(
                "block",
                format!("line {}: expected '|' or '||' prefix in {line:?}", idx + 1),
            ));
        };
        if needle.is_empty() {
            continue;
        }
        let pattern =
            LinePattern::compile(needle, ctx, false).map_err(|e| Diff::message(stream, e))?;
        if !pattern.is_match(haystack) {
            if !missing_streams.contains(&stream) {
                missing_streams.push(stream);
            }
            pairs.push(LinePair {
                line: idx + 1,
                expected: format!("{stream} contains {needle}"),
                actual: haystack.lines().next().map(str::to_string),
            });
        }
    }

    if pairs.is_empty() {
        Ok(())
    } else {
        let missing = pairs.len();
        pairs.truncate(MAX_DIFF_PAIRS);
        Err(Diff {
            stream: missing_streams.join("+"),
            message: format!("{missing} expected substring(s) missing"),
            missing,
            pairs,
        })
    }
}
