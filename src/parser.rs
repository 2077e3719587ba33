//! Expectation parser.
//!
//! Splits an annotated test file into [`Block`]s. Block headers start with
//! the language's comment sigil followed by `@`:
//!
//! ```text
//! #@ name                 code block
//! #@<OUT> name            stdout expectation for the code block `name`
//! #@<ERR> name            stderr expectation
//! #@<PROTOCOL> name       expectation against protocol lines of the shell log
//! #@<> name               setup/teardown code, output not matched
//! #@# name                substring checks (`|stdout`, `||stderr`)
//! #@! deploy 1 k=v        harness directive
//! #@{VER(>=8.0.0)}        guard for the file (before any block) or the next block
//! ```
//!
//! Headers may end with `[USE: other]`, `[OPTIONAL]` and `{guard}`.

use crate::guard::{Guard, GuardError};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// Prelude guard that makes the runner stop at the first failing block.
pub const ABORT_ON_FAIL: &str = "ABORT_ON_FAIL";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unsupported test file extension '{0}' (expected .py, .js or .sql)")]
    UnsupportedLanguage(String),
    #[error("line {line}: {source}")]
    Guard { line: usize, source: GuardError },
    #[error("line {line}: duplicate {kind} block '{name}'")]
    Duplicate {
        line: usize,
        kind: BlockKind,
        name: String,
    },
    #[error("line {line}: {kind} block '{name}' has no preceding code block")]
    Unpaired {
        line: usize,
        kind: BlockKind,
        name: String,
    },
    #[error("line {line}: block '{name}' references unknown block '{target}'")]
    UnknownReference {
        line: usize,
        name: String,
        target: String,
    },
    #[error("line {line}: guard is not followed by any block")]
    DanglingGuard { line: usize },
    #[error("line {line}: invalid directive '{text}': {reason}")]
    Directive {
        line: usize,
        text: String,
        reason: String,
    },
}

/// Script language of a test file, chosen by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Sql,
}

impl Language {
    pub fn from_path(path: &Path) -> Result<Self, ParseError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "py" => Ok(Language::Python),
            "js" => Ok(Language::JavaScript),
            "sql" => Ok(Language::Sql),
            other => Err(ParseError::UnsupportedLanguage(other.to_string())),
        }
    }

    /// Line-comment sigils that may precede `@` in a header.
    pub fn sigils(self) -> &'static [&'static str] {
        match self {
            Language::Python => &["#"],
            Language::JavaScript => &["//"],
            Language::Sql => &["--", "#"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum BlockKind {
    Code,
    Out,
    Err,
    Protocol,
    NoRecord,
    Contains,
    Directive,
}

impl BlockKind {
    pub fn is_expectation(self) -> bool {
        matches!(
            self,
            BlockKind::Out | BlockKind::Err | BlockKind::Protocol | BlockKind::Contains
        )
    }

    pub fn is_code(self) -> bool {
        matches!(self, BlockKind::Code | BlockKind::NoRecord)
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BlockKind::Code => "CODE",
            BlockKind::Out => "OUT",
            BlockKind::Err => "ERR",
            BlockKind::Protocol => "PROTOCOL",
            BlockKind::NoRecord => "NORECORD",
            BlockKind::Contains => "CONTAINS",
            BlockKind::Directive => "DIRECTIVE",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockFlags {
    pub no_record: bool,
    pub optional: bool,
    pub cross_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxOp {
    Deploy,
    Start,
    Stop,
    Kill,
    Destroy,
    Snapshot,
    Restore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Tags(Vec<String>),
    Sandbox {
        op: SandboxOp,
        index: u16,
        options: BTreeMap<String, String>,
    },
}

impl Directive {
    fn parse(text: &str) -> Result<Self, String> {
        let mut words = text.split_whitespace();
        let verb = words.next().ok_or("missing verb")?;
        if verb == "tags" {
            let tags = words
                .flat_map(|w| w.split(','))
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
            return Ok(Directive::Tags(tags));
        }
        let op = match verb {
            "deploy" => SandboxOp::Deploy,
            "start" => SandboxOp::Start,
            "stop" => SandboxOp::Stop,
            "kill" => SandboxOp::Kill,
            "destroy" => SandboxOp::Destroy,
            "snapshot" => SandboxOp::Snapshot,
            "restore" => SandboxOp::Restore,
            other => return Err(format!("unknown verb '{other}'")),
        };
        let index: u16 = words
            .next()
            .ok_or("missing sandbox index")?
            .parse()
            .map_err(|_| "sandbox index must be a positive number".to_string())?;
        if index == 0 {
            return Err("sandbox indexes start at 1".to_string());
        }
        let mut options = BTreeMap::new();
        for word in words {
            let (k, v) = word
                .split_once('=')
                .ok_or_else(|| format!("option '{word}' is not key=value"))?;
            options.insert(k.to_string(), v.to_string());
        }
        Ok(Directive::Sandbox { op, index, options })
    }
}

/// A named region of a test file. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct Block {
    pub name: String,
    pub kind: BlockKind,
    pub flags: BlockFlags,
    /// Body lines joined with `\n`, guard lines removed.
    pub body: String,
    pub guard: Option<Guard>,
    pub directive: Option<Directive>,
    /// 1-based line of the header.
    pub line: usize,
    /// Raw header and body lines, used to render the file back.
    pub source: String,
}

impl Block {
    /// Name for reports; unnamed blocks are identified by kind and line.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("<{} at line {}>", self.kind, self.line)
        } else {
            self.name.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestFile {
    pub path: PathBuf,
    pub language: Language,
    /// Raw lines before the first header.
    pub prelude: String,
    pub guard: Option<Guard>,
    pub abort_on_fail: bool,
    pub tags: Vec<String>,
    pub blocks: Vec<Block>,
    /// Expectation blocks loaded from the mirrored expectations directory.
    pub external: Vec<Block>,
}

impl TestFile {
    /// Reassemble the file from its blocks.
    pub fn render(&self) -> String {
        let mut out = self.prelude.clone();
        for block in &self.blocks {
            out.push_str(&block.source);
        }
        out
    }

    /// Expectation blocks paired with the code block `name`, inline ones first.
    pub fn expectations_for<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Block> {
        self.blocks
            .iter()
            .chain(self.external.iter())
            .filter(move |b| b.kind.is_expectation() && b.name == name)
    }

    pub fn code_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.kind.is_code())
    }

    /// Attach the expectation blocks of `other` (parsed from the mirrored
    /// expectations file). Each must pair with a code block of this file.
    pub fn merge_expectations(&mut self, other: TestFile) -> Result<(), ParseError> {
        let code_names: HashSet<&str> = self.code_blocks().map(|b| b.name.as_str()).collect();
        let mut merged = Vec::new();
        for block in other.blocks.into_iter().filter(|b| b.kind.is_expectation()) {
            if !code_names.contains(block.name.as_str()) {
                return Err(ParseError::Unpaired {
                    line: block.line,
                    kind: block.kind,
                    name: block.name,
                });
            }
            merged.push(block);
        }
        self.external.extend(merged);
        Ok(())
    }
}

enum HeaderLine<'a> {
    Guard(&'a str),
    Block { kind: BlockKind, rest: &'a str },
}

fn classify(line: &str, language: Language) -> Option<HeaderLine<'_>> {
    let trimmed = line.trim_start();
    let after_sigil = language
        .sigils()
        .iter()
        .find_map(|s| trimmed.strip_prefix(*s))?;
    let after = after_sigil.strip_prefix('@')?;

    let bare = after.trim();
    if bare.starts_with('{') && bare.ends_with('}') && (after.starts_with('{') || after.starts_with(' ')) {
        return Some(HeaderLine::Guard(&bare[1..bare.len() - 1]));
    }

    for (marker, kind) in [
        ("<OUT>", BlockKind::Out),
        ("<ERR>", BlockKind::Err),
        ("<PROTOCOL>", BlockKind::Protocol),
        ("<>", BlockKind::NoRecord),
        ("#", BlockKind::Contains),
        ("!", BlockKind::Directive),
    ] {
        if let Some(rest) = after.strip_prefix(marker) {
            return Some(HeaderLine::Block { kind, rest });
        }
    }

    // `#@name` without a space is not a header; it is usually a decorator
    // or an e-mail address in a comment.
    if after.is_empty() || after.starts_with(' ') || after.starts_with('\t') {
        return Some(HeaderLine::Block {
            kind: BlockKind::Code,
            rest: after,
        });
    }
    None
}

struct HeaderParts {
    name: String,
    flags: BlockFlags,
    guard: Option<String>,
}

fn split_header(rest: &str) -> HeaderParts {
    let mut text = rest.trim();
    let mut guard = None;
    if text.ends_with('}')
        && let Some(open) = text.rfind('{')
    {
        guard = Some(text[open + 1..text.len() - 1].to_string());
        text = text[..open].trim_end();
    }

    let mut flags = BlockFlags::default();
    while text.ends_with(']') {
        let Some(open) = text.rfind('[') else { break };
        let inner = text[open + 1..text.len() - 1].trim();
        if let Some(target) = inner.strip_prefix("USE:") {
            flags.cross_ref = Some(target.trim().to_string());
        } else if inner == "OPTIONAL" {
            flags.optional = true;
        } else {
            break;
        }
        text = text[..open].trim_end();
    }

    HeaderParts {
        name: text.to_string(),
        flags,
        guard,
    }
}

fn parse_guard(expr: &str, line: usize) -> Result<Guard, ParseError> {
    Guard::parse(expr).map_err(|source| ParseError::Guard { line, source })
}

fn and_guards(a: Option<Guard>, b: Option<Guard>) -> Option<Guard> {
    match (a, b) {
        (Some(a), Some(b)) => Some(Guard::And(Box::new(a), Box::new(b))),
        (a, b) => a.or(b),
    }
}

fn normalize_line(raw: &str) -> String {
    match raw.strip_suffix("\r\n") {
        Some(stripped) => format!("{stripped}\n"),
        None => raw.strip_suffix('\r').unwrap_or(raw).to_string(),
    }
}

fn finish_body(lines: &[String], kind: BlockKind) -> String {
    let mut body: Vec<&str> = lines.iter().map(|l| l.trim_end_matches('\n')).collect();
    if kind.is_code() {
        while body.last().is_some_and(|l| l.trim().is_empty()) {
            body.pop();
        }
    }
    body.join("\n")
}

/// Parse the text of a test file.
pub fn parse(path: &Path, text: &str) -> Result<TestFile, ParseError> {
    parse_inner(path, text, true)
}

/// Parse a file that only holds expectation blocks for a test file living
/// elsewhere. Pairing is checked later by [`TestFile::merge_expectations`].
pub fn parse_expectations(path: &Path, text: &str) -> Result<TestFile, ParseError> {
    parse_inner(path, text, false)
}

fn parse_inner(path: &Path, text: &str, check_pairing: bool) -> Result<TestFile, ParseError> {
    let language = Language::from_path(path)?;
    let mut file = TestFile {
        path: path.to_path_buf(),
        language,
        prelude: String::new(),
        guard: None,
        abort_on_fail: false,
        tags: Vec::new(),
        blocks: Vec::new(),
        external: Vec::new(),
    };

    let mut current: Option<(Block, Vec<String>)> = None;
    let mut pending_guard: Option<(Guard, usize)> = None;
    let mut file_level = true;

    for (idx, raw) in text.split_inclusive('\n').enumerate() {
        let line_no = idx + 1;
        let line = normalize_line(raw);
        let content = line.trim_end_matches('\n');

        match classify(content, language) {
            Some(HeaderLine::Guard(expr)) => {
                if file_level && expr.trim() == ABORT_ON_FAIL {
                    file.abort_on_fail = true;
                } else if file_level {
                    let guard = parse_guard(expr, line_no)?;
                    file.guard = and_guards(file.guard.take(), Some(guard));
                } else {
                    let guard = parse_guard(expr, line_no)?;
                    let combined = and_guards(pending_guard.take().map(|(g, _)| g), Some(guard));
                    pending_guard = combined.map(|g| (g, line_no));
                }
                match current.as_mut() {
                    Some((block, _)) => block.source.push_str(&line),
                    None => file.prelude.push_str(&line),
                }
            }
            Some(HeaderLine::Block { kind, rest }) => {
                if let Some((block, lines)) = current.take() {
                    file.blocks.push(close_block(block, &lines)?);
                }
                let parts = split_header(rest);
                let directive = if kind == BlockKind::Directive {
                    let directive =
                        Directive::parse(&parts.name).map_err(|reason| ParseError::Directive {
                            line: line_no,
                            text: parts.name.clone(),
                            reason,
                        })?;
                    if let Directive::Tags(tags) = &directive {
                        file.tags.extend(tags.iter().cloned());
                    }
                    Some(directive)
                } else {
                    None
                };
                let is_tags = matches!(directive, Some(Directive::Tags(_)));
                if !is_tags {
                    file_level = false;
                }

                let header_guard = parts
                    .guard
                    .as_deref()
                    .map(|g| parse_guard(g, line_no))
                    .transpose()?;
                let guard = and_guards(pending_guard.take().map(|(g, _)| g), header_guard);
                let mut flags = parts.flags;
                flags.no_record = kind == BlockKind::NoRecord;

                current = Some((
                    Block {
                        name: parts.name,
                        kind,
                        flags,
                        body: String::new(),
                        guard,
                        directive,
                        line: line_no,
                        source: line.clone(),
                    },
                    Vec::new(),
                ));
            }
            None => match current.as_mut() {
                Some((block, lines)) => {
                    block.source.push_str(&line);
                    lines.push(line);
                }
                None => file.prelude.push_str(&line),
            },
        }
    }

    if let Some((block, lines)) = current.take() {
        file.blocks.push(close_block(block, &lines)?);
    }
    if let Some((_, line)) = pending_guard {
        return Err(ParseError::DanglingGuard { line });
    }

    check_structure(&mut file, check_pairing)?;
    Ok(file)
}

fn close_block(mut block: Block, lines: &[String]) -> Result<Block, ParseError> {
    if block.kind == BlockKind::Directive {
        if let Some(extra) = lines.iter().find(|l| !l.trim().is_empty()) {
            return Err(ParseError::Directive {
                line: block.line,
                text: block.name.clone(),
                reason: format!("directives take no body, found '{}'", extra.trim()),
            });
        }
        return Ok(block);
    }
    block.body = finish_body(lines, block.kind);
    Ok(block)
}

/// Enforce pairing, uniqueness and resolve `[USE: …]` references.
fn check_structure(file: &mut TestFile, check_pairing: bool) -> Result<(), ParseError> {
    let mut seen: HashSet<(BlockKind, &str)> = HashSet::new();
    let mut code_so_far: HashSet<&str> = HashSet::new();

    for block in &file.blocks {
        if block.kind == BlockKind::Directive {
            continue;
        }
        if !block.name.is_empty() && !seen.insert((block.kind, block.name.as_str())) {
            return Err(ParseError::Duplicate {
                line: block.line,
                kind: block.kind,
                name: block.name.clone(),
            });
        }
        if block.kind == BlockKind::Code {
            code_so_far.insert(block.name.as_str());
        } else if check_pairing
            && block.kind.is_expectation()
            && !code_so_far.contains(block.name.as_str())
        {
            return Err(ParseError::Unpaired {
                line: block.line,
                kind: block.kind,
                name: block.name.clone(),
            });
        }
    }

    let mut resolved = Vec::new();
    for (idx, block) in file.blocks.iter().enumerate() {
        let Some(target) = &block.flags.cross_ref else {
            continue;
        };
        let source = file
            .blocks
            .iter()
            .find(|b| b.name == *target && b.kind == block.kind)
            .or_else(|| {
                file.blocks
                    .iter()
                    .find(|b| b.name == *target && b.kind.is_expectation())
            })
            .ok_or_else(|| ParseError::UnknownReference {
                line: block.line,
                name: block.name.clone(),
                target: target.clone(),
            })?;
        resolved.push((idx, source.body.clone()));
    }
    for (idx, body) in resolved {
        file.blocks[idx].body = body;
    }
    Ok(())
}
