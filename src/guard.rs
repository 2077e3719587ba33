//! Guard predicates that gate whole files or single blocks.
//!
//! ```text
//! guard   := or
//! or      := and { "||" and }
//! and     := unary { "&&" unary }
//! unary   := "!" unary | "(" guard ")" | "VER(" [relop] version ")" | "DEF(" ident ")"
//! relop   := "<" | "<=" | ">" | ">=" | "==" | "!="
//! ```

use crate::context::Context;
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    #[error("invalid guard '{expr}': {reason}")]
    Syntax { expr: String, reason: String },
    #[error("invalid version '{0}'")]
    Version(String),
    #[error("guard needs the shell version but context has no 'version'")]
    NoVersion,
}

/// A dotted version number. Missing components are zero and any suffix
/// after the numeric part (`8.4.0-commercial`) is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub fn parse(s: &str) -> Result<Self, GuardError> {
        let numeric: String = s
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let mut parts = numeric.split('.').filter(|p| !p.is_empty());
        let mut next = || -> Result<u32, GuardError> {
            parts
                .next()
                .map(|p| p.parse().map_err(|_| GuardError::Version(s.to_string())))
                .unwrap_or(Ok(0))
        };
        let major = next()?;
        let minor = next()?;
        let patch = next()?;
        if numeric.is_empty() {
            return Err(GuardError::Version(s.to_string()));
        }
        Ok(Self {
            major,
            minor,
            patch,
        })
    }

    /// Numeric form used by the `version_num` context entry (`8.0.11` -> `80011`).
    pub fn as_number(&self) -> u64 {
        u64::from(self.major) * 10_000 + u64::from(self.minor) * 100 + u64::from(self.patch)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl RelOp {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            RelOp::Lt => ord == Ordering::Less,
            RelOp::Le => ord != Ordering::Greater,
            RelOp::Gt => ord == Ordering::Greater,
            RelOp::Ge => ord != Ordering::Less,
            RelOp::Eq => ord == Ordering::Equal,
            RelOp::Ne => ord != Ordering::Equal,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            RelOp::Lt => "<",
            RelOp::Le => "<=",
            RelOp::Gt => ">",
            RelOp::Ge => ">=",
            RelOp::Eq => "==",
            RelOp::Ne => "!=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    Ver(RelOp, Version),
    Def(String),
    Not(Box<Guard>),
    And(Box<Guard>, Box<Guard>),
    Or(Box<Guard>, Box<Guard>),
}

impl Guard {
    pub fn parse(expr: &str) -> Result<Self, GuardError> {
        let mut parser = GuardParser {
            src: expr,
            pos: 0,
        };
        let guard = parser.or()?;
        parser.skip_ws();
        if parser.pos != expr.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(guard)
    }

    pub fn evaluate(&self, ctx: &Context) -> Result<bool, GuardError> {
        Ok(match self {
            Guard::Ver(op, wanted) => {
                let current = ctx.get("version").ok_or(GuardError::NoVersion)?;
                op.holds(Version::parse(current)?.cmp(wanted))
            }
            Guard::Def(name) => ctx.is_defined(name),
            Guard::Not(inner) => !inner.evaluate(ctx)?,
            Guard::And(a, b) => a.evaluate(ctx)? && b.evaluate(ctx)?,
            Guard::Or(a, b) => a.evaluate(ctx)? || b.evaluate(ctx)?,
        })
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::Ver(op, v) => write!(f, "VER({}{v})", op.as_str()),
            Guard::Def(name) => write!(f, "DEF({name})"),
            Guard::Not(inner) => write!(f, "!{inner}"),
            Guard::And(a, b) => write!(f, "({a} && {b})"),
            Guard::Or(a, b) => write!(f, "({a} || {b})"),
        }
    }
}

struct GuardParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> GuardParser<'a> {
    fn rest(&self) -> &str {
        &self.src[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn error(&self, reason: &str) -> GuardError {
        GuardError::Syntax {
            expr: self.src.to_string(),
            reason: format!("{reason} at offset {}", self.pos),
        }
    }

    fn or(&mut self) -> Result<Guard, GuardError> {
        let mut left = self.and()?;
        while self.eat("||") {
            let right = self.and()?;
            left = Guard::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Guard, GuardError> {
        let mut left = self.unary()?;
        while self.eat("&&") {
            let right = self.unary()?;
            left = Guard::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Guard, GuardError> {
        if self.eat("!") {
            return Ok(Guard::Not(Box::new(self.unary()?)));
        }
        if self.eat("(") {
            let inner = self.or()?;
            if !self.eat(")") {
                return Err(self.error("expected ')'"));
            }
            return Ok(inner);
        }
        if self.eat("VER(") {
            let arg = self.until_close()?;
            let (op, version) = split_relop(arg.trim());
            return Ok(Guard::Ver(op, Version::parse(version)?));
        }
        if self.eat("DEF(") {
            let arg = self.until_close()?.trim().to_string();
            if arg.is_empty() || !arg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(self.error("DEF expects an identifier"));
            }
            return Ok(Guard::Def(arg));
        }
        Err(self.error("expected VER(...), DEF(...), '!' or '('"))
    }

    fn until_close(&mut self) -> Result<&'a str, GuardError> {
        let src = self.src;
        let start = self.pos;
        let end = src[start..]
            .find(')')
            .ok_or_else(|| self.error("expected ')'"))?;
        self.pos += end + 1;
        Ok(&src[start..start + end])
    }
}

fn split_relop(arg: &str) -> (RelOp, &str) {
    for (prefix, op) in [
        ("<=", RelOp::Le),
        (">=", RelOp::Ge),
        ("==", RelOp::Eq),
        ("!=", RelOp::Ne),
        ("<", RelOp::Lt),
        (">", RelOp::Gt),
        ("=", RelOp::Eq),
    ] {
        if let Some(rest) = arg.strip_prefix(prefix) {
            return (op, rest.trim_start());
        }
    }
    (RelOp::Eq, arg)
}
