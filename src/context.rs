//! Context variables and token expansion.
//!
//! A [`Context`] maps symbolic names to values. Three token syntaxes
//! resolve against it:
//!
//! - `<<<name>>>` in expectation bodies ([`Context::expand_expectation`]),
//! - `__name__` in code sent to the shell ([`Context::expand_code`]),
//! - `$NAME`, `${NAME}` and `__name` in argv entries ([`Context::expand_arg`]).
//!
//! Lookups accept names with or without a leading `__`, so both
//! `<<<sandbox_uri1>>>` and `<<<__sandbox_uri1>>>` resolve.

use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Environment variables copied into every context when set.
pub const IMPORTED_ENV: &[&str] = &[
    "SSH_URI",
    "SSH_USER_URI",
    "MYSQL_OVER_SSH_URI",
    "MYSQLD57_PATH",
    "MYSQLX_PATH",
    "XSHELL_QA_TEST_ROOT",
];

static CODE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__([A-Za-z][A-Za-z0-9_]*?)__").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("undefined context variable '{0}'")]
    Undefined(String),
    #[error("unclosed token: {0}")]
    Unclosed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Context {
    vars: BTreeMap<String, String>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn extend<I, K, V>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in entries {
            self.insert(k, v);
        }
    }

    /// Look a name up, retrying without a leading `__`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .or_else(|| name.strip_prefix("__").and_then(|n| self.vars.get(n)))
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// True when `name` is defined in the context or as a non-empty
    /// process environment variable.
    pub fn is_defined(&self, name: &str) -> bool {
        self.contains(name) || std::env::var(name).is_ok_and(|v| !v.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy the variables of [`IMPORTED_ENV`] that are set in the process
    /// environment.
    pub fn import_env(&mut self) {
        for name in IMPORTED_ENV {
            if let Ok(value) = std::env::var(name)
                && !value.is_empty()
            {
                self.insert(*name, value);
            }
        }
    }

    /// Replace `__name__` tokens whose name is defined. Unknown tokens are
    /// left untouched so that dunder identifiers in Python survive.
    pub fn expand_code(&self, code: &str) -> String {
        CODE_TOKEN
            .replace_all(code, |caps: &Captures| match self.get(&caps[1]) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }

    /// Replace every `<<<name>>>` token. Fails on the first undefined name.
    pub fn expand_expectation(&self, text: &str) -> Result<String, ContextError> {
        let mut result = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("<<<") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 3..];
            let end = after
                .find(">>>")
                .ok_or_else(|| ContextError::Unclosed(format!("<<<{after}")))?;
            let name = after[..end].trim();
            let value = self
                .get(name)
                .ok_or_else(|| ContextError::Undefined(name.to_string()))?;
            result.push_str(value);
            rest = &after[end + 3..];
        }
        result.push_str(rest);
        Ok(result)
    }

    /// Expand one argv entry.
    ///
    /// `${NAME}` and `$NAME` resolve against the context and then the
    /// process environment and must be defined. `__name` (optionally
    /// followed by `__`) resolves when the identifier is a context name and
    /// is kept literally otherwise.
    pub fn expand_arg(&self, arg: &str) -> Result<String, ContextError> {
        let mut result = String::with_capacity(arg.len());
        let mut chars = arg.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '$' && chars.peek() == Some(&'{') {
                chars.next(); // consume '{'
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => return Err(ContextError::Unclosed(format!("${{{name}"))),
                    }
                }
                result.push_str(&self.lookup_var(&name)?);
            } else if c == '$' && chars.peek().is_some_and(|c| is_ident_start(*c)) {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if !is_ident_char(c) {
                        break;
                    }
                    name.push(c);
                    chars.next();
                }
                result.push_str(&self.lookup_var(&name)?);
            } else if c == '_' && chars.peek() == Some(&'_') {
                chars.next(); // consume second '_'
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if !is_ident_char(c) {
                        break;
                    }
                    ident.push(c);
                    chars.next();
                }
                let name = ident.strip_suffix("__").unwrap_or(&ident);
                match self.get(name) {
                    Some(value) if !name.is_empty() => result.push_str(value),
                    _ => {
                        result.push_str("__");
                        result.push_str(&ident);
                    }
                }
            } else {
                result.push(c);
            }
        }

        Ok(result)
    }

    fn lookup_var(&self, name: &str) -> Result<String, ContextError> {
        self.get(name)
            .map(str::to_string)
            .or_else(|| std::env::var(name).ok())
            .ok_or_else(|| ContextError::Undefined(name.to_string()))
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
