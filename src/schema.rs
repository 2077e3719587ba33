//! Schema definitions for the xshtest suite configuration.
//!
//! The suite config lives in `xshtest.yaml` (or `xshtest.toml`) at the test
//! root and is validated against these types. Test files themselves are not
//! YAML; see [`crate::parser`] for their annotation language.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Default per-invocation timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Suite-level configuration loaded from `xshtest.yaml` in the test root.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SuiteConfig {
    /// Schema version (must match crate major version).
    #[serde(default = "default_version")]
    pub version: u32,

    /// How to invoke the shell under test.
    #[serde(default)]
    pub shell: ShellConfig,

    /// Per-invocation timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Extra context entries available to every test file.
    #[serde(default)]
    pub context: BTreeMap<String, String>,

    /// A pre-existing server that tests may connect to.
    #[serde(default)]
    pub server: ServerConfig,

    /// Sandbox manager settings.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Port pool settings. Each worker gets one range.
    #[serde(default)]
    pub ports: PortsConfig,

    /// File stem of the per-directory setup file, which always runs first.
    #[serde(default = "default_setup_file")]
    pub setup_file: String,

    /// Directory mirroring the test tree that holds extra expectation blocks.
    #[serde(default)]
    pub expectations_dir: Option<PathBuf>,

    /// Shell version to use instead of probing `--version`.
    #[serde(default)]
    pub shell_version: Option<String>,

    /// Glob patterns a test file must match (relative to the test root).
    #[serde(default)]
    pub include: Vec<String>,

    /// Glob patterns that exclude test files.
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Number of parallel workers (bounded by `ports.ranges`).
    #[serde(default)]
    pub jobs: Option<usize>,

    /// Steps run once before the first test file.
    #[serde(default)]
    pub setup: Vec<Step>,

    /// Steps run once after the last test file.
    #[serde(default)]
    pub teardown: Vec<Step>,

    /// Steps run after every test file, before its sandboxes are reclaimed.
    #[serde(default)]
    pub file_teardown: Vec<Step>,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            shell: ShellConfig::default(),
            timeout: None,
            context: BTreeMap::new(),
            server: ServerConfig::default(),
            sandbox: SandboxConfig::default(),
            ports: PortsConfig::default(),
            setup_file: default_setup_file(),
            expectations_dir: None,
            shell_version: None,
            include: Vec::new(),
            exclude: Vec::new(),
            jobs: None,
            setup: Vec::new(),
            teardown: Vec::new(),
            file_teardown: Vec::new(),
        }
    }
}

impl SuiteConfig {
    /// Effective invocation timeout in seconds.
    pub fn timeout_secs(&self) -> u64 {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)
    }
}

fn default_version() -> u32 {
    1
}

fn default_setup_file() -> String {
    "setup".to_string()
}

/// Shell invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ShellConfig {
    /// Path to the shell binary. Falls back to `MYSQLX_PATH`, then `mysqlsh`.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Arguments prepended to every script-mode invocation.
    #[serde(default)]
    pub args: Vec<String>,

    /// Whether the shell inherits the harness environment.
    #[serde(default = "default_true")]
    pub inherit_env: bool,

    /// Environment variables set for every invocation.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Log file name inside the shell home directory.
    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// Flag selecting SQL mode for `.sql` test files.
    #[serde(default = "default_sql_flag")]
    pub sql_flag: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            path: None,
            args: Vec::new(),
            inherit_env: true,
            env: BTreeMap::new(),
            log_file: default_log_file(),
            sql_flag: default_sql_flag(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_log_file() -> String {
    "mysqlsh.log".to_string()
}

fn default_sql_flag() -> String {
    "--sql".to_string()
}

/// Connection data for a server that exists outside the harness.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default = "default_password")]
    pub password: String,

    /// Classic protocol port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// X protocol port.
    #[serde(default = "default_xport")]
    pub xport: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            user: default_user(),
            password: default_password(),
            port: default_port(),
            xport: default_xport(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_user() -> String {
    "root".to_string()
}

fn default_password() -> String {
    "root".to_string()
}

fn default_port() -> u16 {
    3306
}

fn default_xport() -> u16 {
    33060
}

/// Sandbox manager settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SandboxConfig {
    /// Directory that holds one subdirectory per sandbox port.
    /// Defaults to a directory inside the worker's temp dir.
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Server binaries keyed by version tag (e.g. `"5.7"`, `"8.0"`).
    #[serde(default)]
    pub binaries: BTreeMap<String, PathBuf>,

    /// Server binary used when a deploy names no tag.
    #[serde(default)]
    pub default_binary: Option<PathBuf>,

    /// Number of sandbox ports assigned to each test file.
    #[serde(default = "default_sandboxes_per_file")]
    pub sandboxes_per_file: u16,

    /// Seconds to wait for a started server to accept connections.
    #[serde(default = "default_start_timeout")]
    pub start_timeout: u64,

    /// Seconds to wait for a stopped server to exit before killing it.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: u64,

    /// Root password given to deployed sandboxes.
    #[serde(default = "default_password")]
    pub root_password: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: None,
            binaries: BTreeMap::new(),
            default_binary: None,
            sandboxes_per_file: default_sandboxes_per_file(),
            start_timeout: default_start_timeout(),
            stop_timeout: default_stop_timeout(),
            root_password: default_password(),
        }
    }
}

fn default_sandboxes_per_file() -> u16 {
    3
}

fn default_start_timeout() -> u64 {
    60
}

fn default_stop_timeout() -> u64 {
    30
}

/// Preallocated port ranges. Range `i` covers
/// `base + i * range_size .. base + (i + 1) * range_size`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PortsConfig {
    #[serde(default = "default_port_base")]
    pub base: u16,

    #[serde(default = "default_range_size")]
    pub range_size: u16,

    #[serde(default = "default_ranges")]
    pub ranges: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            base: default_port_base(),
            range_size: default_range_size(),
            ranges: default_ranges(),
        }
    }
}

fn default_port_base() -> u16 {
    3310
}

fn default_range_size() -> u16 {
    10
}

fn default_ranges() -> u16 {
    4
}

/// A suite or file-level step.
///
/// Each step is a single-key map where the key determines the action.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct Step {
    /// Run an arbitrary command.
    #[serde(default)]
    pub run: Option<RunStep>,

    /// Remove a directory (relative paths resolve against the worker temp dir).
    #[serde(default)]
    pub remove_dir: Option<PathBuf>,
}

/// A command to run (used in setup/teardown).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunStep {
    /// The command/binary to execute.
    pub cmd: String,

    /// Command arguments. Context tokens are expanded.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Generate the JSON Schema for the suite configuration.
pub fn generate_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(SuiteConfig)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config: SuiteConfig = serde_yaml::from_str("version: 1\n").unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.setup_file, "setup");
        assert_eq!(config.shell.log_file, "mysqlsh.log");
        assert_eq!(config.shell.sql_flag, "--sql");
        assert!(config.shell.inherit_env);
        assert_eq!(config.sandbox.sandboxes_per_file, 3);
        assert_eq!(config.ports.base, 3310);
        assert_eq!(config.timeout_secs(), DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
version: 1
shell:
  path: /opt/mysqlsh/bin/mysqlsh
  args: ["--interactive=false"]
  env:
    MYSQLSH_TERM_COLOR_MODE: nocolor
timeout: 60
context:
  hostname: db.example
server:
  host: 127.0.0.1
  port: 3316
  xport: 33160
sandbox:
  root: /var/tmp/sandboxes
  binaries:
    "5.7": /opt/mysql57/bin/mysqld
    "8.0": /opt/mysql80/bin/mysqld
  sandboxes_per_file: 2
ports:
  base: 4000
  range_size: 20
  ranges: 2
expectations_dir: validation
include: ["py_*/**"]
exclude: ["**/slow_*"]
jobs: 2
file_teardown:
  - run:
      cmd: sh
      args: ["-c", "echo done"]
"#;
        let config: SuiteConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.timeout_secs(), 60);
        assert_eq!(config.shell.args, vec!["--interactive=false"]);
        assert_eq!(config.server.port, 3316);
        assert_eq!(config.server.user, "root");
        assert_eq!(config.sandbox.binaries.len(), 2);
        assert_eq!(config.sandbox.sandboxes_per_file, 2);
        assert_eq!(config.ports.range_size, 20);
        assert_eq!(config.expectations_dir, Some(PathBuf::from("validation")));
        assert_eq!(config.file_teardown.len(), 1);
        assert_eq!(config.jobs, Some(2));
    }

    #[test]
    fn test_parse_toml_config() {
        let toml_src = r#"
version = 1
timeout = 5

[shell]
path = "/usr/bin/mysqlsh"

[ports]
base = 5000
"#;
        let config: SuiteConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.timeout, Some(5));
        assert_eq!(config.ports.base, 5000);
        assert_eq!(config.ports.ranges, 4);
    }

    #[test]
    fn test_schema_mentions_sandbox_settings() {
        let schema = serde_json::to_string(&generate_schema()).unwrap();
        assert!(schema.contains("sandboxes_per_file"));
        assert!(schema.contains("expectations_dir"));
    }
}
