//! End-to-end tests of the xshtest binary against a fake shell.

use std::fs;
use std::net::{Ipv4Addr, TcpListener};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Turns `print(X)` lines into `echo X` and runs the result with `sh`.
/// Touches `$FAKE_SHELL_MARKER` (when set) on every non-version run.
const FAKE_SHELL: &str = r#"#!/bin/sh
case "$1" in
  --version) echo "mysqlsh   Ver 8.4.0 for Linux on x86_64 - for MySQL 8.4.0"; exit 0 ;;
esac
if [ -n "$FAKE_SHELL_MARKER" ]; then touch "$FAKE_SHELL_MARKER"; fi
sed "s/^print(\(.*\))$/echo \1/" | sh
"#;

const FAKE_SERVER: &str = r#"#!/bin/sh
for a in "$@"; do
  case "$a" in
    --initialize-insecure) exit 0 ;;
  esac
done
exec sleep 60
"#;

struct Suite {
    root: TempDir,
    bin: TempDir,
    shell: PathBuf,
}

fn write_executable(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn free_base_port() -> u16 {
    loop {
        let port = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let free = |p: u16| TcpListener::bind((Ipv4Addr::LOCALHOST, p)).is_ok();
        if port < 60000 && (port..port + 10).all(free) {
            return port;
        }
    }
}

impl Suite {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let bin = TempDir::new().unwrap();
        let shell = bin.path().join("mysqlsh");
        write_executable(&shell, FAKE_SHELL);
        let suite = Self { root, bin, shell };
        suite.config("");
        suite
    }

    /// Write xshtest.yaml with a private port range plus `extra`.
    fn config(&self, extra: &str) {
        let config = format!(
            "version: 1\ntimeout: 20\nports:\n  base: {}\n  range_size: 10\n  ranges: 1\n{extra}",
            free_base_port()
        );
        fs::write(self.root.path().join("xshtest.yaml"), config).unwrap();
    }

    fn test(&self, name: &str, text: &str) -> PathBuf {
        let path = self.root.path().join(name);
        fs::write(&path, text).unwrap();
        path
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_xshtest"));
        cmd.env("MYSQLX_PATH", &self.shell)
            .env_remove("CONFIG_PATH")
            .env_remove("XSHTEST_LOG");
        cmd
    }

    fn run(&self, args: &[&str]) -> Output {
        self.cmd()
            .arg("run")
            .arg(self.root.path())
            .args(args)
            .output()
            .unwrap()
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn describe(output: &Output) -> String {
    format!(
        "status: {:?}\nstdout: {}\nstderr: {}",
        output.status,
        stdout(output),
        String::from_utf8_lossy(&output.stderr)
    )
}

#[test]
fn test_matching_output_passes() {
    let suite = Suite::new();
    suite.test("hello.py", "#@ hello\nprint('hi')\n#@<OUT> hello\nhi\n");

    let output = suite.run(&[]);
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    assert!(stdout(&output).contains("✓ hello"));
    assert!(stdout(&output).contains("1 passed, 0 failed, 0 skipped"));
}

#[test]
fn test_mismatch_reports_expected_and_actual() {
    let suite = Suite::new();
    suite.test("hello.py", "#@ hello\nprint('hello')\n#@<OUT> hello\nhi\n");

    let output = suite.run(&[]);
    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
    let text = stdout(&output);
    assert!(text.contains("hello.py › hello [CODE]"), "{text}");
    assert!(text.contains("expected: hi"), "{text}");
    assert!(text.contains("actual:   hello"), "{text}");
}

#[test]
fn test_false_version_guard_skips_file_without_starting_shell() {
    let suite = Suite::new();
    let marker = suite.bin.path().join("started");
    suite.test(
        "old.py",
        "#@{VER(<8.0.0)}\n#@ one\nprint('1')\n#@<OUT> one\n1\n#@ two\nprint('2')\n",
    );

    let output = suite
        .cmd()
        .env("FAKE_SHELL_MARKER", &marker)
        .arg("run")
        .arg(suite.root.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    assert!(stdout(&output).contains("0 passed, 0 failed, 2 skipped"));
    assert!(!marker.exists(), "shell ran for a guarded-out file");
}

#[test]
fn test_wildcard_line_matches_anything() {
    let suite = Suite::new();
    suite.test(
        "wild.py",
        "#@ wild\nprint('line one')\nprint('anything here')\nprint('line three')\n#@<OUT> wild\nline one\n[[*]]\nline three\n",
    );

    let output = suite.run(&[]);
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
}

#[test]
fn test_alternation_in_json_output() {
    let suite = Suite::new();
    suite.test(
        "state.py",
        "#@ good\nprint('state: recoverable')\n#@<OUT> good\nstate: {{ok|recoverable}}\n#@ bad\nprint('state: failed')\n#@<OUT> bad\nstate: {{ok|recoverable}}\n",
    );

    let output = suite.run(&["--output", "json"]);
    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let blocks = &value["results"][0]["blocks"];
    assert_eq!(blocks[0]["name"], "good");
    assert_eq!(blocks[0]["outcome"], "PASS");
    assert_eq!(blocks[1]["outcome"], "FAIL");
    assert_eq!(blocks[1]["diffs"][0]["pairs"][0]["actual"], "state: failed");
    assert_eq!(value["passed"], 1);
    assert_eq!(value["failed"], 1);
}

#[test]
fn test_xml_report_is_written() {
    let suite = Suite::new();
    suite.test("a.py", "#@ pass\nprint('x')\n#@<OUT> pass\nx\n#@ skip {VER(<5.0.0)}\nprint('y')\n");
    let xml_path = suite.bin.path().join("report.xml");

    let output = suite.run(&["--xml", xml_path.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    let xml = fs::read_to_string(&xml_path).unwrap();
    assert!(xml.starts_with("<?xml"));
    assert!(xml.contains("<testcase name=\"pass\""));
    assert!(xml.contains("<skipped message="));
}

#[test]
fn test_unparseable_guard_is_a_configuration_error() {
    let suite = Suite::new();
    suite.test("bad.py", "#@ a {VER(<<8)}\nprint('a')\n");

    let output = suite.run(&[]);
    assert_eq!(output.status.code(), Some(2), "{}", describe(&output));
}

#[test]
fn test_unpaired_expectation_is_a_configuration_error() {
    let suite = Suite::new();
    suite.test("bad.py", "#@<OUT> nobody\nx\n");

    let output = suite.run(&[]);
    assert_eq!(output.status.code(), Some(2), "{}", describe(&output));
}

#[test]
fn test_setup_file_runs_first_and_tags_filter() {
    let suite = Suite::new();
    suite.test("b.py", "#@! tags slow\n#@ b\nprint('b')\n");
    suite.test("a.py", "#@ a\nprint('a')\n");
    suite.test("setup.py", "#@ s\nprint('s')\n");

    let output = suite.run(&["--output", "json"]);
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let files: Vec<String> = value["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| {
            Path::new(f["path"].as_str().unwrap())
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    assert_eq!(files, vec!["setup.py", "a.py", "b.py"]);

    let output = suite.run(&["--output", "json", "--skip-tag", "slow"]);
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["results"].as_array().unwrap().len(), 2);
}

#[test]
fn test_server_binary_override_feeds_directives() {
    let suite = Suite::new();
    let server = suite.bin.path().join("mysqld-8.0");
    write_executable(&server, FAKE_SERVER);
    let sandboxes = suite.bin.path().join("sandboxes");
    suite.config(&format!("sandbox:\n  root: {}\n", sandboxes.display()));
    suite.test(
        "deploy.py",
        "#@! deploy 1 mysqld=8.0 start=false\n#@ check\nprint('__mysql_sandbox_port1__')\n#@<OUT> check\n<<<mysql_sandbox_port1>>>\n",
    );
    let binary = format!("8.0={}", server.display());

    let output = suite.run(&["--server-binary", &binary]);
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    let leftovers: Vec<_> = fs::read_dir(sandboxes.join("w0")).unwrap().collect();
    assert!(leftovers.is_empty(), "sandbox directories left behind");
}

#[test]
fn test_sigint_tears_down_sandboxes() {
    let suite = Suite::new();
    let server = suite.bin.path().join("mysqld");
    write_executable(&server, FAKE_SERVER);
    let sandboxes = suite.bin.path().join("sandboxes");
    let running = suite.bin.path().join("running");
    suite.config(&format!(
        "sandbox:\n  root: {}\n  default_binary: {}\n",
        sandboxes.display(),
        server.display()
    ));
    suite.test(
        "slow.py",
        &format!(
            "#@! deploy 1 start=false\n#@ slow\ntouch '{}'\nsleep 30\n#@ after\nprint('after')\n",
            running.display()
        ),
    );

    let mut child = suite
        .cmd()
        .arg("run")
        .arg(suite.root.path())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let start = Instant::now();
    while !running.exists() {
        assert!(start.elapsed() < Duration::from_secs(20), "block never started");
        std::thread::sleep(Duration::from_millis(50));
    }
    let deployed: Vec<_> = fs::read_dir(sandboxes.join("w0")).unwrap().collect();
    assert_eq!(deployed.len(), 1);

    // SAFETY: plain kill(2) on the pid of our own child.
    let rc = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGINT) };
    assert_eq!(rc, 0);
    let output = child.wait_with_output().unwrap();

    assert_eq!(output.status.code(), Some(130), "{}", describe(&output));
    assert!(stdout(&output).contains("cancelled"));
    let leftovers: Vec<_> = fs::read_dir(sandboxes.join("w0")).unwrap().collect();
    assert!(leftovers.is_empty(), "sandbox directories left behind");
}

#[test]
fn test_validate_counts_blocks() {
    let suite = Suite::new();
    suite.test("a.py", "#@ a\nprint('a')\n#@<OUT> a\na\n");

    let output = suite
        .cmd()
        .arg("validate")
        .arg(suite.root.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", describe(&output));
    assert!(stdout(&output).contains("(2 blocks, 1 code)"));
}

#[test]
fn test_init_scaffold_validates() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("suite");

    let output = Command::new(env!("CARGO_BIN_EXE_xshtest"))
        .arg("init")
        .arg(&target)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", describe(&output));
    assert!(target.join("xshtest.yaml").exists());

    let output = Command::new(env!("CARGO_BIN_EXE_xshtest"))
        .env_remove("CONFIG_PATH")
        .arg("validate")
        .arg(&target)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", describe(&output));

    let output = Command::new(env!("CARGO_BIN_EXE_xshtest"))
        .arg("init")
        .arg(&target)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_schema_is_json() {
    let output = Command::new(env!("CARGO_BIN_EXE_xshtest"))
        .arg("schema")
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(value["properties"]["sandbox"].is_object());
}
