mod context;
mod driver;
mod guard;
mod loader;
mod matcher;
mod parser;
mod report;
mod runner;
mod sandbox;
mod schema;

use clap::{Args, Parser, Subcommand};
use report::OutputFormat;
use schema::SuiteConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Exit code for configuration errors (bad config, unparseable test file).
const EXIT_CONFIG: i32 = 2;
/// Exit code after Ctrl-C.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "xshtest")]
#[command(about = "Integration test harness for the MySQL Shell")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run test files against the shell
    Run(RunArgs),
    /// Parse test files without running them
    Validate {
        /// Test root (file or directory)
        #[arg(env = "XSHELL_QA_TEST_ROOT")]
        path: PathBuf,
        /// Suite config file (default: xshtest.yaml in the test root)
        #[arg(long, env = "CONFIG_PATH")]
        config: Option<PathBuf>,
    },
    /// Scaffold a suite config and a sample test
    Init {
        /// Directory to create the suite in
        #[arg(default_value = "xshtest-suite")]
        path: PathBuf,
    },
    /// Output the suite config schema
    Schema,
}

#[derive(Args)]
struct RunArgs {
    /// Test root (file or directory)
    #[arg(env = "XSHELL_QA_TEST_ROOT")]
    path: PathBuf,
    /// Suite config file (default: xshtest.yaml in the test root)
    #[arg(long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,
    /// Only run files matching this glob (repeatable)
    #[arg(long)]
    include: Vec<String>,
    /// Skip files matching this glob (repeatable)
    #[arg(long)]
    exclude: Vec<String>,
    /// Also write a JUnit XML report to this path
    #[arg(long)]
    xml: Option<PathBuf>,
    /// Number of files run in parallel
    #[arg(short, long)]
    jobs: Option<usize>,
    /// Server binary for a version tag (repeatable)
    #[arg(long = "server-binary", value_name = "TAG=PATH", value_parser = parse_server_binary)]
    server_binaries: Vec<(String, PathBuf)>,
    /// Output format
    #[arg(short, long, default_value = "human")]
    output: OutputFormat,
    /// Only run code blocks whose name contains this
    #[arg(short, long)]
    filter: Option<String>,
    /// Per-invocation timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Only run files carrying one of these tags (repeatable)
    #[arg(long)]
    tag: Vec<String>,
    /// Skip files carrying one of these tags (repeatable)
    #[arg(long)]
    skip_tag: Vec<String>,
    /// Shell binary under test
    #[arg(long, env = "MYSQLX_PATH")]
    shell: Option<PathBuf>,
    /// Debug logging and skip reasons in the summary
    #[arg(short, long)]
    verbose: bool,
}

fn parse_server_binary(s: &str) -> Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((tag, path)) if !tag.is_empty() && !path.is_empty() => {
            Ok((tag.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected TAG=PATH, got '{s}'")),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("xshtest=debug")
    } else {
        EnvFilter::try_from_env("XSHTEST_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Flip the cancellation flag on the first Ctrl-C; exit on the second.
fn watch_interrupts(tx: watch::Sender<bool>) {
    thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                tracing::warn!(error = %e, "cannot watch for interrupts");
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            tracing::warn!("interrupted, tearing down");
            let _ = tx.send(true);
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(EXIT_INTERRUPTED);
            }
        });
    });
}

fn load_config(path: &Path, explicit: Option<&Path>) -> Result<SuiteConfig, loader::LoadError> {
    match loader::load_suite_config(path, explicit)? {
        Some((file, config)) => {
            tracing::info!(config = %file.display(), "loaded suite config");
            Ok(config)
        }
        None => Ok(SuiteConfig::default()),
    }
}

/// Discover and parse every selected test file. All parse errors are
/// reported before giving up.
fn load_tests(
    path: &Path,
    config: &SuiteConfig,
) -> Result<Vec<parser::TestFile>, Vec<String>> {
    let mut discovery = loader::Discovery::new(&config.setup_file, &config.include, &config.exclude)
        .map_err(|e| vec![e.to_string()])?;
    if let Some(dir) = &config.expectations_dir {
        discovery = discovery.skip_dir(dir);
    }
    let paths = discovery.find_tests(path).map_err(|e| vec![e.to_string()])?;
    if paths.is_empty() {
        return Err(vec![format!("No test files found at: {}", path.display())]);
    }

    let mut files = Vec::new();
    let mut errors = Vec::new();
    for test in &paths {
        match loader::load_test_file(test, path, config.expectations_dir.as_deref()) {
            Ok(file) => files.push(file),
            Err(e) => errors.push(e.to_string()),
        }
    }
    if errors.is_empty() {
        Ok(files)
    } else {
        Err(errors)
    }
}

fn run(args: RunArgs) -> i32 {
    let mut config = match load_config(&args.path, args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading suite config: {e}");
            return EXIT_CONFIG;
        }
    };
    if !args.include.is_empty() {
        config.include = args.include;
    }
    if !args.exclude.is_empty() {
        config.exclude = args.exclude;
    }
    if args.timeout.is_some() {
        config.timeout = args.timeout;
    }
    config.sandbox.binaries.extend(args.server_binaries);

    let files = match load_tests(&args.path, &config) {
        Ok(files) => loader::filter_by_tags(files, &args.tag, &args.skip_tag),
        Err(errors) => {
            for error in errors {
                eprintln!("✗ {error}");
            }
            return EXIT_CONFIG;
        }
    };
    if let Some(ref f) = args.filter {
        tracing::info!(filter = %f, "filtering blocks");
    }

    let shell = args
        .shell
        .or_else(|| config.shell.path.clone())
        .unwrap_or_else(|| PathBuf::from("mysqlsh"));
    let mut settings = runner::RunSettings::new(config, shell);
    if let Some(jobs) = args.jobs {
        settings.jobs = jobs;
    }
    settings.filter = args.filter;

    let (tx, rx) = watch::channel(false);
    watch_interrupts(tx);

    let suite = match runner::run_suite(&settings, files, rx) {
        Ok(suite) => suite,
        Err(e) => {
            eprintln!("Error: {e}");
            return EXIT_CONFIG;
        }
    };

    match report::render(args.output, &suite, args.verbose) {
        Ok(text) => print!("{text}"),
        Err(e) => eprintln!("Error rendering report: {e}"),
    }
    let mut code = suite.exit_code();
    if let Some(path) = &args.xml
        && let Err(e) = fs::write(path, report::format_junit_xml(&suite))
    {
        eprintln!("Error writing {}: {e}", path.display());
        if code == 0 {
            code = 1;
        }
    }
    code
}

fn validate(path: &Path, explicit: Option<&Path>) -> i32 {
    let config = match load_config(path, explicit) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading suite config: {e}");
            return EXIT_CONFIG;
        }
    };
    let mut discovery = match loader::Discovery::new(&config.setup_file, &config.include, &config.exclude) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Error: {e}");
            return EXIT_CONFIG;
        }
    };
    if let Some(dir) = &config.expectations_dir {
        discovery = discovery.skip_dir(dir);
    }
    let tests = match discovery.find_tests(path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error finding tests: {e}");
            return EXIT_CONFIG;
        }
    };
    if tests.is_empty() {
        eprintln!("No test files found at: {}", path.display());
        return 1;
    }

    let mut errors = 0;
    for test in &tests {
        match loader::load_test_file(test, path, config.expectations_dir.as_deref()) {
            Ok(file) => {
                let code = file.code_blocks().count();
                println!(
                    "✓ {} ({} blocks, {code} code)",
                    test.display(),
                    file.blocks.len()
                );
            }
            Err(e) => {
                eprintln!("✗ {e}");
                errors += 1;
            }
        }
    }

    if errors > 0 {
        eprintln!("\n{errors} file(s) failed validation");
        return 1;
    }
    println!("\nAll {} file(s) valid", tests.len());
    0
}

const CONFIG_TEMPLATE: &str = r#"version: 1

shell:
  # path: /usr/local/bin/mysqlsh
  args: []

# Seconds per shell invocation.
timeout: 300

server:
  host: localhost
  user: root
  password: root
  port: 3306
  xport: 33060

sandbox:
  # default_binary: /usr/sbin/mysqld
  # binaries:
  #   "5.7": /opt/mysql-5.7/bin/mysqld
  sandboxes_per_file: 3

ports:
  base: 3310
  range_size: 10
  ranges: 4

# setup:
#   - run:
#       cmd: ./prepare.sh
# file_teardown:
#   - remove_dir: scratch
"#;

const SAMPLE_TEST: &str = r#"#@ hello
print("hello world")
#@<OUT> hello
hello world

#@ version_number {VER(>=8.0.0)}
print(__version_num__ >= 80000)
#@<OUT> version_number
True
"#;

fn init(dir: &Path) -> i32 {
    let config = dir.join(loader::SUITE_CONFIG_FILENAMES[0]);
    let sample = dir.join("sample.py");
    for path in [&config, &sample] {
        if path.exists() {
            eprintln!("Error: file already exists: {}", path.display());
            return 1;
        }
    }
    if let Err(e) = fs::create_dir_all(dir) {
        eprintln!("Error creating directory: {e}");
        return 1;
    }
    for (path, contents) in [(&config, CONFIG_TEMPLATE), (&sample, SAMPLE_TEST)] {
        if let Err(e) = fs::write(path, contents) {
            eprintln!("Error writing file: {e}");
            return 1;
        }
        println!("Created: {}", path.display());
    }
    0
}

fn main() {
    let cli = Cli::parse();
    let verbose = matches!(&cli.command, Command::Run(args) if args.verbose);
    init_tracing(verbose);

    let code = match cli.command {
        Command::Run(args) => run(args),
        Command::Validate { path, config } => validate(&path, config.as_deref()),
        Command::Init { path } => init(&path),
        Command::Schema => match serde_json::to_string_pretty(&schema::generate_schema()) {
            Ok(json) => {
                println!("{json}");
                0
            }
            Err(e) => {
                eprintln!("Error serializing schema: {e}");
                1
            }
        },
    };
    std::process::exit(code);
}
