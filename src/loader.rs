//! Suite loader.
//!
//! Loads the suite configuration, discovers test files and reads them.

use crate::parser::{self, ParseError, TestFile};
use crate::schema::SuiteConfig;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};

/// Error type for loading operations.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("unsupported config format: {0} (expected .yaml, .yml, or .toml)")]
    UnsupportedFormat(String),
    #[error("unsupported config version {0} (expected 1)")]
    Version(u32),
    #[error("invalid glob '{pattern}': {source}")]
    Glob {
        pattern: String,
        source: globset::Error,
    },
    #[error("{path}: {source}")]
    Parse { path: PathBuf, source: ParseError },
    #[error("test root {0} does not exist")]
    MissingRoot(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> LoadError + '_ {
    move |source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Suite configuration file names, in lookup order.
pub const SUITE_CONFIG_FILENAMES: &[&str] = &["xshtest.yaml", "xshtest.yml", "xshtest.toml"];

/// File extensions of test files.
pub const TEST_EXTENSIONS: &[&str] = &["py", "js", "sql"];

/// Load a suite configuration file. Relative paths inside it resolve
/// against the file's directory.
pub fn load_config_file(path: &Path) -> Result<SuiteConfig, LoadError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let contents = std::fs::read_to_string(path).map_err(io_error(path))?;

    let mut config: SuiteConfig = match ext {
        "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(|source| LoadError::Yaml {
            path: path.to_path_buf(),
            source,
        })?,
        "toml" => toml::from_str(&contents).map_err(|source| LoadError::Toml {
            path: path.to_path_buf(),
            source,
        })?,
        other => return Err(LoadError::UnsupportedFormat(other.to_string())),
    };
    if config.version != 1 {
        return Err(LoadError::Version(config.version));
    }

    let base = path.parent().unwrap_or(Path::new("."));
    let absolutize = |p: &mut PathBuf| {
        if p.is_relative() {
            *p = base.join(&*p);
        }
    };
    if let Some(dir) = config.expectations_dir.as_mut() {
        absolutize(dir);
    }
    if let Some(dir) = config.sandbox.root.as_mut() {
        absolutize(dir);
    }
    Ok(config)
}

/// Load the suite configuration for `root`.
///
/// An explicit path (from `--config` or `CONFIG_PATH`) wins; otherwise the
/// first of [`SUITE_CONFIG_FILENAMES`] found in `root` is used. Returns
/// `None` when there is no config file.
pub fn load_suite_config(
    root: &Path,
    explicit: Option<&Path>,
) -> Result<Option<(PathBuf, SuiteConfig)>, LoadError> {
    if let Some(path) = explicit {
        return Ok(Some((path.to_path_buf(), load_config_file(path)?)));
    }
    let dir = if root.is_file() {
        root.parent().unwrap_or(Path::new("."))
    } else {
        root
    };
    for name in SUITE_CONFIG_FILENAMES {
        let path = dir.join(name);
        if path.is_file() {
            let config = load_config_file(&path)?;
            return Ok(Some((path, config)));
        }
    }
    Ok(None)
}

/// Which files under the test root are selected.
#[derive(Debug)]
pub struct Discovery {
    setup_stem: String,
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
    skip_dirs: Vec<PathBuf>,
}

fn build_globs(patterns: &[String]) -> Result<Option<GlobSet>, LoadError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| LoadError::Glob {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map(Some)
        .map_err(|source| LoadError::Glob {
            pattern: patterns.join(", "),
            source,
        })
}

impl Discovery {
    pub fn new(
        setup_stem: &str,
        include: &[String],
        exclude: &[String],
    ) -> Result<Self, LoadError> {
        Ok(Self {
            setup_stem: setup_stem.to_string(),
            include: build_globs(include)?,
            exclude: build_globs(exclude)?,
            skip_dirs: Vec::new(),
        })
    }

    /// Directories that are never searched (the expectations mirror).
    pub fn skip_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.skip_dirs.push(dir.into());
        self
    }

    fn is_setup(&self, path: &Path) -> bool {
        path.file_stem().is_some_and(|s| *s == *self.setup_stem)
    }

    /// Patterns match the path relative to the root or the bare file name.
    fn selected(&self, rel: &Path) -> bool {
        let name = rel.file_name().map(Path::new).unwrap_or(rel);
        let hit = |set: &GlobSet| set.is_match(rel) || set.is_match(name);
        self.include.as_ref().is_none_or(hit) && !self.exclude.as_ref().is_some_and(hit)
    }

    /// Find test files under `root` (or `root` itself if it is a file).
    ///
    /// Within a directory the setup file comes first, then the other files
    /// in lexical order, then the subdirectories in lexical order. A setup
    /// file is kept whenever another file of its directory is selected.
    pub fn find_tests(&self, root: &Path) -> Result<Vec<PathBuf>, LoadError> {
        if !root.exists() {
            return Err(LoadError::MissingRoot(root.to_path_buf()));
        }
        if root.is_file() {
            return Ok(vec![root.to_path_buf()]);
        }
        let mut found = Vec::new();
        self.collect(root, root, &mut found)?;
        Ok(found)
    }

    fn collect(&self, root: &Path, dir: &Path, found: &mut Vec<PathBuf>) -> Result<(), LoadError> {
        if self.skip_dirs.iter().any(|s| dir == s) {
            return Ok(());
        }
        let mut entries = std::fs::read_dir(dir)
            .map_err(io_error(dir))?
            .map(|e| e.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_error(dir))?;
        entries.sort();

        let mut setup = None;
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        for path in entries {
            if path.is_dir() {
                dirs.push(path);
                continue;
            }
            let is_test = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| TEST_EXTENSIONS.contains(&e));
            if !is_test {
                continue;
            }
            if self.is_setup(&path) && setup.is_none() {
                setup = Some(path);
                continue;
            }
            let rel = path.strip_prefix(root).unwrap_or(&path);
            if self.selected(rel) {
                files.push(path);
            }
        }

        if let Some(setup) = setup {
            let rel = setup.strip_prefix(root).unwrap_or(&setup);
            if !files.is_empty() || self.selected(rel) {
                found.push(setup);
            }
        }
        found.extend(files);
        for sub in dirs {
            self.collect(root, &sub, found)?;
        }
        Ok(())
    }
}

/// Read and parse a test file. When `expectations_dir` is given, the file
/// at the same relative path below it contributes extra expectation blocks.
pub fn load_test_file(
    path: &Path,
    root: &Path,
    expectations_dir: Option<&Path>,
) -> Result<TestFile, LoadError> {
    let text = std::fs::read_to_string(path).map_err(io_error(path))?;
    let parse_err = |source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    };
    let mut file = parser::parse(path, &text).map_err(parse_err)?;

    if let Some(dir) = expectations_dir {
        let rel = if root.is_file() {
            path.file_name().map(Path::new).unwrap_or(path)
        } else {
            path.strip_prefix(root).unwrap_or(path)
        };
        let mirror = dir.join(rel);
        if mirror.is_file() {
            let text = std::fs::read_to_string(&mirror).map_err(io_error(&mirror))?;
            let extra = parser::parse_expectations(&mirror, &text).map_err(|source| {
                LoadError::Parse {
                    path: mirror.clone(),
                    source,
                }
            })?;
            file.merge_expectations(extra).map_err(|source| LoadError::Parse {
                path: mirror.clone(),
                source,
            })?;
            tracing::debug!(file = %path.display(), mirror = %mirror.display(), "merged external expectations");
        }
    }
    Ok(file)
}

/// Keep files carrying at least one of `tags` (all files when empty) and
/// none of `skip_tags`.
pub fn filter_by_tags(files: Vec<TestFile>, tags: &[String], skip_tags: &[String]) -> Vec<TestFile> {
    files
        .into_iter()
        .filter(|f| tags.is_empty() || f.tags.iter().any(|t| tags.contains(t)))
        .filter(|f| !f.tags.iter().any(|t| skip_tags.contains(t)))
        .collect()
}
