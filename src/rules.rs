use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

// Compile stage fallbacks, used when a rule has no `compile_limits`
const COMPILE_CPU_TIME: f64 = 30.0; // seconds
const COMPILE_WALL_TIME: f64 = 30.0; // seconds
const COMPILE_MEMORY: u64 = 512 * 1024 * 1024;
const COMPILE_PROCESSES: u64 = 32;
const COMPILE_OUTPUT: u64 = 64 * 1024;
const COMPILE_OPEN_FILES: u64 = 512;
const COMPILE_FILE_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("failed to read rules from {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse rules file {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid rule for language '{language}': {reason}")]
    Invalid { language: String, reason: String },
    #[error("language '{0}' is defined more than once")]
    Duplicate(String),
    #[error("no rule for language '{0}'")]
    NotFound(String),
}

#[derive(Error, Debug, PartialEq)]
pub enum LimitError {
    #[error("limit '{0}' must be positive and finite")]
    NotPositive(&'static str),
    #[error("limit '{field}' = {requested} is above the language ceiling {ceiling}")]
    AboveRule {
        field: &'static str,
        requested: String,
        ceiling: String,
    },
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Second(pub f64);

impl Second {
    fn is_valid(self) -> bool {
        self.0.is_finite() && self.0 > 0.0
    }

    pub fn to_duration(self) -> Duration {
        Duration::try_from_secs_f64(self.0).unwrap_or(Duration::MAX)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn megabytes_ceil(self) -> u64 {
        self.0.div_ceil(1024 * 1024)
    }
}

/// Resource limits as written in a rule file
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Limits {
    #[serde(rename = "cpu_time_sec")]
    pub cpu_time: Second,
    #[serde(rename = "wall_time_sec")]
    pub wall_time: Second,
    #[serde(rename = "memory_bytes")]
    pub memory: ByteSize,
    pub processes: u64,
    #[serde(rename = "output_bytes")]
    pub output: ByteSize,
    pub open_files: u64,
    #[serde(rename = "file_size_bytes")]
    pub file_size: ByteSize,
}

impl Limits {
    fn compile_defaults() -> Self {
        Self {
            cpu_time: Second(COMPILE_CPU_TIME),
            wall_time: Second(COMPILE_WALL_TIME),
            memory: ByteSize(COMPILE_MEMORY),
            processes: COMPILE_PROCESSES,
            output: ByteSize(COMPILE_OUTPUT),
            open_files: COMPILE_OPEN_FILES,
            file_size: ByteSize(COMPILE_FILE_SIZE),
        }
    }

    fn check(&self) -> Result<(), LimitError> {
        if !self.cpu_time.is_valid() {
            return Err(LimitError::NotPositive("cpu_time_sec"));
        }
        if !self.wall_time.is_valid() {
            return Err(LimitError::NotPositive("wall_time_sec"));
        }
        for (field, value) in [
            ("memory_bytes", self.memory.0),
            ("processes", self.processes),
            ("output_bytes", self.output.0),
            ("open_files", self.open_files),
            ("file_size_bytes", self.file_size.0),
        ] {
            if value == 0 {
                return Err(LimitError::NotPositive(field));
            }
        }
        Ok(())
    }

    /// Legal but suspicious values only get a warning
    fn warn_suspicious(&self, language: &str) {
        let mb = self.memory.0 / (1024 * 1024);
        if mb < 16 {
            log::warn!("[{language}] memory limit {mb} MB seems very low");
        } else if mb > 4096 {
            log::warn!("[{language}] memory limit {mb} MB seems too high");
        }
        if self.wall_time.0 < 0.5 {
            log::warn!("[{language}] wall time {:.1} sec seems very low", self.wall_time.0);
        } else if self.wall_time.0 > 60.0 {
            log::warn!("[{language}] wall time {:.1} sec seems too high", self.wall_time.0);
        }
        if self.open_files < 3 {
            log::warn!("[{language}] open files limit {} seems very low", self.open_files);
        }
        if self.output.0 < 1024 {
            log::warn!("[{language}] output limit {} bytes seems very low", self.output.0);
        } else if self.output.0 > 1024 * 1024 * 1024 {
            log::warn!("[{language}] output limit {} bytes seems too high", self.output.0);
        }
    }

    pub fn envelope(&self) -> ResourceEnvelope {
        ResourceEnvelope {
            cpu_time: self.cpu_time.to_duration(),
            wall_time: self.wall_time.to_duration(),
            memory_bytes: self.memory.0,
            processes: self.processes,
            output_bytes: self.output.0,
            open_files: self.open_files,
            file_size_bytes: self.file_size.0,
        }
    }
}

/// Concrete limits applied to one sandboxed process group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEnvelope {
    pub cpu_time: Duration,
    pub wall_time: Duration,
    pub memory_bytes: u64,
    pub processes: u64,
    pub output_bytes: u64,
    pub open_files: u64,
    pub file_size_bytes: u64,
}

/// Per-submission limits; each one may only tighten the rule's default
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LimitOverrides {
    #[serde(rename = "cpu_time_sec")]
    pub cpu_time: Option<Second>,
    #[serde(rename = "wall_time_sec")]
    pub wall_time: Option<Second>,
    #[serde(rename = "memory_bytes")]
    pub memory: Option<ByteSize>,
    pub processes: Option<u64>,
    #[serde(rename = "output_bytes")]
    pub output: Option<ByteSize>,
}

fn tighten_seconds(
    field: &'static str,
    ceiling: Second,
    requested: Option<Second>,
) -> Result<Second, LimitError> {
    match requested {
        None => Ok(ceiling),
        Some(s) if !s.is_valid() => Err(LimitError::NotPositive(field)),
        Some(s) if s > ceiling => Err(LimitError::AboveRule {
            field,
            requested: s.0.to_string(),
            ceiling: ceiling.0.to_string(),
        }),
        Some(s) => Ok(s),
    }
}

fn tighten_count(field: &'static str, ceiling: u64, requested: Option<u64>) -> Result<u64, LimitError> {
    match requested {
        None => Ok(ceiling),
        Some(0) => Err(LimitError::NotPositive(field)),
        Some(n) if n > ceiling => Err(LimitError::AboveRule {
            field,
            requested: n.to_string(),
            ceiling: ceiling.to_string(),
        }),
        Some(n) => Ok(n),
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Rule {
    pub name: String,
    /// Source file extension, without the dot
    pub extension: String,
    /// Empty for interpreted languages
    #[serde(default)]
    pub compile: Vec<String>,
    pub run: Vec<String>,
    pub limits: Limits,
    pub compile_limits: Option<Limits>,
    /// Extra `KEY=VALUE` pairs for both stages
    #[serde(default)]
    pub env: Vec<String>,
    /// Extra read-only paths the toolchain needs
    #[serde(default)]
    pub mounts: Vec<PathBuf>,
}

impl Rule {
    pub fn has_compile_step(&self) -> bool {
        !self.compile.is_empty()
    }

    pub fn source_file_name(&self) -> String {
        format!("main.{}", self.extension)
    }

    pub fn compile_envelope(&self) -> ResourceEnvelope {
        self.compile_limits
            .clone()
            .unwrap_or_else(Limits::compile_defaults)
            .envelope()
    }

    /// Run envelope for one submission, overrides applied
    pub fn envelope(&self, overrides: &LimitOverrides) -> Result<ResourceEnvelope, LimitError> {
        let limits = Limits {
            cpu_time: tighten_seconds("cpu_time_sec", self.limits.cpu_time, overrides.cpu_time)?,
            wall_time: tighten_seconds("wall_time_sec", self.limits.wall_time, overrides.wall_time)?,
            memory: ByteSize(tighten_count(
                "memory_bytes",
                self.limits.memory.0,
                overrides.memory.map(|m| m.0),
            )?),
            processes: tighten_count("processes", self.limits.processes, overrides.processes)?,
            output: ByteSize(tighten_count(
                "output_bytes",
                self.limits.output.0,
                overrides.output.map(|o| o.0),
            )?),
            open_files: self.limits.open_files,
            file_size: self.limits.file_size,
        };
        Ok(limits.envelope())
    }

    fn validate(&self) -> Result<(), RuleError> {
        let invalid = |reason: String| RuleError::Invalid {
            language: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name can't be empty".into()));
        }
        if self.extension.is_empty()
            || !self.extension.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(invalid(format!("bad extension {:?}", self.extension)));
        }
        if self.run.is_empty() || self.run[0].is_empty() {
            return Err(invalid("run command can't be empty".into()));
        }
        if self.compile.first().is_some_and(|c| c.is_empty()) {
            return Err(invalid("compile command starts with an empty program".into()));
        }
        if let Some(bad) = self.env.iter().find(|e| !e.contains('=')) {
            return Err(invalid(format!("env entry {bad:?} is not KEY=VALUE")));
        }
        if let Some(bad) = self.mounts.iter().find(|m| !m.is_absolute()) {
            return Err(invalid(format!("mount {} is not absolute", bad.display())));
        }

        self.limits.check().map_err(|e| invalid(e.to_string()))?;
        if let Some(compile_limits) = &self.compile_limits {
            compile_limits
                .check()
                .map_err(|e| invalid(format!("compile limits: {e}")))?;
        }
        self.limits.warn_suspicious(&self.name);
        Ok(())
    }
}

#[derive(Deserialize)]
struct RuleFile {
    rules: Vec<Rule>,
}

/// Per-language rules, immutable once built
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: HashMap<String, Arc<Rule>>,
}

impl RuleRegistry {
    /// Loads a single rules file, or every .json/.yaml/.yml file of a directory
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let path = path.as_ref();
        let io_err = |source| RuleError::Io {
            path: path.to_path_buf(),
            source,
        };

        let files = if path.is_dir() {
            let mut files = Vec::new();
            for entry in fs::read_dir(path).map_err(io_err)? {
                let entry_path = entry.map_err(io_err)?.path();
                if entry_path.is_file() && rule_format(&entry_path).is_some() {
                    files.push(entry_path);
                }
            }
            files.sort();
            files
        } else {
            vec![path.to_path_buf()]
        };

        let mut rules = Vec::new();
        for file in &files {
            rules.extend(read_rule_file(file)?);
        }
        if rules.is_empty() {
            return Err(RuleError::Parse {
                path: path.to_path_buf(),
                message: "no rules defined".to_string(),
            });
        }
        Self::from_rules(rules)
    }

    pub fn from_rules(rules: impl IntoIterator<Item = Rule>) -> Result<Self, RuleError> {
        let mut map = HashMap::new();
        for rule in rules {
            rule.validate()?;
            if map.contains_key(&rule.name) {
                return Err(RuleError::Duplicate(rule.name));
            }
            map.insert(rule.name.clone(), Arc::new(rule));
        }
        Ok(Self { rules: map })
    }

    pub fn resolve(&self, language: &str) -> Result<Arc<Rule>, RuleError> {
        self.rules
            .get(language)
            .cloned()
            .ok_or_else(|| RuleError::NotFound(language.to_string()))
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }
}

enum RuleFormat {
    Json,
    Yaml,
}

fn rule_format(path: &Path) -> Option<RuleFormat> {
    match path.extension()?.to_str()? {
        "json" => Some(RuleFormat::Json),
        "yaml" | "yml" => Some(RuleFormat::Yaml),
        _ => None,
    }
}

fn read_rule_file(path: &Path) -> Result<Vec<Rule>, RuleError> {
    let text = fs::read_to_string(path).map_err(|source| RuleError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_err = |message: String| RuleError::Parse {
        path: path.to_path_buf(),
        message,
    };

    let file: RuleFile = match rule_format(path) {
        Some(RuleFormat::Yaml) => serde_yaml::from_str(&text).map_err(|e| parse_err(e.to_string()))?,
        _ => serde_json::from_str(&text).map_err(|e| parse_err(e.to_string()))?,
    };
    Ok(file.rules)
}
