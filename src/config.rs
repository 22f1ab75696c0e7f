use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "runjail", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    /// Path to the service configuration file (JSON)
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<PathBuf>,

    /// Rule file or directory with .json/.yaml rule files
    #[arg(long = "rules", short = 'r')]
    pub rules_path: PathBuf,

    /// Number of worker threads, overrides `scheduler.workers`
    #[arg(long = "threads", short = 't')]
    pub threads: Option<usize>,

    /// Verbosity: error, warn, info, debug, trace
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

impl CliArgs {
    /// Load the configuration from the specified file, or the defaults
    pub fn to_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => {
                let file = std::fs::File::open(path)
                    .with_context(|| format!("failed to open config {}", path.display()))?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader)
                    .with_context(|| format!("failed to parse config {}", path.display()))?
            }
            None => Config::default(),
        };

        if let Some(threads) = self.threads {
            config.scheduler.workers = threads;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub scratch: ScratchConfig,
    pub watchdog: WatchdogConfig,
    pub isolator: IsolatorConfig,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scheduler.workers == 0 {
            bail!("the number of workers must not be 0");
        }
        if self.scratch.sources_size_limit_bytes == 0 {
            bail!("sources_size_limit_bytes can't be zero");
        }
        if self.watchdog.poll_interval_ms == 0 || self.watchdog.poll_interval_ms >= 1000 {
            bail!(
                "watchdog poll interval must be within 1..1000 ms, got {}",
                self.watchdog.poll_interval_ms
            );
        }
        let headroom = self.isolator.memory_headroom();
        if !headroom.is_finite() || headroom < 1.0 {
            bail!("memory_headroom must be a finite factor >= 1, got {headroom}");
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub bind_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 1556,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Size of the worker pool
    pub workers: usize,
    /// Submissions allowed to wait for a worker before rejection
    pub backlog: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            backlog: 16,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ScratchConfig {
    pub sources_dir: Option<PathBuf>,
    pub artifacts_dir: Option<PathBuf>,
    pub sources_size_limit_bytes: u64,
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            sources_dir: None,
            artifacts_dir: None,
            sources_size_limit_bytes: 64 * 1024,
        }
    }
}

impl ScratchConfig {
    /// Resolves both scratch roots, falling back to the per-user cache dir,
    /// and creates them if missing
    pub fn resolve_roots(&self) -> anyhow::Result<(PathBuf, PathBuf)> {
        use directories::ProjectDirs;

        let cache_dir = || -> anyhow::Result<PathBuf> {
            let proj_dirs = ProjectDirs::from("", "", "runjail")
                .context("Unable to find user directory")?;
            Ok(proj_dirs.cache_dir().to_path_buf())
        };

        let sources = match &self.sources_dir {
            Some(dir) => dir.clone(),
            None => cache_dir()?.join("sources"),
        };
        let artifacts = match &self.artifacts_dir {
            Some(dir) => dir.clone(),
            None => cache_dir()?.join("artifacts"),
        };
        if sources == artifacts {
            bail!("sources_dir and artifacts_dir must be different directories");
        }

        for dir in [&sources, &artifacts] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create scratch root {}", dir.display()))?;
        }
        Ok((sources, artifacts))
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WatchdogConfig {
    pub poll_interval_ms: u64,
    pub grace_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            grace_ms: 200,
        }
    }
}

impl WatchdogConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IsolatorConfig {
    Embedded(EmbeddedConfig),
    External(ExternalConfig),
}

impl Default for IsolatorConfig {
    fn default() -> Self {
        Self::Embedded(EmbeddedConfig::default())
    }
}

impl IsolatorConfig {
    pub fn memory_headroom(&self) -> f64 {
        match self {
            Self::Embedded(c) => c.memory_headroom,
            Self::External(c) => c.memory_headroom,
        }
    }
}

fn default_readonly_paths() -> Vec<PathBuf> {
    ["/usr", "/lib", "/lib64", "/bin", "/etc"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

fn default_path_env() -> String {
    "/usr/local/bin:/usr/bin:/bin".to_string()
}

fn default_memory_headroom() -> f64 {
    2.0
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct EmbeddedConfig {
    /// Enter user/mount/net/ipc/uts namespaces and chroot into a fresh root
    #[serde(default = "default_true")]
    pub namespaces: bool,
    /// Empty directory used as the tmpfs root inside each job's mount namespace
    #[serde(default = "default_root_mountpoint")]
    pub root_mountpoint: PathBuf,
    #[serde(default = "default_readonly_paths")]
    pub readonly_paths: Vec<PathBuf>,
    #[serde(default = "default_path_env")]
    pub path_env: String,
    /// Address-space rlimit as a multiple of the memory limit
    #[serde(default = "default_memory_headroom")]
    pub memory_headroom: f64,
}

fn default_true() -> bool {
    true
}

fn default_root_mountpoint() -> PathBuf {
    std::env::temp_dir().join("runjail-root")
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            namespaces: true,
            root_mountpoint: default_root_mountpoint(),
            readonly_paths: default_readonly_paths(),
            path_env: default_path_env(),
            memory_headroom: default_memory_headroom(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ExternalConfig {
    #[serde(default = "default_nsjail_path")]
    pub nsjail_path: PathBuf,
    #[serde(default = "default_readonly_paths")]
    pub readonly_paths: Vec<PathBuf>,
    #[serde(default = "default_path_env")]
    pub path_env: String,
    #[serde(default = "default_memory_headroom")]
    pub memory_headroom: f64,
}

fn default_nsjail_path() -> PathBuf {
    PathBuf::from("/usr/bin/nsjail")
}
