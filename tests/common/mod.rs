#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use runjail::config::{EmbeddedConfig, IsolatorConfig, SchedulerConfig};
use runjail::executor::Executor;
use runjail::rules::{Rule, RuleRegistry};
use runjail::sandbox::{Watchdog, create_isolator};
use runjail::scheduler::{Scheduler, Submission};
use runjail::staging::Stager;

pub const SOURCE_LIMIT: u64 = 4096;

fn limits() -> serde_json::Value {
    json!({
        "cpu_time_sec": 2.0,
        "wall_time_sec": 3.0,
        "memory_bytes": 64 * 1024 * 1024,
        "processes": 64,
        "output_bytes": 1024,
        "open_files": 64,
        "file_size_bytes": 1024 * 1024
    })
}

/// `sh` interprets the source, `shc` "compiles" it with a syntax check and a copy
pub fn registry() -> Arc<RuleRegistry> {
    let rules: Vec<Rule> = serde_json::from_value(json!([
        {
            "name": "sh",
            "extension": "sh",
            "run": ["/bin/sh", "%INPUT%"],
            "limits": limits()
        },
        {
            "name": "shc",
            "extension": "sh",
            "compile": ["/bin/sh", "-c", "/bin/sh -n \"$0\" && cp \"$0\" \"$1\"", "%INPUT%", "%OUTPUT%"],
            "run": ["/bin/sh", "%OUTPUT%"],
            "limits": limits(),
            "env": ["GREETING=hello"]
        }
    ]))
    .unwrap();
    Arc::new(RuleRegistry::from_rules(rules).unwrap())
}

pub struct TestService {
    pub scheduler: Arc<Scheduler>,
    pub sources: TempDir,
    pub artifacts: TempDir,
}

impl TestService {
    pub fn start(workers: usize, backlog: usize) -> Self {
        let sources = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();

        let stager = Stager::new(sources.path(), artifacts.path()).unwrap();
        let isolator = create_isolator(&IsolatorConfig::Embedded(EmbeddedConfig {
            namespaces: false,
            ..EmbeddedConfig::default()
        }))
        .unwrap();
        let watchdog = Watchdog::new(Duration::from_millis(20), Duration::from_millis(100));
        let executor = Arc::new(Executor::new(stager, isolator, watchdog));

        let scheduler = Scheduler::start(
            &SchedulerConfig { workers, backlog },
            SOURCE_LIMIT,
            registry(),
            executor,
        );

        Self {
            scheduler: Arc::new(scheduler),
            sources,
            artifacts,
        }
    }

    /// Both scratch roots hold no job directories
    pub fn scratch_is_empty(&self) -> bool {
        is_empty_dir(self.sources.path()) && is_empty_dir(self.artifacts.path())
    }
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path).unwrap().next().is_none()
}

pub fn submission(language: &str, source: &str) -> Submission {
    Submission {
        language: language.to_string(),
        source: source.to_string(),
        limits: Default::default(),
    }
}

pub fn submission_with_limits(language: &str, source: &str, limits: serde_json::Value) -> Submission {
    serde_json::from_value(json!({
        "language": language,
        "source": source,
        "limits": limits,
    }))
    .unwrap()
}
