use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::rules::{ResourceEnvelope, Rule};

// Jailed programs may run under a different uid (nsjail), the unique
// name keeps the directory private to its job
const JOB_DIR_PERMISSIONS: u32 = 0o777;
const ARTIFACT_NAME: &str = "main";
const MAX_NAME_ATTEMPTS: u32 = 64;

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("scratch root {path} is unusable: {reason}")]
    BadRoot { path: PathBuf, reason: String },
    #[error("failed to stage job in {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("could not find a free job directory name after {0} attempts")]
    NameExhausted(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Staged,
    Compiling,
    Running,
    Finished,
}

/// One submission materialized on disk
///
/// Owned by exactly one worker. Dropping a job without calling
/// [`Stager::release`] still removes its directories.
#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub language: String,
    pub work_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub source_path: PathBuf,
    pub envelope: ResourceEnvelope,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    phase: JobPhase,
    released: bool,
}

impl Job {
    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    /// Phases only move forward
    pub fn advance(&mut self, next: JobPhase) {
        debug_assert!(next as u8 >= self.phase as u8, "job phase went backwards");
        self.phase = next;
        if next == JobPhase::Finished {
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.artifact_dir.join(ARTIFACT_NAME)
    }

    fn remove_dirs(&mut self) -> io::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let work = remove_if_exists(&self.work_dir);
        let artifacts = remove_if_exists(&self.artifact_dir);
        work.and(artifacts)
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if let Err(e) = self.remove_dirs() {
            log::error!("Failed to clean up job {}: {e}", self.id);
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Creates per-job directories under the shared scratch roots
#[derive(Debug)]
pub struct Stager {
    sources_root: PathBuf,
    artifacts_root: PathBuf,
    counter: AtomicU64,
}

impl Stager {
    pub fn new(
        sources_root: impl Into<PathBuf>,
        artifacts_root: impl Into<PathBuf>,
    ) -> Result<Self, StagingError> {
        let sources_root = sources_root.into();
        let artifacts_root = artifacts_root.into();

        for root in [&sources_root, &artifacts_root] {
            let meta = fs::metadata(root).map_err(|e| StagingError::BadRoot {
                path: root.clone(),
                reason: e.to_string(),
            })?;
            if !meta.is_dir() {
                return Err(StagingError::BadRoot {
                    path: root.clone(),
                    reason: "not a directory".to_string(),
                });
            }
        }

        Ok(Self {
            sources_root,
            artifacts_root,
            counter: AtomicU64::new(0),
        })
    }

    /// Writes the source into a fresh, exclusively owned directory
    pub fn stage(
        &self,
        rule: &Rule,
        source: &[u8],
        envelope: ResourceEnvelope,
    ) -> Result<Job, StagingError> {
        let (id, work_dir, artifact_dir) = self.create_unique_dirs()?;

        // From here on the job owns both directories; an early return drops it and cleans up
        let job = Job {
            id: id.clone(),
            language: rule.name.clone(),
            artifact_dir,
            source_path: work_dir.join(rule.source_file_name()),
            work_dir,
            envelope,
            created_at: Utc::now(),
            finished_at: None,
            phase: JobPhase::Staged,
            released: false,
        };

        fs::write(&job.source_path, source).map_err(|source| StagingError::Io {
            path: job.source_path.clone(),
            source,
        })?;

        log::debug!("Staged job {id} ({}) in {}", job.language, job.work_dir.display());
        Ok(job)
    }

    /// Removes the job's directories; runs at most once per job
    pub fn release(&self, mut job: Job) -> Result<(), StagingError> {
        job.remove_dirs().map_err(|source| StagingError::Io {
            path: job.work_dir.clone(),
            source,
        })?;
        log::debug!("Released job {}", job.id);
        Ok(())
    }

    /// Claims a `(work_dir, artifact_dir)` pair under a fresh name
    fn create_unique_dirs(&self) -> Result<(String, PathBuf, PathBuf), StagingError> {
        let pid = std::process::id();
        for _ in 0..MAX_NAME_ATTEMPTS {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            let id = format!("job-{pid}-{n}");
            let work_dir = self.sources_root.join(&id);
            let artifact_dir = self.artifacts_root.join(&id);

            // `create` fails on an existing path, which is the atomic existence check
            match create_job_dir(&work_dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(StagingError::Io { path: work_dir, source }),
            }
            match create_job_dir(&artifact_dir) {
                Ok(()) => return Ok((id, work_dir, artifact_dir)),
                Err(e) => {
                    let _ = fs::remove_dir(&work_dir);
                    if e.kind() != io::ErrorKind::AlreadyExists {
                        return Err(StagingError::Io {
                            path: artifact_dir,
                            source: e,
                        });
                    }
                }
            }
        }
        Err(StagingError::NameExhausted(MAX_NAME_ATTEMPTS))
    }
}

/// Fails with `AlreadyExists` instead of reusing a directory
fn create_job_dir(path: &Path) -> io::Result<()> {
    DirBuilder::new().mode(JOB_DIR_PERMISSIONS).create(path)?;
    // the umask applies to `mode`, set the bits explicitly
    fs::set_permissions(path, fs::Permissions::from_mode(JOB_DIR_PERMISSIONS))
}
