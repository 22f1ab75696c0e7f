use crate::report::{ExecutionResult, report};
use crate::rules::{ResourceEnvelope, Rule};
use crate::sandbox::{CommandSpec, Isolator, RawOutcome, Watchdog};
use crate::staging::{Job, JobPhase, Stager};

const INPUT_PLACEHOLDER: &str = "%INPUT%";
const OUTPUT_PLACEHOLDER: &str = "%OUTPUT%";

/// Fills `%INPUT%` and `%OUTPUT%` of a command template with the job's paths
pub fn substitute(template: &[String], job: &Job) -> Vec<String> {
    let input = job.source_path.display().to_string();
    let output = job.artifact_path().display().to_string();
    template
        .iter()
        .map(|arg| {
            arg.replace(INPUT_PLACEHOLDER, &input)
                .replace(OUTPUT_PLACEHOLDER, &output)
        })
        .collect()
}

/// Runs admitted jobs through staging, compile, run and reporting
///
/// Every call blocks until the job is finished and its scratch directories
/// are gone. Shared by all workers.
pub struct Executor {
    stager: Stager,
    isolator: Box<dyn Isolator>,
    watchdog: Watchdog,
}

impl Executor {
    pub fn new(stager: Stager, isolator: Box<dyn Isolator>, watchdog: Watchdog) -> Self {
        Self {
            stager,
            isolator,
            watchdog,
        }
    }

    pub fn execute(&self, rule: &Rule, source: &[u8], envelope: ResourceEnvelope) -> ExecutionResult {
        let mut job = match self.stager.stage(rule, source, envelope) {
            Ok(job) => job,
            Err(e) => {
                log::error!("Failed to stage {} submission: {e}", rule.name);
                return ExecutionResult::internal_error(format!("staging failed: {e}"), None);
            }
        };
        log::info!("Job {} ({}) staged", job.id, rule.name);

        let result = self.run_stages(rule, &mut job);
        job.advance(JobPhase::Finished);
        log::info!("Job {} finished: {}", job.id, result.verdict);

        let id = job.id.clone();
        if let Err(e) = self.stager.release(job) {
            log::error!("Failed to release job {id}: {e}");
        }
        result
    }

    fn run_stages(&self, rule: &Rule, job: &mut Job) -> ExecutionResult {
        let compile = if rule.has_compile_step() {
            job.advance(JobPhase::Compiling);
            match self.run_step(rule, &rule.compile, job, &rule.compile_envelope()) {
                Ok(outcome) => Some(outcome),
                Err(message) => return ExecutionResult::internal_error(message, None),
            }
        } else {
            None
        };

        if let Some(outcome) = compile.as_ref().filter(|c| !c.exited_cleanly()) {
            log::debug!("Job {} failed to compile", job.id);
            return report(Some(outcome), None, &job.envelope);
        }

        job.advance(JobPhase::Running);
        match self.run_step(rule, &rule.run, job, &job.envelope) {
            Ok(run) => report(compile.as_ref(), Some(&run), &job.envelope),
            Err(message) => ExecutionResult::internal_error(message, compile.as_ref()),
        }
    }

    fn run_step(
        &self,
        rule: &Rule,
        template: &[String],
        job: &Job,
        envelope: &ResourceEnvelope,
    ) -> Result<RawOutcome, String> {
        let spec = CommandSpec {
            argv: substitute(template, job),
            cwd: job.work_dir.clone(),
            env: rule.env.clone(),
            writable_paths: vec![job.work_dir.clone(), job.artifact_dir.clone()],
            readonly_paths: rule.mounts.clone(),
        };

        self.isolator
            .run(&spec, envelope, &self.watchdog)
            .map_err(|e| {
                log::error!(
                    "{} failed on job {} ({:?}): {e}",
                    self.isolator.name(),
                    job.id,
                    job.phase()
                );
                format!("{:?} stage: {e}", job.phase())
            })
    }
}
