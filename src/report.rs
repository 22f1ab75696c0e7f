use std::fmt;

use serde::{Deserialize, Serialize};

use crate::rules::ResourceEnvelope;
use crate::sandbox::{KillCause, RawOutcome};

/// Final classification of a job, exactly one per job
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Success,
    CompileError,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    InternalError,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "Success",
            Self::CompileError => "Compilation Error",
            Self::RuntimeError => "Runtime Error",
            Self::TimeLimitExceeded => "Time Limit Exceeded",
            Self::MemoryLimitExceeded => "Memory Limit Exceeded",
            Self::OutputLimitExceeded => "Output Limit Exceeded",
            Self::InternalError => "Internal Error",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StageReport {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub time_sec: f64,
    pub stdout: String,
    pub stderr: String,
}

impl From<&RawOutcome> for StageReport {
    fn from(outcome: &RawOutcome) -> Self {
        Self {
            exit_code: outcome.exit_code,
            signal: outcome.signal,
            time_sec: outcome.elapsed.as_secs_f64(),
            stdout: outcome.stdout.to_string_lossy(),
            stderr: outcome.stderr.to_string_lossy(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub verdict: Verdict,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub time_sec: f64,
    pub cpu_time_sec: f64,
    /// Bytes
    pub peak_memory: u64,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub compile: Option<StageReport>,
    pub message: Option<String>,
}

impl ExecutionResult {
    pub fn internal_error(message: impl Into<String>, compile: Option<&RawOutcome>) -> Self {
        Self {
            verdict: Verdict::InternalError,
            exit_code: None,
            signal: None,
            time_sec: 0.0,
            cpu_time_sec: 0.0,
            peak_memory: 0,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            compile: compile.map(StageReport::from),
            message: Some(message.into()),
        }
    }
}

fn compile_failed(compile: Option<&RawOutcome>) -> bool {
    compile.is_some_and(|c| !c.exited_cleanly())
}

/// Applies the verdict precedence: compile failure, watchdog kill, memory
/// ceiling, output budget, abnormal exit, success
pub fn classify(
    compile: Option<&RawOutcome>,
    run: Option<&RawOutcome>,
    envelope: &ResourceEnvelope,
) -> Verdict {
    if compile_failed(compile) {
        return Verdict::CompileError;
    }
    let Some(run) = run else {
        return Verdict::InternalError;
    };

    match run.kill_cause {
        Some(KillCause::WallTime | KillCause::CpuTime) => return Verdict::TimeLimitExceeded,
        Some(KillCause::Memory) => return Verdict::MemoryLimitExceeded,
        Some(KillCause::Output) | None => {}
    }

    // The kernel address-space cap can fail an allocation before the watchdog samples it
    if !run.exited_cleanly() && run.peak_memory >= envelope.memory_bytes {
        return Verdict::MemoryLimitExceeded;
    }
    if run.output_exceeded {
        return Verdict::OutputLimitExceeded;
    }
    if !run.exited_cleanly() {
        return Verdict::RuntimeError;
    }
    Verdict::Success
}

fn kill_message(cause: KillCause, envelope: &ResourceEnvelope) -> String {
    match cause {
        KillCause::WallTime => format!(
            "killed: wall time limit of {:.3} s exceeded",
            envelope.wall_time.as_secs_f64()
        ),
        KillCause::CpuTime => format!(
            "killed: cpu time limit of {:.3} s exceeded",
            envelope.cpu_time.as_secs_f64()
        ),
        KillCause::Memory => format!(
            "killed: memory limit of {} bytes exceeded",
            envelope.memory_bytes
        ),
        KillCause::Output => format!(
            "killed: output limit of {} bytes exceeded",
            envelope.output_bytes
        ),
    }
}

/// Builds the final result of a job from its compile and run outcomes
pub fn report(
    compile: Option<&RawOutcome>,
    run: Option<&RawOutcome>,
    envelope: &ResourceEnvelope,
) -> ExecutionResult {
    let verdict = classify(compile, run, envelope);
    let compile_report = compile.map(StageReport::from);

    if let (Verdict::CompileError, Some(compile)) = (verdict, compile) {
        // only the compiler's output is surfaced, no run stage happened
        return ExecutionResult {
            verdict,
            exit_code: compile.exit_code,
            signal: compile.signal,
            time_sec: compile.elapsed.as_secs_f64(),
            cpu_time_sec: compile.cpu_time.as_secs_f64(),
            peak_memory: compile.peak_memory,
            stdout: String::new(),
            stderr: compile.stderr.to_string_lossy(),
            stdout_truncated: false,
            stderr_truncated: compile.stderr.truncated,
            compile: compile_report,
            message: Some(compile_failed_reason(compile)),
        };
    }

    let Some(run) = run else {
        return ExecutionResult::internal_error("run stage produced no outcome", compile);
    };

    let message = run.kill_cause.map(|cause| kill_message(cause, envelope)).or_else(|| {
        match verdict {
            Verdict::MemoryLimitExceeded => Some(format!(
                "memory limit of {} bytes reached",
                envelope.memory_bytes
            )),
            Verdict::OutputLimitExceeded => Some(format!(
                "output limit of {} bytes exceeded",
                envelope.output_bytes
            )),
            _ => None,
        }
    });

    ExecutionResult {
        verdict,
        exit_code: run.exit_code,
        signal: run.signal,
        time_sec: run.elapsed.as_secs_f64(),
        cpu_time_sec: run.cpu_time.as_secs_f64(),
        peak_memory: run.peak_memory,
        stdout: run.stdout.to_string_lossy(),
        stderr: run.stderr.to_string_lossy(),
        stdout_truncated: run.stdout.truncated,
        stderr_truncated: run.stderr.truncated,
        compile: compile_report,
        message,
    }
}

fn compile_failed_reason(compile: &RawOutcome) -> String {
    match (compile.kill_cause, compile.signal, compile.exit_code) {
        (Some(cause), _, _) => format!("compilation killed: {cause} limit exceeded"),
        (None, Some(signal), _) => format!("compiler terminated by signal {signal}"),
        (None, None, Some(code)) => format!("compiler exited with code {code}"),
        (None, None, None) => "compiler failed".to_string(),
    }
}
