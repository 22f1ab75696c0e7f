use crate::rules::ResourceEnvelope;

use super::{CommandSpec, IsolationError, RawOutcome, SandboxHandle, Watchdog};

/// A mechanism that starts one command inside a confined environment
///
/// Implementations only differ in how the confinement is set up; supervision
/// of the started process is shared through [`Watchdog`]. The returned
/// handle is already running, and the caller owns its lifetime.
pub trait Isolator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts `spec` with the limits of `envelope` applied
    fn spawn(
        &self,
        spec: &CommandSpec,
        envelope: &ResourceEnvelope,
    ) -> Result<SandboxHandle, IsolationError>;

    /// Starts `spec` and supervises it to completion
    fn run(
        &self,
        spec: &CommandSpec,
        envelope: &ResourceEnvelope,
        watchdog: &Watchdog,
    ) -> Result<RawOutcome, IsolationError> {
        let handle = self.spawn(spec, envelope)?;
        log::debug!("{} started {:?}", self.name(), spec.argv);
        watchdog.supervise(handle, envelope)
    }
}
