//! Error taxonomy of the agent core.

use overair_trust::TrustError;

use crate::types::{FailureClass, StepOutcome};

/// Extended result codes attached to failures the core itself produces.
/// Handlers carry their own extended codes through [`StepOutcome`].
pub mod extended_codes {
    pub const NONE: u32 = 0;
    pub const CONFIG: u32 = 0x0100_0001;
    pub const TRUST: u32 = 0x0200_0001;
    pub const TRANSIENT_IO: u32 = 0x0300_0001;
    pub const THROTTLED: u32 = 0x0300_0002;
    pub const VERIFICATION: u32 = 0x0400_0001;
    pub const HANDLER: u32 = 0x0500_0001;
    pub const PERSISTENCE: u32 = 0x0600_0001;
}

/// Everything that can go wrong inside the core, classified for the retry
/// machinery. Cancellation and reboot requests are not errors; they travel
/// as distinguished [`StepOutcome`] variants.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Malformed configuration or deployment document. Fatal.
    #[error("configuration error: {0}")]
    Config(String),

    /// Signature or anti-rollback failure. Surfaced, never retried.
    #[error(transparent)]
    Trust(#[from] TrustError),

    /// Network or partial-read failure. Retried under the download policy.
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// Cloud-reported throttling. Retried under the throttle policy with
    /// the server-provided `Retry-After` as a floor.
    #[error("throttled ({message}); server asks for {retry_after_secs}s")]
    Throttled {
        retry_after_secs: u64,
        message: String,
    },

    /// Hash mismatch. The payload is deleted; retried a bounded number of
    /// times, then fatal.
    #[error("payload verification failed: {0}")]
    Verification(String),

    /// A handler-returned failure.
    #[error("handler failure (extended code {extended_code:#x}): {message}")]
    Handler {
        class: FailureClass,
        extended_code: u32,
        message: String,
    },

    /// Persistence failures are fatal; recovery cannot be guaranteed
    /// without a durable record.
    #[error("failed to persist workflow state: {0}")]
    Persistence(String),
}

impl AgentError {
    /// Whether the retry machinery may try again.
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::TransientIo(_)
            | AgentError::Throttled { .. }
            | AgentError::Verification(_) => true,
            AgentError::Handler { class, .. } => *class == FailureClass::Transient,
            AgentError::Config(_) | AgentError::Trust(_) | AgentError::Persistence(_) => false,
        }
    }

    /// The extended result code reported for this failure.
    pub fn extended_code(&self) -> u32 {
        match self {
            AgentError::Config(_) => extended_codes::CONFIG,
            AgentError::Trust(_) => extended_codes::TRUST,
            AgentError::TransientIo(_) => extended_codes::TRANSIENT_IO,
            AgentError::Throttled { .. } => extended_codes::THROTTLED,
            AgentError::Verification(_) => extended_codes::VERIFICATION,
            AgentError::Handler { extended_code, .. } => *extended_code,
            AgentError::Persistence(_) => extended_codes::PERSISTENCE,
        }
    }

    /// Collapse into the handler-facing result sum.
    pub fn into_outcome(self) -> StepOutcome {
        let class = if self.is_transient() {
            FailureClass::Transient
        } else {
            FailureClass::Fatal
        };
        let extended_code = self.extended_code();
        StepOutcome::failed(class, extended_code, self.to_string())
    }
}
