//! Remote text-completion collaborator seam.
//!
//! The call is modeled as a pollable, cancellable task so an asynchronous
//! transport can plug in later without changing the session state graph. The
//! bundled daemon client is synchronous: `begin` performs the whole call and
//! the first `poll` returns the outcome, which collapses the orchestrator's
//! two remote-call states into a single transition.

/// Failure of a remote completion call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("service returned status {0}")]
    Status(u16),
}

/// Remote text-completion client. Exactly one call is in flight at a time;
/// `begin` while a call is pending replaces it.
pub trait CompletionClient {
    /// Start a completion call for `prompt`.
    fn begin(&mut self, prompt: &str);

    /// Poll the in-flight call. `Some` exactly once when it finishes;
    /// `None` while still pending (or after the outcome was taken).
    fn poll(&mut self) -> Option<Result<String, CompletionError>>;

    /// Abandon the in-flight call, if any. Its outcome is never delivered.
    fn cancel(&mut self);
}
