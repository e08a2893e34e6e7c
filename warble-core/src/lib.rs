//! Warble ASR-link protocol and session orchestration.
//! Host-driven: no I/O and no clocks; the host feeds bytes and a monotonic
//! `now_ms` and performs the actions.

pub mod completion;
pub mod frame;
pub mod link;
pub mod session;

pub use completion::{CompletionClient, CompletionError};
pub use frame::{encode_frame, Frame, FrameDecoder, FrameError, FrameType, MAX_PAYLOAD};
pub use link::{
    truncate_chars, ByteChannel, Command, LinkManager, RecognitionResult, LINK_TIMEOUT_MS,
    TTS_MAX_CHARS,
};
pub use session::{
    RestartPolicy, SessionOrchestrator, SessionResult, SessionState, RECOGNITION_TIMEOUT_MS,
    RESPONSE_MAX_CHARS,
};
