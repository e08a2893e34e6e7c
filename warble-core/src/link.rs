//! Link manager: owns the byte channel to the ASR module, decodes inbound
//! frames, exposes send primitives and a liveness signal.

use std::io;

use crate::frame::{encode_frame, Frame, FrameDecoder, FrameType};

/// Maximum speech text length in characters; longer text is truncated at
/// encode time.
pub const TTS_MAX_CHARS: usize = 30;
/// The link is healthy while a valid frame arrived within this window.
pub const LINK_TIMEOUT_MS: u64 = 5_000;

const READ_CHUNK: usize = 64;

/// Non-blocking byte channel to the ASR module. The host implements this;
/// the link manager is its only user.
pub trait ByteChannel {
    /// Read available bytes. `Ok(0)` means nothing is available right now
    /// (never blocks).
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Write all bytes. Any partial write is an error.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Control commands understood by the ASR module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Reset = 0x01,
    StartListen = 0x02,
    StopListen = 0x03,
    GetVersion = 0x04,
}

/// Outcome of one recognition, parsed from a Recognition frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionResult {
    pub succeeded: bool,
    /// Recognized text (empty when not succeeded).
    pub text: String,
    /// Confidence 0-100.
    pub confidence: u8,
    /// Failure description (empty when succeeded).
    pub error: String,
}

impl RecognitionResult {
    fn failure(error: &str) -> Self {
        Self {
            succeeded: false,
            text: String::new(),
            confidence: 0,
            error: error.to_string(),
        }
    }
}

/// Parse a Recognition payload: `CONFIDENCE(1) CONTENT_LENGTH(1) CONTENT(..)`.
/// A malformed payload yields a failed result, never a truncated success.
fn parse_recognition(payload: &[u8]) -> RecognitionResult {
    if payload.len() < 2 {
        return RecognitionResult::failure("frame too short");
    }
    let confidence = payload[0];
    let content_length = payload[1] as usize;
    if content_length == 0 || content_length > payload.len() - 2 {
        return RecognitionResult::failure("invalid content length");
    }
    match std::str::from_utf8(&payload[2..2 + content_length]) {
        Ok(text) => RecognitionResult {
            succeeded: true,
            text: text.to_string(),
            confidence,
            error: String::new(),
        },
        Err(_) => RecognitionResult::failure("content is not valid UTF-8"),
    }
}

/// Truncate to at most `limit` characters, on a char boundary.
pub fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}

/// Drives the byte channel: decodes inbound frames, dispatches them by type,
/// transmits speech and command frames. Designed for single-threaded
/// cooperative polling; nothing here blocks.
pub struct LinkManager<C> {
    channel: C,
    decoder: FrameDecoder,
    pending: Option<RecognitionResult>,
    last_rx_ms: Option<u64>,
}

impl<C: ByteChannel> LinkManager<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            decoder: FrameDecoder::new(),
            pending: None,
            last_rx_ms: None,
        }
    }

    /// Drain available channel bytes and attempt one decode. Returns true
    /// when a Recognition frame was decoded and a new result recorded (the
    /// result itself may describe a failed recognition).
    pub fn poll(&mut self, now_ms: u64) -> bool {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.channel.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.decoder.extend(&buf[..n]),
                Err(err) => {
                    tracing::warn!("channel read failed: {err}");
                    break;
                }
            }
        }
        match self.decoder.next_frame() {
            Ok(Some(frame)) => {
                self.last_rx_ms = Some(now_ms);
                self.dispatch(frame)
            }
            Ok(None) => false,
            Err(err) => {
                tracing::warn!("dropped malformed frame: {err}");
                false
            }
        }
    }

    fn dispatch(&mut self, frame: Frame) -> bool {
        match frame.frame_type {
            FrameType::Recognition => {
                let result = parse_recognition(&frame.payload);
                if result.succeeded {
                    tracing::info!(
                        text = %result.text,
                        confidence = result.confidence,
                        "recognition received"
                    );
                } else {
                    tracing::warn!(error = %result.error, "invalid recognition payload");
                }
                self.pending = Some(result);
                true
            }
            FrameType::Acknowledge => {
                tracing::debug!(len = frame.payload.len(), "ack received");
                false
            }
            FrameType::Error => {
                tracing::warn!(
                    "module reported error: {}",
                    String::from_utf8_lossy(&frame.payload)
                );
                false
            }
            other => {
                tracing::warn!(frame_type = ?other, "unrecognized frame type from module");
                false
            }
        }
    }

    /// Take the pending recognition result, if any.
    pub fn take_recognition(&mut self) -> Option<RecognitionResult> {
        self.pending.take()
    }

    /// Request speech playback. Empty text is rejected without writing any
    /// bytes; over-long text is truncated to [`TTS_MAX_CHARS`].
    pub fn send_text_to_speech(&mut self, text: &str) -> bool {
        if text.is_empty() {
            tracing::warn!("rejecting empty speech request");
            return false;
        }
        let chars = text.chars().count();
        let spoken = if chars > TTS_MAX_CHARS {
            tracing::warn!(chars, limit = TTS_MAX_CHARS, "speech text truncated");
            truncate_chars(text, TTS_MAX_CHARS)
        } else {
            text
        };
        self.transmit(Frame::new(
            FrameType::TextToSpeech,
            spoken.as_bytes().to_vec(),
        ))
    }

    /// Send a 2-byte control command `[command, parameter]`.
    pub fn send_command(&mut self, command: Command, parameter: u8) -> bool {
        tracing::debug!(?command, parameter, "sending command");
        self.transmit(Frame::new(
            FrameType::Command,
            vec![command as u8, parameter],
        ))
    }

    fn transmit(&mut self, frame: Frame) -> bool {
        let bytes = match encode_frame(&frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!("frame encode failed: {err}");
                return false;
            }
        };
        match self.channel.write_all(&bytes) {
            Ok(()) => {
                tracing::debug!(
                    frame_type = ?frame.frame_type,
                    len = frame.payload.len(),
                    "frame sent"
                );
                true
            }
            Err(err) => {
                tracing::warn!("frame send failed: {err}");
                false
            }
        }
    }

    /// True iff a valid frame of any type was received within the last
    /// [`LINK_TIMEOUT_MS`]. Liveness signal only; never gates sends.
    pub fn is_link_healthy(&self, now_ms: u64) -> bool {
        self.last_rx_ms
            .is_some_and(|t| now_ms.saturating_sub(t) < LINK_TIMEOUT_MS)
    }
}
