//! Framing: sentinel-delimited frames with an XOR checksum over the payload.
//!
//! Wire layout: `START(0xAA) TYPE(1) LENGTH(2, LE) PAYLOAD(LENGTH) CHECKSUM(1) END(0xCC)`.
//! Body bytes (everything between the sentinels) are byte-stuffed: a body byte
//! equal to `START`, `END` or `ESC` is sent as `ESC, byte ^ 0x20`, so 0xAA on
//! the wire is always a frame start and 0xCC always a frame end. `LENGTH` and
//! `CHECKSUM` describe the logical (unescaped) payload. The module this
//! protocol was lifted from sent body bytes unescaped and could lose sync on
//! sentinel-valued payload bytes; the stuffing is a deliberate deviation (see
//! DESIGN.md).

/// Frame start sentinel.
pub const FRAME_START: u8 = 0xAA;
/// Frame end sentinel.
pub const FRAME_END: u8 = 0xCC;
/// Escape byte for sentinel-valued body bytes.
pub const FRAME_ESC: u8 = 0x7D;
const ESC_XOR: u8 = 0x20;

/// Receive buffer capacity on the module side.
pub const BUFFER_SIZE: usize = 512;
/// Maximum payload length: buffer capacity minus framing overhead.
pub const MAX_PAYLOAD: usize = BUFFER_SIZE - 8;

/// Frame type byte. Tags the payload's semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Recognition result (module -> controller).
    Recognition = 0x01,
    /// Speech playback request (controller -> module).
    TextToSpeech = 0x02,
    /// Control command (controller -> module).
    Command = 0x03,
    /// Acknowledge (both directions).
    Acknowledge = 0x04,
    /// Error report (both directions).
    Error = 0x05,
}

impl FrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(FrameType::Recognition),
            0x02 => Some(FrameType::TextToSpeech),
            0x03 => Some(FrameType::Command),
            0x04 => Some(FrameType::Acknowledge),
            0x05 => Some(FrameType::Error),
            _ => None,
        }
    }
}

/// One complete unit of wire exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            payload,
        }
    }
}

/// Error decoding or encoding a frame. Every decode error consumes the
/// offending frame's bytes; the stream position is kept.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("payload length {len} exceeds buffer capacity")]
    Oversize { len: usize },
    #[error("checksum mismatch (expected {expected:#04x}, received {received:#04x})")]
    ChecksumMismatch { expected: u8, received: u8 },
    #[error("missing end sentinel (found {found:#04x})")]
    MissingEnd { found: u8 },
    #[error("unknown frame type {0:#04x}")]
    UnknownType(u8),
    #[error("frame interrupted by a sentinel")]
    Truncated,
}

/// Running XOR of every payload byte.
pub fn xor_checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0, |acc, &b| acc ^ b)
}

fn push_escaped(out: &mut Vec<u8>, b: u8) {
    if b == FRAME_START || b == FRAME_END || b == FRAME_ESC {
        out.push(FRAME_ESC);
        out.push(b ^ ESC_XOR);
    } else {
        out.push(b);
    }
}

/// Encode a frame into wire bytes. Always succeeds for payloads within
/// capacity.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    if frame.payload.len() > MAX_PAYLOAD {
        return Err(FrameError::Oversize {
            len: frame.payload.len(),
        });
    }
    let len = frame.payload.len() as u16;
    let mut out = Vec::with_capacity(frame.payload.len() + 8);
    out.push(FRAME_START);
    push_escaped(&mut out, frame.frame_type as u8);
    push_escaped(&mut out, (len & 0xFF) as u8);
    push_escaped(&mut out, (len >> 8) as u8);
    for &b in &frame.payload {
        push_escaped(&mut out, b);
    }
    push_escaped(&mut out, xor_checksum(&frame.payload));
    out.push(FRAME_END);
    Ok(out)
}

/// Incremental decoder over a raw byte stream.
///
/// Feed bytes with [`extend`](Self::extend) as they arrive and call
/// [`next_frame`](Self::next_frame); it never blocks. `Ok(None)` means no
/// complete frame is buffered yet (garbage before a start sentinel is
/// discarded, a partial frame is retained for the next call).
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

enum Parse {
    NeedMore,
    /// Complete valid frame; `usize` is the body length consumed (start
    /// sentinel excluded).
    Frame(Frame, usize),
    /// Malformed frame; consume `usize` body bytes and report the error.
    Bad(FrameError, usize),
}

struct Unescaper<'a> {
    body: &'a [u8],
    pos: usize,
}

enum Logical {
    Byte(u8),
    NeedMore,
    /// A raw sentinel interrupted the body at this index.
    Interrupted(usize, u8),
}

impl<'a> Unescaper<'a> {
    fn next(&mut self) -> Logical {
        let Some(&raw) = self.body.get(self.pos) else {
            return Logical::NeedMore;
        };
        match raw {
            FRAME_START | FRAME_END => Logical::Interrupted(self.pos, raw),
            FRAME_ESC => match self.body.get(self.pos + 1) {
                None => Logical::NeedMore,
                Some(&e) => {
                    self.pos += 2;
                    Logical::Byte(e ^ ESC_XOR)
                }
            },
            b => {
                self.pos += 1;
                Logical::Byte(b)
            }
        }
    }
}

fn parse_body(body: &[u8]) -> Parse {
    let mut r = Unescaper { body, pos: 0 };

    // An unescaped start sentinel means the previous frame was cut short:
    // consume up to it so the next call resumes there. An unescaped end
    // sentinel is consumed along with the truncated frame.
    macro_rules! logical {
        () => {
            match r.next() {
                Logical::Byte(b) => b,
                Logical::NeedMore => return Parse::NeedMore,
                Logical::Interrupted(i, FRAME_START) => {
                    return Parse::Bad(FrameError::Truncated, i)
                }
                Logical::Interrupted(i, _) => return Parse::Bad(FrameError::Truncated, i + 1),
            }
        };
    }

    let type_byte = logical!();
    let len_lo = logical!();
    let len_hi = logical!();
    let len = u16::from_le_bytes([len_lo, len_hi]) as usize;
    if len > MAX_PAYLOAD {
        // Rejected before any payload data is consumed.
        return Parse::Bad(FrameError::Oversize { len }, r.pos);
    }

    let mut payload = Vec::with_capacity(len);
    for _ in 0..len {
        payload.push(logical!());
    }
    let received = logical!();

    let Some(&trailer) = body.get(r.pos) else {
        return Parse::NeedMore;
    };
    if trailer == FRAME_START {
        return Parse::Bad(FrameError::Truncated, r.pos);
    }
    let used = r.pos + 1;
    if trailer != FRAME_END {
        return Parse::Bad(FrameError::MissingEnd { found: trailer }, used);
    }
    let expected = xor_checksum(&payload);
    if received != expected {
        return Parse::Bad(FrameError::ChecksumMismatch { expected, received }, used);
    }
    match FrameType::from_byte(type_byte) {
        Some(frame_type) => Parse::Frame(
            Frame {
                frame_type,
                payload,
            },
            used,
        ),
        None => Parse::Bad(FrameError::UnknownType(type_byte), used),
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the channel.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempt one decode. `Ok(None)` when no complete frame is available
    /// yet; `Err` when a frame was present but malformed (its bytes are
    /// consumed, scanning resumes after it).
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        match self.buf.iter().position(|&b| b == FRAME_START) {
            None => {
                self.buf.clear();
                return Ok(None);
            }
            Some(i) if i > 0 => {
                self.buf.drain(..i);
            }
            _ => {}
        }
        match parse_body(&self.buf[1..]) {
            Parse::NeedMore => Ok(None),
            Parse::Frame(frame, used) => {
                self.buf.drain(..1 + used);
                Ok(Some(frame))
            }
            Parse::Bad(err, used) => {
                self.buf.drain(..1 + used);
                Err(err)
            }
        }
    }
}
