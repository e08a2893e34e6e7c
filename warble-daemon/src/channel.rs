//! Byte channel to the ASR module over a serial-over-TCP bridge.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use warble_core::ByteChannel;

/// Non-blocking TCP stream satisfying the core's byte-channel contract.
/// Frames are tiny, so a stalled write is retried briefly before being
/// reported as a send failure.
pub struct TcpByteChannel {
    stream: TcpStream,
}

const WRITE_STALL_LIMIT: u32 = 50;

impl TcpByteChannel {
    pub fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }
}

impl ByteChannel for TcpByteChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "asr link closed",
            )),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut off = 0;
        let mut stalls = 0;
        while off < bytes.len() {
            match self.stream.write(&bytes[off..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "asr link rejected write",
                    ))
                }
                Ok(n) => {
                    off += n;
                    stalls = 0;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    stalls += 1;
                    if stalls > WRITE_STALL_LIMIT {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "asr link write stalled",
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
