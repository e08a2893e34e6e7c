//! Operator control channel: a line-based TCP socket on localhost. One
//! client at a time; a new connection replaces the previous one.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Listen,
    Stop,
    Status,
    Test(String),
    SetToken(String),
}

pub struct ControlServer {
    listener: TcpListener,
    client: Option<TcpStream>,
    buf: String,
}

impl ControlServer {
    pub fn bind(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        listener.set_nonblocking(true)?;
        tracing::info!(port, "control channel listening");
        Ok(Self {
            listener,
            client: None,
            buf: String::new(),
        })
    }

    /// Accept any waiting connection and parse complete lines from the
    /// current client. Never blocks.
    pub fn poll(&mut self) -> Vec<ControlCommand> {
        if let Ok((stream, peer)) = self.listener.accept() {
            if stream.set_nonblocking(true).is_ok() {
                tracing::info!(%peer, "control client connected");
                self.client = Some(stream);
                self.buf.clear();
            }
        }

        let mut commands = Vec::new();
        let Some(stream) = self.client.as_mut() else {
            return commands;
        };

        let mut disconnect = false;
        let mut chunk = [0u8; 256];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    tracing::info!("control client disconnected");
                    disconnect = true;
                    break;
                }
                Ok(n) => self.buf.push_str(&String::from_utf8_lossy(&chunk[..n])),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!("control read failed: {e}");
                    disconnect = true;
                    break;
                }
            }
        }
        if disconnect {
            self.client = None;
        }

        while let Some(pos) = self.buf.find('\n') {
            let line = self.buf[..pos].trim().to_string();
            self.buf.drain(..=pos);
            if line.is_empty() {
                continue;
            }
            match parse_command(&line) {
                Some(cmd) => commands.push(cmd),
                None => {
                    tracing::warn!(%line, "unknown control command");
                    self.notify("Unknown command");
                }
            }
        }
        commands
    }

    /// Best-effort line to the connected client, if any.
    pub fn notify(&mut self, message: &str) {
        if let Some(stream) = self.client.as_mut() {
            if writeln!(stream, "{message}").is_err() {
                self.client = None;
            }
        }
    }
}

fn parse_command(line: &str) -> Option<ControlCommand> {
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((h, r)) => (h, r.trim()),
        None => (line, ""),
    };
    match head.to_ascii_lowercase().as_str() {
        "listen" | "start" => Some(ControlCommand::Listen),
        "stop" => Some(ControlCommand::Stop),
        "status" => Some(ControlCommand::Status),
        "test" if !rest.is_empty() => Some(ControlCommand::Test(rest.to_string())),
        "token" if !rest.is_empty() => Some(ControlCommand::SetToken(rest.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_commands() {
        assert_eq!(parse_command("listen"), Some(ControlCommand::Listen));
        assert_eq!(parse_command("START"), Some(ControlCommand::Listen));
        assert_eq!(parse_command("stop"), Some(ControlCommand::Stop));
        assert_eq!(parse_command("status"), Some(ControlCommand::Status));
    }

    #[test]
    fn parse_commands_with_arguments() {
        assert_eq!(
            parse_command("test hello there"),
            Some(ControlCommand::Test("hello there".to_string()))
        );
        assert_eq!(
            parse_command("token abc123"),
            Some(ControlCommand::SetToken("abc123".to_string()))
        );
    }

    #[test]
    fn rejects_unknown_and_bare_argument_commands() {
        assert_eq!(parse_command("bogus"), None);
        assert_eq!(parse_command("test"), None);
        assert_eq!(parse_command("token"), None);
        assert_eq!(parse_command("token   "), None);
    }
}
