// Warble daemon: drives the voice-assistant session loop over the ASR
// byte channel and exposes a localhost control socket for operators.

mod channel;
mod chat;
mod config;
mod control;
mod token;

use std::time::{Duration, Instant};

use anyhow::Context;

use warble_core::{truncate_chars, LinkManager, SessionOrchestrator};

use crate::channel::TcpByteChannel;
use crate::chat::ChatClient;
use crate::control::{ControlCommand, ControlServer};
use crate::token::TokenStore;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const TICK_INTERVAL: Duration = Duration::from_millis(10);

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("warble-daemon {VERSION}");
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = config::load();
    let store = TokenStore::new();

    let channel = TcpByteChannel::connect(&cfg.asr_addr)
        .with_context(|| format!("connecting to asr bridge at {}", cfg.asr_addr))?;
    let link = LinkManager::new(channel);
    let chat = ChatClient::new(&cfg, store.clone())?;
    let mut orchestrator = SessionOrchestrator::new(link, chat);

    // Separate client for operator test requests so they never disturb an
    // in-flight session call.
    let mut test_client = ChatClient::new(&cfg, store.clone())?;
    let mut control = ControlServer::bind(cfg.control_port)?;

    tracing::info!(asr = %cfg.asr_addr, "warble-daemon {VERSION} running");

    let start = Instant::now();
    loop {
        let now_ms = start.elapsed().as_millis() as u64;
        orchestrator.advance(now_ms);

        for cmd in control.poll() {
            match cmd {
                ControlCommand::Listen => {
                    if orchestrator.start_listening(now_ms) {
                        control.notify("listening started");
                    } else {
                        control.notify("busy: session in progress");
                    }
                }
                ControlCommand::Stop => {
                    orchestrator.stop_listening();
                    control.notify("listening stopped");
                }
                ControlCommand::Status => {
                    let link_up = orchestrator.link().is_link_healthy(now_ms);
                    let msg = format!(
                        "state: {:?}, link: {}",
                        orchestrator.state(),
                        if link_up { "up" } else { "down" }
                    );
                    control.notify(&msg);
                }
                ControlCommand::Test(text) => match test_client.send(&text) {
                    Ok(reply) => {
                        let msg = format!("reply: {}", truncate_chars(&reply, 20));
                        control.notify(&msg);
                    }
                    Err(err) => control.notify(&format!("test failed: {err}")),
                },
                ControlCommand::SetToken(value) => match store.save(&value) {
                    Ok(()) => control.notify("token saved"),
                    Err(err) => control.notify(&format!("token save failed: {err}")),
                },
            }
        }

        if let Some(result) = orchestrator.take_result() {
            if result.succeeded {
                tracing::info!(
                    heard = %result.recognized_text,
                    reply = %result.remote_response_text,
                    elapsed_ms = result.elapsed_ms,
                    "session complete"
                );
                control.notify(&format!(
                    "ok: \"{}\" -> \"{}\" ({} ms)",
                    result.recognized_text, result.remote_response_text, result.elapsed_ms
                ));
            } else {
                let reason = result.error.as_deref().unwrap_or("unknown");
                tracing::warn!(elapsed_ms = result.elapsed_ms, "session failed: {reason}");
                control.notify(&format!("error: {reason}"));
            }
        }

        std::thread::sleep(TICK_INTERVAL);
    }
}
