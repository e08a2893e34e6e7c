//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/warble/config.toml or
/// /etc/warble/config.toml. Env overrides: WARBLE_ASR_ADDR,
/// WARBLE_CONTROL_PORT, WARBLE_CHAT_HOST, WARBLE_CHAT_PORT,
/// WARBLE_CHAT_TOKEN, WARBLE_CHAT_USER.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address of the serial-over-TCP bridge to the ASR module.
    #[serde(default = "default_asr_addr")]
    pub asr_addr: String,
    /// Operator control channel TCP port (default 45680).
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Completion service host.
    #[serde(default = "default_chat_host")]
    pub chat_host: String,
    /// Completion service port (default 10089).
    #[serde(default = "default_chat_port")]
    pub chat_port: u16,
    /// Completion service path.
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    /// Fallback auth token when no token has been stored.
    #[serde(default)]
    pub chat_token: String,
    /// User identifier sent with completion requests.
    #[serde(default)]
    pub chat_user: String,
    /// Ask the completion service to use web search.
    #[serde(default = "default_true")]
    pub web_search: bool,
}

fn default_asr_addr() -> String {
    "127.0.0.1:2217".to_string()
}
fn default_control_port() -> u16 {
    45680
}
fn default_chat_host() -> String {
    "192.168.0.103".to_string()
}
fn default_chat_port() -> u16 {
    10089
}
fn default_chat_path() -> String {
    "/chat/completions/".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            asr_addr: default_asr_addr(),
            control_port: default_control_port(),
            chat_host: default_chat_host(),
            chat_port: default_chat_port(),
            chat_path: default_chat_path(),
            chat_token: String::new(),
            chat_user: String::new(),
            web_search: true,
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("WARBLE_ASR_ADDR") {
        c.asr_addr = s;
    }
    if let Ok(s) = std::env::var("WARBLE_CONTROL_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.control_port = p;
        }
    }
    if let Ok(s) = std::env::var("WARBLE_CHAT_HOST") {
        c.chat_host = s;
    }
    if let Ok(s) = std::env::var("WARBLE_CHAT_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.chat_port = p;
        }
    }
    if let Ok(s) = std::env::var("WARBLE_CHAT_TOKEN") {
        c.chat_token = s;
    }
    if let Ok(s) = std::env::var("WARBLE_CHAT_USER") {
        c.chat_user = s;
    }
    c
}

pub fn config_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config/warble"))
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(dir) = config_dir() {
        out.push(dir.join("config.toml"));
    }
    out.push(PathBuf::from("/etc/warble/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(err) => tracing::warn!("ignoring malformed config {}: {err}", p.display()),
                }
            }
            break;
        }
    }
    None
}
