//! Session orchestrator: the state machine sequencing one
//! listen -> recognize -> remote completion -> speak cycle.

use crate::completion::CompletionClient;
use crate::link::{truncate_chars, ByteChannel, Command, LinkManager};

/// Watchdog for a recognition result, measured from state entry.
pub const RECOGNITION_TIMEOUT_MS: u64 = 60_000;
/// Remote responses are truncated to this many characters before playback.
pub const RESPONSE_MAX_CHARS: usize = 30;

/// Spoken best-effort when a cycle fails.
const FAILURE_PHRASE: &str = "Something went wrong";

/// Orchestrator states. The remote call completes synchronously today, so
/// SendingToRemote and WaitingForRemote collapse to one transition in
/// practice; the split is kept so an asynchronous completion client can plug
/// in without changing the state graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    WaitingForRecognition,
    SendingToRemote,
    WaitingForRemote,
    SendingSpeech,
    Error,
}

/// What `start_listening` does when a session is already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Abandon the in-flight session (cancelling any remote call) and start
    /// over with fresh timers.
    #[default]
    Restart,
    /// Refuse the request and leave the in-flight session untouched.
    Reject,
}

/// Outcome of one end-to-end cycle. Published once per completed or failed
/// cycle; overwritten by the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResult {
    pub succeeded: bool,
    pub recognized_text: String,
    /// Remote response, already truncated to [`RESPONSE_MAX_CHARS`].
    pub remote_response_text: String,
    pub error: Option<String>,
    /// Elapsed since `start_listening`.
    pub elapsed_ms: u64,
}

/// Single-session state machine. Driven by repeated non-blocking `advance`
/// calls from the host's cooperative loop; the host supplies a monotonic
/// `now_ms` so the core never reads a clock.
pub struct SessionOrchestrator<C, R> {
    link: LinkManager<C>,
    remote: R,
    state: SessionState,
    restart_policy: RestartPolicy,
    recognized_text: String,
    response_text: String,
    state_entered_ms: u64,
    session_started_ms: u64,
    pending_failure: Option<String>,
    result: Option<SessionResult>,
}

impl<C: ByteChannel, R: CompletionClient> SessionOrchestrator<C, R> {
    pub fn new(link: LinkManager<C>, remote: R) -> Self {
        Self {
            link,
            remote,
            state: SessionState::Idle,
            restart_policy: RestartPolicy::default(),
            recognized_text: String::new(),
            response_text: String::new(),
            state_entered_ms: 0,
            session_started_ms: 0,
            pending_failure: None,
            result: None,
        }
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The link manager, e.g. for liveness queries.
    pub fn link(&self) -> &LinkManager<C> {
        &self.link
    }

    /// Send the start-listening command, reset session state and timers, and
    /// enter WaitingForRecognition. Returns the command-send outcome; the
    /// transition happens regardless. Behavior while a session is in flight
    /// is governed by the [`RestartPolicy`].
    pub fn start_listening(&mut self, now_ms: u64) -> bool {
        if self.state != SessionState::Idle {
            match self.restart_policy {
                RestartPolicy::Reject => {
                    tracing::warn!(state = ?self.state, "listen request rejected, session in flight");
                    return false;
                }
                RestartPolicy::Restart => {
                    tracing::info!(state = ?self.state, "restarting session");
                    self.remote.cancel();
                }
            }
        }
        self.recognized_text.clear();
        self.response_text.clear();
        self.pending_failure = None;
        self.session_started_ms = now_ms;
        let sent = self.link.send_command(Command::StartListen, 0);
        if !sent {
            tracing::warn!("start-listen command send failed");
        }
        self.enter(SessionState::WaitingForRecognition, now_ms);
        sent
    }

    /// Send the stop-listening command and force Idle unconditionally. No
    /// result is published for the abandoned session.
    pub fn stop_listening(&mut self) -> bool {
        let sent = self.link.send_command(Command::StopListen, 0);
        self.remote.cancel();
        self.state = SessionState::Idle;
        sent
    }

    /// Return and clear the last published result.
    pub fn take_result(&mut self) -> Option<SessionResult> {
        self.result.take()
    }

    /// One iteration of the cooperative loop: always polls the link first
    /// (late recognition frames are drained even outside
    /// WaitingForRecognition, then discarded), then performs one state's
    /// work.
    pub fn advance(&mut self, now_ms: u64) {
        if self.link.poll(now_ms) {
            if let Some(result) = self.link.take_recognition() {
                if self.state == SessionState::WaitingForRecognition {
                    if result.succeeded {
                        self.recognized_text = result.text;
                        self.enter(SessionState::SendingToRemote, now_ms);
                    } else {
                        self.fail(format!("recognition failed: {}", result.error), now_ms);
                    }
                } else {
                    tracing::debug!(state = ?self.state, "discarding recognition outside session");
                }
            }
        }

        match self.state {
            SessionState::Idle => {}
            SessionState::WaitingForRecognition => {
                if now_ms.saturating_sub(self.state_entered_ms) > RECOGNITION_TIMEOUT_MS {
                    self.fail("recognition timeout".to_string(), now_ms);
                }
            }
            SessionState::SendingToRemote => {
                tracing::info!(prompt = %self.recognized_text, "requesting completion");
                self.remote.begin(&self.recognized_text);
                self.enter(SessionState::WaitingForRemote, now_ms);
            }
            SessionState::WaitingForRemote => match self.remote.poll() {
                None => {}
                Some(Ok(content)) => {
                    let truncated = truncate_chars(&content, RESPONSE_MAX_CHARS);
                    if truncated.len() < content.len() {
                        tracing::info!(
                            limit = RESPONSE_MAX_CHARS,
                            "completion truncated for playback"
                        );
                    }
                    self.response_text = truncated.to_string();
                    self.enter(SessionState::SendingSpeech, now_ms);
                }
                Some(Err(err)) => self.fail(format!("completion failed: {err}"), now_ms),
            },
            SessionState::SendingSpeech => {
                if self.response_text.is_empty() {
                    self.fail("no response content to speak".to_string(), now_ms);
                } else if self.link.send_text_to_speech(&self.response_text) {
                    self.publish(true, None, now_ms);
                    self.state = SessionState::Idle;
                } else {
                    self.fail("speech request send failed".to_string(), now_ms);
                }
            }
            SessionState::Error => {
                let reason = self
                    .pending_failure
                    .take()
                    .unwrap_or_else(|| "unknown error".to_string());
                self.publish(false, Some(reason), now_ms);
                self.state = SessionState::Idle;
            }
        }
    }

    fn enter(&mut self, state: SessionState, now_ms: u64) {
        tracing::debug!(from = ?self.state, to = ?state, "state transition");
        self.state = state;
        self.state_entered_ms = now_ms;
    }

    fn fail(&mut self, reason: String, now_ms: u64) {
        tracing::warn!(%reason, "session error");
        // Best-effort apology; its own failure is not retried.
        let _ = self.link.send_text_to_speech(FAILURE_PHRASE);
        self.pending_failure = Some(reason);
        self.enter(SessionState::Error, now_ms);
    }

    fn publish(&mut self, succeeded: bool, error: Option<String>, now_ms: u64) {
        self.result = Some(SessionResult {
            succeeded,
            recognized_text: self.recognized_text.clone(),
            remote_response_text: self.response_text.clone(),
            error,
            elapsed_ms: now_ms.saturating_sub(self.session_started_ms),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionError;
    use crate::frame::{encode_frame, Frame, FrameDecoder, FrameType};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io;
    use std::rc::Rc;

    /// Channel whose buffers the test keeps a handle to, so bytes can be
    /// injected mid-session.
    #[derive(Default, Clone)]
    struct SharedChannel {
        rx: Rc<RefCell<VecDeque<u8>>>,
        tx: Rc<RefCell<Vec<u8>>>,
    }

    impl SharedChannel {
        fn inject(&self, bytes: &[u8]) {
            self.rx.borrow_mut().extend(bytes);
        }

        fn sent_frames(&self) -> Vec<Frame> {
            let mut decoder = FrameDecoder::new();
            decoder.extend(&self.tx.borrow());
            let mut out = Vec::new();
            while let Some(frame) = decoder.next_frame().unwrap() {
                out.push(frame);
            }
            out
        }
    }

    impl ByteChannel for SharedChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut rx = self.rx.borrow_mut();
            let n = rx.len().min(buf.len());
            for slot in buf.iter_mut().take(n) {
                *slot = rx.pop_front().unwrap();
            }
            Ok(n)
        }

        fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.tx.borrow_mut().extend_from_slice(bytes);
            Ok(())
        }
    }

    /// Completion client scripted with a single canned reply.
    #[derive(Default)]
    struct StubClient {
        reply: Option<Result<String, CompletionError>>,
        in_flight: Option<Result<String, CompletionError>>,
        prompts: Vec<String>,
        cancelled: u32,
    }

    impl CompletionClient for StubClient {
        fn begin(&mut self, prompt: &str) {
            self.prompts.push(prompt.to_string());
            self.in_flight = self.reply.clone();
        }

        fn poll(&mut self) -> Option<Result<String, CompletionError>> {
            self.in_flight.take()
        }

        fn cancel(&mut self) {
            self.cancelled += 1;
            self.in_flight = None;
        }
    }

    fn orchestrator(
        reply: Option<Result<String, CompletionError>>,
    ) -> (SessionOrchestrator<SharedChannel, StubClient>, SharedChannel) {
        let channel = SharedChannel::default();
        let link = LinkManager::new(channel.clone());
        let client = StubClient {
            reply,
            ..Default::default()
        };
        (SessionOrchestrator::new(link, client), channel)
    }

    fn recognition_bytes(confidence: u8, content: &str) -> Vec<u8> {
        let mut payload = vec![confidence, content.len() as u8];
        payload.extend_from_slice(content.as_bytes());
        encode_frame(&Frame::new(FrameType::Recognition, payload)).unwrap()
    }

    #[test]
    fn full_cycle_truncates_response_and_returns_idle() {
        let reply = "Hello there, how can I help you today right now";
        let (mut orch, channel) = orchestrator(Some(Ok(reply.to_string())));

        assert!(orch.start_listening(1_000));
        assert_eq!(orch.state(), SessionState::WaitingForRecognition);

        channel.inject(&recognition_bytes(85, "open the door"));
        orch.advance(1_200); // recognition -> SendingToRemote -> call begun
        assert_eq!(orch.state(), SessionState::WaitingForRemote);
        orch.advance(1_220); // poll Ok -> SendingSpeech
        orch.advance(1_230); // speak, publish, Idle

        assert_eq!(orch.state(), SessionState::Idle);
        let result = orch.take_result().unwrap();
        assert!(result.succeeded);
        assert_eq!(result.recognized_text, "open the door");
        assert_eq!(
            result.remote_response_text,
            truncate_chars(reply, RESPONSE_MAX_CHARS)
        );
        assert_eq!(result.remote_response_text.chars().count(), RESPONSE_MAX_CHARS);
        assert_eq!(result.elapsed_ms, 230);
        assert!(result.error.is_none());
        assert!(orch.take_result().is_none());

        // StartListen command, then the spoken response.
        let sent = channel.sent_frames();
        assert_eq!(sent[0].frame_type, FrameType::Command);
        assert_eq!(sent[0].payload[0], Command::StartListen as u8);
        let spoken = sent.last().unwrap();
        assert_eq!(spoken.frame_type, FrameType::TextToSpeech);
        assert_eq!(
            spoken.payload,
            truncate_chars(reply, RESPONSE_MAX_CHARS).as_bytes()
        );
    }

    #[test]
    fn recognition_timeout_publishes_exactly_one_failure() {
        let (mut orch, _channel) = orchestrator(None);
        orch.start_listening(0);

        orch.advance(RECOGNITION_TIMEOUT_MS); // exactly at the bound: no timeout yet
        assert_eq!(orch.state(), SessionState::WaitingForRecognition);

        orch.advance(RECOGNITION_TIMEOUT_MS + 1); // -> Error
        orch.advance(RECOGNITION_TIMEOUT_MS + 2); // publish, -> Idle
        let result = orch.take_result().unwrap();
        assert!(!result.succeeded);
        assert_eq!(result.error.as_deref(), Some("recognition timeout"));

        orch.advance(RECOGNITION_TIMEOUT_MS + 100);
        assert!(orch.take_result().is_none());
        assert_eq!(orch.state(), SessionState::Idle);
    }

    #[test]
    fn restart_resets_the_watchdog() {
        let (mut orch, _channel) = orchestrator(None);
        orch.start_listening(0);
        orch.start_listening(50_000);

        // 100s after the first start, 50s after the second: still waiting.
        orch.advance(100_000);
        assert_eq!(orch.state(), SessionState::WaitingForRecognition);
        assert!(orch.take_result().is_none());

        orch.advance(110_001);
        orch.advance(110_002);
        let result = orch.take_result().unwrap();
        assert_eq!(result.error.as_deref(), Some("recognition timeout"));
        // Elapsed is measured from the restart.
        assert_eq!(result.elapsed_ms, 60_002);
    }

    #[test]
    fn reject_policy_refuses_reentry() {
        let (orch, _channel) = orchestrator(None);
        let mut orch = orch.with_restart_policy(RestartPolicy::Reject);
        assert!(orch.start_listening(0));
        assert!(!orch.start_listening(50_000));

        // The first session's watchdog still applies.
        orch.advance(60_001);
        orch.advance(60_002);
        assert_eq!(
            orch.take_result().unwrap().error.as_deref(),
            Some("recognition timeout")
        );
    }

    #[test]
    fn corrupted_frame_keeps_waiting() {
        let (mut orch, channel) = orchestrator(None);
        orch.start_listening(0);

        let mut bytes = recognition_bytes(85, "open the door");
        bytes[5] ^= 0x01;
        channel.inject(&bytes);

        orch.advance(100);
        assert_eq!(orch.state(), SessionState::WaitingForRecognition);
        assert!(orch.take_result().is_none());
    }

    #[test]
    fn failed_recognition_reports_session_error() {
        let (mut orch, channel) = orchestrator(None);
        orch.start_listening(0);

        // Structurally valid frame with an invalid inner payload.
        let bytes = encode_frame(&Frame::new(FrameType::Recognition, vec![85, 0])).unwrap();
        channel.inject(&bytes);

        orch.advance(100); // failure -> Error -> published in same pass
        assert_eq!(orch.state(), SessionState::Idle);
        let result = orch.take_result().unwrap();
        assert!(!result.succeeded);
        assert_eq!(
            result.error.as_deref(),
            Some("recognition failed: invalid content length")
        );
        // Best-effort apology was spoken.
        let spoken = channel.sent_frames();
        assert!(spoken
            .iter()
            .any(|f| f.frame_type == FrameType::TextToSpeech
                && f.payload == FAILURE_PHRASE.as_bytes()));
    }

    #[test]
    fn late_recognition_is_discarded_when_idle() {
        let (mut orch, channel) = orchestrator(None);
        channel.inject(&recognition_bytes(90, "hello"));
        orch.advance(100);
        assert_eq!(orch.state(), SessionState::Idle);
        assert!(orch.take_result().is_none());
    }

    #[test]
    fn remote_failure_reports_session_error() {
        let (mut orch, channel) = orchestrator(Some(Err(CompletionError::Status(500))));
        orch.start_listening(0);
        channel.inject(&recognition_bytes(85, "hi"));
        orch.advance(10); // recognition -> call begun
        orch.advance(20); // poll Err -> Error
        orch.advance(30); // publish, -> Idle
        let result = orch.take_result().unwrap();
        assert!(!result.succeeded);
        assert_eq!(
            result.error.as_deref(),
            Some("completion failed: service returned status 500")
        );
        assert_eq!(result.recognized_text, "hi");
    }

    #[test]
    fn empty_remote_response_is_an_error() {
        let (mut orch, channel) = orchestrator(Some(Ok(String::new())));
        orch.start_listening(0);
        channel.inject(&recognition_bytes(85, "hi"));
        orch.advance(10); // recognition -> call begun
        orch.advance(20); // empty response accepted -> SendingSpeech
        orch.advance(30); // nothing to speak -> Error
        orch.advance(40); // publish, -> Idle
        let result = orch.take_result().unwrap();
        assert_eq!(result.error.as_deref(), Some("no response content to speak"));
    }

    #[test]
    fn stop_listening_forces_idle_and_cancels_remote() {
        let (mut orch, channel) = orchestrator(Some(Ok("reply".to_string())));
        orch.start_listening(0);
        assert!(orch.stop_listening());
        assert_eq!(orch.state(), SessionState::Idle);
        assert_eq!(orch.remote.cancelled, 1);
        assert!(orch.take_result().is_none());

        let sent = channel.sent_frames();
        assert!(sent
            .iter()
            .any(|f| f.frame_type == FrameType::Command
                && f.payload[0] == Command::StopListen as u8));
    }

    #[test]
    fn restart_cancels_in_flight_remote_call() {
        // No canned reply: the call stays pending, as an async client's would.
        let (mut orch, channel) = orchestrator(None);
        orch.start_listening(0);
        channel.inject(&recognition_bytes(85, "hi"));
        orch.advance(10); // recognition -> call begun
        orch.advance(20); // still pending
        assert_eq!(orch.state(), SessionState::WaitingForRemote);

        orch.start_listening(1_000);
        assert_eq!(orch.state(), SessionState::WaitingForRecognition);
        assert_eq!(orch.remote.cancelled, 1);
        assert!(orch.take_result().is_none());
    }
}
