//! Per-connection state machine.
//!
//! The FSM is pull-based: the transport (in this crate, [`crate::reactor`])
//! asks [`Session::next_window`] how many bytes it wants next, delivers
//! exactly that many, then calls [`Session::on_window_filled`]. The FSM
//! never touches the socket or the connection registry directly — its only
//! external dependencies are the shared taken-names set and the peer
//! address string, both passed in by reference at call time. This keeps the
//! same FSM usable under a blocking-per-connection transport or a
//! non-blocking event loop without modification.

use std::collections::HashSet;

use chat_utils::ArrayStr;

use crate::codec::{self, LEN_PREFIX_SIZE};

const MIN_NAME_LEN: usize = 1;
const MAX_NAME_LEN: usize = 64;

/// One less than [`MAX_NAME_LEN`]: the longest name the handshake can ever
/// accept, and so the capacity a fixed-size display-name buffer needs.
type DisplayName = ArrayStr<63>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingNameLength,
    AwaitingNameBytes,
    AwaitingPacketLength,
    AwaitingPacketBytes,
    Terminated,
}

/// Outbound instruction emitted by the FSM for the Reactor to carry out once
/// control returns to it. The FSM never performs these itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    /// Send `msg` back to the connection that produced this effect.
    SendSelf(String),
    /// Send `msg` to every live, registered connection. If `exclude_self` is
    /// set, the originating connection is skipped (join/leave notices); chat
    /// echoes itself, so chat broadcasts use `exclude_self: false`.
    Broadcast { msg: String, exclude_self: bool },
    /// Terminate this session; the Reactor tears the connection down on the
    /// next sweep.
    Terminate,
}

const HELP_TEXT: &str = "\x1b[36mAvailable commands:\r\n  /online - list users currently in the room\r\n  /help   - show this message\x1b[0m";

pub struct Session {
    state: SessionState,
    buf: Vec<u8>,
    display_name: DisplayName,
    max_packet_size: usize,
}

impl Session {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            state: SessionState::AwaitingNameLength,
            buf: vec![0; LEN_PREFIX_SIZE],
            display_name: DisplayName::new(),
            max_packet_size,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_str()
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SessionState::Terminated
    }

    /// Bytes still wanted to complete the current window. Zero means the
    /// session is terminating and no more reads should be attempted.
    pub fn next_window(&self) -> usize {
        self.buf.len()
    }

    /// The buffer the caller should read the next `next_window()` bytes
    /// into.
    pub fn window_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn resize_window(&mut self, want: usize) {
        self.buf.clear();
        self.buf.resize(want, 0);
    }

    fn terminate(&mut self) {
        self.state = SessionState::Terminated;
        self.buf.clear();
    }

    /// Advance the FSM by exactly one transition now that the current window
    /// has been completely filled.
    pub fn on_window_filled(
        &mut self,
        taken_names: &mut HashSet<String>,
    ) -> Vec<SessionEffect> {
        match self.state {
            SessionState::AwaitingNameLength => self.handle_name_length(),
            SessionState::AwaitingNameBytes => self.handle_name_bytes(taken_names),
            SessionState::AwaitingPacketLength => self.handle_packet_length(),
            SessionState::AwaitingPacketBytes => self.handle_packet_bytes(taken_names),
            SessionState::Terminated => Vec::new(),
        }
    }

    fn handle_name_length(&mut self) -> Vec<SessionEffect> {
        let len = u32::from_ne_bytes(self.buf[..LEN_PREFIX_SIZE].try_into().unwrap()) as usize;
        if !(MIN_NAME_LEN..MAX_NAME_LEN).contains(&len) {
            self.terminate();
            return vec![SessionEffect::Terminate];
        }
        self.state = SessionState::AwaitingNameBytes;
        self.resize_window(len);
        Vec::new()
    }

    fn handle_name_bytes(&mut self, taken_names: &mut HashSet<String>) -> Vec<SessionEffect> {
        let Ok(name) = core::str::from_utf8(&self.buf) else {
            self.terminate();
            return vec![SessionEffect::Terminate];
        };
        let name = name.to_string();

        if !taken_names.insert(name.clone()) {
            self.terminate();
            return vec![
                SessionEffect::SendSelf(format!(
                    "\x1b[31mSorry but the name '{name}' is already taken.\x1b[0m"
                )),
                SessionEffect::Terminate,
            ];
        }

        // Validated above to be 1..64 bytes, so this never truncates.
        self.display_name = DisplayName::from_str_truncate(&name);
        self.state = SessionState::AwaitingPacketLength;
        self.resize_window(LEN_PREFIX_SIZE);
        vec![
            SessionEffect::SendSelf(format!("\x1b[32mWelcome, {name}!\x1b[0m")),
            SessionEffect::Broadcast {
                msg: format!("\x1b[33m{name} has joined the chat.\x1b[0m"),
                exclude_self: true,
            },
        ]
    }

    fn handle_packet_length(&mut self) -> Vec<SessionEffect> {
        let len = u32::from_ne_bytes(self.buf[..LEN_PREFIX_SIZE].try_into().unwrap()) as usize;
        if len > self.max_packet_size {
            self.terminate();
            return vec![SessionEffect::Terminate];
        }
        self.state = SessionState::AwaitingPacketBytes;
        self.resize_window(len);
        Vec::new()
    }

    fn handle_packet_bytes(&mut self, taken_names: &HashSet<String>) -> Vec<SessionEffect> {
        let Some(effects) = self.dispatch_packet(taken_names) else {
            self.terminate();
            return vec![SessionEffect::Terminate];
        };
        self.state = SessionState::AwaitingPacketLength;
        self.resize_window(LEN_PREFIX_SIZE);
        effects
    }

    /// Returns `None` on a malformed packet (unknown id, truncated payload).
    fn dispatch_packet(&self, taken_names: &HashSet<String>) -> Option<Vec<SessionEffect>> {
        let (id, payload_off) = codec::decode_u32(&self.buf, 0).ok()?;
        match id {
            0 => {
                let (text, _) = codec::decode_string(&self.buf, payload_off).ok()?;
                let line = format!("[{}] {}", self.display_name, text);
                Some(vec![SessionEffect::Broadcast { msg: line, exclude_self: false }])
            }
            1 => {
                let (text, _) = codec::decode_string(&self.buf, payload_off).ok()?;
                Some(self.dispatch_command(text, taken_names))
            }
            _ => None,
        }
    }

    fn dispatch_command(&self, text: &str, taken_names: &HashSet<String>) -> Vec<SessionEffect> {
        let mut tokens = text.split(' ').filter(|t| !t.is_empty());
        let cmd = tokens.next().unwrap_or("");
        match cmd {
            "online" => {
                let mut names: Vec<&str> = taken_names.iter().map(String::as_str).collect();
                names.sort_unstable();
                let n = names.len();
                let msg = if n == 1 {
                    format!("\x1b[36mThere is 1 user online: {}\x1b[0m", names.join(", "))
                } else {
                    format!(
                        "\x1b[36mThere are {n} users online: {}\x1b[0m",
                        names.join(", ")
                    )
                };
                vec![SessionEffect::SendSelf(msg)]
            }
            "help" => vec![SessionEffect::SendSelf(HELP_TEXT.to_string())],
            other => {
                vec![SessionEffect::SendSelf(format!("\x1b[31mUnknown command /{other}.\x1b[0m"))]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(session: &mut Session, taken: &mut HashSet<String>, bytes: &[u8]) -> Vec<SessionEffect> {
        assert_eq!(bytes.len(), session.next_window());
        session.window_mut().copy_from_slice(bytes);
        session.on_window_filled(taken)
    }

    fn name_frame(name: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::encode_u32(&mut buf, name.len() as u32);
        buf.extend_from_slice(name.as_bytes());
        buf
    }

    fn chat_packet(text: &str) -> Vec<u8> {
        let mut payload = Vec::new();
        codec::encode_u32(&mut payload, 0);
        codec::encode_string(&mut payload, text);
        let mut buf = Vec::new();
        codec::encode_u32(&mut buf, payload.len() as u32);
        buf.extend_from_slice(&payload);
        buf
    }

    fn drive(session: &mut Session, taken: &mut HashSet<String>, frame: &[u8]) -> Vec<SessionEffect> {
        let mut all = Vec::new();
        let mut off = 0;
        while off < frame.len() {
            let want = session.next_window();
            assert!(want > 0, "session terminated early");
            all.extend(fill(session, taken, &frame[off..off + want]));
            off += want;
        }
        all
    }

    #[test]
    fn handshake_then_chat_echoes_to_self() {
        let mut session = Session::new(1024 * 1024);
        let mut taken = HashSet::new();
        let frame = name_frame("Alice");
        let effects = drive(&mut session, &mut taken, &frame);
        assert!(matches!(effects[0], SessionEffect::SendSelf(ref s) if s.contains("Welcome")));
        assert_eq!(session.state(), SessionState::AwaitingPacketLength);
        assert!(taken.contains("Alice"));

        let chat = chat_packet("hi");
        let effects = drive(&mut session, &mut taken, &chat);
        assert_eq!(effects.len(), 1);
        match &effects[0] {
            SessionEffect::Broadcast { msg, exclude_self } => {
                assert!(!exclude_self);
                assert!(msg.ends_with("] hi"));
            }
            other => panic!("unexpected effect {other:?}"),
        }
    }

    #[test]
    fn duplicate_name_terminates() {
        let mut session_a = Session::new(1024);
        let mut taken = HashSet::new();
        drive(&mut session_a, &mut taken, &name_frame("Bob"));

        let mut session_b = Session::new(1024);
        let effects = drive(&mut session_b, &mut taken, &name_frame("Bob"));
        assert!(session_b.is_terminated());
        assert!(effects.iter().any(|e| matches!(e, SessionEffect::Terminate)));
        assert!(matches!(&effects[0], SessionEffect::SendSelf(s) if s.contains("Sorry but") && s.contains("Bob")));
    }

    #[test]
    fn oversized_name_terminates_without_registering() {
        let mut session = Session::new(1024);
        let mut taken = HashSet::new();
        let mut buf = Vec::new();
        codec::encode_u32(&mut buf, 100);
        session.window_mut().copy_from_slice(&buf);
        let effects = session.on_window_filled(&mut taken);
        assert!(session.is_terminated());
        assert_eq!(effects, vec![SessionEffect::Terminate]);
        assert!(taken.is_empty());
    }

    #[test]
    fn online_command_lists_names() {
        let mut session = Session::new(1024);
        let mut taken = HashSet::new();
        taken.insert("Ada".to_string());
        taken.insert("Lin".to_string());
        drive(&mut session, &mut taken, &name_frame("Ada"));

        let mut payload = Vec::new();
        codec::encode_u32(&mut payload, 1);
        codec::encode_string(&mut payload, "online");
        let mut frame = Vec::new();
        codec::encode_u32(&mut frame, payload.len() as u32);
        frame.extend_from_slice(&payload);

        let effects = drive(&mut session, &mut taken, &frame);
        assert_eq!(effects.len(), 1);
        match &effects[0] {
            SessionEffect::SendSelf(msg) => {
                assert!(msg.contains("Ada"));
                assert!(msg.contains("Lin"));
                assert!(msg.contains("2 users"));
            }
            other => panic!("unexpected effect {other:?}"),
        }
    }

    #[test]
    fn unknown_command_is_not_a_protocol_violation() {
        let mut session = Session::new(1024);
        let mut taken = HashSet::new();
        drive(&mut session, &mut taken, &name_frame("Eve"));

        let mut payload = Vec::new();
        codec::encode_u32(&mut payload, 1);
        codec::encode_string(&mut payload, "frobnicate");
        let mut frame = Vec::new();
        codec::encode_u32(&mut frame, payload.len() as u32);
        frame.extend_from_slice(&payload);

        let effects = drive(&mut session, &mut taken, &frame);
        assert!(!session.is_terminated());
        assert!(matches!(&effects[0], SessionEffect::SendSelf(s) if s.contains("Unknown command /frobnicate")));
    }

    #[test]
    fn malformed_packet_id_terminates() {
        let mut session = Session::new(1024);
        let mut taken = HashSet::new();
        drive(&mut session, &mut taken, &name_frame("Mal"));

        let mut payload = Vec::new();
        codec::encode_u32(&mut payload, 99);
        let mut frame = Vec::new();
        codec::encode_u32(&mut frame, payload.len() as u32);
        frame.extend_from_slice(&payload);

        let effects = drive(&mut session, &mut taken, &frame);
        assert!(session.is_terminated());
        assert_eq!(effects, vec![SessionEffect::Terminate]);
    }

    #[test]
    fn oversized_packet_is_protocol_violation() {
        let mut session = Session::new(16);
        let mut taken = HashSet::new();
        drive(&mut session, &mut taken, &name_frame("Cap"));

        let mut buf = Vec::new();
        codec::encode_u32(&mut buf, 17);
        let effects = drive(&mut session, &mut taken, &buf);
        assert!(session.is_terminated());
        assert_eq!(effects, vec![SessionEffect::Terminate]);
    }

    #[test]
    fn short_read_idempotence_one_byte_at_a_time() {
        // Feed an entire handshake+chat stream one byte at a time and
        // compare the resulting effect sequence to feeding it as a whole.
        let mut frame = name_frame("Zoe");
        frame.extend_from_slice(&chat_packet("yo"));

        let mut whole_session = Session::new(1024);
        let mut whole_taken = HashSet::new();
        let whole_effects = drive(&mut whole_session, &mut whole_taken, &frame);

        // Byte-at-a-time driver: track how many bytes have been fed into the
        // current window and only call on_window_filled once it's full.
        let mut session2 = Session::new(1024);
        let mut taken2 = HashSet::new();
        let mut effects2 = Vec::new();
        let mut cursor = 0usize;
        let mut filled = 0usize;
        while cursor < frame.len() {
            let want = session2.next_window();
            if want == 0 {
                break;
            }
            session2.window_mut()[filled] = frame[cursor];
            filled += 1;
            cursor += 1;
            if filled == want {
                effects2.extend(session2.on_window_filled(&mut taken2));
                filled = 0;
            }
        }

        assert_eq!(whole_effects, effects2);
        assert_eq!(whole_taken, taken2);
    }
}
