//! Per-connection runtime state: the socket, the inbound read offset, the
//! outbound backpressure queue, and the owned [`Session`].
//!
//! Mirrors the non-blocking read/write contract of the teacher's
//! `TcpStream` (`poll_with` / `write_or_enqueue_with` / `drain_backlog`),
//! generalised to the chat wire format and the Session FSM's window
//! protocol instead of a fixed length+timestamp frame header.

use std::{
    collections::{HashSet, VecDeque},
    io::{self, Read, Write},
    net::SocketAddr,
};

use mio::{Interest, Registry, Token, net::TcpStream};
use tracing::{debug, warn};

use crate::{
    error::ChatError,
    session::{Session, SessionEffect},
};

/// Outcome of a single [`Connection::receive`] call.
pub enum ReceiveOutcome {
    /// No more data available right now; connection stays open.
    Idle,
    /// Peer closed, a non-retryable read error occurred, or the session
    /// terminated (protocol violation, duplicate name, oversized frame).
    /// The caller must tear this connection down.
    Closed,
    /// One or more frames completed during this call; these are the
    /// accumulated effects the Reactor must act on.
    Effects(Vec<SessionEffect>),
}

/// Outcome of a single [`Connection::drain`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Queue fully flushed (or was already empty).
    Done,
    /// Kernel send buffer is full; more data remains queued. Write interest
    /// stays armed.
    Busy,
    /// A non-retryable write error occurred. Per §4.3/§7 this does *not*
    /// tear the connection down immediately — write interest is cleared and
    /// the caller may keep servicing reads until something else finalizes
    /// teardown.
    Failed,
}

pub struct Connection {
    socket: TcpStream,
    peer_addr: SocketAddr,
    session: Session,
    read_off: usize,
    outbound: VecDeque<Vec<u8>>,
    write_offset: usize,
    writable_armed: bool,
}

impl Connection {
    pub fn new(socket: TcpStream, peer_addr: SocketAddr, max_packet_size: usize) -> Self {
        Self {
            socket,
            peer_addr,
            session: Session::new(max_packet_size),
            read_off: 0,
            outbound: VecDeque::new(),
            write_offset: 0,
            writable_armed: false,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn display_name(&self) -> &str {
        self.session.display_name()
    }

    pub fn is_write_interest_armed(&self) -> bool {
        self.writable_armed
    }

    /// Reads as many complete frame windows as the kernel currently has
    /// buffered, driving the Session FSM forward once per window. Loops
    /// internally until `WouldBlock`, a hard close, or session termination.
    pub fn receive(&mut self, taken_names: &mut HashSet<String>) -> ReceiveOutcome {
        let mut effects = Vec::new();

        loop {
            if self.session.is_terminated() {
                return if effects.is_empty() { ReceiveOutcome::Closed } else { ReceiveOutcome::Effects(effects) };
            }

            let want = self.session.next_window();
            if want == 0 {
                return if effects.is_empty() { ReceiveOutcome::Closed } else { ReceiveOutcome::Effects(effects) };
            }

            let buf = self.session.window_mut();
            match self.socket.read(&mut buf[self.read_off..want]) {
                Ok(0) => return ReceiveOutcome::Closed,
                Ok(n) => {
                    self.read_off += n;
                    if self.read_off < want {
                        continue;
                    }
                    self.read_off = 0;
                    effects.extend(self.session.on_window_filled(taken_names));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return if effects.is_empty() {
                        ReceiveOutcome::Idle
                    } else {
                        ReceiveOutcome::Effects(effects)
                    };
                }
                Err(err) => {
                    let err = ChatError::from(err);
                    debug!(%err, peer = %self.peer_addr, "chat-net: read failed");
                    return if effects.is_empty() { ReceiveOutcome::Closed } else { ReceiveOutcome::Effects(effects) };
                }
            }
        }
    }

    /// Sends `bytes` now if possible; any residual is queued for later
    /// flushing by [`Connection::drain`]. Never blocks, never reports an
    /// error to the caller — a write failure here is deferred to `drain`.
    pub fn enqueue(&mut self, registry: &Registry, token: Token, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        if !self.outbound.is_empty() {
            self.outbound.push_back(bytes.to_vec());
            self.arm_writable(registry, token);
            return;
        }

        match self.socket.write(bytes) {
            Ok(n) if n == bytes.len() => {}
            Ok(n) => {
                self.outbound.push_back(bytes.to_vec());
                self.write_offset = n;
                self.arm_writable(registry, token);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.outbound.push_back(bytes.to_vec());
                self.arm_writable(registry, token);
            }
            Err(err) => {
                warn!(?err, peer = %self.peer_addr, "chat-net: write failed, will retry via drain");
                self.outbound.push_back(bytes.to_vec());
                self.arm_writable(registry, token);
            }
        }
    }

    /// Flushes the outbound queue until it's empty, the kernel blocks, or a
    /// write fails outright.
    pub fn drain(&mut self, registry: &Registry, token: Token) -> DrainOutcome {
        while let Some(head) = self.outbound.front_mut() {
            chat_utils::safe_assert!(self.write_offset < head.len());
            match self.socket.write(&head[self.write_offset..]) {
                Ok(0) => {
                    self.clear_writable(registry, token);
                    return DrainOutcome::Failed;
                }
                Ok(n) => {
                    self.write_offset += n;
                    if self.write_offset == head.len() {
                        self.outbound.pop_front();
                        self.write_offset = 0;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return DrainOutcome::Busy;
                }
                Err(err) => {
                    debug!(?err, peer = %self.peer_addr, "chat-net: drain write failed");
                    self.clear_writable(registry, token);
                    return DrainOutcome::Failed;
                }
            }
        }

        self.clear_writable(registry, token);
        DrainOutcome::Done
    }

    fn arm_writable(&mut self, registry: &Registry, token: Token) {
        if self.writable_armed {
            return;
        }
        if let Err(err) =
            registry.reregister(&mut self.socket, token, Interest::READABLE | Interest::WRITABLE)
        {
            debug!(?err, peer = %self.peer_addr, "chat-net: reregister for writable failed");
            return;
        }
        self.writable_armed = true;
    }

    fn clear_writable(&mut self, registry: &Registry, token: Token) {
        if !self.writable_armed {
            return;
        }
        if self.outbound.is_empty() {
            if let Err(err) = registry.reregister(&mut self.socket, token, Interest::READABLE) {
                debug!(?err, peer = %self.peer_addr, "chat-net: reregister drop writable failed");
            }
            self.writable_armed = false;
        }
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.socket, token, Interest::READABLE)
    }

    pub fn close(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.socket);
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
    }
}
