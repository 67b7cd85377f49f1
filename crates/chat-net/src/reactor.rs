//! Single-threaded readiness-multiplexed event loop.
//!
//! Owns the listen socket, the connection registry, and the taken-names set.
//! Directly modeled on `flux-network`'s `ConnectionManager::poll_with` loop:
//! one `mio::Poll::poll` call per iteration, then a pass over the returned
//! events, then a teardown sweep for anything marked dead during that pass.

use std::{
    collections::{HashMap, HashSet},
    io,
    net::SocketAddr,
};

use mio::{
    Events, Interest, Poll, Token,
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info, warn};

use crate::{
    codec,
    connection::{Connection, DrainOutcome, ReceiveOutcome},
    error::ChatError,
    session::SessionEffect,
};

const LISTENER_TOKEN: Token = Token(0);
const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;
const EVENTS_CAPACITY: usize = 1024;

pub struct Reactor {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: HashMap<Token, Connection>,
    taken_names: HashSet<String>,
    next_token: usize,
    max_packet_size: usize,
}

impl Reactor {
    /// Binds the listen socket at `0.0.0.0:<port>` with `SO_REUSEADDR` and
    /// the given backlog, then registers it with a fresh `mio::Poll`.
    pub fn bind(port: u16, backlog: u32) -> io::Result<Self> {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let socket = mio::net::TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(backlog)?;

        let poll = Poll::new()?;
        let mut listener = listener;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            connections: HashMap::new(),
            taken_names: HashSet::new(),
            next_token: 1,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        })
    }

    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    /// Runs the event loop forever (or until a poll error aborts it).
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.run_once()?;
        }
    }

    /// Drives a single iteration of the loop: one `poll` call, one pass over
    /// the returned events, one teardown sweep. Split out from `run` so
    /// integration tests can single-step the reactor.
    pub fn run_once(&mut self) -> io::Result<()> {
        self.poll.poll(&mut self.events, None)?;

        let mut to_teardown = Vec::new();
        // mio::Events borrows self.events immutably; collect tokens first so
        // the subsequent receive/drain calls can borrow self mutably.
        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            if token == LISTENER_TOKEN {
                self.accept_ready();
                continue;
            }

            if readable {
                match self.service_readable(token) {
                    ServiceOutcome::Alive => {}
                    ServiceOutcome::Dead => to_teardown.push(token),
                }
            }

            if writable && !to_teardown.contains(&token) {
                self.service_writable(token);
            }
        }

        for token in to_teardown {
            self.teardown(token);
        }

        Ok(())
    }

    /// Accepts at most one pending connection per call. The listen socket is
    /// level-triggered, so a backlog deeper than one is simply observed again
    /// as still-readable on the next `poll` and drained one connection per
    /// iteration rather than all at once.
    fn accept_ready(&mut self) {
        match self.listener.accept() {
            Ok((socket, peer_addr)) => self.accept_one(socket, peer_addr),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                let err = ChatError::AcceptFailed(err);
                warn!(%err, "chat-net: accept failed");
            }
        }
    }

    fn accept_one(&mut self, socket: TcpStream, peer_addr: SocketAddr) {
        let token = Token(self.next_token);
        self.next_token += 1;

        let mut conn = Connection::new(socket, peer_addr, self.max_packet_size);
        if let Err(err) = conn.register(self.poll.registry(), token) {
            warn!(?err, %peer_addr, "chat-net: failed to register accepted socket");
            return;
        }

        info!(%peer_addr, "chat-net: connection accepted");
        self.connections.insert(token, conn);
    }

    fn service_readable(&mut self, token: Token) -> ServiceOutcome {
        let Some(conn) = self.connections.get_mut(&token) else {
            return ServiceOutcome::Dead;
        };

        match conn.receive(&mut self.taken_names) {
            ReceiveOutcome::Idle => ServiceOutcome::Alive,
            ReceiveOutcome::Closed => ServiceOutcome::Dead,
            ReceiveOutcome::Effects(effects) => {
                self.apply_effects(token, effects);
                if self
                    .connections
                    .get(&token)
                    .is_some_and(|c| c.session().is_terminated())
                {
                    ServiceOutcome::Dead
                } else {
                    ServiceOutcome::Alive
                }
            }
        }
    }

    fn service_writable(&mut self, token: Token) {
        let registry = self.poll.registry();
        if let Some(conn) = self.connections.get_mut(&token) {
            match conn.drain(registry, token) {
                DrainOutcome::Done | DrainOutcome::Busy => {}
                DrainOutcome::Failed => {
                    debug!(peer = %conn.peer_addr(), "chat-net: drain failed, write interest cleared");
                }
            }
        }
    }

    /// Interprets the effects a Session emitted for one connection's
    /// window-fill, fanning broadcasts out across the registry. Runs after
    /// the triggering `receive()` call has returned, so the registry is
    /// fully available here — see the ownership-cycle note in the crate's
    /// design docs.
    fn apply_effects(&mut self, origin: Token, effects: Vec<SessionEffect>) {
        for effect in effects {
            match effect {
                SessionEffect::SendSelf(msg) => self.send_to(origin, &msg),
                SessionEffect::Broadcast { msg, exclude_self } => {
                    self.broadcast(origin, &msg, exclude_self)
                }
                SessionEffect::Terminate => {}
            }
        }
    }

    fn send_to(&mut self, token: Token, msg: &str) {
        let bytes = encode_server_message(msg);
        let registry = self.poll.registry();
        if let Some(conn) = self.connections.get_mut(&token) {
            conn.enqueue(registry, token, &bytes);
        }
    }

    fn broadcast(&mut self, origin: Token, msg: &str, exclude_self: bool) {
        let bytes = encode_server_message(msg);
        let registry = self.poll.registry();
        for (&token, conn) in self.connections.iter_mut() {
            if exclude_self && token == origin {
                continue;
            }
            if conn.display_name().is_empty() {
                continue;
            }
            conn.enqueue(registry, token, &bytes);
        }
    }

    fn teardown(&mut self, token: Token) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };

        let name = conn.display_name().to_string();
        conn.close(self.poll.registry());

        if !name.is_empty() {
            self.taken_names.remove(&name);
            info!(%name, "chat-net: connection left");
            self.broadcast(
                token,
                &format!("\x1b[33m{name} has left the chat.\x1b[0m"),
                true,
            );
        }
    }

    /// The bound listen address; mainly useful for tests that bind to port
    /// `0` and need the kernel-assigned port back.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of currently-registered connections, live or mid-handshake.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

enum ServiceOutcome {
    Alive,
    Dead,
}

/// Encodes a server→client message: packet id `0` then a length-prefixed
/// string, with **no** outer total-length frame — this asymmetry with the
/// client→server direction is deliberate, see §6 of the design docs.
fn encode_server_message(msg: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(codec::LEN_PREFIX_SIZE * 2 + msg.len());
    codec::encode_u32(&mut out, 0);
    codec::encode_string(&mut out, msg);
    out
}
