// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Worker-owned socket objects.
//!
//! A socket lives in exactly one worker's slab and is mutated only on that
//! worker's thread; everything other threads may do to it travels as an
//! event addressed by [`SockKey`]. The generation in the key lets the worker
//! drop events aimed at a socket whose slab slot was since reused.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use slab::Slab;

use crate::buffer::Buffer;
use crate::handle::{Handle, HandleInner};
use crate::quota::{Quota, QuotaGuard};
use crate::timer::TimerKey;
use crate::tls::TlsLayer;
use crate::tlsdns::{ListenShared, SendRequest};
use crate::{AcceptCallback, ConnectCallback, ReadCallback, RecvCallback};

/// Addresses one socket across threads: owning worker, slab slot, and the
/// generation the slot had when the socket was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SockKey {
    pub(crate) tid: usize,
    pub(crate) token: Token,
    pub(crate) gen: u64,
}

impl Default for SockKey {
    fn default() -> Self {
        Self {
            tid: 0,
            token: Token(0),
            gen: 0,
        }
    }
}

/// Transport state of a stream socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SockState {
    /// TCP connect in flight.
    Connecting,
    /// TCP established; TLS may still be handshaking.
    Connected,
    /// Close requested; waiting for outstanding handles and the close_notify
    /// flush.
    Closing,
    /// Event-loop resources released.
    Closed,
}

/// A worker-owned socket: either a listener child or a stream.
pub(crate) struct Socket {
    pub(crate) key: SockKey,
    pub(crate) kind: SockKind,
}

pub(crate) enum SockKind {
    Listener(ListenerSock),
    Stream(Box<StreamSock>),
}

impl Socket {
    pub(crate) fn stream_mut(&mut self) -> Option<&mut StreamSock> {
        match self.kind {
            SockKind::Stream(ref mut s) => Some(s.as_mut()),
            SockKind::Listener(_) => None,
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SockKind::Listener(ref l) => f
                .debug_struct("ListenerSock")
                .field("key", &self.key)
                .field("parked", &l.parked)
                .field("closing", &l.closing)
                .finish_non_exhaustive(),
            SockKind::Stream(ref s) => f
                .debug_struct("StreamSock")
                .field("key", &self.key)
                .field("state", &s.state)
                .field("client", &s.client)
                .field("peer", &s.peer)
                .finish_non_exhaustive(),
        }
    }
}

/// One per-worker child of a multi-worker listener.
pub(crate) struct ListenerSock {
    pub(crate) listener: TcpListener,
    pub(crate) shared: Arc<ListenShared>,
    pub(crate) server_config: Arc<rustls::ServerConfig>,
    pub(crate) recv_cb: RecvCallback,
    pub(crate) accept_cb: AcceptCallback,
    pub(crate) quota: Option<Arc<Quota>>,
    /// An accept is parked on the quota waitlist; further readiness events
    /// do not park again.
    pub(crate) parked: bool,
    pub(crate) closing: bool,
}

/// A connected (or connecting) TLSDNS stream, client or accepted server.
pub(crate) struct StreamSock {
    pub(crate) stream: TcpStream,
    /// Interest currently registered with the poll, if any.
    pub(crate) interest: Option<Interest>,
    pub(crate) state: SockState,
    pub(crate) client: bool,
    pub(crate) sequential: bool,
    pub(crate) keepalive: bool,
    /// Kernel reads are wanted; cleared by sequential mode, client
    /// single-message reads, and `pause_read`.
    pub(crate) reading: bool,
    pub(crate) tls: TlsLayer,
    /// Inbound framed-DNS byte stream.
    pub(crate) buf: Buffer,
    pub(crate) peer: SocketAddr,
    pub(crate) local: SocketAddr,
    /// Active-handle table; each live handle owns the slot its `slot` field
    /// names.
    pub(crate) handles: Slab<Arc<HandleInner>>,
    /// Non-owning backref to the connection-lifetime handle of client
    /// sockets.
    pub(crate) statichandle: Weak<HandleInner>,
    /// Server streams keep one internal reference so the socket survives
    /// between messages.
    pub(crate) recv_handle: Option<Handle>,
    /// Persistent receive callback (server streams).
    pub(crate) recv_cb: Option<RecvCallback>,
    /// Accept callback, invoked again at handshake completion (server
    /// streams).
    pub(crate) accept_cb: Option<AcceptCallback>,
    /// One-shot read armed by `Handle::read` (client streams).
    pub(crate) pending_read: Option<ReadCallback>,
    pub(crate) pending_connect: Option<ConnectCallback>,
    /// Sends accepted before the handshake finished.
    pub(crate) queued_sends: VecDeque<SendRequest>,
    /// Sends whose plaintext is in the session, awaiting the ciphertext
    /// flush.
    pub(crate) inflight_sends: VecDeque<SendRequest>,
    pub(crate) quota_guard: Option<QuotaGuard>,
    pub(crate) timer: Option<TimerKey>,
    /// Effective read timeout; `None` disables the idle timer.
    pub(crate) read_timeout: Option<Duration>,
    /// `Handle::set_timeout` override; wins over the manager defaults.
    pub(crate) timeout_override: Option<Duration>,
    pub(crate) connect_timeout: Duration,
}

impl StreamSock {
    pub(crate) fn new(
        stream: TcpStream,
        tls: TlsLayer,
        peer: SocketAddr,
        local: SocketAddr,
        client: bool,
    ) -> Box<Self> {
        Box::new(Self {
            stream,
            interest: None,
            state: SockState::Connected,
            client,
            sequential: false,
            keepalive: false,
            reading: false,
            tls,
            buf: Buffer::new(crate::tlsdns::RECV_BUF_SIZE),
            peer,
            local,
            handles: Slab::new(),
            statichandle: Weak::new(),
            recv_handle: None,
            recv_cb: None,
            accept_cb: None,
            pending_read: None,
            pending_connect: None,
            queued_sends: VecDeque::new(),
            inflight_sends: VecDeque::new(),
            quota_guard: None,
            timer: None,
            read_timeout: None,
            timeout_override: None,
            connect_timeout: Duration::ZERO,
        })
    }

    /// True once the socket has entered the close path; events arriving
    /// afterwards are ignored.
    pub(crate) fn closing(&self) -> bool {
        matches!(self.state, SockState::Closing | SockState::Closed)
    }

    /// True while the connect is outstanding, TCP or TLS handshake
    /// included; the timer runs on the connect timeout for its duration.
    pub(crate) fn connecting(&self) -> bool {
        self.state == SockState::Connecting || self.pending_connect.is_some()
    }

    /// Count of live entries in the active-handle table.
    pub(crate) fn active_handles(&self) -> usize {
        self.handles.len()
    }
}
