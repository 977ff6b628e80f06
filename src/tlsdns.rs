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

//! The DNS-over-TLS stream engine.
//!
//! Listeners spawn one accepting child per worker over a shared (dup'd)
//! kernel socket. Accepted and connected streams run the TLS pump: the
//! cycle moves ciphertext between the kernel and the rustls session, drains
//! decrypted plaintext into the socket's framed-DNS buffer, and delivers
//! complete `u16`-length-prefixed messages to the receive callback without
//! copying. Admission is quota-gated, idle connections are reaped by
//! per-socket timers, and shutdown cancels pending operations exactly once.

use std::io::{ErrorKind, Read as _};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, trace, warn};
use mio::net::TcpStream;
use mio::{Interest, Token};
use slab::Slab;
use socket2::{Domain, Protocol, SockRef, Socket as RawSocket, Type};

use crate::handle::Handle;
use crate::manager::{Manager, Shared};
use crate::quota::{Quota, QuotaGuard};
use crate::result::{Error, Result};
use crate::socket::{SockKey, SockKind, SockState, Socket, StreamSock};
use crate::timer::TimerWheel;
use crate::tls::{TlsLayer, TlsState};
use crate::worker::{self, Worker};
use crate::{AcceptCallback, ConnectCallback, ReadCallback, RecvCallback, SendCallback};

/// Initial size of a stream's framed-DNS receive buffer.
pub(crate) const RECV_BUF_SIZE: usize = 4096;

/// Hard ceiling for the receive buffer: two maximum frames.
const BIG_BUF: usize = (u16::MAX as usize + 2) * 2;

/// A server stream stops issuing kernel reads while this many per-message
/// handles are outstanding.
const STREAM_CLIENTS_PER_CONN: usize = 23;

/// Slack added to the configured connect timeout.
const CONNECT_SLACK: Duration = Duration::from_millis(10);

/// How long a closing socket may wait for its close_notify to flush.
const CLOSE_GRACE: Duration = Duration::from_millis(1000);

static LAST_QUOTA_LOG: AtomicU64 = AtomicU64::new(0);

/// At most one quota log line per second.
fn can_log_quota() -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let last = LAST_QUOTA_LOG.load(Ordering::Relaxed);
    now != last
        && LAST_QUOTA_LOG
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
}

// ---------------------------------------------------------------------------
// Listener surface
// ---------------------------------------------------------------------------

struct ListenInit {
    pending: usize,
    failed: Option<Error>,
}

/// State shared between a listener's children across workers.
pub(crate) struct ListenShared {
    local_addr: SocketAddr,
    children: Mutex<Vec<SockKey>>,
    init: Mutex<ListenInit>,
    init_cv: Condvar,
    stopped: AtomicBool,
}

/// A multi-worker TLSDNS listener. Dropping the listener stops it.
pub struct Listener {
    shared: Arc<ListenShared>,
    mgr: Weak<Shared>,
}

impl Listener {
    /// The bound local address (useful when listening on port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Stops accepting and tears down all children. Idempotent.
    pub fn stop_listening(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(mgr) = self.mgr.upgrade() else { return };
        let children: Vec<SockKey> = self.shared.children.lock().unwrap().drain(..).collect();
        for key in children {
            mgr.submit(key.tid, crate::event::NetEvent::StopListen { key });
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.shared.local_addr)
            .field("stopped", &self.shared.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

/// Worker-bound request to open one listener child.
pub(crate) struct ListenRequest {
    listener: std::net::TcpListener,
    shared: Arc<ListenShared>,
    recv_cb: RecvCallback,
    accept_cb: AcceptCallback,
    quota: Option<Arc<Quota>>,
    config: Arc<rustls::ServerConfig>,
}

/// Worker-bound request to open an outgoing connection.
pub(crate) struct ConnectRequest {
    local: Option<SocketAddr>,
    peer: SocketAddr,
    cb: ConnectCallback,
    timeout: Duration,
    config: Arc<rustls::ClientConfig>,
    /// Cross-thread creators wait here for the initiation result.
    reply: Option<Arc<(Mutex<Option<Result<()>>>, Condvar)>>,
}

/// One framed message queued for sending, with its completion callback.
/// Completion fires exactly once; an abandoned request completes with
/// `Canceled` on drop.
pub(crate) struct SendRequest {
    pub(crate) data: Vec<u8>,
    pub(crate) handle: Handle,
    pub(crate) cb: Option<SendCallback>,
}

impl SendRequest {
    fn complete(mut self, res: Result<()>) {
        if let Some(cb) = self.cb.take() {
            cb(&self.handle, res);
        }
    }
}

impl Drop for SendRequest {
    fn drop(&mut self) {
        if let Some(cb) = self.cb.take() {
            cb(&self.handle, Err(Error::Canceled));
        }
    }
}

// ---------------------------------------------------------------------------
// Manager-side entry points
// ---------------------------------------------------------------------------

/// Binds `iface` and spawns one accepting child per worker. Blocks until
/// every child has attempted to start; the first child error fails the
/// listen and tears the rest down.
pub(crate) fn listen(
    shared: &Arc<Shared>,
    iface: SocketAddr,
    recv_cb: RecvCallback,
    accept_cb: AcceptCallback,
    backlog: u32,
    quota: Option<Arc<Quota>>,
    config: Arc<rustls::ServerConfig>,
) -> Result<Listener> {
    assert!(
        worker::tid().is_none(),
        "listen must not be called from a worker thread"
    );

    let sock = RawSocket::new(Domain::for_address(iface), Type::STREAM, Some(Protocol::TCP))
        .map_err(Error::from)?;
    sock.set_reuse_address(true).map_err(Error::from)?;
    if iface.is_ipv6() {
        sock.set_only_v6(true).map_err(Error::from)?;
    }
    sock.set_nonblocking(true).map_err(Error::from)?;
    sock.bind(&iface.into()).map_err(Error::from)?;
    sock.listen(backlog.min(i32::MAX as u32) as i32)
        .map_err(Error::from)?;

    let parent: std::net::TcpListener = sock.into();
    let local_addr = parent.local_addr().map_err(Error::from)?;

    let nworkers = shared.workers.len();
    // Each child gets its own dup of the parent's fd; the kernel load
    // balances accepts across them.
    let mut dups = Vec::with_capacity(nworkers);
    for _ in 0..nworkers {
        dups.push(parent.try_clone().map_err(Error::from)?);
    }

    let lshared = Arc::new(ListenShared {
        local_addr,
        children: Mutex::new(Vec::with_capacity(nworkers)),
        init: Mutex::new(ListenInit {
            pending: nworkers,
            failed: None,
        }),
        init_cv: Condvar::new(),
        stopped: AtomicBool::new(false),
    });

    for (tid, dup) in dups.into_iter().enumerate() {
        shared.submit(
            tid,
            crate::event::NetEvent::Listen(Box::new(ListenRequest {
                listener: dup,
                shared: Arc::clone(&lshared),
                recv_cb: Arc::clone(&recv_cb),
                accept_cb: Arc::clone(&accept_cb),
                quota: quota.clone(),
                config: Arc::clone(&config),
            })),
        );
    }

    // The start-listening barrier: every child reports once.
    let mut init = lshared.init.lock().unwrap();
    while init.pending > 0 {
        init = lshared.init_cv.wait(init).unwrap();
    }
    let failed = init.failed;
    drop(init);

    let listener = Listener {
        shared: lshared,
        mgr: Arc::downgrade(shared),
    };
    match failed {
        Some(err) => {
            listener.stop_listening();
            Err(err)
        }
        None => {
            debug!("tlsdns listening on {}", local_addr);
            Ok(listener)
        }
    }
}

/// Initiates an outgoing TLSDNS connection on a worker. Cross-thread
/// callers block until the worker reports the connect was initiated;
/// in-worker callers return immediately and learn everything through the
/// connect callback.
pub(crate) fn connect(
    shared: &Arc<Shared>,
    local: Option<SocketAddr>,
    peer: SocketAddr,
    cb: ConnectCallback,
    timeout_ms: u64,
    config: Arc<rustls::ClientConfig>,
) -> Result<()> {
    let tid = Manager::pick_worker(shared);
    let reply = if worker::tid().is_none() {
        Some(Arc::new((Mutex::new(None), Condvar::new())))
    } else {
        None
    };

    shared.submit(
        tid,
        crate::event::NetEvent::Connect(Box::new(ConnectRequest {
            local,
            peer,
            cb,
            timeout: Duration::from_millis(timeout_ms),
            config,
            reply: reply.clone(),
        })),
    );

    if let Some(pair) = reply {
        let (lock, cv) = &*pair;
        let mut result = lock.lock().unwrap();
        while result.is_none() {
            result = cv.wait(result).unwrap();
        }
        result.unwrap_or(Ok(()))
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Worker-side: listeners and accept
// ---------------------------------------------------------------------------

pub(crate) fn listen_child(w: &mut Worker, req: ListenRequest) {
    let ListenRequest {
        listener,
        shared: lshared,
        recv_cb,
        accept_cb,
        quota,
        config,
    } = req;

    let result = open_child(w, listener, &lshared, recv_cb, accept_cb, quota, config);

    let mut init = lshared.init.lock().unwrap();
    match result {
        Ok(key) => {
            lshared.children.lock().unwrap().push(key);
        }
        Err(err) => {
            if init.failed.is_none() {
                init.failed = Some(err);
            }
        }
    }
    init.pending -= 1;
    lshared.init_cv.notify_all();
}

fn open_child(
    w: &mut Worker,
    listener: std::net::TcpListener,
    lshared: &Arc<ListenShared>,
    recv_cb: RecvCallback,
    accept_cb: AcceptCallback,
    quota: Option<Arc<Quota>>,
    config: Arc<rustls::ServerConfig>,
) -> Result<SockKey> {
    listener.set_nonblocking(true).map_err(Error::from)?;
    let listener = mio::net::TcpListener::from_std(listener);

    let key = w.insert_sock(|key| Socket {
        key,
        kind: SockKind::Listener(crate::socket::ListenerSock {
            listener,
            shared: Arc::clone(lshared),
            server_config: config,
            recv_cb,
            accept_cb,
            quota,
            parked: false,
            closing: false,
        }),
    });

    let Worker { poll, socks, .. } = w;
    let register = match socks.get_mut(key.token.0) {
        Some(Socket {
            kind: SockKind::Listener(l),
            ..
        }) => poll
            .registry()
            .register(&mut l.listener, key.token, Interest::READABLE),
        _ => return Err(Error::Unexpected),
    };
    if let Err(err) = register {
        let _ = w.remove_sock(key.token);
        return Err(err.into());
    }
    trace!("worker {} listening child on {}", w.id, lshared.local_addr);
    Ok(key)
}

pub(crate) fn stop_listen_child(w: &mut Worker, key: SockKey) {
    if w.resolve(key).is_none() {
        return;
    }
    close_listener(w, key.token);
}

fn close_listener(w: &mut Worker, token: Token) {
    let Worker { poll, socks, .. } = w;
    match socks.get_mut(token.0) {
        Some(Socket {
            kind: SockKind::Listener(l),
            ..
        }) => {
            if l.closing {
                return;
            }
            l.closing = true;
            let _ = poll.registry().deregister(&mut l.listener);
        }
        _ => return,
    }
    let _ = w.remove_sock(token);
}

/// Retry an accept parked on the quota waitlist.
pub(crate) fn accept_retry(w: &mut Worker, key: SockKey) {
    match w.resolve(key) {
        Some(Socket {
            kind: SockKind::Listener(l),
            ..
        }) => l.parked = false,
        _ => return,
    }
    accept_loop(w, key.token);
}

/// Accepts until the kernel runs dry or the quota parks us. The quota is
/// attached before the kernel accept so a refused connection stays in the
/// backlog.
pub(crate) fn accept_loop(w: &mut Worker, token: Token) {
    loop {
        let guard = match attach_quota(w, token) {
            QuotaAttach::NoQuota => None,
            QuotaAttach::Attached(guard) => Some(guard),
            QuotaAttach::Parked | QuotaAttach::Gone => return,
        };

        let accepted = {
            let Worker { socks, .. } = w;
            let l = match socks.get_mut(token.0) {
                Some(Socket {
                    kind: SockKind::Listener(l),
                    ..
                }) if !l.closing => l,
                _ => return,
            };
            match l.listener.accept() {
                Ok((stream, peer)) => Accepted {
                    stream,
                    peer,
                    config: Arc::clone(&l.server_config),
                    recv_cb: Arc::clone(&l.recv_cb),
                    accept_cb: Arc::clone(&l.accept_cb),
                },
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!("TCP accept failed: {}", err);
                    return;
                }
            }
        };

        accept_connection(w, accepted, guard);
    }
}

enum QuotaAttach {
    NoQuota,
    Attached(QuotaGuard),
    Parked,
    Gone,
}

fn attach_quota(w: &mut Worker, token: Token) -> QuotaAttach {
    let Worker { socks, shared, id, .. } = w;
    let tid = *id;
    let (key, l) = match socks.get_mut(token.0) {
        Some(Socket {
            key,
            kind: SockKind::Listener(l),
        }) if !l.closing => (*key, l),
        _ => return QuotaAttach::Gone,
    };
    let Some(quota) = l.quota.as_ref() else {
        return QuotaAttach::NoQuota;
    };
    if l.parked {
        return QuotaAttach::Parked;
    }

    let weak = Arc::downgrade(shared);
    match Quota::try_attach(
        quota,
        Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.submit(tid, crate::event::NetEvent::Accept { key });
            }
        }),
    ) {
        Some((guard, soft_exceeded)) => {
            if soft_exceeded && can_log_quota() {
                warn!("TCP connection failed: {}", Error::SoftQuota);
            }
            QuotaAttach::Attached(guard)
        }
        None => {
            l.parked = true;
            if can_log_quota() {
                warn!("TCP connection failed: {}", Error::Quota);
            }
            QuotaAttach::Parked
        }
    }
}

struct Accepted {
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<rustls::ServerConfig>,
    recv_cb: RecvCallback,
    accept_cb: AcceptCallback,
}

fn accept_connection(w: &mut Worker, accepted: Accepted, guard: Option<QuotaGuard>) {
    let Accepted {
        stream,
        peer,
        config,
        recv_cb,
        accept_cb,
    } = accepted;

    // A client that disconnected between the kernel accept and here is
    // dropped silently.
    let local = match stream.local_addr() {
        Ok(addr) => addr,
        Err(_) => return,
    };
    let _ = stream.set_nodelay(true);
    apply_buffer_sizes(&w.shared, &stream);

    let tls = match TlsLayer::server(config) {
        Ok(tls) => tls,
        Err(err) => {
            warn!("TLS session setup failed: {}", err);
            return;
        }
    };

    let key = w.insert_sock(|key| {
        let mut s = StreamSock::new(stream, tls, peer, local, false);
        s.recv_cb = Some(recv_cb);
        s.accept_cb = Some(accept_cb);
        s.quota_guard = guard;
        s.reading = true;
        Socket {
            key,
            kind: SockKind::Stream(s),
        }
    });
    let token = key.token;
    trace!("worker {} accepted {} on {}", w.id, peer, local);

    // The accept callback runs once before the handshake; the user may
    // reject the connection outright.
    let (handle, cb) = {
        let Worker { socks, shared, timers, .. } = w;
        let Some(s) = stream_mut(socks, token) else { return };
        let handle = alloc_handle(shared, s, key, peer, local);
        s.recv_handle = Some(handle.clone());
        s.read_timeout = shared.init_timeout();
        timer_start(timers, s, token);
        let cb = s.accept_cb.clone();
        (handle, cb)
    };
    let rejected = match cb {
        Some(cb) => cb(&handle, Ok(())).is_err(),
        None => false,
    };
    drop(handle);
    if rejected {
        close_socket(w, token);
        return;
    }

    tls_cycle(w, token);
}

// ---------------------------------------------------------------------------
// Worker-side: connect
// ---------------------------------------------------------------------------

pub(crate) fn connect_start(w: &mut Worker, req: ConnectRequest) {
    let ConnectRequest {
        local,
        peer,
        cb,
        timeout,
        config,
        reply,
    } = req;

    let report = move |res: Result<()>| {
        if let Some(pair) = reply {
            let (lock, cv) = &*pair;
            *lock.lock().unwrap() = Some(res);
            cv.notify_all();
        }
    };

    let stream = match tcp_connect(local, peer, &w.shared) {
        Ok(stream) => stream,
        Err(err) => {
            report(Err(err));
            cb(Err(err));
            return;
        }
    };
    let tls = match TlsLayer::client(config, peer) {
        Ok(tls) => tls,
        Err(err) => {
            report(Err(err));
            cb(Err(err));
            return;
        }
    };

    let fallback = match peer.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let key = w.insert_sock(|key| {
        let mut s = StreamSock::new(stream, tls, peer, local.unwrap_or(fallback), true);
        s.state = SockState::Connecting;
        s.connect_timeout = timeout;
        s.pending_connect = Some(cb);
        Socket {
            key,
            kind: SockKind::Stream(s),
        }
    });
    let token = key.token;

    {
        let Worker { socks, timers, .. } = w;
        if let Some(s) = stream_mut(socks, token) {
            timer_restart(timers, s, token);
        }
    }
    update_interest(w, token);
    trace!("worker {} connecting to {}", w.id, peer);
    report(Ok(()));
}

fn tcp_connect(
    local: Option<SocketAddr>,
    peer: SocketAddr,
    shared: &Shared,
) -> Result<TcpStream> {
    let socket = RawSocket::new(Domain::for_address(peer), Type::STREAM, Some(Protocol::TCP))
        .map_err(Error::from)?;
    socket.set_nonblocking(true).map_err(Error::from)?;
    if let Some(addr) = local {
        socket.bind(&addr.into()).map_err(Error::from)?;
    }

    let recv = shared.recv_buffer.load(Ordering::Relaxed);
    if recv > 0 {
        let _ = socket.set_recv_buffer_size(recv);
    }
    let send = shared.send_buffer.load(Ordering::Relaxed);
    if send > 0 {
        let _ = socket.set_send_buffer_size(send);
    }

    match socket.connect(&peer.into()) {
        Ok(()) => {}
        Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(ref err) if err.kind() == ErrorKind::WouldBlock => {}
        Err(err) => return Err(err.into()),
    }

    let stream: std::net::TcpStream = socket.into();
    Ok(TcpStream::from_std(stream))
}

/// The connecting socket's fd became writable: either the TCP connect
/// finished or it failed.
pub(crate) fn connect_ready(w: &mut Worker, token: Token) {
    let failed = {
        let Worker { socks, .. } = w;
        let Some(s) = stream_mut(socks, token) else { return };
        match s.stream.take_error() {
            Ok(Some(err)) => Some(Error::from(err)),
            Err(err) => Some(Error::from(err)),
            Ok(None) => match s.stream.peer_addr() {
                Ok(_) => None,
                // Spurious wakeup; the connect is still in flight.
                Err(ref err) if err.kind() == ErrorKind::NotConnected => return,
                Err(err) => Some(Error::from(err)),
            },
        }
    };

    if let Some(err) = failed {
        connect_fail(w, token, err);
        return;
    }

    {
        let Worker { socks, .. } = w;
        let Some(s) = stream_mut(socks, token) else { return };
        s.state = SockState::Connected;
        if let Ok(addr) = s.stream.local_addr() {
            s.local = addr;
        }
        let _ = s.stream.set_nodelay(true);
        // The connect timer keeps running through the TLS handshake.
    }
    tls_cycle(w, token);
}

fn connect_fail(w: &mut Worker, token: Token, err: Error) {
    let cb = {
        let Worker { socks, timers, .. } = w;
        let Some(s) = stream_mut(socks, token) else { return };
        timer_stop(timers, s);
        s.pending_connect.take()
    };
    if let Some(cb) = cb {
        cb(Err(err));
    }
    close_socket(w, token);
}

// ---------------------------------------------------------------------------
// The TLS cycle
// ---------------------------------------------------------------------------

/// Asynchronous cycle entry, scheduled at most once per socket at a time.
pub(crate) fn cycle(w: &mut Worker, key: SockKey) {
    let token = key.token;
    {
        let Some(sock) = w.resolve(key) else { return };
        let Some(s) = sock.stream_mut() else { return };
        s.tls.cycle_scheduled = false;
    }
    tls_cycle(w, token);
}

fn schedule_cycle(shared: &Arc<Shared>, s: &mut StreamSock, key: SockKey) {
    if s.tls.cycle_scheduled {
        return;
    }
    s.tls.cycle_scheduled = true;
    shared.submit(key.tid, crate::event::NetEvent::Cycle { key });
}

pub(crate) fn readable(w: &mut Worker, token: Token) {
    tls_cycle(w, token);
}

pub(crate) fn writable(w: &mut Worker, token: Token) {
    let closing = {
        let Worker { socks, .. } = w;
        let Some(s) = stream_mut(socks, token) else { return };
        s.closing()
    };
    if closing {
        let _ = cycle_output(w, token);
        maybe_finish_close(w, token);
        return;
    }
    match cycle_output(w, token) {
        Ok(()) => update_interest(w, token),
        Err(err) => tls_error(w, token, err),
    }
}

/// One step of the pump: consume a stored error, drive input, drive output.
fn tls_cycle(w: &mut Worker, token: Token) {
    enum Gate {
        Run,
        Failed(Option<Error>),
    }
    let gate = {
        let Worker { socks, .. } = w;
        let Some(s) = stream_mut(socks, token) else { return };
        if s.closing() {
            return;
        }
        if s.tls.state == TlsState::Error {
            // The stored error is surfaced once; the state stays terminal.
            Gate::Failed(s.tls.pending_error.take())
        } else {
            Gate::Run
        }
    };
    match gate {
        Gate::Failed(Some(err)) => {
            failed_read(w, token, err);
            return;
        }
        Gate::Failed(None) => return,
        Gate::Run => {}
    }
    if let Err(err) = cycle_input(w, token) {
        tls_error(w, token, err);
        return;
    }
    if let Err(err) = cycle_output(w, token) {
        tls_error(w, token, err);
        return;
    }
    update_interest(w, token);
}

/// Pulls ciphertext from the kernel, decrypts into the framed-DNS buffer,
/// delivers complete frames, and completes the handshake when it finishes.
fn cycle_input(w: &mut Worker, token: Token) -> Result<()> {
    loop {
        let (delivered, peer_closed) = {
            let Worker { socks, .. } = w;
            let Some(s) = stream_mut(socks, token) else { return Ok(()) };
            if s.closing() {
                return Ok(());
            }
            if s.tls.state == TlsState::None {
                s.tls.state = TlsState::Handshake;
            }
            if !(s.reading || s.tls.conn.is_handshaking()) {
                return Ok(());
            }

            match s.tls.conn.read_tls(&mut s.stream) {
                Ok(0) => return Err(Error::Eof),
                Ok(_) => {}
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }

            let peer = s.peer;
            let io_state = s.tls.conn.process_new_packets().map_err(|err| {
                debug!("TLS failure from {}: {}", peer, err);
                Error::Tls
            })?;

            let mut wanted = io_state.plaintext_bytes_to_read();
            if s.buf.remaining() + wanted > BIG_BUF {
                return Err(Error::NoResources);
            }
            let delivered = wanted > 0;
            while wanted > 0 {
                let space = s.buf.space(wanted);
                let len = wanted.min(space.len());
                let got = match s.tls.conn.reader().read(&mut space[..len]) {
                    Ok(0) => break,
                    Ok(got) => got,
                    Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => return Err(Error::Tls),
                };
                s.buf.mark_written(got);
                wanted -= got;
            }

            (delivered, io_state.peer_has_closed())
        };

        if delivered {
            process_sock_buffer(w, token);
        }

        let handshake_finished = {
            let Worker { socks, .. } = w;
            match stream_mut(socks, token) {
                Some(s) => s.tls.state == TlsState::Handshake && !s.tls.conn.is_handshaking(),
                None => return Ok(()),
            }
        };
        if handshake_finished {
            handshake_done(w, token)?;
        }

        if peer_closed {
            return Err(Error::Eof);
        }
    }
}

/// Flushes pending ciphertext to the kernel; when the session's outgoing
/// buffer fully drains, the queued send callbacks complete with success.
fn cycle_output(w: &mut Worker, token: Token) -> Result<()> {
    let drained = {
        let Worker { socks, .. } = w;
        let Some(s) = stream_mut(socks, token) else { return Ok(()) };
        loop {
            if !s.tls.conn.wants_write() {
                break true;
            }
            match s.tls.conn.write_tls(&mut s.stream) {
                Ok(0) => return Err(Error::Eof),
                Ok(_) => {}
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => break false,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    };

    if drained {
        loop {
            let req = {
                let Worker { socks, .. } = w;
                match stream_mut(socks, token) {
                    Some(s) => s.inflight_sends.pop_front(),
                    None => return Ok(()),
                }
            };
            match req {
                Some(req) => req.complete(Ok(())),
                None => break,
            }
        }
    }
    Ok(())
}

/// The handshake finished: flip to I/O state, run the server accept
/// callback or complete the client connect, then flush anything queued.
fn handshake_done(w: &mut Worker, token: Token) -> Result<()> {
    enum Role {
        Server(Option<AcceptCallback>, Option<Handle>),
        Client(Option<ConnectCallback>, Handle),
    }

    let role = {
        let Worker { socks, timers, shared, .. } = w;
        let key = match socks.get(token.0) {
            Some(sock) => sock.key,
            None => return Ok(()),
        };
        let Some(s) = stream_mut(socks, token) else { return Ok(()) };
        s.tls.state = TlsState::Io;
        if s.tls.is_server() {
            Role::Server(s.accept_cb.clone(), s.recv_handle.clone())
        } else {
            timer_stop(timers, s);
            let (handle, inner) = alloc_client_handle(shared, s, key);
            s.statichandle = Arc::downgrade(&inner);
            Role::Client(s.pending_connect.take(), handle)
        }
    };

    match role {
        Role::Server(cb, handle) => {
            trace!("handshake complete (server)");
            if let (Some(cb), Some(handle)) = (cb, handle) {
                if cb(&handle, Ok(())).is_err() {
                    // Rejected: tear down without surfacing a read error.
                    let Worker { socks, .. } = w;
                    if let Some(s) = stream_mut(socks, token) {
                        s.recv_cb = None;
                    }
                    return Err(Error::Canceled);
                }
            }
        }
        Role::Client(cb, handle) => {
            trace!("handshake complete (client)");
            match cb {
                Some(cb) => cb(Ok(handle)),
                None => drop(handle),
            }
        }
    }

    flush_queued_sends(w, token)?;

    // Keep the pump moving for anything the callbacks produced.
    let Worker { socks, shared, .. } = w;
    if let Some(sock) = socks.get(token.0) {
        let key = sock.key;
        if let Some(s) = stream_mut(socks, token) {
            schedule_cycle(shared, s, key);
        }
    }
    Ok(())
}

fn flush_queued_sends(w: &mut Worker, token: Token) -> Result<()> {
    loop {
        let req = {
            let Worker { socks, .. } = w;
            match stream_mut(socks, token) {
                Some(s) => s.queued_sends.pop_front(),
                None => return Ok(()),
            }
        };
        let Some(req) = req else { break };
        let Worker { socks, .. } = w;
        if let Some(s) = stream_mut(socks, token) {
            write_send(s, req);
        }
    }
    cycle_output(w, token)
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

enum Outcome {
    /// One frame delivered; true when the callback requested sequential
    /// mode on the frame's handle.
    Delivered(bool),
    NeedMore,
    Closing,
}

/// Delivers complete frames and decides whether to keep reading and
/// whether to arm the idle timer.
///
/// Reading stops for client sockets after one message, for sequential
/// server sockets, and once the per-connection handle limit is reached;
/// `resume_processing` restarts it as handles release. The timer only runs
/// while no external handles are outstanding.
fn process_sock_buffer(w: &mut Worker, token: Token) {
    loop {
        match process_buffer(w, token) {
            Outcome::Closing => {
                let Worker { socks, timers, .. } = w;
                if let Some(s) = stream_mut(socks, token) {
                    timer_stop(timers, s);
                    s.reading = false;
                }
                update_interest(w, token);
                return;
            }
            Outcome::NeedMore => {
                let Worker { socks, timers, .. } = w;
                let Some(s) = stream_mut(socks, token) else { return };
                if !(s.client && s.pending_read.is_none()) {
                    s.reading = true;
                }
                if s.active_handles() <= 1 {
                    timer_start(timers, s, token);
                }
                update_interest(w, token);
                return;
            }
            Outcome::Delivered(went_sequential) => {
                let Worker { socks, timers, shared, .. } = w;
                let Some(s) = stream_mut(socks, token) else { return };
                // A full message arrived: the idle timer restarts only once
                // the buffer runs dry again. An override of zero means the
                // timeout is disabled.
                timer_stop(timers, s);
                s.read_timeout = match s.timeout_override {
                    Some(over) => (!over.is_zero()).then_some(over),
                    None => shared.idle_timeout(s.keepalive),
                };
                if went_sequential {
                    s.sequential = true;
                }
                if s.client
                    || s.sequential
                    || s.active_handles() >= STREAM_CLIENTS_PER_CONN
                {
                    s.reading = false;
                    update_interest(w, token);
                    return;
                }
            }
        }
    }
}

/// Processes the first complete frame in the buffer, leaving the rest for
/// later. The receive callback sees a region pointing straight into the
/// buffer.
fn process_buffer(w: &mut Worker, token: Token) -> Outcome {
    let Worker { socks, shared, .. } = w;
    let key = match socks.get(token.0) {
        Some(sock) => sock.key,
        None => return Outcome::Closing,
    };
    let Some(s) = stream_mut(socks, token) else {
        return Outcome::Closing;
    };
    if s.closing() {
        return Outcome::Closing;
    }
    if s.buf.remaining() < 2 {
        return Outcome::NeedMore;
    }
    let bytes = s.buf.as_slice();
    let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    if s.buf.remaining() - 2 < len {
        return Outcome::NeedMore;
    }

    if s.client {
        let Some(cb) = s.pending_read.take() else {
            // No read armed; the frame waits in the buffer.
            return Outcome::NeedMore;
        };
        let Some(inner) = s.statichandle.upgrade() else {
            return Outcome::Closing;
        };
        let handle = Handle::from_inner(inner);
        let frame = &s.buf.as_slice()[2..2 + len];
        cb(&handle, Ok(frame));
        s.buf.mark_read(len + 2);
        Outcome::Delivered(false)
    } else {
        let Some(cb) = s.recv_cb.clone() else {
            return Outcome::Closing;
        };
        let (peer, local) = (s.peer, s.local);
        let handle = alloc_handle(shared, s, key, peer, local);
        let frame = &s.buf.as_slice()[2..2 + len];
        cb(&handle, Ok(frame));
        s.buf.mark_read(len + 2);
        let went_sequential = handle.inner().sequential.load(Ordering::Acquire);
        Outcome::Delivered(went_sequential)
    }
}

// ---------------------------------------------------------------------------
// Send
// ---------------------------------------------------------------------------

pub(crate) fn send(w: &mut Worker, key: SockKey, req: SendRequest) {
    let token = key.token;
    {
        let Some(sock) = w.resolve(key) else {
            req.complete(Err(Error::Canceled));
            return;
        };
        let Some(s) = sock.stream_mut() else {
            req.complete(Err(Error::Canceled));
            return;
        };
        if s.closing() || s.tls.state == TlsState::Error {
            req.complete(Err(Error::Canceled));
            return;
        }
        // Sends submitted before the handshake finishes wait for it.
        if s.state == SockState::Connecting || s.tls.conn.is_handshaking() {
            s.queued_sends.push_back(req);
            return;
        }
        write_send(s, req);
    }
    match cycle_output(w, token) {
        Ok(()) => update_interest(w, token),
        Err(err) => tls_error(w, token, err),
    }
}

/// Moves the framed payload into the session's outgoing queue.
fn write_send(s: &mut StreamSock, mut req: SendRequest) {
    use std::io::Write as _;
    match s.tls.conn.writer().write_all(&req.data) {
        Ok(()) => {
            req.data = Vec::new();
            s.inflight_sends.push_back(req);
        }
        Err(_) => req.complete(Err(Error::Tls)),
    }
}

// ---------------------------------------------------------------------------
// Read, cancel, pause/resume
// ---------------------------------------------------------------------------

pub(crate) fn read(w: &mut Worker, key: SockKey, handle: Handle, cb: ReadCallback) {
    let token = key.token;
    let init = w.shared.init_timeout();
    {
        let Some(sock) = w.resolve(key) else {
            cb(&handle, Err(Error::Canceled));
            return;
        };
        let Some(s) = sock.stream_mut() else {
            cb(&handle, Err(Error::Canceled));
            return;
        };
        if s.closing() || s.tls.state == TlsState::Error {
            cb(&handle, Err(Error::Canceled));
            return;
        }
        if !s.client {
            cb(&handle, Err(Error::Unexpected));
            return;
        }
        s.pending_read = Some(cb);
        if s.timeout_override.is_none() {
            s.read_timeout = init;
        }
    }
    drop(handle);
    // Deliver straight from the buffer if a frame is already waiting,
    // otherwise start reading; then give the pump a chance to pull.
    process_sock_buffer(w, token);
    tls_cycle(w, token);
}

pub(crate) fn cancel_read(w: &mut Worker, key: SockKey) {
    let delivery = {
        let Some(sock) = w.resolve(key) else { return };
        let Some(s) = sock.stream_mut() else { return };
        if s.closing() {
            return;
        }
        let Some(cb) = s.pending_read.take() else {
            // Already completed or canceled.
            return;
        };
        let Some(inner) = s.statichandle.upgrade() else { return };
        s.reading = false;
        Some((cb, Handle::from_inner(inner)))
    };
    if let Some((cb, handle)) = delivery {
        cb(&handle, Err(Error::Canceled));
    }
    let token = key.token;
    {
        let Worker { socks, timers, .. } = w;
        if let Some(s) = stream_mut(socks, token) {
            timer_stop(timers, s);
        }
    }
    update_interest(w, token);
}

pub(crate) fn pause_read(w: &mut Worker, key: SockKey) {
    {
        let Some(sock) = w.resolve(key) else { return };
        let Some(s) = sock.stream_mut() else { return };
        if s.closing() {
            return;
        }
        s.reading = false;
    }
    update_interest(w, key.token);
}

pub(crate) fn resume_read(w: &mut Worker, key: SockKey) {
    {
        let Some(sock) = w.resolve(key) else { return };
        let Some(s) = sock.stream_mut() else { return };
        if s.closing() {
            return;
        }
        s.reading = true;
    }
    process_sock_buffer(w, key.token);
    tls_cycle(w, key.token);
}

pub(crate) fn set_timeout(w: &mut Worker, key: SockKey, ms: u64) {
    let token = key.token;
    let Worker { socks, timers, .. } = w;
    let Some(sock) = socks.get_mut(token.0) else { return };
    if sock.key.gen != key.gen {
        return;
    }
    let Some(s) = sock.stream_mut() else { return };
    let value = (ms > 0).then(|| Duration::from_millis(ms));
    s.timeout_override = Some(value.unwrap_or(Duration::ZERO));
    s.read_timeout = value;
    if !s.connecting() {
        timer_restart(timers, s, token);
    }
}

pub(crate) fn clear_timeout(w: &mut Worker, key: SockKey) {
    let Worker { socks, timers, .. } = w;
    let Some(sock) = socks.get_mut(key.token.0) else { return };
    if sock.key.gen != key.gen {
        return;
    }
    let Some(s) = sock.stream_mut() else { return };
    s.timeout_override = Some(Duration::ZERO);
    s.read_timeout = None;
    timer_stop(timers, s);
}

/// Sequential mode applies to server streams: reading stops now and
/// resumes only as the per-message handle releases.
pub(crate) fn sequential(w: &mut Worker, key: SockKey) {
    {
        let Some(sock) = w.resolve(key) else { return };
        let Some(s) = sock.stream_mut() else { return };
        if s.client || s.closing() {
            return;
        }
        s.sequential = true;
        s.reading = false;
    }
    update_interest(w, key.token);
}

/// Keepalive applies to TLSDNS stream sockets only; it selects the
/// keepalive timeout the next time the idle timer arms.
pub(crate) fn keepalive(w: &mut Worker, key: SockKey, on: bool) {
    let Some(sock) = w.resolve(key) else { return };
    let Some(s) = sock.stream_mut() else { return };
    s.keepalive = on;
}

// ---------------------------------------------------------------------------
// Handle detach
// ---------------------------------------------------------------------------

enum AfterDetach {
    CloseClient,
    ResumeServer,
    Nothing,
}

/// The last user reference to a handle dropped: release the table slot,
/// run the reset hook, then close (client statichandle) or resume the
/// pipeline (server streams).
pub(crate) fn detach_handle(w: &mut Worker, key: SockKey, slot: usize) {
    let token = key.token;
    let after = {
        let Some(sock) = w.resolve(key) else { return };
        let Some(s) = sock.stream_mut() else { return };
        let Some(inner) = s.handles.get(slot) else { return };
        if inner.refs.load(Ordering::Acquire) != 0 {
            // Revived by the worker between the drop and this event.
            return;
        }
        let inner = s.handles.remove(slot);
        inner.do_reset();
        let was_static = s
            .statichandle
            .upgrade()
            .map(|st| Arc::ptr_eq(&st, &inner))
            .unwrap_or(false);
        drop(inner);

        if s.closing() {
            AfterDetach::Nothing
        } else if s.client && was_static {
            AfterDetach::CloseClient
        } else if !s.client {
            AfterDetach::ResumeServer
        } else {
            AfterDetach::Nothing
        }
    };

    match after {
        AfterDetach::CloseClient => close_socket(w, token),
        // The close-handle hook: restart buffer processing so a paused
        // pipeline (sequential mode, handle limit) picks the next frame,
        // then pull anything the kernel buffered while reads were off.
        AfterDetach::ResumeServer => {
            process_sock_buffer(w, token);
            tls_cycle(w, token);
        }
        AfterDetach::Nothing => maybe_finish_close(w, token),
    }
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

fn timer_stop(timers: &mut TimerWheel, s: &mut StreamSock) {
    if let Some(key) = s.timer.take() {
        timers.cancel(key);
    }
}

/// Starts the timer unless it is already running.
fn timer_start(timers: &mut TimerWheel, s: &mut StreamSock, token: Token) {
    if s.timer.is_some() {
        return;
    }
    timer_restart(timers, s, token);
}

/// Replaces the pending deadline: the connect timeout (plus slack) while
/// connecting, the read timeout otherwise.
fn timer_restart(timers: &mut TimerWheel, s: &mut StreamSock, token: Token) {
    timer_stop(timers, s);
    let delay = if s.connecting() {
        if s.connect_timeout.is_zero() {
            return;
        }
        s.connect_timeout + CONNECT_SLACK
    } else {
        // A zero read timeout means disabled, never fire-immediately.
        match s.read_timeout {
            Some(delay) if !delay.is_zero() => delay,
            _ => return,
        }
    };
    s.timer = Some(timers.schedule(delay, token));
}

pub(crate) fn timer_expired(w: &mut Worker, token: Token) {
    enum Expiry {
        Connect,
        Read,
        CloseGrace,
    }
    let expiry = {
        let Worker { socks, .. } = w;
        let Some(s) = stream_mut(socks, token) else { return };
        s.timer = None;
        if s.closing() {
            Expiry::CloseGrace
        } else if s.connecting() {
            Expiry::Connect
        } else {
            Expiry::Read
        }
    };
    match expiry {
        Expiry::Connect => connect_fail(w, token, Error::TimedOut),
        Expiry::Read => failed_read(w, token, Error::TimedOut),
        Expiry::CloseGrace => {
            // The peer never drained our close_notify; stop waiting.
            let Worker { socks, .. } = w;
            if let Some(s) = stream_mut(socks, token) {
                s.tls.state = TlsState::Error;
            }
            maybe_finish_close(w, token);
        }
    }
}

// ---------------------------------------------------------------------------
// Errors, shutdown, close
// ---------------------------------------------------------------------------

/// Fails the active read exactly once and closes the socket. Timeouts and
/// cancellation deliver through here as well.
fn failed_read(w: &mut Worker, token: Token, err: Error) {
    enum Deliver {
        Client(ReadCallback, Handle),
        Server(RecvCallback, Handle),
        None,
    }

    // Once teardown starts, every pending operation reports Canceled, even
    // when the peer's own teardown races us with a clean close.
    let err = if err == Error::Eof && w.shared.shutting_down.load(Ordering::Acquire) {
        Error::Canceled
    } else {
        err
    };

    let connecting = {
        let Worker { socks, .. } = w;
        match stream_mut(socks, token) {
            Some(s) => {
                if s.closing() {
                    return;
                }
                s.connecting()
            }
            None => return,
        }
    };
    if connecting {
        connect_fail(w, token, err);
        return;
    }

    let deliver = {
        let Worker { socks, .. } = w;
        let Some(s) = stream_mut(socks, token) else { return };
        if let Some(cb) = s.pending_read.take() {
            match s.statichandle.upgrade() {
                Some(inner) => Deliver::Client(cb, Handle::from_inner(inner)),
                None => Deliver::None,
            }
        } else if !s.client {
            match (s.recv_cb.clone(), s.recv_handle.clone()) {
                (Some(cb), Some(handle)) => Deliver::Server(cb, handle),
                _ => Deliver::None,
            }
        } else {
            Deliver::None
        }
    };

    match deliver {
        Deliver::Client(cb, handle) => cb(&handle, Err(err)),
        Deliver::Server(cb, handle) => cb(&handle, Err(err)),
        Deliver::None => {}
    }
    close_socket(w, token);
}

/// Records a terminal TLS failure and soft-stops the socket; the stored
/// error is surfaced by the shutdown path.
fn tls_error(w: &mut Worker, token: Token, err: Error) {
    {
        let Worker { socks, .. } = w;
        let Some(s) = stream_mut(socks, token) else { return };
        s.tls.fail(err);
    }
    sock_shutdown(w, token);
}

/// Soft stop, used by manager teardown and TLS failure: cancel a pending
/// connect, fail a connected socket's read, close anything else.
pub(crate) fn sock_shutdown(w: &mut Worker, token: Token) {
    enum Path {
        Listener,
        ConnectFail(Error),
        FailRead(Error),
        Close,
        Ignore,
    }

    let path = match w.socks.get_mut(token.0) {
        None => return,
        Some(Socket {
            kind: SockKind::Listener(_),
            ..
        }) => Path::Listener,
        Some(Socket {
            kind: SockKind::Stream(s),
            ..
        }) => {
            if s.closing() {
                Path::Ignore
            } else {
                let err = s.tls.pending_error.take().unwrap_or(Error::Canceled);
                if s.connecting() {
                    Path::ConnectFail(err)
                } else if s.state == SockState::Connected && !s.tls.conn.is_handshaking() {
                    Path::FailRead(err)
                } else {
                    // Accepted but still handshaking: no callbacks to fail.
                    Path::Close
                }
            }
        }
    };

    match path {
        Path::Listener => close_listener(w, token),
        Path::ConnectFail(err) => connect_fail(w, token, err),
        Path::FailRead(err) => failed_read(w, token, err),
        Path::Close => close_socket(w, token),
        Path::Ignore => {}
    }
}

/// Enters the close path: cancel pending work, release the quota token,
/// start the graceful TLS shutdown, and finish once outstanding handles
/// release and the close_notify flushes.
fn close_socket(w: &mut Worker, token: Token) {
    let mut canceled: Vec<SendRequest> = Vec::new();
    let pending: Option<(Option<ConnectCallback>, Option<(ReadCallback, Handle)>)> = {
        let Worker { socks, timers, .. } = w;
        let Some(s) = stream_mut(socks, token) else { return };
        if s.closing() {
            return;
        }
        s.state = SockState::Closing;
        s.reading = false;
        timer_stop(timers, s);

        // Graceful TLS shutdown on a live session.
        if s.tls.state == TlsState::Io {
            s.tls.conn.send_close_notify();
        }

        canceled.extend(s.queued_sends.drain(..));
        canceled.extend(s.inflight_sends.drain(..));

        let connect_cb = s.pending_connect.take();
        let read_cb = s.pending_read.take().and_then(|cb| {
            s.statichandle
                .upgrade()
                .map(|inner| (cb, Handle::from_inner(inner)))
        });

        // Quota token released exactly once, here or never.
        s.quota_guard = None;
        s.recv_cb = None;
        s.accept_cb = None;
        // Dropping the internal reference posts its detach event.
        s.recv_handle = None;

        Some((connect_cb, read_cb))
    };

    if let Some((connect_cb, read_cb)) = pending {
        if let Some(cb) = connect_cb {
            cb(Err(Error::Canceled));
        }
        if let Some((cb, handle)) = read_cb {
            cb(&handle, Err(Error::Canceled));
        }
    }
    // Dropping unfinished requests completes them with `Canceled`.
    drop(canceled);

    // Push the close_notify out; leftovers flush on writable events, with
    // a grace deadline so a dead peer cannot park the close forever.
    let _ = cycle_output(w, token);
    {
        let Worker { socks, timers, .. } = w;
        if let Some(s) = stream_mut(socks, token) {
            if s.tls.state == TlsState::Io && s.tls.conn.wants_write() {
                s.timer = Some(timers.schedule(CLOSE_GRACE, token));
            }
        }
    }
    update_interest(w, token);
    maybe_finish_close(w, token);
}

/// Close completes once the handle table is empty and the close_notify
/// flush is no longer pending.
fn maybe_finish_close(w: &mut Worker, token: Token) {
    let done = {
        let Worker { socks, .. } = w;
        let Some(s) = stream_mut(socks, token) else { return };
        s.state == SockState::Closing
            && s.handles.is_empty()
            && (s.tls.state != TlsState::Io || !s.tls.conn.wants_write())
    };
    if done {
        finish_close(w, token);
    }
}

fn finish_close(w: &mut Worker, token: Token) {
    {
        let Worker { poll, socks, timers, .. } = w;
        let Some(s) = stream_mut(socks, token) else { return };
        s.state = SockState::Closed;
        timer_stop(timers, s);
        if s.interest.take().is_some() {
            let _ = poll.registry().deregister(&mut s.stream);
        }
    }
    let sock = w.remove_sock(token);
    trace!("socket {:?} destroyed", sock.key);
    drop(sock);
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn stream_mut(socks: &mut Slab<Socket>, token: Token) -> Option<&mut StreamSock> {
    match socks.get_mut(token.0) {
        Some(Socket {
            kind: SockKind::Stream(s),
            ..
        }) => Some(s.as_mut()),
        _ => None,
    }
}

/// Allocates a handle in the socket's active-handle table.
fn alloc_handle(
    shared: &Arc<Shared>,
    s: &mut StreamSock,
    key: SockKey,
    peer: SocketAddr,
    local: SocketAddr,
) -> Handle {
    let entry = s.handles.vacant_entry();
    let (handle, inner) = Handle::new(Arc::downgrade(shared), key, entry.key(), peer, local);
    entry.insert(inner);
    handle
}

fn alloc_client_handle(
    shared: &Arc<Shared>,
    s: &mut StreamSock,
    key: SockKey,
) -> (Handle, Arc<crate::handle::HandleInner>) {
    let entry = s.handles.vacant_entry();
    let (handle, inner) =
        Handle::new(Arc::downgrade(shared), key, entry.key(), s.peer, s.local);
    entry.insert(Arc::clone(&inner));
    (handle, inner)
}

/// Applies the manager's kernel buffer-size knobs to a socket.
fn apply_buffer_sizes(shared: &Shared, stream: &TcpStream) {
    use std::os::fd::{AsRawFd, BorrowedFd};
    let fd = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
    let sockref = SockRef::from(&fd);
    let recv = shared.recv_buffer.load(Ordering::Relaxed);
    if recv > 0 {
        let _ = sockref.set_recv_buffer_size(recv);
    }
    let send = shared.send_buffer.load(Ordering::Relaxed);
    if send > 0 {
        let _ = sockref.set_send_buffer_size(send);
    }
}

/// Re-registers the stream to match what the socket currently wants:
/// readable while reading or handshaking, writable while connecting or
/// the session has ciphertext to push.
fn update_interest(w: &mut Worker, token: Token) {
    let Worker { poll, socks, .. } = w;
    let Some(s) = stream_mut(socks, token) else { return };
    if s.state == SockState::Closed {
        return;
    }

    let mut want_read = s.reading && !s.closing();
    if s.state == SockState::Connected && s.tls.conn.is_handshaking() {
        want_read = true;
    }
    let want_write = s.state == SockState::Connecting || s.tls.conn.wants_write();

    let desired = match (want_read, want_write) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    };
    if desired == s.interest {
        return;
    }

    let registry = poll.registry();
    let result = match (s.interest, desired) {
        (None, Some(interest)) => registry.register(&mut s.stream, token, interest),
        (Some(_), Some(interest)) => registry.reregister(&mut s.stream, token, interest),
        (Some(_), None) => registry.deregister(&mut s.stream),
        (None, None) => Ok(()),
    };
    if result.is_ok() {
        s.interest = desired;
    }
}
