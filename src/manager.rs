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

//! The process-wide network manager.
//!
//! A [`Manager`] owns a pool of I/O worker threads, each running its own
//! event loop. Cloning the manager attaches another reference; dropping
//! one detaches it. The worker pool is torn down by [`Manager::destroy`]
//! or by the last detach, either of which blocks until every socket has
//! been released.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace, warn};
use mio::{Poll, Waker};

use crate::event::{NetEvent, QueueKind};
use crate::quota::Quota;
use crate::result::{Error, Result};
use crate::tlsdns::{self, Listener};
use crate::worker::{self, Worker, WAKE_TOKEN};
use crate::{AcceptCallback, ConnectCallback, RecvCallback};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_UDP: usize = 1232;

/// Cross-thread face of one worker: queue senders, depth counters, the
/// poll waker, and the pause signal.
pub(crate) struct WorkerChannel {
    senders: [Sender<NetEvent>; 4],
    pub(crate) counters: [Arc<AtomicUsize>; 4],
    pub(crate) waker: Arc<Waker>,
    /// Signalled on priority submissions so a paused worker wakes without
    /// its poll running.
    pub(crate) prio_signal: Arc<(Mutex<()>, Condvar)>,
    pub(crate) paused: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// State shared between the manager frontend, its workers, and handles.
pub(crate) struct Shared {
    pub(crate) workers: Vec<WorkerChannel>,
    pub(crate) tcp_init: AtomicU64,
    pub(crate) tcp_idle: AtomicU64,
    pub(crate) tcp_keepalive: AtomicU64,
    pub(crate) tcp_advertised: AtomicU64,
    pub(crate) max_udp: AtomicUsize,
    pub(crate) recv_buffer: AtomicUsize,
    pub(crate) send_buffer: AtomicUsize,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) paused: AtomicBool,
    /// External `Manager` references; the last detach tears the pool down.
    mgr_refs: AtomicUsize,
    /// The pool has been stopped and joined; teardown runs at most once.
    destroyed: AtomicBool,
    /// Workers currently reporting paused, and the wait for the aggregate.
    pause_count: Mutex<usize>,
    pause_cv: Condvar,
    /// The process-wide single-writer token serializing pause/resume.
    interlock: Mutex<bool>,
    interlock_cv: Condvar,
    /// Live socket count; destroy blocks until it reaches zero.
    socks: Mutex<usize>,
    socks_cv: Condvar,
    conn_rr: AtomicUsize,
}

impl Shared {
    /// Routes `ev` to the owning worker's queue for its kind and signals
    /// the loop.
    pub(crate) fn submit(&self, tid: usize, ev: NetEvent) {
        let wc = &self.workers[tid];
        let kind = ev.queue();
        // The counter leads the enqueue so the consumer sees an upper bound.
        wc.counters[kind as usize].fetch_add(1, Ordering::AcqRel);
        if kind == QueueKind::Priority {
            // Sending under the lock pairs with the paused worker's
            // check-then-wait, so the notify cannot be lost.
            let _guard = wc.prio_signal.0.lock().unwrap();
            let _ = wc.senders[kind as usize].send(ev);
            wc.prio_signal.1.notify_all();
        } else {
            let _ = wc.senders[kind as usize].send(ev);
        }
        let _ = wc.waker.wake();
    }

    pub(crate) fn sock_created(&self) {
        let mut socks = self.socks.lock().unwrap();
        *socks += 1;
    }

    pub(crate) fn sock_destroyed(&self) {
        let mut socks = self.socks.lock().unwrap();
        *socks -= 1;
        if *socks == 0 {
            self.socks_cv.notify_all();
        }
    }

    /// Worker-side: report this worker paused and wait-free return.
    pub(crate) fn worker_paused(&self) {
        let mut count = self.pause_count.lock().unwrap();
        *count += 1;
        self.pause_cv.notify_all();
    }

    /// Worker-side: report this worker resumed (privileged queue drained).
    pub(crate) fn worker_resumed(&self) {
        let mut count = self.pause_count.lock().unwrap();
        *count -= 1;
        self.pause_cv.notify_all();
    }

    pub(crate) fn init_timeout(&self) -> Option<Duration> {
        ms_opt(self.tcp_init.load(Ordering::Relaxed))
    }

    pub(crate) fn idle_timeout(&self, keepalive: bool) -> Option<Duration> {
        if keepalive {
            ms_opt(self.tcp_keepalive.load(Ordering::Relaxed))
        } else {
            ms_opt(self.tcp_idle.load(Ordering::Relaxed))
        }
    }

    fn initiate_shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("network manager shutting down");
        for id in 0..self.workers.len() {
            self.submit(id, NetEvent::Shutdown);
        }
    }

    /// Shuts every socket down, waits for all of them to be released, then
    /// stops and joins the workers. Runs at most once; later callers return
    /// immediately.
    fn teardown(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.initiate_shutdown();

        let mut socks = self.socks.lock().unwrap();
        while *socks != 0 {
            socks = self.socks_cv.wait(socks).unwrap();
        }
        drop(socks);

        for id in 0..self.workers.len() {
            self.submit(id, NetEvent::Stop);
        }
        for wc in &self.workers {
            if let Some(join) = wc.join.lock().unwrap().take() {
                let _ = join.join();
            }
        }
        debug!("network manager destroyed");
    }
}

fn ms_opt(ms: u64) -> Option<Duration> {
    (ms != 0).then(|| Duration::from_millis(ms))
}

/// Multi-threaded, event-loop-driven network manager for DNS transports.
pub struct Manager {
    shared: Arc<Shared>,
}

impl Manager {
    /// Creates a manager running `workers` I/O threads.
    pub fn new(workers: usize) -> io::Result<Manager> {
        let nworkers = workers.max(1);
        let mut channels = Vec::with_capacity(nworkers);
        let mut seeds = Vec::with_capacity(nworkers);

        for id in 0..nworkers {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
            let mut senders: Vec<Sender<NetEvent>> = Vec::with_capacity(4);
            let mut receivers: Vec<Receiver<NetEvent>> = Vec::with_capacity(4);
            for _ in 0..4 {
                let (tx, rx) = unbounded();
                senders.push(tx);
                receivers.push(rx);
            }
            let counters: [Arc<AtomicUsize>; 4] = std::array::from_fn(|_| {
                Arc::new(AtomicUsize::new(0))
            });

            channels.push(WorkerChannel {
                senders: senders.try_into().map_err(|_| ()).unwrap(),
                counters,
                waker,
                prio_signal: Arc::new((Mutex::new(()), Condvar::new())),
                paused: Arc::new(AtomicBool::new(false)),
                join: Mutex::new(None),
            });
            seeds.push((id, poll, receivers));
        }

        let shared = Arc::new(Shared {
            workers: channels,
            tcp_init: AtomicU64::new(DEFAULT_TIMEOUT_MS),
            tcp_idle: AtomicU64::new(DEFAULT_TIMEOUT_MS),
            tcp_keepalive: AtomicU64::new(DEFAULT_TIMEOUT_MS),
            tcp_advertised: AtomicU64::new(DEFAULT_TIMEOUT_MS),
            max_udp: AtomicUsize::new(DEFAULT_MAX_UDP),
            recv_buffer: AtomicUsize::new(0),
            send_buffer: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            mgr_refs: AtomicUsize::new(1),
            destroyed: AtomicBool::new(false),
            pause_count: Mutex::new(0),
            pause_cv: Condvar::new(),
            interlock: Mutex::new(false),
            interlock_cv: Condvar::new(),
            socks: Mutex::new(0),
            socks_cv: Condvar::new(),
            conn_rr: AtomicUsize::new(0),
        });

        for (id, poll, receivers) in seeds {
            let shared_for_worker = Arc::clone(&shared);
            let join = thread::Builder::new()
                .name(format!("netmgr-{id}"))
                .spawn(move || {
                    Worker::new(id, shared_for_worker, poll, receivers).run();
                })?;
            *shared.workers[id].join.lock().unwrap() = Some(join);
        }

        debug!("network manager running {} workers", nworkers);
        Ok(Manager { shared })
    }

    /// Halts event processing on every worker. Only priority events run
    /// until [`Manager::resume`]. A worker may call this only if it is
    /// worker zero.
    pub fn pause(&self) {
        assert!(!self.shared.paused.load(Ordering::Acquire));
        self.acquire_interlock();
        self.shared.paused.store(true, Ordering::Release);

        let self_tid = worker::tid();
        if let Some(tid) = self_tid {
            assert_eq!(tid, 0, "a worker pausing the manager must be worker 0");
        }

        for (id, wc) in self.shared.workers.iter().enumerate() {
            if self_tid == Some(id) {
                wc.paused.store(true, Ordering::Release);
                self.shared.worker_paused();
            } else {
                self.shared.submit(id, NetEvent::Pause);
            }
        }

        let mut count = self.shared.pause_count.lock().unwrap();
        while *count != self.shared.workers.len() {
            count = self.shared.pause_cv.wait(count).unwrap();
        }
        trace!("all workers paused");
    }

    /// Releases every worker paused by [`Manager::pause`]. Returns once
    /// each worker has drained its privileged queue and resumed.
    pub fn resume(&self) {
        assert!(self.shared.paused.load(Ordering::Acquire));
        let self_tid = worker::tid();

        for (id, wc) in self.shared.workers.iter().enumerate() {
            if self_tid == Some(id) {
                wc.paused.store(false, Ordering::Release);
                self.shared.worker_resumed();
            } else {
                self.shared.submit(id, NetEvent::Resume);
            }
        }

        let mut count = self.shared.pause_count.lock().unwrap();
        while *count != 0 {
            count = self.shared.pause_cv.wait(count).unwrap();
        }
        drop(count);

        self.shared.paused.store(false, Ordering::Release);
        self.release_interlock();
        trace!("all workers resumed");
    }

    /// Soft-stops every socket: pending reads fail with `Canceled`,
    /// listeners stop accepting, and no new work is admitted.
    pub fn shutdown(&self) {
        self.shared.initiate_shutdown();
    }

    /// Tears the manager down: shuts every socket down, waits for all of
    /// them to be released, then stops and joins the workers. Must not be
    /// called from a worker thread. Dropping the last manager reference
    /// performs the same teardown.
    pub fn destroy(self) {
        assert!(
            worker::tid().is_none(),
            "destroy must not run on a worker thread"
        );
        self.shared.teardown();
    }

    /// Sets the TCP initial, idle, keepalive, and advertised timeouts, in
    /// milliseconds. Zero disables the corresponding timer.
    pub fn set_tcp_timeouts(&self, init: u64, idle: u64, keepalive: u64, advertised: u64) {
        self.shared.tcp_init.store(init, Ordering::Relaxed);
        self.shared.tcp_idle.store(idle, Ordering::Relaxed);
        self.shared.tcp_keepalive.store(keepalive, Ordering::Relaxed);
        self.shared.tcp_advertised.store(advertised, Ordering::Relaxed);
    }

    /// The TCP timeouts: (initial, idle, keepalive, advertised).
    pub fn tcp_timeouts(&self) -> (u64, u64, u64, u64) {
        (
            self.shared.tcp_init.load(Ordering::Relaxed),
            self.shared.tcp_idle.load(Ordering::Relaxed),
            self.shared.tcp_keepalive.load(Ordering::Relaxed),
            self.shared.tcp_advertised.load(Ordering::Relaxed),
        )
    }

    /// Sets the maximum UDP payload size advertised by the server.
    pub fn set_max_udp_size(&self, size: usize) {
        self.shared.max_udp.store(size, Ordering::Relaxed);
    }

    /// The maximum UDP payload size.
    pub fn max_udp_size(&self) -> usize {
        self.shared.max_udp.load(Ordering::Relaxed)
    }

    /// Sets kernel receive/send buffer sizes applied to new sockets. Zero
    /// keeps the kernel default.
    pub fn set_socket_buffer_sizes(&self, recv: usize, send: usize) {
        self.shared.recv_buffer.store(recv, Ordering::Relaxed);
        self.shared.send_buffer.store(send, Ordering::Relaxed);
    }

    /// Opens a TLSDNS listener on `iface`, with one accepting child per
    /// worker. `accept_cb` runs at TCP accept and again at handshake
    /// completion; returning an error rejects the connection. `recv_cb`
    /// runs once per received DNS frame.
    pub fn listen_tlsdns(
        &self,
        iface: SocketAddr,
        recv_cb: RecvCallback,
        accept_cb: AcceptCallback,
        backlog: u32,
        quota: Option<Arc<Quota>>,
        config: Arc<rustls::ServerConfig>,
    ) -> Result<Listener> {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        tlsdns::listen(
            &self.shared,
            iface,
            recv_cb,
            accept_cb,
            backlog,
            quota,
            config,
        )
    }

    /// Opens an outgoing TLSDNS connection. Completion, including the TLS
    /// handshake, is reported through `cb` with the connection's handle.
    pub fn connect_tlsdns(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: ConnectCallback,
        timeout_ms: u64,
        config: Arc<rustls::ClientConfig>,
    ) -> Result<()> {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        tlsdns::connect(&self.shared, local, peer, cb, timeout_ms, config)
    }

    fn acquire_interlock(&self) {
        let mut held = self.shared.interlock.lock().unwrap();
        while *held {
            held = self.shared.interlock_cv.wait(held).unwrap();
        }
        *held = true;
    }

    fn release_interlock(&self) {
        let mut held = self.shared.interlock.lock().unwrap();
        *held = false;
        self.shared.interlock_cv.notify_one();
    }

    /// Picks the owning worker for a new outgoing connection: the current
    /// worker when called from one, round-robin otherwise.
    pub(crate) fn pick_worker(shared: &Shared) -> usize {
        match worker::tid() {
            Some(tid) => tid,
            None => shared.conn_rr.fetch_add(1, Ordering::Relaxed) % shared.workers.len(),
        }
    }
}

impl Clone for Manager {
    fn clone(&self) -> Self {
        self.shared.mgr_refs.fetch_add(1, Ordering::AcqRel);
        Manager {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if self.shared.mgr_refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if self.shared.destroyed.load(Ordering::Acquire) {
            return;
        }
        // The last detach tears the pool down. A worker thread cannot join
        // the pool it runs on; there teardown stays with `destroy`.
        if worker::tid().is_some() {
            warn!("last manager reference dropped on a worker thread; workers not joined");
            return;
        }
        self.shared.teardown();
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("workers", &self.shared.workers.len())
            .field(
                "shutting_down",
                &self.shared.shutting_down.load(Ordering::Relaxed),
            )
            .finish()
    }
}
