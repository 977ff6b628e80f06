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

//! The per-thread event loop.
//!
//! A worker owns a `mio::Poll`, a timer wheel, a slab of sockets, and the
//! receiving ends of its four event queues. It blocks in `poll` until I/O is
//! ready, a timer is due, or the waker fires; each round it dispatches I/O
//! events, drains the queues in priority order, and fires expired timers.
//! While paused it parks on the priority condvar and processes only
//! priority events.

use std::cell::Cell;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};
use log::{error, trace, warn};
use mio::{Events, Poll, Token};
use slab::Slab;

use crate::event::{NetEvent, QueueKind, QUEUE_KINDS};
use crate::manager::Shared;
use crate::socket::{SockKey, SockKind, SockState, Socket};
use crate::timer::TimerWheel;
use crate::tlsdns;

/// Token reserved for the cross-thread waker.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX - 1);

thread_local! {
    static TID: Cell<isize> = const { Cell::new(-1) };
}

/// The calling thread's worker id, if it is a worker thread.
pub(crate) fn tid() -> Option<usize> {
    TID.with(|t| {
        let v = t.get();
        (v >= 0).then_some(v as usize)
    })
}

pub(crate) enum Action {
    Continue,
    /// The batch was terminated by pause or stop; re-arm and re-enter.
    Suspend,
}

pub(crate) struct Worker {
    pub(crate) id: usize,
    pub(crate) shared: Arc<Shared>,
    pub(crate) poll: Poll,
    receivers: Vec<Receiver<NetEvent>>,
    pub(crate) socks: Slab<Socket>,
    pub(crate) timers: TimerWheel,
    next_gen: u64,
    finished: bool,
}

enum Dispatch {
    Accept,
    ConnectReady,
    Io { readable: bool, writable: bool },
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        shared: Arc<Shared>,
        poll: Poll,
        receivers: Vec<Receiver<NetEvent>>,
    ) -> Self {
        Self {
            id,
            shared,
            poll,
            receivers,
            socks: Slab::new(),
            timers: TimerWheel::new(),
            next_gen: 0,
            finished: false,
        }
    }

    pub(crate) fn run(mut self) {
        TID.with(|t| t.set(self.id as isize));
        trace!("worker {} running", self.id);

        let mut events = Events::with_capacity(1024);
        while !self.finished {
            let timeout = self.timers.next_timeout(Instant::now());
            if let Err(err) = self.poll.poll(&mut events, timeout) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!("worker {} poll failed: {}", self.id, err);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => {}
                    token => self.sock_event(token, event),
                }
            }

            self.drain_queues();
            self.fire_timers();

            while self.paused() && !self.finished {
                self.run_paused();
            }
        }

        self.stop_drain();
        trace!("worker {} finished", self.id);
    }

    /// Inserts a new socket, assigning its key. The closure receives the
    /// key so the socket can carry it.
    pub(crate) fn insert_sock(&mut self, build: impl FnOnce(SockKey) -> Socket) -> SockKey {
        let gen = self.next_gen;
        self.next_gen += 1;
        let entry = self.socks.vacant_entry();
        let key = SockKey {
            tid: self.id,
            token: Token(entry.key()),
            gen,
        };
        entry.insert(build(key));
        self.shared.sock_created();
        key
    }

    /// Removes a socket from the slab, releasing its manager count.
    pub(crate) fn remove_sock(&mut self, token: Token) -> Socket {
        let sock = self.socks.remove(token.0);
        self.shared.sock_destroyed();
        sock
    }

    /// Resolves a cross-thread key, dropping events whose socket slot has
    /// been reused since the event was posted.
    pub(crate) fn resolve(&mut self, key: SockKey) -> Option<&mut Socket> {
        match self.socks.get_mut(key.token.0) {
            Some(sock) if sock.key.gen == key.gen => Some(sock),
            _ => None,
        }
    }

    fn paused(&self) -> bool {
        self.shared.workers[self.id].paused.load(Ordering::Acquire)
    }

    fn sock_event(&mut self, token: Token, event: &mio::event::Event) {
        let dispatch = match self.socks.get(token.0) {
            Some(sock) => match sock.kind {
                SockKind::Listener(_) => {
                    if !event.is_readable() {
                        return;
                    }
                    Dispatch::Accept
                }
                SockKind::Stream(ref s) if s.state == SockState::Connecting => {
                    Dispatch::ConnectReady
                }
                SockKind::Stream(_) => Dispatch::Io {
                    readable: event.is_readable() || event.is_read_closed(),
                    writable: event.is_writable(),
                },
            },
            // Sporadic events for released slots happen.
            None => return,
        };

        match dispatch {
            Dispatch::Accept => tlsdns::accept_loop(self, token),
            Dispatch::ConnectReady => tlsdns::connect_ready(self, token),
            Dispatch::Io { readable, writable } => {
                if writable {
                    tlsdns::writable(self, token);
                }
                if readable {
                    tlsdns::readable(self, token);
                }
            }
        }
    }

    fn drain_queues(&mut self) {
        for kind in QUEUE_KINDS {
            if self.paused() && kind != QueueKind::Priority {
                break;
            }
            if let Action::Suspend = self.process_queue(kind) {
                // Re-arm so the next loop iteration resumes draining.
                let _ = self.shared.workers[self.id].waker.wake();
                return;
            }
        }
    }

    fn process_queue(&mut self, kind: QueueKind) -> Action {
        let idx = kind as usize;
        let counter = Arc::clone(&self.shared.workers[self.id].counters[idx]);

        // The counter is an upper bound on this round; anything enqueued
        // while we drain waits for the next round.
        let bound = counter.load(Ordering::Acquire);
        for _ in 0..bound {
            match self.receivers[idx].try_recv() {
                Ok(ev) => {
                    counter.fetch_sub(1, Ordering::AcqRel);
                    if let Action::Suspend = self.process_event(ev) {
                        return Action::Suspend;
                    }
                }
                Err(TryRecvError::Empty) => {
                    // An item is scheduled but not visible yet.
                    if counter.load(Ordering::Acquire) > 0 {
                        thread::yield_now();
                    }
                    break;
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }
        Action::Continue
    }

    fn process_event(&mut self, ev: NetEvent) -> Action {
        match ev {
            NetEvent::Pause => {
                self.shared.workers[self.id]
                    .paused
                    .store(true, Ordering::Release);
                self.shared.worker_paused();
                Action::Suspend
            }
            NetEvent::Resume => {
                self.shared.workers[self.id]
                    .paused
                    .store(false, Ordering::Release);
                Action::Continue
            }
            NetEvent::Stop => {
                self.finished = true;
                Action::Suspend
            }
            NetEvent::Privileged(task) | NetEvent::Task(task) => {
                task();
                Action::Continue
            }
            NetEvent::Shutdown => {
                self.shutdown_sockets();
                Action::Continue
            }
            NetEvent::Listen(req) => {
                tlsdns::listen_child(self, *req);
                Action::Continue
            }
            NetEvent::StopListen { key } => {
                tlsdns::stop_listen_child(self, key);
                Action::Continue
            }
            NetEvent::Accept { key } => {
                tlsdns::accept_retry(self, key);
                Action::Continue
            }
            NetEvent::Connect(req) => {
                tlsdns::connect_start(self, *req);
                Action::Continue
            }
            NetEvent::Send { key, req } => {
                tlsdns::send(self, key, req);
                Action::Continue
            }
            NetEvent::Read { key, handle, cb } => {
                tlsdns::read(self, key, handle, cb);
                Action::Continue
            }
            NetEvent::Cancel { key } => {
                tlsdns::cancel_read(self, key);
                Action::Continue
            }
            NetEvent::Cycle { key } => {
                tlsdns::cycle(self, key);
                Action::Continue
            }
            NetEvent::DetachHandle { key, slot } => {
                tlsdns::detach_handle(self, key, slot);
                Action::Continue
            }
            NetEvent::PauseRead { key } => {
                tlsdns::pause_read(self, key);
                Action::Continue
            }
            NetEvent::ResumeRead { key } => {
                tlsdns::resume_read(self, key);
                Action::Continue
            }
            NetEvent::SetTimeout { key, ms } => {
                tlsdns::set_timeout(self, key, ms);
                Action::Continue
            }
            NetEvent::ClearTimeout { key } => {
                tlsdns::clear_timeout(self, key);
                Action::Continue
            }
            NetEvent::Sequential { key } => {
                tlsdns::sequential(self, key);
                Action::Continue
            }
            NetEvent::Keepalive { key, on } => {
                tlsdns::keepalive(self, key, on);
                Action::Continue
            }
        }
    }

    /// Parks on the priority condvar, processing only priority events,
    /// until resumed or stopped. Drains the privileged queue before
    /// reporting resumed.
    fn run_paused(&mut self) {
        loop {
            let _ = self.process_queue(QueueKind::Priority);
            if self.finished || !self.paused() {
                break;
            }
            let pair = Arc::clone(&self.shared.workers[self.id].prio_signal);
            let (lock, cv) = &*pair;
            let guard = lock.lock().unwrap();
            if self.shared.workers[self.id].counters[QueueKind::Priority as usize]
                .load(Ordering::Acquire)
                == 0
            {
                let _ = cv.wait_timeout(guard, Duration::from_millis(100)).unwrap();
            }
        }

        let _ = self.process_queue(QueueKind::Privileged);
        self.shared.worker_resumed();
    }

    /// Soft-stops every socket owned by this worker.
    fn shutdown_sockets(&mut self) {
        let tokens: Vec<Token> = self.socks.iter().map(|(k, _)| Token(k)).collect();
        for token in tokens {
            tlsdns::sock_shutdown(self, token);
        }
    }

    /// Final queue drain on worker stop: privileged and task queues run,
    /// the priority queue gets one drain, everything else is dropped.
    fn stop_drain(&mut self) {
        let _ = self.process_queue(QueueKind::Privileged);
        let _ = self.process_queue(QueueKind::Task);
        let _ = self.process_queue(QueueKind::Priority);

        if !self.socks.is_empty() {
            warn!(
                "worker {} stopping with {} sockets outstanding",
                self.id,
                self.socks.len()
            );
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some(token) = self.timers.pop_expired(now) {
            tlsdns::timer_expired(self, token);
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("sockets", &self.socks.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
