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

//! The user-facing, per-exchange reference to a connection.
//!
//! A [`Handle`] is handed to application callbacks on accept, connect, and
//! per received message. Cloning a handle attaches another reference;
//! dropping the last clone posts a detach event to the connection's owning
//! worker, which releases the handle's slot in the socket's active-handle
//! table and lets a pending close complete. All socket mutation stays on the
//! owning worker: handle methods submit events, they never touch the socket
//! directly.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::event::NetEvent;
use crate::manager::Shared;
use crate::result::Error;
use crate::socket::SockKey;
use crate::tlsdns::SendRequest;
use crate::{ReadCallback, SendCallback};

/// Opaque per-handle user data with optional reset and free hooks.
pub(crate) struct UserData {
    value: Arc<dyn Any + Send + Sync>,
    reset: Option<Box<dyn Fn() + Send>>,
    free: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for UserData {
    fn drop(&mut self) {
        if let Some(free) = self.free.take() {
            free();
        }
    }
}

pub(crate) struct HandleInner {
    pub(crate) mgr: Weak<Shared>,
    pub(crate) key: SockKey,
    pub(crate) slot: usize,
    pub(crate) peer: SocketAddr,
    pub(crate) local: SocketAddr,
    /// User-visible references. The active-handle table's own `Arc` is not
    /// counted here; the last user release is what triggers detach.
    pub(crate) refs: AtomicUsize,
    /// Sequential mode was requested on this handle; consulted by the
    /// framing loop right after the receive callback returns, so the mode
    /// takes effect before the next buffered frame is surfaced.
    pub(crate) sequential: AtomicBool,
    pub(crate) data: Mutex<Option<UserData>>,
}

impl HandleInner {
    /// Runs the user reset hook, if any. Called by the owning worker when
    /// the last user reference detaches.
    pub(crate) fn do_reset(&self) {
        let data = self.data.lock().unwrap();
        if let Some(ref data) = *data {
            if let Some(ref reset) = data.reset {
                reset();
            }
        }
    }
}

/// A reference-counted, per-exchange surface onto one connection.
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl Handle {
    /// Worker-side constructor for a freshly allocated table slot.
    pub(crate) fn new(
        mgr: Weak<Shared>,
        key: SockKey,
        slot: usize,
        peer: SocketAddr,
        local: SocketAddr,
    ) -> (Self, Arc<HandleInner>) {
        let inner = Arc::new(HandleInner {
            mgr,
            key,
            slot,
            peer,
            local,
            refs: AtomicUsize::new(1),
            sequential: AtomicBool::new(false),
            data: Mutex::new(None),
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            inner,
        )
    }

    /// Worker-side revival of an existing table entry (statichandle reuse).
    pub(crate) fn from_inner(inner: Arc<HandleInner>) -> Self {
        inner.refs.fetch_add(1, Ordering::AcqRel);
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<HandleInner> {
        &self.inner
    }

    /// The remote address of the connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// The local address of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    /// Attaches another reference; equivalent to `clone`.
    pub fn attach(&self) -> Handle {
        self.clone()
    }

    /// Associates opaque data with this handle. `reset` runs when the last
    /// reference detaches; `free` runs when the handle is freed.
    pub fn set_data(
        &self,
        value: Arc<dyn Any + Send + Sync>,
        reset: Option<Box<dyn Fn() + Send>>,
        free: Option<Box<dyn FnOnce() + Send>>,
    ) {
        let mut slot = self.inner.data.lock().unwrap();
        *slot = Some(UserData { value, reset, free });
    }

    /// The data previously stored with [`Handle::set_data`].
    pub fn data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        let slot = self.inner.data.lock().unwrap();
        slot.as_ref().map(|d| Arc::clone(&d.value))
    }

    /// Queues a DNS message for sending. The payload is framed with the
    /// 2-byte big-endian length prefix; completion is reported through `cb`
    /// exactly once.
    pub fn send(&self, msg: &[u8], cb: SendCallback) {
        if msg.len() > u16::MAX as usize {
            cb(self, Err(Error::NoResources));
            return;
        }
        let Some(mgr) = self.inner.mgr.upgrade() else {
            cb(self, Err(Error::ShuttingDown));
            return;
        };

        let mut data = Vec::with_capacity(msg.len() + 2);
        data.extend_from_slice(&(msg.len() as u16).to_be_bytes());
        data.extend_from_slice(msg);

        mgr.submit(
            self.inner.key.tid,
            NetEvent::Send {
                key: self.inner.key,
                req: SendRequest {
                    data,
                    handle: self.clone(),
                    cb: Some(cb),
                },
            },
        );
    }

    /// Arms a one-shot read on a client connection. The callback fires with
    /// the next full frame, or with the error that ended the connection.
    pub fn read(&self, cb: ReadCallback) {
        let Some(mgr) = self.inner.mgr.upgrade() else {
            cb(self, Err(Error::ShuttingDown));
            return;
        };
        mgr.submit(
            self.inner.key.tid,
            NetEvent::Read {
                key: self.inner.key,
                handle: self.clone(),
                cb,
            },
        );
    }

    /// Cancels a pending read; the read completes with `Canceled` at most
    /// once. Canceling with no read pending is a no-op.
    pub fn cancel_read(&self) {
        self.post(NetEvent::Cancel {
            key: self.inner.key,
        });
    }

    /// Stops issuing kernel reads for this connection.
    pub fn pause_read(&self) {
        self.post(NetEvent::PauseRead {
            key: self.inner.key,
        });
    }

    /// Resumes kernel reads for this connection.
    pub fn resume_read(&self) {
        self.post(NetEvent::ResumeRead {
            key: self.inner.key,
        });
    }

    /// Overrides the read timeout for this connection, in milliseconds, and
    /// restarts the running timer.
    pub fn set_timeout(&self, ms: u64) {
        self.post(NetEvent::SetTimeout {
            key: self.inner.key,
            ms,
        });
    }

    /// Clears the read timeout and stops the running timer.
    pub fn clear_timeout(&self) {
        self.post(NetEvent::ClearTimeout {
            key: self.inner.key,
        });
    }

    /// Disables pipelining on a server connection: reading pauses between
    /// frames and resumes only after this handle is released.
    pub fn sequential(&self) {
        // The flag applies synchronously when called from the receive
        // callback; the event covers every other caller.
        self.inner.sequential.store(true, Ordering::Release);
        self.post(NetEvent::Sequential {
            key: self.inner.key,
        });
    }

    /// Switches this connection's idle timer to the keepalive timeout.
    pub fn keepalive(&self, on: bool) {
        self.post(NetEvent::Keepalive {
            key: self.inner.key,
            on,
        });
    }

    fn post(&self, ev: NetEvent) {
        if let Some(mgr) = self.inner.mgr.upgrade() {
            mgr.submit(self.inner.key.tid, ev);
        }
    }
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        self.inner.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.inner.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // Last user reference: the owning worker releases the table slot,
        // runs the reset hook, and resumes a paused pipeline if needed.
        if let Some(mgr) = self.inner.mgr.upgrade() {
            mgr.submit(
                self.inner.key.tid,
                NetEvent::DetachHandle {
                    key: self.inner.key,
                    slot: self.inner.slot,
                },
            );
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("peer", &self.inner.peer)
            .field("local", &self.inner.local)
            .field("refs", &self.inner.refs.load(Ordering::Relaxed))
            .finish()
    }
}
