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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! netmgr is a multi-threaded, event-loop-driven network manager for DNS
//! transports.
//!
//! A [`Manager`] owns a pool of I/O worker threads, each running its own
//! `mio` event loop. Application code opens DNS-over-TLS listeners and
//! connections and then works exclusively through opaque [`Handle`]s: the
//! manager performs the socket I/O, pumps TLS records through `rustls`,
//! frames DNS messages with the 2-byte big-endian length prefix, runs
//! per-connection timers, gates accepts on a [`Quota`], and tears
//! everything down in order on shutdown.
//!
//! All socket state is pinned to one worker; operations submitted from
//! other threads travel as typed events on the owning worker's queues and
//! results come back through callbacks. Callbacks run on the worker thread
//! and must not block.

mod buffer;
mod event;
mod handle;
mod manager;
mod quota;
mod result;
mod socket;
mod timer;
mod tls;
mod tlsdns;
mod worker;

pub use handle::Handle;
pub use manager::Manager;
pub use quota::Quota;
pub use result::{Error, Result};
pub use tlsdns::Listener;

use std::sync::Arc;

/// Receive callback, invoked once per received DNS frame or with the error
/// that ended the connection. The payload region points into the
/// connection's receive buffer and is only valid for the duration of the
/// call.
pub type RecvCallback = Arc<dyn Fn(&Handle, Result<&[u8]>) + Send + Sync>;

/// Accept callback, invoked at TCP accept and again at TLS handshake
/// completion. Returning an error rejects the connection.
pub type AcceptCallback = Arc<dyn Fn(&Handle, Result<()>) -> Result<()> + Send + Sync>;

/// Connect completion callback: receives the connection's handle once the
/// TLS handshake finishes, or the error that prevented it.
pub type ConnectCallback = Box<dyn FnOnce(Result<Handle>) + Send>;

/// Send completion callback; fires exactly once per send.
pub type SendCallback = Box<dyn FnOnce(&Handle, Result<()>) + Send>;

/// One-shot read callback armed by [`Handle::read`].
pub type ReadCallback = Box<dyn FnOnce(&Handle, Result<&[u8]>) + Send>;
