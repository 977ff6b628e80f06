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

//! The typed cross-thread event set and its routing to per-worker queues.
//!
//! Every operation submitted from outside a worker becomes a [`NetEvent`]
//! enqueued on the owning worker's queue for its kind. Queues are drained in
//! strictly decreasing urgency: priority events run even while the manager
//! is paused, privileged and ordinary tasks run around pause boundaries, and
//! normal I/O events run only while the worker is live.

use std::fmt;

use crate::handle::Handle;
use crate::socket::SockKey;
use crate::tlsdns::{ConnectRequest, ListenRequest, SendRequest};
use crate::ReadCallback;

/// A closure executed on a worker thread by the task system.
pub(crate) type TaskFn = Box<dyn FnOnce() + Send>;

/// The four per-worker queues, in decreasing urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueKind {
    /// Pause, resume, and stop. Runs even while the worker is paused.
    Priority = 0,
    /// Tasks marked privileged; drained on pause exit and on worker stop.
    Privileged = 1,
    /// Ordinary tasks; drained on worker stop.
    Task = 2,
    /// Per-operation I/O events.
    Normal = 3,
}

pub(crate) const QUEUE_KINDS: [QueueKind; 4] = [
    QueueKind::Priority,
    QueueKind::Privileged,
    QueueKind::Task,
    QueueKind::Normal,
];

/// A cross-thread event delivered to a worker.
pub(crate) enum NetEvent {
    /// Halt processing of everything but the priority queue.
    Pause,
    /// Leave the paused state; the privileged queue is drained before the
    /// pause barrier releases.
    Resume,
    /// Terminal: finish the current batch and stop the worker.
    Stop,
    /// A privileged task.
    Privileged(TaskFn),
    /// An ordinary task.
    Task(TaskFn),
    /// Soft-stop every socket owned by this worker.
    Shutdown,
    /// Open a listener child on this worker.
    Listen(Box<ListenRequest>),
    /// Tear down a listener child.
    StopListen { key: SockKey },
    /// Retry an accept parked on quota exhaustion.
    Accept { key: SockKey },
    /// Open an outgoing connection owned by this worker.
    Connect(Box<ConnectRequest>),
    /// Queue a framed message for sending.
    Send { key: SockKey, req: SendRequest },
    /// Arm a one-shot client read.
    Read {
        key: SockKey,
        handle: Handle,
        cb: ReadCallback,
    },
    /// Fail the pending read with `Canceled`.
    Cancel { key: SockKey },
    /// One step of the TLS pump.
    Cycle { key: SockKey },
    /// A handle released its slot in the socket's active-handle table.
    DetachHandle { key: SockKey, slot: usize },
    /// Stop issuing kernel reads for this socket.
    PauseRead { key: SockKey },
    /// Resume kernel reads for this socket.
    ResumeRead { key: SockKey },
    /// Override the read timeout for this socket, in milliseconds.
    SetTimeout { key: SockKey, ms: u64 },
    /// Clear the read timeout and stop the running timer.
    ClearTimeout { key: SockKey },
    /// Disable pipelining: one frame at a time until the handle releases.
    Sequential { key: SockKey },
    /// Switch the idle timer to the keepalive value for this connection.
    Keepalive { key: SockKey, on: bool },
}

impl NetEvent {
    /// The queue this event is routed to.
    pub(crate) fn queue(&self) -> QueueKind {
        match self {
            NetEvent::Pause | NetEvent::Resume | NetEvent::Stop => QueueKind::Priority,
            NetEvent::Privileged(_) => QueueKind::Privileged,
            NetEvent::Task(_) | NetEvent::Shutdown => QueueKind::Task,
            _ => QueueKind::Normal,
        }
    }
}

impl fmt::Debug for NetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetEvent::Pause => "Pause",
            NetEvent::Resume => "Resume",
            NetEvent::Stop => "Stop",
            NetEvent::Privileged(_) => "Privileged",
            NetEvent::Task(_) => "Task",
            NetEvent::Shutdown => "Shutdown",
            NetEvent::Listen(_) => "Listen",
            NetEvent::StopListen { .. } => "StopListen",
            NetEvent::Accept { .. } => "Accept",
            NetEvent::Connect(_) => "Connect",
            NetEvent::Send { .. } => "Send",
            NetEvent::Read { .. } => "Read",
            NetEvent::Cancel { .. } => "Cancel",
            NetEvent::Cycle { .. } => "Cycle",
            NetEvent::DetachHandle { .. } => "DetachHandle",
            NetEvent::PauseRead { .. } => "PauseRead",
            NetEvent::ResumeRead { .. } => "ResumeRead",
            NetEvent::SetTimeout { .. } => "SetTimeout",
            NetEvent::ClearTimeout { .. } => "ClearTimeout",
            NetEvent::Sequential { .. } => "Sequential",
            NetEvent::Keepalive { .. } => "Keepalive",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_events_route_to_priority() {
        assert_eq!(NetEvent::Pause.queue(), QueueKind::Priority);
        assert_eq!(NetEvent::Resume.queue(), QueueKind::Priority);
        assert_eq!(NetEvent::Stop.queue(), QueueKind::Priority);
    }

    #[test]
    fn tasks_route_by_privilege() {
        assert_eq!(
            NetEvent::Privileged(Box::new(|| {})).queue(),
            QueueKind::Privileged
        );
        assert_eq!(NetEvent::Task(Box::new(|| {})).queue(), QueueKind::Task);
        assert_eq!(NetEvent::Shutdown.queue(), QueueKind::Task);
    }

    #[test]
    fn io_events_route_to_normal() {
        let key = SockKey::default();
        assert_eq!(NetEvent::Cancel { key }.queue(), QueueKind::Normal);
        assert_eq!(NetEvent::Cycle { key }.queue(), QueueKind::Normal);
        assert_eq!(
            NetEvent::DetachHandle { key, slot: 0 }.queue(),
            QueueKind::Normal
        );
    }
}
