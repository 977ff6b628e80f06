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

//! Connection admission control.
//!
//! A [`Quota`] bounds the number of concurrently accepted connections.
//! Listeners attach one token per accepted connection; the token is a scoped
//! [`QuotaGuard`] released exactly once when the connection closes. When the
//! quota is exhausted the accept parks on a callback waitlist and is retried
//! as soon as a token frees up.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type WaitCallback = Box<dyn FnOnce() + Send>;

/// A bound on concurrently admitted connections.
///
/// `soft` marks the level past which connections are still admitted but
/// flagged, so the server can start shedding load before the hard limit.
pub struct Quota {
    max: AtomicUsize,
    soft: AtomicUsize,
    used: AtomicUsize,
    waiting: Mutex<VecDeque<WaitCallback>>,
}

impl Quota {
    /// Creates a quota admitting at most `max` connections. `max` of zero
    /// means unlimited.
    pub fn new(max: usize) -> Self {
        Self {
            max: AtomicUsize::new(max),
            soft: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
            waiting: Mutex::new(VecDeque::new()),
        }
    }

    /// Sets the soft limit. Zero disables it.
    pub fn set_soft(&self, soft: usize) {
        self.soft.store(soft, Ordering::Relaxed);
    }

    /// Replaces the hard limit. Zero means unlimited.
    pub fn set_max(&self, max: usize) {
        self.max.store(max, Ordering::Relaxed);
    }

    /// The hard limit.
    pub fn max(&self) -> usize {
        self.max.load(Ordering::Relaxed)
    }

    /// Tokens currently held.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Attempts to take a token. On success returns the scoped guard and
    /// whether the soft limit was exceeded. On exhaustion, queues `waiter`
    /// to be invoked once a token is released and returns `None`.
    pub(crate) fn try_attach(
        this: &Arc<Quota>,
        waiter: WaitCallback,
    ) -> Option<(QuotaGuard, bool)> {
        // Hold the waitlist lock across the counter update so a release on
        // another thread cannot miss a waiter queued between the failed
        // increment and the push.
        let mut waiting = this.waiting.lock().unwrap();

        let max = this.max.load(Ordering::Relaxed);
        let mut used = this.used.load(Ordering::Acquire);
        loop {
            if max != 0 && used >= max {
                waiting.push_back(waiter);
                return None;
            }
            match this.used.compare_exchange_weak(
                used,
                used + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => used = actual,
            }
        }
        drop(waiting);

        let soft = this.soft.load(Ordering::Relaxed);
        let soft_exceeded = soft != 0 && used + 1 > soft;
        Some((
            QuotaGuard {
                quota: Arc::clone(this),
            },
            soft_exceeded,
        ))
    }

    fn release(&self) {
        let waiter = {
            let mut waiting = self.waiting.lock().unwrap();
            self.used.fetch_sub(1, Ordering::AcqRel);
            waiting.pop_front()
        };
        if let Some(waiter) = waiter {
            waiter();
        }
    }
}

impl fmt::Debug for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Quota")
            .field("max", &self.max.load(Ordering::Relaxed))
            .field("soft", &self.soft.load(Ordering::Relaxed))
            .field("used", &self.used.load(Ordering::Relaxed))
            .finish()
    }
}

/// A held admission token. Dropping the guard releases the token and wakes
/// the oldest parked accept, if any.
pub(crate) struct QuotaGuard {
    quota: Arc<Quota>,
}

impl Drop for QuotaGuard {
    fn drop(&mut self) {
        self.quota.release();
    }
}

impl fmt::Debug for QuotaGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn attach_and_release() {
        let quota = Arc::new(Quota::new(2));

        let (a, soft_a) = Quota::try_attach(&quota, Box::new(|| {})).unwrap();
        let (b, soft_b) = Quota::try_attach(&quota, Box::new(|| {})).unwrap();
        assert!(!soft_a);
        assert!(!soft_b);
        assert_eq!(quota.used(), 2);

        drop(a);
        assert_eq!(quota.used(), 1);
        drop(b);
        assert_eq!(quota.used(), 0);
    }

    #[test]
    fn exhaustion_parks_waiter_until_release() {
        let quota = Arc::new(Quota::new(1));
        let woken = Arc::new(AtomicBool::new(false));

        let (guard, _) = Quota::try_attach(&quota, Box::new(|| {})).unwrap();

        let woken2 = Arc::clone(&woken);
        let parked = Quota::try_attach(&quota, Box::new(move || {
            woken2.store(true, Ordering::SeqCst);
        }));
        assert!(parked.is_none());
        assert!(!woken.load(Ordering::SeqCst));

        drop(guard);
        assert!(woken.load(Ordering::SeqCst));
        assert_eq!(quota.used(), 0);
    }

    #[test]
    fn soft_limit_flags_but_admits() {
        let quota = Arc::new(Quota::new(3));
        quota.set_soft(1);

        let (_a, soft_a) = Quota::try_attach(&quota, Box::new(|| {})).unwrap();
        let (_b, soft_b) = Quota::try_attach(&quota, Box::new(|| {})).unwrap();
        assert!(!soft_a);
        assert!(soft_b);
    }

    #[test]
    fn zero_max_is_unlimited() {
        let quota = Arc::new(Quota::new(0));
        let mut guards = Vec::new();
        for _ in 0..64 {
            let (guard, soft) = Quota::try_attach(&quota, Box::new(|| {})).unwrap();
            assert!(!soft);
            guards.push(guard);
        }
        assert_eq!(quota.used(), 64);
    }

    #[test]
    fn release_is_exactly_once() {
        let quota = Arc::new(Quota::new(4));
        let (guard, _) = Quota::try_attach(&quota, Box::new(|| {})).unwrap();
        assert_eq!(quota.used(), 1);
        drop(guard);
        assert_eq!(quota.used(), 0);
        // A second release would underflow; the guard is consumed by drop so
        // there is nothing left to release.
        assert!(quota.waiting.lock().unwrap().is_empty());
    }
}
