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

//! Per-worker timer wheel.
//!
//! Each stream socket owns at most one pending deadline at a time, used for
//! either the connect timeout or the read idle-timeout. Deadlines are
//! single-shot; restarting replaces the previous expiry. The wheel feeds the
//! worker's poll timeout so the event loop wakes exactly when the nearest
//! deadline is due.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use mio::Token;

/// Identifies one scheduled deadline, held by the socket that scheduled it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerKey {
    due: Instant,
    seq: u64,
}

/// Ordered set of pending socket deadlines.
#[derive(Debug, Default)]
pub(crate) struct TimerWheel {
    entries: BTreeMap<(Instant, u64), Token>,
    seq: u64,
}

impl TimerWheel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Schedules `token` to fire after `delay`.
    pub(crate) fn schedule(&mut self, delay: Duration, token: Token) -> TimerKey {
        let due = Instant::now() + delay;
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        self.entries.insert((due, seq), token);
        TimerKey { due, seq }
    }

    /// Cancels a previously scheduled deadline. Canceling a deadline that
    /// has already fired is a no-op.
    pub(crate) fn cancel(&mut self, key: TimerKey) {
        self.entries.remove(&(key.due, key.seq));
    }

    /// How long the event loop may sleep before the nearest deadline is due.
    /// `None` when no deadlines are pending.
    pub(crate) fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.entries
            .keys()
            .next()
            .map(|(due, _)| due.saturating_duration_since(now))
    }

    /// Pops the next deadline due at or before `now`.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<Token> {
        let (&(due, seq), &token) = self.entries.iter().next()?;
        if due > now {
            return None;
        }
        self.entries.remove(&(due, seq));
        Some(token)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        wheel.schedule(Duration::from_millis(20), Token(2));
        wheel.schedule(Duration::from_millis(10), Token(1));

        let later = Instant::now() + Duration::from_millis(50);
        assert_eq!(wheel.pop_expired(later), Some(Token(1)));
        assert_eq!(wheel.pop_expired(later), Some(Token(2)));
        assert_eq!(wheel.pop_expired(later), None);
    }

    #[test]
    fn not_due_yet_stays_pending() {
        let mut wheel = TimerWheel::new();
        wheel.schedule(Duration::from_secs(60), Token(7));

        assert_eq!(wheel.pop_expired(Instant::now()), None);
        assert_eq!(wheel.len(), 1);
    }

    #[test]
    fn cancel_removes_the_deadline() {
        let mut wheel = TimerWheel::new();
        let key = wheel.schedule(Duration::from_millis(1), Token(3));
        wheel.cancel(key);

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(wheel.pop_expired(later), None);
    }

    #[test]
    fn cancel_after_fire_is_noop() {
        let mut wheel = TimerWheel::new();
        let key = wheel.schedule(Duration::from_millis(1), Token(3));

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(wheel.pop_expired(later), Some(Token(3)));
        wheel.cancel(key);
        assert_eq!(wheel.len(), 0);
    }

    #[test]
    fn identical_deadlines_are_kept_distinct() {
        let mut wheel = TimerWheel::new();
        // Equal delays may resolve to the same Instant; the sequence number
        // keeps both entries alive.
        wheel.schedule(Duration::from_millis(5), Token(1));
        wheel.schedule(Duration::from_millis(5), Token(2));
        assert_eq!(wheel.len(), 2);

        let later = Instant::now() + Duration::from_secs(1);
        assert!(wheel.pop_expired(later).is_some());
        assert!(wheel.pop_expired(later).is_some());
    }

    #[test]
    fn next_timeout_tracks_nearest() {
        let mut wheel = TimerWheel::new();
        assert_eq!(wheel.next_timeout(Instant::now()), None);

        wheel.schedule(Duration::from_secs(10), Token(1));
        wheel.schedule(Duration::from_millis(100), Token(2));

        let timeout = wheel.next_timeout(Instant::now()).unwrap();
        assert!(timeout <= Duration::from_millis(100));
    }
}
