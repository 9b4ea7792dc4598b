//! The driver-side timer wheel.
//!
//! Timer commands emitted by protocol steps are applied here. Each scheduled
//! timer gets a monotonically allocated ID and fires at most once; a machine
//! re-scheduling the same timer value replaces the pending entry, and
//! cancellation is by value.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::{TimerCmd, TimerT};

/// A set of pending timers tagged with values of type `T`.
#[derive(Debug)]
pub struct TimerWheel<T> {
    next_id: u64,
    /// Pending timers by ID; IDs grow monotonically, so iteration order is
    /// arming order.
    pending: BTreeMap<u64, (Instant, T)>,
}

impl<T: TimerT> TimerWheel<T> {
    /// Creates an empty wheel.
    pub fn new() -> Self {
        TimerWheel {
            next_id: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Applies a batch of timer commands at time `now`.
    pub fn apply<I: IntoIterator<Item = TimerCmd<T>>>(&mut self, cmds: I, now: Instant) {
        for cmd in cmds {
            match cmd {
                TimerCmd::Schedule(timer, delay) => self.schedule(timer, delay, now),
                TimerCmd::Cancel(timer) => self.cancel(&timer),
            }
        }
    }

    /// Arms `timer` to fire `delay` after `now`, replacing any pending
    /// occurrence of the same value.
    pub fn schedule(&mut self, timer: T, delay: Duration, now: Instant) {
        self.cancel(&timer);
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id, (now + delay, timer));
    }

    /// Cancels every pending occurrence of `timer`.
    pub fn cancel(&mut self, timer: &T) {
        self.pending.retain(|_, (_, tag)| *tag != *timer);
    }

    /// The earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|(deadline, _)| *deadline).min()
    }

    /// Removes and returns the timers that are due at `now`, in arming
    /// order.
    pub fn expire(&mut self, now: Instant) -> Vec<T> {
        let due: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        due.into_iter()
            .map(|id| {
                let (_, timer) = self.pending.remove(&id).expect("due timer is pending");
                timer
            })
            .collect()
    }

    /// Returns `true` if no timer is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Returns `true` if an occurrence of `timer` is pending.
    pub fn is_pending(&self, timer: &T) -> bool {
        self.pending.values().any(|(_, pending)| pending == timer)
    }
}

impl<T: TimerT> Default for TimerWheel<T> {
    fn default() -> Self {
        TimerWheel::new()
    }
}

#[cfg(test)]
mod tests {
    use super::TimerWheel;
    use std::time::{Duration, Instant};

    #[test]
    fn timers_fire_once_in_arming_order() {
        let now = Instant::now();
        let mut wheel = TimerWheel::new();
        wheel.schedule("b", Duration::from_millis(10), now);
        wheel.schedule("a", Duration::from_millis(10), now);

        let due = wheel.expire(now + Duration::from_millis(20));
        assert_eq!(due, vec!["b", "a"]);
        assert!(wheel.is_empty());
        assert!(wheel.expire(now + Duration::from_millis(30)).is_empty());
    }

    #[test]
    fn rescheduling_replaces_and_cancel_removes() {
        let now = Instant::now();
        let mut wheel = TimerWheel::new();
        wheel.schedule("t", Duration::from_millis(10), now);
        wheel.schedule("t", Duration::from_millis(50), now);
        assert!(wheel.expire(now + Duration::from_millis(20)).is_empty());

        wheel.schedule("u", Duration::from_millis(10), now);
        wheel.cancel(&"u");
        assert_eq!(
            wheel.next_deadline(),
            Some(now + Duration::from_millis(50))
        );
    }
}
