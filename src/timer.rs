//! Hashed timer wheel, used for per-socket inactivity timeouts and the server's accept-error
//! backoff.
//!
//! Adapted from the teacher's `timer.rs`: a fixed number of wheel slots, each the head of a
//! doubly linked list of entries, where an entry's deadline tick determines its slot by
//! `tick & mask`. Unlike the teacher, this wheel does not bridge itself into `Poll` via its own
//! `Registration`/wakeup-thread pair — `Loop::tick` already knows to compute `next_deadline()`
//! and pass it as the `mio::Poll::poll` timeout, so a single thread suffices.

use std::cmp;
use std::time::{Duration, Instant};

const EMPTY: usize = usize::MAX;

#[derive(Clone, Copy)]
struct WheelSlot {
    next_tick: u64,
    head: usize,
}

struct Entry<T> {
    state: Option<T>,
    tick: u64,
    prev: usize,
    next: usize,
}

/// A handle to a previously scheduled timeout, usable with [`Wheel::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    index: usize,
    tick: u64,
}

/// A tick-based timer wheel storing arbitrary per-timeout state `T`.
pub struct Wheel<T> {
    tick_ms: u64,
    start: Instant,
    tick: u64,
    mask: u64,
    wheel: Vec<WheelSlot>,
    entries: Vec<Entry<T>>,
    free: Vec<usize>,
}

impl<T> Wheel<T> {
    pub fn new(tick: Duration, num_slots: usize) -> Wheel<T> {
        let num_slots = num_slots.next_power_of_two();
        Wheel {
            tick_ms: tick.as_millis().max(1) as u64,
            start: Instant::now(),
            tick: 0,
            mask: (num_slots as u64) - 1,
            wheel: vec![WheelSlot { next_tick: u64::MAX, head: EMPTY }; num_slots],
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    fn now_tick(&self) -> u64 {
        (self.start.elapsed().as_millis() as u64) / self.tick_ms
    }

    /// Schedule `state` to fire no earlier than `delay` from now. Always at least one tick in
    /// the future, so a zero delay still round-trips through the wheel rather than firing
    /// inline.
    pub fn insert(&mut self, delay: Duration, state: T) -> Timeout {
        let mut tick = self.now_tick() + (delay.as_millis() as u64) / self.tick_ms;
        if tick <= self.tick {
            tick = self.tick + 1;
        }

        let slot = (tick & self.mask) as usize;
        let head = self.wheel[slot].head;

        let index = match self.free.pop() {
            Some(i) => {
                self.entries[i] = Entry { state: Some(state), tick, prev: EMPTY, next: head };
                i
            }
            None => {
                self.entries.push(Entry { state: Some(state), tick, prev: EMPTY, next: head });
                self.entries.len() - 1
            }
        };

        if head != EMPTY {
            self.entries[head].prev = index;
        }
        self.wheel[slot] = WheelSlot {
            next_tick: cmp::min(tick, self.wheel[slot].next_tick),
            head: index,
        };

        Timeout { index, tick }
    }

    /// Cancel a timeout before it fires. Returns the state if it had not already fired.
    pub fn cancel(&mut self, timeout: Timeout) -> Option<T> {
        let entry = self.entries.get(timeout.index)?;
        if entry.tick != timeout.tick || entry.state.is_none() {
            return None;
        }
        self.unlink(timeout.index);
        let state = self.entries[timeout.index].state.take();
        self.free.push(timeout.index);
        state
    }

    fn unlink(&mut self, index: usize) {
        let (tick, prev, next) = {
            let e = &self.entries[index];
            (e.tick, e.prev, e.next)
        };
        let slot = (tick & self.mask) as usize;

        if prev == EMPTY {
            self.wheel[slot].head = next;
        } else {
            self.entries[prev].next = next;
        }
        if next != EMPTY {
            self.entries[next].prev = prev;
        }
    }

    /// Pop the next expired timeout, advancing the wheel's internal clock as needed. Call
    /// repeatedly until it returns `None` to drain everything due "now."
    pub fn poll(&mut self) -> Option<T> {
        let target = self.now_tick();

        while self.tick <= target {
            let slot = (self.tick & self.mask) as usize;
            let mut index = self.wheel[slot].head;
            let mut next_tick_in_slot = u64::MAX;

            while index != EMPTY {
                let entry_tick = self.entries[index].tick;
                let next = self.entries[index].next;

                if entry_tick <= self.tick {
                    self.unlink(index);
                    let state = self.entries[index].state.take();
                    self.free.push(index);
                    return state;
                } else {
                    next_tick_in_slot = cmp::min(next_tick_in_slot, entry_tick);
                }
                index = next;
            }

            self.wheel[slot].next_tick = next_tick_in_slot;
            self.tick += 1;
        }

        None
    }

    /// Duration until the next timeout could fire, for use as a poll timeout upper bound.
    pub fn next_deadline(&self) -> Option<Duration> {
        let next_tick = self.wheel.iter().map(|s| s.next_tick).min()?;
        if next_tick == u64::MAX {
            return None;
        }
        let now = self.now_tick();
        let ticks_remaining = next_tick.saturating_sub(now);
        Some(Duration::from_millis(ticks_remaining * self.tick_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_after_delay_not_before() {
        let mut wheel: Wheel<u32> = Wheel::new(Duration::from_millis(5), 16);
        wheel.insert(Duration::from_millis(20), 42);
        assert_eq!(wheel.poll(), None);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(wheel.poll(), Some(42));
        assert_eq!(wheel.poll(), None);
    }

    #[test]
    fn cancel_prevents_fire() {
        let mut wheel: Wheel<u32> = Wheel::new(Duration::from_millis(5), 16);
        let t = wheel.insert(Duration::from_millis(10), 7);
        assert_eq!(wheel.cancel(t), Some(7));
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(wheel.poll(), None);
    }

    #[test]
    fn multiple_timeouts_fire_in_order() {
        let mut wheel: Wheel<u32> = Wheel::new(Duration::from_millis(5), 16);
        wheel.insert(Duration::from_millis(10), 1);
        wheel.insert(Duration::from_millis(20), 2);
        std::thread::sleep(Duration::from_millis(40));
        let mut seen = vec![];
        while let Some(v) = wheel.poll() {
            seen.push(v);
        }
        seen.sort();
        assert_eq!(seen, vec![1, 2]);
    }
}
