use bincode::{Decode, Encode};
use riffle_types::{to_millis, CallbackId, Key};
use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;
use tracing::{debug, trace};

#[derive(Encode, Decode, Clone, Debug, PartialEq, Eq)]
pub struct Timer<K: Key> {
    pub fire_time: SystemTime,
    pub key: K,
    pub callback_id: CallbackId,
}

/// Pending timers of one operator instance, ordered by fire time and then by
/// registration order.
///
/// A key identifies at most one pending timer; registering an already-pending
/// key moves it to the new fire time.
#[derive(Debug, Clone)]
pub struct TimerService<K: Key> {
    pending: BTreeMap<(SystemTime, u64), Timer<K>>,
    index: HashMap<K, (SystemTime, u64)>,
    next_seq: u64,
    watermark: Option<SystemTime>,
}

impl<K: Key> Default for TimerService<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> TimerService<K> {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
            watermark: None,
        }
    }

    /// Schedules `key` to fire once the watermark reaches `fire_time`. Returns
    /// the timer this replaced, if the key was already pending.
    pub fn register(
        &mut self,
        fire_time: SystemTime,
        key: K,
        callback_id: CallbackId,
    ) -> Option<Timer<K>> {
        let replaced = self.cancel(&key);

        if let Some(watermark) = self.watermark {
            if fire_time <= watermark {
                debug!(
                    "timer for {:?} registered at {}ms, behind watermark {}ms; fires on next advance",
                    key,
                    to_millis(fire_time),
                    to_millis(watermark)
                );
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        self.index.insert(key.clone(), (fire_time, seq));
        self.pending.insert(
            (fire_time, seq),
            Timer {
                fire_time,
                key,
                callback_id,
            },
        );

        replaced
    }

    /// Removes the pending timer for `key`; a no-op if it already fired or was
    /// never registered.
    pub fn cancel(&mut self, key: &K) -> Option<Timer<K>> {
        let slot = self.index.remove(key)?;
        self.pending.remove(&slot)
    }

    /// Fires, in ascending fire-time order, every pending timer at or below
    /// `watermark`. Timers registered by `on_timer` that are themselves due
    /// fire within the same call. Returns the number of timers fired.
    pub fn advance<F>(&mut self, watermark: SystemTime, mut on_timer: F) -> usize
    where
        F: FnMut(Timer<K>, &mut TimerContext<'_, K>),
    {
        if self.watermark.map(|w| watermark > w).unwrap_or(true) {
            self.watermark = Some(watermark);
        }

        let mut fired = 0;
        while let Some(timer) = self.pop_due(watermark) {
            trace!(
                "firing timer {:?} at {}ms for watermark {}ms",
                timer.key,
                to_millis(timer.fire_time),
                to_millis(watermark)
            );
            fired += 1;
            on_timer(timer, &mut TimerContext { timers: &mut *self });
        }

        fired
    }

    fn pop_due(&mut self, watermark: SystemTime) -> Option<Timer<K>> {
        let entry = self.pending.first_entry()?;
        if entry.key().0 > watermark {
            return None;
        }

        let timer = entry.remove();
        self.index.remove(&timer.key);
        Some(timer)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn next_fire_time(&self) -> Option<SystemTime> {
        self.pending.keys().next().map(|(t, _)| *t)
    }

    pub fn get(&self, key: &K) -> Option<&Timer<K>> {
        self.index.get(key).and_then(|slot| self.pending.get(slot))
    }

    /// Pending timers in firing order.
    pub fn pending(&self) -> Vec<&Timer<K>> {
        self.pending.values().collect()
    }

    pub fn snapshot(&self) -> TimerSnapshot<K> {
        TimerSnapshot {
            timers: self
                .pending
                .iter()
                .map(|((_, seq), timer)| (*seq, timer.clone()))
                .collect(),
            next_seq: self.next_seq,
            watermark: self.watermark,
        }
    }

    pub fn restore(snapshot: TimerSnapshot<K>) -> Self {
        let mut pending = BTreeMap::new();
        let mut index = HashMap::new();

        for (seq, timer) in snapshot.timers {
            index.insert(timer.key.clone(), (timer.fire_time, seq));
            pending.insert((timer.fire_time, seq), timer);
        }

        Self {
            pending,
            index,
            next_seq: snapshot.next_seq,
            watermark: snapshot.watermark,
        }
    }
}

/// The view of the timer service available to a firing callback. It can
/// schedule and cancel timers but cannot advance the watermark.
pub struct TimerContext<'a, K: Key> {
    timers: &'a mut TimerService<K>,
}

impl<'a, K: Key> TimerContext<'a, K> {
    pub fn register(
        &mut self,
        fire_time: SystemTime,
        key: K,
        callback_id: CallbackId,
    ) -> Option<Timer<K>> {
        self.timers.register(fire_time, key, callback_id)
    }

    pub fn cancel(&mut self, key: &K) -> Option<Timer<K>> {
        self.timers.cancel(key)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[derive(Encode, Decode, Clone, Debug, PartialEq, Eq)]
pub struct TimerSnapshot<K: Key> {
    timers: Vec<(u64, Timer<K>)>,
    next_seq: u64,
    watermark: Option<SystemTime>,
}
