use bincode::{Decode, Encode};
use riffle_types::Watermark;
use std::time::SystemTime;

/// Suppresses non-advancing watermarks on an output channel.
///
/// Event-time values are only forwarded when strictly greater than the last
/// one forwarded. `Idle` is forwarded once per idle period. Leaving an idle
/// period re-announces an event time no lower than the last one forwarded, so
/// downstream merges start counting this channel again.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Encode, Decode)]
pub struct WatermarkEmitter {
    last_emitted: Option<Watermark>,
    last_event_time: Option<SystemTime>,
}

impl WatermarkEmitter {
    pub fn offer(&mut self, candidate: Watermark) -> Option<Watermark> {
        match candidate {
            Watermark::Idle => {
                if self.last_emitted == Some(Watermark::Idle) {
                    return None;
                }
                self.last_emitted = Some(Watermark::Idle);
                Some(Watermark::Idle)
            }
            Watermark::EventTime(t) => {
                let resuming = self.last_emitted == Some(Watermark::Idle);
                let t = match self.last_event_time {
                    Some(last) if t <= last => {
                        if !resuming {
                            return None;
                        }
                        last
                    }
                    _ => t,
                };

                self.last_event_time = Some(t);
                self.last_emitted = Some(Watermark::EventTime(t));
                self.last_emitted
            }
        }
    }

    /// The last value forwarded, idle sentinel included.
    pub fn current(&self) -> Option<Watermark> {
        self.last_emitted
    }

    /// The last event time forwarded, even if the channel is idle now.
    pub fn last_event_time(&self) -> Option<SystemTime> {
        self.last_event_time
    }

    /// Merges a restored emitter into this one without moving backwards.
    pub fn restore(&mut self, restored: WatermarkEmitter) {
        if restored.last_event_time >= self.last_event_time {
            *self = restored;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riffle_types::from_millis;

    fn wm(ms: u64) -> Watermark {
        Watermark::EventTime(from_millis(ms))
    }

    #[test]
    fn test_only_strict_advances_forwarded() {
        let mut e = WatermarkEmitter::default();
        assert_eq!(e.offer(wm(10)), Some(wm(10)));
        assert_eq!(e.offer(wm(10)), None);
        assert_eq!(e.offer(wm(5)), None);
        assert_eq!(e.offer(wm(11)), Some(wm(11)));
        assert_eq!(e.current(), Some(wm(11)));
    }

    #[test]
    fn test_idle_and_resume() {
        let mut e = WatermarkEmitter::default();
        e.offer(wm(20));

        assert_eq!(e.offer(Watermark::Idle), Some(Watermark::Idle));
        assert_eq!(e.offer(Watermark::Idle), None);
        assert_eq!(e.last_event_time(), Some(from_millis(20)));

        // resuming below the last event time re-announces the old value
        assert_eq!(e.offer(wm(15)), Some(wm(20)));
        assert_eq!(e.offer(wm(18)), None);
        assert_eq!(e.offer(wm(25)), Some(wm(25)));
    }

    #[test]
    fn test_idle_from_the_start() {
        let mut e = WatermarkEmitter::default();
        assert_eq!(e.offer(Watermark::Idle), Some(Watermark::Idle));
        assert_eq!(e.offer(wm(3)), Some(wm(3)));
    }

    #[test]
    fn test_restore_never_regresses() {
        let mut newer = WatermarkEmitter::default();
        newer.offer(wm(50));

        let mut older = WatermarkEmitter::default();
        older.offer(wm(30));

        newer.restore(older);
        assert_eq!(newer.current(), Some(wm(50)));

        let mut fresh = WatermarkEmitter::default();
        fresh.restore(newer);
        assert_eq!(fresh.current(), Some(wm(50)));
    }
}
