use crate::emitter::WatermarkEmitter;
use crate::merger::{InputEdgeState, MergerSnapshot, WatermarkMerger};
use bincode::{Decode, Encode};
use riffle_state::{Timer, TimerContext, TimerService, TimerSnapshot};
use riffle_types::{end_of_time, CallbackId, EdgeId, EventDisposition, Key, Result, Watermark};
use std::time::{Duration, SystemTime};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct OperatorSnapshot<K: Key> {
    pub edges: Vec<InputEdgeState>,
    pub output: WatermarkEmitter,
    pub timers: TimerSnapshot<K>,
}

/// What happened when a watermark arrived on one input edge.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct WatermarkAdvance {
    /// The watermark to forward downstream, if it moved.
    pub forward: Option<Watermark>,
    pub timers_fired: usize,
}

/// Where operator logic schedules and cancels its timers. Implemented both by
/// the operator state and by the context handed to firing timers.
pub trait TimerRegistry<K: Key> {
    fn register_timer(
        &mut self,
        fire_time: SystemTime,
        key: K,
        callback_id: CallbackId,
    ) -> Option<Timer<K>>;

    fn cancel_timer(&mut self, key: &K) -> Option<Timer<K>>;
}

impl<K: Key> TimerRegistry<K> for TimerContext<'_, K> {
    fn register_timer(
        &mut self,
        fire_time: SystemTime,
        key: K,
        callback_id: CallbackId,
    ) -> Option<Timer<K>> {
        self.register(fire_time, key, callback_id)
    }

    fn cancel_timer(&mut self, key: &K) -> Option<Timer<K>> {
        self.cancel(key)
    }
}

impl<K: Key> TimerRegistry<K> for OperatorWatermarkState<K> {
    fn register_timer(
        &mut self,
        fire_time: SystemTime,
        key: K,
        callback_id: CallbackId,
    ) -> Option<Timer<K>> {
        self.timers.register(fire_time, key, callback_id)
    }

    fn cancel_timer(&mut self, key: &K) -> Option<Timer<K>> {
        self.timers.cancel(key)
    }
}

/// The watermark side of one operator instance: the merge over its input
/// edges and the timers waiting on the result.
#[derive(Debug)]
pub struct OperatorWatermarkState<K: Key> {
    merger: WatermarkMerger,
    timers: TimerService<K>,
    allowed_lateness: Duration,
}

impl<K: Key> OperatorWatermarkState<K> {
    pub fn new(inputs: usize, allowed_lateness: Duration) -> Self {
        Self {
            merger: WatermarkMerger::new(inputs),
            timers: TimerService::new(),
            allowed_lateness,
        }
    }

    /// Merges a watermark from `edge`. If the operator watermark advances to a
    /// new event time, every timer at or below it fires through `on_timer`
    /// before this returns, so timer output always precedes the forwarded
    /// watermark.
    pub fn on_watermark<F>(
        &mut self,
        edge: EdgeId,
        watermark: Watermark,
        on_timer: F,
    ) -> Result<WatermarkAdvance>
    where
        F: FnMut(Timer<K>, &mut TimerContext<'_, K>),
    {
        let forward = self.merger.on_watermark_message(edge, watermark)?;
        Ok(self.fire(forward, on_timer))
    }

    /// Removes an edge that has finished; see [`WatermarkMerger::close_edge`].
    pub fn close_edge<F>(&mut self, edge: EdgeId, on_timer: F) -> Result<WatermarkAdvance>
    where
        F: FnMut(Timer<K>, &mut TimerContext<'_, K>),
    {
        let forward = self.merger.close_edge(edge)?;
        Ok(self.fire(forward, on_timer))
    }

    fn fire<F>(&mut self, forward: Option<Watermark>, on_timer: F) -> WatermarkAdvance
    where
        F: FnMut(Timer<K>, &mut TimerContext<'_, K>),
    {
        let timers_fired = match forward {
            Some(Watermark::EventTime(t)) => self.timers.advance(t, on_timer),
            _ => 0,
        };

        if timers_fired > 0 {
            debug!("fired {} timers for watermark {:?}", timers_fired, forward);
        }

        WatermarkAdvance {
            forward,
            timers_fired,
        }
    }

    /// Fires every pending timer regardless of fire time. Used once all
    /// inputs have reached end of data and event time is complete.
    pub fn fire_all_timers<F>(&mut self, on_timer: F) -> usize
    where
        F: FnMut(Timer<K>, &mut TimerContext<'_, K>),
    {
        self.timers.advance(end_of_time(), on_timer)
    }

    pub fn register_timer(
        &mut self,
        fire_time: SystemTime,
        key: K,
        callback_id: CallbackId,
    ) -> Option<Timer<K>> {
        self.timers.register(fire_time, key, callback_id)
    }

    pub fn cancel_timer(&mut self, key: &K) -> Option<Timer<K>> {
        self.timers.cancel(key)
    }

    /// Classifies a record against the last event-time watermark this
    /// operator forwarded.
    pub fn classify(&self, timestamp: SystemTime) -> EventDisposition {
        EventDisposition::classify(
            timestamp,
            self.merger.last_present_watermark(),
            self.allowed_lateness,
        )
    }

    pub fn watermark(&self) -> Option<Watermark> {
        self.merger.watermark()
    }

    pub fn last_present_watermark(&self) -> Option<SystemTime> {
        self.merger.last_present_watermark()
    }

    pub fn merger(&self) -> &WatermarkMerger {
        &self.merger
    }

    pub fn timers(&self) -> &TimerService<K> {
        &self.timers
    }

    pub fn all_inputs_closed(&self) -> bool {
        self.merger.all_closed()
    }

    pub fn snapshot(&self) -> OperatorSnapshot<K> {
        let MergerSnapshot { edges, output } = self.merger.snapshot();
        OperatorSnapshot {
            edges,
            output,
            timers: self.timers.snapshot(),
        }
    }

    pub fn restore(&mut self, snapshot: OperatorSnapshot<K>) -> Result<()> {
        self.merger.restore(MergerSnapshot {
            edges: snapshot.edges,
            output: snapshot.output,
        })?;
        self.timers = TimerService::restore(snapshot.timers);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riffle_types::{from_millis, to_millis};

    fn wm(ms: u64) -> Watermark {
        Watermark::EventTime(from_millis(ms))
    }

    fn state() -> OperatorWatermarkState<String> {
        OperatorWatermarkState::new(2, Duration::from_millis(10))
    }

    #[test]
    fn test_timers_fire_on_merged_watermark() {
        let mut s = state();
        for (t, k) in [(5, "a"), (10, "b"), (10, "c"), (20, "d")] {
            s.register_timer(from_millis(t), k.to_string(), CallbackId(0));
        }

        let mut fired = vec![];
        let advance = s
            .on_watermark(EdgeId(0), wm(15), |t, _| fired.push(t.key))
            .unwrap();
        // edge 1 hasn't reported yet
        assert_eq!(advance, WatermarkAdvance::default());
        assert!(fired.is_empty());

        let advance = s
            .on_watermark(EdgeId(1), wm(10), |t, _| fired.push(t.key))
            .unwrap();
        assert_eq!(advance.forward, Some(wm(10)));
        assert_eq!(advance.timers_fired, 3);
        assert_eq!(fired, vec!["a", "b", "c"]);
        assert_eq!(s.timers().len(), 1);
    }

    #[test]
    fn test_idle_does_not_fire_timers() {
        let mut s = state();
        s.register_timer(from_millis(1), "a".to_string(), CallbackId(0));

        s.on_watermark(EdgeId(0), Watermark::Idle, |_, _| panic!("fired"))
            .unwrap();
        let advance = s
            .on_watermark(EdgeId(1), Watermark::Idle, |_, _| panic!("fired"))
            .unwrap();

        assert_eq!(advance.forward, Some(Watermark::Idle));
        assert_eq!(s.timers().len(), 1);
    }

    #[test]
    fn test_callbacks_can_schedule_follow_ups() {
        let mut s = state();
        s.register_timer(from_millis(5), "window".to_string(), CallbackId(1));

        let mut fired = vec![];
        s.on_watermark(EdgeId(0), wm(100), |_, _| {}).unwrap();
        s.on_watermark(EdgeId(1), wm(100), |t, ctx| {
            if t.callback_id == CallbackId(1) {
                // cleanup after the allowed lateness
                ctx.register(
                    t.fire_time + Duration::from_millis(10),
                    format!("{}-cleanup", t.key),
                    CallbackId(2),
                );
            }
            fired.push((to_millis(t.fire_time), t.key));
        })
        .unwrap();

        assert_eq!(
            fired,
            vec![(5, "window".to_string()), (15, "window-cleanup".to_string())]
        );
    }

    #[test]
    fn test_classify_against_forwarded_watermark() {
        let mut s = state();
        assert_eq!(s.classify(from_millis(1)), EventDisposition::OnTime);

        s.on_watermark(EdgeId(0), wm(100), |_, _| {}).unwrap();
        s.on_watermark(EdgeId(1), wm(100), |_, _| {}).unwrap();

        assert_eq!(
            s.classify(from_millis(95)),
            EventDisposition::Late {
                watermark: from_millis(100),
                within_allowed_lateness: true
            }
        );
        assert!(s.classify(from_millis(50)).is_late());

        // still classified against the last event time while idle
        s.on_watermark(EdgeId(0), Watermark::Idle, |_, _| {}).unwrap();
        s.on_watermark(EdgeId(1), Watermark::Idle, |_, _| {}).unwrap();
        assert!(s.classify(from_millis(50)).is_late());
    }

    #[test]
    fn test_closing_edges_fires_timers() {
        let mut s = state();
        s.register_timer(from_millis(30), "a".to_string(), CallbackId(0));
        s.on_watermark(EdgeId(0), wm(50), |_, _| {}).unwrap();

        let advance = s.close_edge(EdgeId(1), |_, _| {}).unwrap();
        assert_eq!(advance.forward, Some(wm(50)));
        assert_eq!(advance.timers_fired, 1);
        assert!(!s.all_inputs_closed());
    }

    #[test]
    fn test_restore_fidelity() {
        let mut s = state();
        s.register_timer(from_millis(30), "a".to_string(), CallbackId(0));
        s.register_timer(from_millis(60), "b".to_string(), CallbackId(0));
        s.on_watermark(EdgeId(0), wm(40), |_, _| {}).unwrap();
        s.on_watermark(EdgeId(1), Watermark::Idle, |_, _| {})
            .unwrap();

        let bytes = riffle_state::encode_snapshot(&s.snapshot()).unwrap();

        let mut restored = state();
        restored
            .restore(riffle_state::decode_snapshot(&bytes).unwrap())
            .unwrap();

        assert_eq!(restored.watermark(), Some(wm(40)));
        assert_eq!(restored.snapshot(), s.snapshot());
        assert_eq!(
            restored
                .timers()
                .pending()
                .iter()
                .map(|t| t.key.as_str())
                .collect::<Vec<_>>(),
            vec!["b"]
        );
    }
}
