use riffle_types::{saturating_sub, Result, WatermarkError};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Gap kept between the newest event and the watermark of a monotonic stream.
pub const MONOTONIC_EPSILON: Duration = Duration::from_millis(1);

/// Turns observed event timestamps into a candidate watermark.
///
/// Generators only ever look at the running maximum: a timestamp below it is
/// absorbed without effect.
pub trait WatermarkGenerator: Debug + Send {
    fn on_event(&mut self, timestamp: SystemTime);

    /// The candidate watermark, or `None` before the first event.
    fn emit(&self) -> Option<SystemTime>;

    fn max_seen(&self) -> Option<SystemTime>;

    fn restore(&mut self, max_seen: Option<SystemTime>);
}

#[derive(Debug, Default, Clone, Copy)]
struct MaxTracker {
    max: Option<SystemTime>,
}

impl MaxTracker {
    fn observe(&mut self, timestamp: SystemTime) {
        if self.max.map(|m| timestamp > m).unwrap_or(true) {
            self.max = Some(timestamp);
        }
    }
}

#[derive(Debug, Clone)]
pub struct BoundedOutOfOrderness {
    delay: Duration,
    seen: MaxTracker,
}

impl BoundedOutOfOrderness {
    pub fn try_new(delay: Duration) -> Result<Self> {
        if delay.is_zero() {
            return Err(WatermarkError::config(
                "max-out-of-orderness",
                "delay must be positive",
            ));
        }

        Ok(Self {
            delay,
            seen: MaxTracker::default(),
        })
    }
}

impl WatermarkGenerator for BoundedOutOfOrderness {
    fn on_event(&mut self, timestamp: SystemTime) {
        self.seen.observe(timestamp);
    }

    fn emit(&self) -> Option<SystemTime> {
        self.seen.max.map(|m| saturating_sub(m, self.delay))
    }

    fn max_seen(&self) -> Option<SystemTime> {
        self.seen.max
    }

    fn restore(&mut self, max_seen: Option<SystemTime>) {
        self.seen.max = max_seen;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Monotonic {
    seen: MaxTracker,
}

impl WatermarkGenerator for Monotonic {
    fn on_event(&mut self, timestamp: SystemTime) {
        self.seen.observe(timestamp);
    }

    fn emit(&self) -> Option<SystemTime> {
        self.seen.max.map(|m| saturating_sub(m, MONOTONIC_EPSILON))
    }

    fn max_seen(&self) -> Option<SystemTime> {
        self.seen.max
    }

    fn restore(&mut self, max_seen: Option<SystemTime>) {
        self.seen.max = max_seen;
    }
}

pub type WatermarkFn = Arc<dyn Fn(SystemTime) -> SystemTime + Send + Sync>;

/// Applies a caller-supplied pure function to the running maximum.
pub struct Custom {
    function: WatermarkFn,
    seen: MaxTracker,
}

impl Debug for Custom {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Custom")
            .field("max_seen", &self.seen.max)
            .finish()
    }
}

impl WatermarkGenerator for Custom {
    fn on_event(&mut self, timestamp: SystemTime) {
        self.seen.observe(timestamp);
    }

    fn emit(&self) -> Option<SystemTime> {
        self.seen.max.map(|m| (self.function)(m))
    }

    fn max_seen(&self) -> Option<SystemTime> {
        self.seen.max
    }

    fn restore(&mut self, max_seen: Option<SystemTime>) {
        self.seen.max = max_seen;
    }
}

/// A cloneable recipe for building one generator per partition.
#[derive(Clone)]
pub enum WatermarkStrategy {
    BoundedOutOfOrderness(Duration),
    Monotonic,
    Custom(WatermarkFn),
}

impl Debug for WatermarkStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WatermarkStrategy::BoundedOutOfOrderness(d) => {
                f.debug_tuple("BoundedOutOfOrderness").field(d).finish()
            }
            WatermarkStrategy::Monotonic => f.write_str("Monotonic"),
            WatermarkStrategy::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl WatermarkStrategy {
    pub fn bounded(delay: Duration) -> Result<Self> {
        BoundedOutOfOrderness::try_new(delay)?;
        Ok(WatermarkStrategy::BoundedOutOfOrderness(delay))
    }

    pub fn custom(function: impl Fn(SystemTime) -> SystemTime + Send + Sync + 'static) -> Self {
        WatermarkStrategy::Custom(Arc::new(function))
    }

    pub fn create(&self) -> Result<Box<dyn WatermarkGenerator>> {
        Ok(match self {
            WatermarkStrategy::BoundedOutOfOrderness(delay) => {
                Box::new(BoundedOutOfOrderness::try_new(*delay)?)
            }
            WatermarkStrategy::Monotonic => Box::<Monotonic>::default(),
            WatermarkStrategy::Custom(function) => Box::new(Custom {
                function: Arc::clone(function),
                seen: MaxTracker::default(),
            }),
        })
    }
}
