use crate::generator::{WatermarkGenerator, WatermarkStrategy};
use bincode::{Decode, Encode};
use riffle_types::{to_millis, PartitionId, Result, Watermark, WatermarkError};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Encode, Decode)]
pub enum PartitionStatus {
    NotStarted,
    Active,
    Idle,
    Closed,
}

/// When a silent partition stops counting towards the watermark, and how
/// much fresh data it takes to count again.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IdlenessConfig {
    idle_timeout: Duration,
    reactivation_threshold: u32,
}

impl IdlenessConfig {
    pub fn try_new(idle_timeout: Duration, reactivation_threshold: u32) -> Result<Self> {
        if idle_timeout.is_zero() {
            return Err(WatermarkError::config(
                "idle-timeout",
                "idle timeout must be positive",
            ));
        }

        if reactivation_threshold == 0 {
            return Err(WatermarkError::config(
                "reactivation-threshold",
                "at least one event is required to reactivate a partition",
            ));
        }

        Ok(Self {
            idle_timeout,
            reactivation_threshold,
        })
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn reactivation_threshold(&self) -> u32 {
        self.reactivation_threshold
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PartitionState {
    pub partition_id: PartitionId,
    pub max_observed_timestamp: Option<SystemTime>,
    pub current: Option<SystemTime>,
    pub last_event_wall_clock: SystemTime,
    pub status: PartitionStatus,
    pub fresh_events: u32,
}

impl PartitionState {
    pub fn is_idle(&self) -> bool {
        self.status == PartitionStatus::Idle
    }

    pub fn is_closed(&self) -> bool {
        self.status == PartitionStatus::Closed
    }
}

/// Watermark progress of one partition (or split) of a source.
#[derive(Debug)]
pub struct PartitionWatermarkTracker {
    partition_id: PartitionId,
    generator: Box<dyn WatermarkGenerator>,
    idleness: IdlenessConfig,
    status: PartitionStatus,
    current: Option<SystemTime>,
    last_event_wall_clock: SystemTime,
    fresh_events: u32,
}

impl PartitionWatermarkTracker {
    pub fn new(
        partition_id: PartitionId,
        strategy: &WatermarkStrategy,
        idleness: IdlenessConfig,
        now: SystemTime,
    ) -> Result<Self> {
        Ok(Self {
            partition_id,
            generator: strategy.create()?,
            idleness,
            status: PartitionStatus::NotStarted,
            current: None,
            last_event_wall_clock: now,
            fresh_events: 0,
        })
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn status(&self) -> PartitionStatus {
        self.status
    }

    pub fn max_observed_timestamp(&self) -> Option<SystemTime> {
        self.generator.max_seen()
    }

    /// Feeds an event. Returns true if this made an idle partition active again.
    pub fn update(&mut self, timestamp: SystemTime, now: SystemTime) -> bool {
        if self.status == PartitionStatus::Closed {
            warn!(
                "ignoring event at {}ms for closed {}",
                to_millis(timestamp),
                self.partition_id
            );
            return false;
        }

        self.generator.on_event(timestamp);
        if let Some(candidate) = self.generator.emit() {
            if self.current.map(|c| candidate > c).unwrap_or(true) {
                self.current = Some(candidate);
            }
        }
        self.last_event_wall_clock = now;

        match self.status {
            PartitionStatus::NotStarted => {
                debug!("{} received its first event", self.partition_id);
                self.status = PartitionStatus::Active;
                false
            }
            PartitionStatus::Idle => {
                self.fresh_events += 1;
                if self.fresh_events >= self.idleness.reactivation_threshold {
                    info!(
                        "{} is active again after {} fresh events",
                        self.partition_id, self.fresh_events
                    );
                    self.status = PartitionStatus::Active;
                    self.fresh_events = 0;
                    true
                } else {
                    false
                }
            }
            PartitionStatus::Active | PartitionStatus::Closed => false,
        }
    }

    /// Checks the idle timeout against the wall clock. Returns true if the
    /// partition just became idle.
    pub fn tick(&mut self, now: SystemTime) -> bool {
        match self.status {
            PartitionStatus::NotStarted | PartitionStatus::Active => {
                if self.silent_for(now) > self.idleness.idle_timeout {
                    info!(
                        "Setting {} to idle after {:?}",
                        self.partition_id, self.idleness.idle_timeout
                    );
                    self.status = PartitionStatus::Idle;
                    self.fresh_events = 0;
                    true
                } else {
                    false
                }
            }
            PartitionStatus::Idle => {
                // reactivation needs consecutive events; a silent gap starts the count over
                if self.fresh_events > 0 && self.silent_for(now) > self.idleness.idle_timeout {
                    debug!(
                        "{} went quiet again after {} fresh events",
                        self.partition_id, self.fresh_events
                    );
                    self.fresh_events = 0;
                }
                false
            }
            PartitionStatus::Closed => false,
        }
    }

    fn silent_for(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_event_wall_clock)
            .unwrap_or(Duration::ZERO)
    }

    /// The partition's contribution to the source watermark: `None` until the
    /// first event, the idle sentinel while idle or closed.
    pub fn estimate(&self) -> Option<Watermark> {
        match self.status {
            PartitionStatus::NotStarted => None,
            PartitionStatus::Active => self.current.map(Watermark::EventTime),
            PartitionStatus::Idle | PartitionStatus::Closed => Some(Watermark::Idle),
        }
    }

    pub fn close(&mut self) {
        if self.status != PartitionStatus::Closed {
            info!("closing {}", self.partition_id);
            self.status = PartitionStatus::Closed;
        }
    }

    pub fn snapshot(&self) -> PartitionState {
        PartitionState {
            partition_id: self.partition_id,
            max_observed_timestamp: self.generator.max_seen(),
            current: self.current,
            last_event_wall_clock: self.last_event_wall_clock,
            status: self.status,
            fresh_events: self.fresh_events,
        }
    }

    pub fn restore(
        state: PartitionState,
        strategy: &WatermarkStrategy,
        idleness: IdlenessConfig,
    ) -> Result<Self> {
        let mut generator = strategy.create()?;
        generator.restore(state.max_observed_timestamp);

        Ok(Self {
            partition_id: state.partition_id,
            generator,
            idleness,
            status: state.status,
            current: state.current,
            last_event_wall_clock: state.last_event_wall_clock,
            fresh_events: state.fresh_events,
        })
    }
}
