use crate::emitter::WatermarkEmitter;
use crate::generator::WatermarkStrategy;
use crate::tracker::{IdlenessConfig, PartitionState, PartitionStatus, PartitionWatermarkTracker};
use bincode::{Decode, Encode};
use riffle_server_common::config::WatermarkConfig;
use riffle_types::{EventDisposition, PartitionId, Result, Watermark, WatermarkError};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SourceSnapshot {
    pub partitions: Vec<PartitionState>,
    pub output: WatermarkEmitter,
}

/// Merges the partition trackers of one source instance into the single
/// watermark that instance forwards downstream.
#[derive(Debug)]
pub struct SourceWatermarkAggregator {
    strategy: WatermarkStrategy,
    idleness: IdlenessConfig,
    allowed_lateness: Duration,
    trackers: BTreeMap<PartitionId, PartitionWatermarkTracker>,
    output: WatermarkEmitter,
}

impl SourceWatermarkAggregator {
    pub fn new(
        strategy: WatermarkStrategy,
        idleness: IdlenessConfig,
        allowed_lateness: Duration,
    ) -> Result<Self> {
        // fail on a bad strategy now rather than on first assignment
        strategy.create()?;

        Ok(Self {
            strategy,
            idleness,
            allowed_lateness,
            trackers: BTreeMap::new(),
            output: WatermarkEmitter::default(),
        })
    }

    pub fn from_config(config: &WatermarkConfig) -> Result<Self> {
        config.validate()?;
        Self::new(
            crate::strategy_from_config(config)?,
            IdlenessConfig::try_new(*config.idle_timeout, config.reactivation_threshold)?,
            *config.allowed_lateness,
        )
    }

    /// Starts tracking a partition. Re-assigning a closed partition starts it
    /// over; re-assigning a live one is a no-op.
    pub fn assign(&mut self, partition: PartitionId, now: SystemTime) -> Result<()> {
        if let Some(existing) = self.trackers.get(&partition) {
            if existing.status() != PartitionStatus::Closed {
                warn!("{} is already assigned", partition);
                return Ok(());
            }
        }

        info!("assigned {}", partition);
        self.trackers.insert(
            partition,
            PartitionWatermarkTracker::new(partition, &self.strategy, self.idleness, now)?,
        );
        Ok(())
    }

    /// Marks a partition closed and recomputes immediately, so a revoked split
    /// never holds the watermark back.
    pub fn close(&mut self, partition: PartitionId) -> Result<Option<Watermark>> {
        self.trackers
            .get_mut(&partition)
            .ok_or(WatermarkError::UnknownPartition(partition))?
            .close();

        Ok(self.compute_watermark())
    }

    /// Records an event and reports whether it is behind the watermark already
    /// forwarded by this source.
    pub fn on_event(
        &mut self,
        partition: PartitionId,
        timestamp: SystemTime,
        now: SystemTime,
    ) -> Result<EventDisposition> {
        let disposition = EventDisposition::classify(
            timestamp,
            self.output.last_event_time(),
            self.allowed_lateness,
        );

        self.trackers
            .get_mut(&partition)
            .ok_or(WatermarkError::UnknownPartition(partition))?
            .update(timestamp, now);

        Ok(disposition)
    }

    /// Runs idle detection on every partition; returns how many just went idle.
    pub fn tick(&mut self, now: SystemTime) -> usize {
        self.trackers
            .values_mut()
            .map(|t| t.tick(now))
            .filter(|idle| *idle)
            .count()
    }

    /// Recomputes the source watermark and returns it if it should be
    /// forwarded downstream.
    pub fn compute_watermark(&mut self) -> Option<Watermark> {
        let candidate = self
            .trackers
            .values()
            .filter(|t| t.status() != PartitionStatus::Closed)
            .map(|t| t.estimate())
            .fold(Some(Watermark::Idle), |current, next| {
                Some(current?.min(next?))
            })?;

        let emitted = self.output.offer(candidate);
        if let Some(watermark) = emitted {
            debug!("source emitting watermark {}", watermark);
        }
        emitted
    }

    pub fn current_watermark(&self) -> Option<Watermark> {
        self.output.current()
    }

    pub fn partition(&self, partition: PartitionId) -> Option<&PartitionWatermarkTracker> {
        self.trackers.get(&partition)
    }

    pub fn partitions(&self) -> impl Iterator<Item = &PartitionWatermarkTracker> {
        self.trackers.values()
    }

    /// Partitions currently excluded from the minimum.
    pub fn excluded_partitions(&self) -> usize {
        self.trackers
            .values()
            .filter(|t| {
                matches!(
                    t.status(),
                    PartitionStatus::Idle | PartitionStatus::Closed
                )
            })
            .count()
    }

    /// True once every partition has been closed (and at least one existed).
    pub fn all_closed(&self) -> bool {
        !self.trackers.is_empty()
            && self
                .trackers
                .values()
                .all(|t| t.status() == PartitionStatus::Closed)
    }

    pub fn snapshot(&self) -> SourceSnapshot {
        SourceSnapshot {
            partitions: self.trackers.values().map(|t| t.snapshot()).collect(),
            output: self.output,
        }
    }

    /// Reinstates checkpointed state. A source that already has partitions
    /// assigned must have exactly the checkpointed set.
    pub fn restore(&mut self, snapshot: SourceSnapshot) -> Result<()> {
        let current: Vec<PartitionId> = self.trackers.keys().copied().collect();
        let mut restored: Vec<PartitionId> =
            snapshot.partitions.iter().map(|p| p.partition_id).collect();
        restored.sort();

        if !current.is_empty() && current != restored {
            return Err(WatermarkError::RestoreMismatch {
                kind: "partition",
                expected: current.iter().map(|p| p.to_string()).collect(),
                found: restored.iter().map(|p| p.to_string()).collect(),
            });
        }

        let mut trackers = BTreeMap::new();
        for state in snapshot.partitions {
            trackers.insert(
                state.partition_id,
                PartitionWatermarkTracker::restore(state, &self.strategy, self.idleness)?,
            );
        }

        info!(
            "restored {} partitions with watermark {:?}",
            trackers.len(),
            snapshot.output.current()
        );
        self.trackers = trackers;
        self.output.restore(snapshot.output);
        Ok(())
    }
}
