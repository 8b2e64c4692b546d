//! Event-time watermark generation and propagation.
//!
//! Sources track a watermark per partition and merge them into one output
//! per source instance, excluding partitions that have gone idle. Operators
//! merge the watermarks of their input edges the same way and fire timers
//! as their watermark advances. Idleness travels as [`Watermark::Idle`], which
//! sorts above every event time, so every fan-in point is a plain minimum.

use riffle_server_common::config::{StrategyKind, WatermarkConfig};
use riffle_types::Result;

pub mod context;
pub mod emitter;
pub mod engine;
pub mod generator;
pub mod merger;
pub mod operator;
pub mod source;
pub mod tracker;

pub use context::{Collector, ControlChannels, ControlMessage, ControlResp, TaskClock};
pub use emitter::WatermarkEmitter;
pub use engine::{OperatorContext, OperatorTask, SourceTask, WatermarkOperator};
pub use generator::{WatermarkGenerator, WatermarkStrategy, MONOTONIC_EPSILON};
pub use merger::{InputEdgeState, MergerSnapshot, WatermarkMerger};
pub use operator::{OperatorSnapshot, OperatorWatermarkState, TimerRegistry, WatermarkAdvance};
pub use riffle_types::Watermark;
pub use source::{SourceSnapshot, SourceWatermarkAggregator};
pub use tracker::{IdlenessConfig, PartitionState, PartitionStatus, PartitionWatermarkTracker};

pub fn strategy_from_config(config: &WatermarkConfig) -> Result<WatermarkStrategy> {
    match config.strategy {
        StrategyKind::BoundedOutOfOrderness => {
            WatermarkStrategy::bounded(*config.max_out_of_orderness)
        }
        StrategyKind::Monotonic => Ok(WatermarkStrategy::Monotonic),
    }
}
