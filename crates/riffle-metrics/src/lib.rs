use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec, IntGauge, Opts,
};
use riffle_types::{to_millis, TaskInfo, Watermark};

pub const CURRENT_WATERMARK: &str = "riffle_worker_current_watermark";
pub const IDLE_PARTITIONS: &str = "riffle_worker_idle_partitions";
pub const PENDING_TIMERS: &str = "riffle_worker_pending_timers";
pub const LATE_EVENTS: &str = "riffle_worker_late_events";
pub const TIMERS_FIRED: &str = "riffle_worker_timers_fired";
pub const WATERMARKS_EMITTED: &str = "riffle_worker_watermarks_emitted";

pub fn gauge_for_task(
    task_info: &TaskInfo,
    name: &'static str,
    help: &'static str,
    mut labels: HashMap<String, String>,
) -> Option<IntGauge> {
    let mut opts = Opts::new(name, help);
    labels.extend(task_info.metric_label_map());

    opts.const_labels = labels;

    register_int_gauge!(opts).ok()
}

lazy_static! {
    pub static ref TASK_METRIC_LABELS: Vec<&'static str> =
        vec!["operator_id", "subtask_idx", "operator_name"];
    pub static ref LATE_EVENTS_COUNTER: IntCounterVec = register_int_counter_vec!(
        LATE_EVENTS,
        "Count of events that arrived behind the current watermark",
        &TASK_METRIC_LABELS
    )
    .unwrap();
    pub static ref TIMERS_FIRED_COUNTER: IntCounterVec = register_int_counter_vec!(
        TIMERS_FIRED,
        "Count of timers fired by watermark advancement",
        &TASK_METRIC_LABELS
    )
    .unwrap();
    pub static ref WATERMARKS_EMITTED_COUNTER: IntCounterVec = register_int_counter_vec!(
        WATERMARKS_EMITTED,
        "Count of watermarks forwarded downstream",
        &TASK_METRIC_LABELS
    )
    .unwrap();
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum TaskCounters {
    LateEvents,
    TimersFired,
    WatermarksEmitted,
}

impl TaskCounters {
    fn metric(&self) -> &'static IntCounterVec {
        match self {
            TaskCounters::LateEvents => &LATE_EVENTS_COUNTER,
            TaskCounters::TimersFired => &TIMERS_FIRED_COUNTER,
            TaskCounters::WatermarksEmitted => &WATERMARKS_EMITTED_COUNTER,
        }
    }

    #[allow(clippy::type_complexity)]
    pub fn for_task<F>(&self, task_info: &Arc<TaskInfo>, f: F)
    where
        F: Fn(&IntCounter),
    {
        static CACHE: OnceLock<RwLock<HashMap<(TaskCounters, Arc<TaskInfo>), IntCounter>>> =
            OnceLock::new();
        let cache = CACHE.get_or_init(|| RwLock::new(HashMap::new()));

        if let Ok(cache) = cache.read() {
            if let Some(counter) = cache.get(&(*self, Arc::clone(task_info))) {
                f(counter);
                return;
            }
        }

        let counter = self.metric().with_label_values(&[
            &task_info.operator_id,
            &task_info.task_index.to_string(),
            &task_info.operator_name,
        ]);

        f(&counter);

        if let Ok(mut cache) = cache.write() {
            cache.insert((*self, Arc::clone(task_info)), counter);
        }
    }
}

/// Per-task gauges describing watermark progress. Any gauge that fails to
/// register (e.g. a duplicate task in tests) is simply not reported.
#[derive(Debug, Default)]
pub struct WatermarkGauges {
    current_watermark: Option<IntGauge>,
    idle_partitions: Option<IntGauge>,
    pending_timers: Option<IntGauge>,
}

impl WatermarkGauges {
    pub fn register(task_info: &TaskInfo) -> Self {
        Self {
            current_watermark: gauge_for_task(
                task_info,
                CURRENT_WATERMARK,
                "Current event-time watermark in millis (-1 while idle)",
                HashMap::new(),
            ),
            idle_partitions: gauge_for_task(
                task_info,
                IDLE_PARTITIONS,
                "Number of idle or closed partitions excluded from the watermark",
                HashMap::new(),
            ),
            pending_timers: gauge_for_task(
                task_info,
                PENDING_TIMERS,
                "Number of timers waiting for the watermark",
                HashMap::new(),
            ),
        }
    }

    pub fn set_watermark(&self, watermark: Watermark) {
        if let Some(g) = &self.current_watermark {
            g.set(match watermark {
                Watermark::EventTime(t) => to_millis(t) as i64,
                Watermark::Idle => -1,
            });
        }
    }

    pub fn set_idle_partitions(&self, n: usize) {
        if let Some(g) = &self.idle_partitions {
            g.set(n as i64);
        }
    }

    pub fn set_pending_timers(&self, n: usize) {
        if let Some(g) = &self.pending_timers {
            g.set(n as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_cached_per_task() {
        let task_info = Arc::new(TaskInfo::for_test("job", "metrics-counter-test"));
        TaskCounters::LateEvents.for_task(&task_info, |c| c.inc());
        TaskCounters::LateEvents.for_task(&task_info, |c| c.inc_by(2));

        let value = std::cell::Cell::new(0);
        TaskCounters::LateEvents.for_task(&task_info, |c| value.set(c.get()));
        assert_eq!(value.get(), 3);
    }

    #[test]
    fn test_duplicate_gauges_are_tolerated() {
        let task_info = TaskInfo::for_test("job", "metrics-gauge-test");
        let first = WatermarkGauges::register(&task_info);
        let second = WatermarkGauges::register(&task_info);

        assert!(first.current_watermark.is_some());
        assert!(second.current_watermark.is_none());
        second.set_watermark(Watermark::Idle);
        first.set_watermark(Watermark::Idle);
        assert_eq!(first.current_watermark.as_ref().map(|g| g.get()), Some(-1));
    }
}
