use bincode::{Decode, Encode};
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::hash::Hash;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod errors;

pub use errors::{Result, WatermarkError};

pub fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

pub fn from_millis(ts: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ts)
}

pub fn from_nanos(ts: u128) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(ts as u64)
}

/// The latest representable event time; every timer is due by then.
pub fn end_of_time() -> SystemTime {
    from_nanos(u64::MAX as u128)
}

/// Subtracts `d` from `t`, saturating at the unix epoch.
pub fn saturating_sub(t: SystemTime, d: Duration) -> SystemTime {
    t.checked_sub(d)
        .filter(|t| *t >= UNIX_EPOCH)
        .unwrap_or(UNIX_EPOCH)
}

pub trait Key: Debug + Clone + Encode + Decode + Hash + PartialEq + Eq + Send + 'static {}
impl<T: Debug + Clone + Encode + Decode + Hash + PartialEq + Eq + Send + 'static> Key for T {}

pub trait Data: Debug + Clone + Send + 'static {}
impl<T: Debug + Clone + Send + 'static> Data for T {}

/// An event-time completeness signal.
///
/// `Idle` sorts above every event time, so it never holds back the minimum
/// taken at a fan-in point; the same `min` merge works at sources and at
/// every downstream operator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub enum Watermark {
    EventTime(SystemTime),
    Idle,
}

impl Watermark {
    pub fn event_time(&self) -> Option<SystemTime> {
        match self {
            Watermark::EventTime(t) => Some(*t),
            Watermark::Idle => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Watermark::Idle)
    }
}

impl Display for Watermark {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Watermark::EventTime(t) => write!(f, "{}ms", to_millis(*t)),
            Watermark::Idle => write!(f, "idle"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct PartitionId(pub u32);

impl Display for PartitionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "partition-{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct EdgeId(pub usize);

impl Display for EdgeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "edge-{}", self.0)
    }
}

/// Identifies which piece of window/state logic a timer belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct CallbackId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct TaskInfo {
    pub job_id: String,
    pub operator_name: String,
    pub operator_id: String,
    pub task_index: usize,
    pub parallelism: usize,
}

impl TaskInfo {
    pub fn for_test(job_id: &str, operator_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            operator_name: "op".to_string(),
            operator_id: operator_id.to_string(),
            task_index: 0,
            parallelism: 1,
        }
    }

    pub fn metric_label_map(&self) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert("operator_id".to_string(), self.operator_id.clone());
        labels.insert("subtask_idx".to_string(), format!("{}", self.task_index));
        labels.insert("operator_name".to_string(), self.operator_name.clone());
        labels
    }
}

impl Display for TaskInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.operator_name, self.task_index)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record<T: Data> {
    pub timestamp: SystemTime,
    pub partition: Option<PartitionId>,
    pub value: T,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Encode, Decode)]
pub enum SignalMessage {
    Watermark(Watermark),
    Stop,
    EndOfData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message<T: Data> {
    Record(Record<T>),
    Signal(SignalMessage),
}

impl<T: Data> Message<T> {
    pub fn is_end(&self) -> bool {
        matches!(
            self,
            Message::Signal(SignalMessage::Stop) | Message::Signal(SignalMessage::EndOfData)
        )
    }
}

/// What a source connector hands to the watermark core.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent<T: Data> {
    Record {
        partition: PartitionId,
        timestamp: SystemTime,
        payload: T,
    },
    Assigned(PartitionId),
    Closed(PartitionId),
}

/// Result of checking an event against the current watermark. Late events are
/// tagged rather than dropped; the caller decides where they go.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventDisposition {
    OnTime,
    Late {
        watermark: SystemTime,
        within_allowed_lateness: bool,
    },
}

impl EventDisposition {
    pub fn classify(
        timestamp: SystemTime,
        watermark: Option<SystemTime>,
        allowed_lateness: Duration,
    ) -> Self {
        match watermark {
            Some(watermark) if timestamp < watermark => EventDisposition::Late {
                watermark,
                within_allowed_lateness: timestamp + allowed_lateness >= watermark,
            },
            _ => EventDisposition::OnTime,
        }
    }

    pub fn is_late(&self) -> bool {
        matches!(self, EventDisposition::Late { .. })
    }
}
