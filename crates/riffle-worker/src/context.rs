use anyhow::anyhow;
use riffle_types::{Data, Message, Record, TaskInfo, Watermark};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc::{Receiver, Sender};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Checkpoint { epoch: u32 },
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlResp {
    CheckpointCompleted {
        operator_id: String,
        task_index: usize,
        epoch: u32,
        watermark: Option<Watermark>,
        snapshot: Vec<u8>,
    },
    TaskFinished {
        operator_id: String,
        task_index: usize,
    },
    TaskFailed {
        operator_id: String,
        task_index: usize,
        error: String,
    },
}

/// A task's link to the controller.
pub struct ControlChannels {
    pub rx: Receiver<ControlMessage>,
    pub tx: Sender<ControlResp>,
}

impl ControlChannels {
    pub fn new(rx: Receiver<ControlMessage>, tx: Sender<ControlResp>) -> Self {
        Self { rx, tx }
    }

    pub async fn respond(&self, resp: ControlResp) {
        if self.tx.send(resp).await.is_err() {
            warn!("control response dropped; controller has hung up");
        }
    }
}

/// Wall-clock time as seen by a task. It advances with the tokio clock, so
/// idle detection follows `tokio::time::pause` in tests.
#[derive(Debug, Copy, Clone)]
pub struct TaskClock {
    wall: SystemTime,
    start: tokio::time::Instant,
}

impl TaskClock {
    pub fn start() -> Self {
        Self {
            wall: SystemTime::now(),
            start: tokio::time::Instant::now(),
        }
    }

    pub fn now(&self) -> SystemTime {
        self.wall + self.start.elapsed()
    }
}

/// Sends a task's output downstream. Records are spread round-robin over the
/// output queues; signals go to every queue, in the order they were sent.
pub struct Collector<T: Data> {
    task_info: Arc<TaskInfo>,
    out_qs: Vec<Sender<Message<T>>>,
    next: usize,
}

impl<T: Data> Collector<T> {
    pub fn new(task_info: Arc<TaskInfo>, out_qs: Vec<Sender<Message<T>>>) -> Self {
        Self {
            task_info,
            out_qs,
            next: 0,
        }
    }

    pub async fn collect(&mut self, record: Record<T>) -> anyhow::Result<()> {
        if self.out_qs.is_empty() {
            return Ok(());
        }

        let idx = self.next % self.out_qs.len();
        self.next = self.next.wrapping_add(1);

        self.out_qs[idx]
            .send(Message::Record(record))
            .await
            .map_err(|_| anyhow!("output {} of {} is closed", idx, self.task_info))
    }

    pub async fn broadcast(&mut self, message: Message<T>) -> anyhow::Result<()> {
        for (idx, q) in self.out_qs.iter().enumerate() {
            q.send(message.clone())
                .await
                .map_err(|_| anyhow!("output {} of {} is closed", idx, self.task_info))?;
        }
        Ok(())
    }

    pub async fn send(&mut self, message: Message<T>) -> anyhow::Result<()> {
        match message {
            Message::Record(record) => self.collect(record).await,
            signal @ Message::Signal(_) => self.broadcast(signal).await,
        }
    }
}
