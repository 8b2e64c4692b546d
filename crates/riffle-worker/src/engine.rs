use crate::context::{Collector, ControlChannels, ControlMessage, ControlResp, TaskClock};
use crate::operator::{OperatorSnapshot, OperatorWatermarkState, TimerRegistry, WatermarkAdvance};
use crate::source::{SourceSnapshot, SourceWatermarkAggregator};
use crate::tracker::PartitionStatus;
use riffle_metrics::{TaskCounters, WatermarkGauges};
use riffle_server_common::config::WatermarkConfig;
use riffle_state::{decode_snapshot, encode_snapshot, Timer, TimerContext};
use riffle_types::{
    CallbackId, Data, EdgeId, EventDisposition, Key, Message, PartitionId, Record, SignalMessage,
    SourceEvent, TaskInfo, Watermark, WatermarkError,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, error, info, warn};

async fn report_result(
    task_info: &TaskInfo,
    control: &ControlChannels,
    result: &anyhow::Result<()>,
) {
    let resp = match result {
        Ok(()) => {
            info!("task {} finished", task_info);
            ControlResp::TaskFinished {
                operator_id: task_info.operator_id.clone(),
                task_index: task_info.task_index,
            }
        }
        Err(e) => {
            error!("task {} failed: {:?}", task_info, e);
            ControlResp::TaskFailed {
                operator_id: task_info.operator_id.clone(),
                task_index: task_info.task_index,
                error: format!("{:?}", e),
            }
        }
    };

    control.respond(resp).await;
}

/// Drives one source instance: connector events, idle ticks and control
/// messages are all handled from this single task, so partition state has a
/// single writer.
pub struct SourceTask<T: Data> {
    task_info: Arc<TaskInfo>,
    aggregator: SourceWatermarkAggregator,
    tick_interval: Duration,
    events: Receiver<SourceEvent<T>>,
    collector: Collector<T>,
    late_tx: Option<Sender<Record<T>>>,
    control: ControlChannels,
    gauges: WatermarkGauges,
    clock: TaskClock,
}

impl<T: Data> SourceTask<T> {
    pub fn new(
        task_info: Arc<TaskInfo>,
        aggregator: SourceWatermarkAggregator,
        tick_interval: Duration,
        events: Receiver<SourceEvent<T>>,
        out_qs: Vec<Sender<Message<T>>>,
        control: ControlChannels,
    ) -> riffle_types::Result<Self> {
        if tick_interval.is_zero() {
            return Err(WatermarkError::config(
                "tick-interval",
                "tick interval must be positive",
            ));
        }

        Ok(Self {
            gauges: WatermarkGauges::register(&task_info),
            collector: Collector::new(task_info.clone(), out_qs),
            task_info,
            aggregator,
            tick_interval,
            events,
            late_tx: None,
            control,
            clock: TaskClock::start(),
        })
    }

    pub fn from_config(
        task_info: Arc<TaskInfo>,
        config: &WatermarkConfig,
        events: Receiver<SourceEvent<T>>,
        out_qs: Vec<Sender<Message<T>>>,
        control: ControlChannels,
    ) -> riffle_types::Result<Self> {
        Self::new(
            task_info,
            SourceWatermarkAggregator::from_config(config)?,
            *config.tick_interval,
            events,
            out_qs,
            control,
        )
    }

    /// Sends late records here instead of downstream.
    pub fn with_late_output(mut self, late_tx: Sender<Record<T>>) -> Self {
        self.late_tx = Some(late_tx);
        self
    }

    pub fn restore(&mut self, snapshot: &[u8]) -> anyhow::Result<()> {
        let snapshot: SourceSnapshot = decode_snapshot(snapshot)?;
        self.aggregator.restore(snapshot)?;
        Ok(())
    }

    pub fn aggregator(&self) -> &SourceWatermarkAggregator {
        &self.aggregator
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        self.clock = TaskClock::start();
        info!("Running source {}", self.task_info);

        let result = self.run_loop().await;
        report_result(&self.task_info, &self.control, &result).await;
        result
    }

    async fn run_loop(&mut self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(control_message) = self.control.rx.recv() => {
                    match control_message {
                        ControlMessage::Checkpoint { epoch } => self.checkpoint(epoch).await?,
                        ControlMessage::Stop => {
                            info!("stopping source {}", self.task_info);
                            self.collector.broadcast(Message::Signal(SignalMessage::Stop)).await?;
                            return Ok(());
                        }
                    }
                }
                event = self.events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await?,
                        None => {
                            self.end_of_data().await?;
                            return Ok(());
                        }
                    }
                }
                _ = interval.tick() => {
                    self.handle_tick().await?;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: SourceEvent<T>) -> anyhow::Result<()> {
        let now = self.clock.now();

        let watermark = match event {
            SourceEvent::Record {
                partition,
                timestamp,
                payload,
            } => {
                if self.aggregator.partition(partition).is_none() {
                    warn!(
                        "record for unassigned {} in {}; assigning it",
                        partition, self.task_info
                    );
                    self.aggregator.assign(partition, now)?;
                }

                let disposition = self.aggregator.on_event(partition, timestamp, now)?;
                let record = Record {
                    timestamp,
                    partition: Some(partition),
                    value: payload,
                };
                self.route(record, disposition).await?;
                self.aggregator.compute_watermark()
            }
            SourceEvent::Assigned(partition) => {
                self.aggregator.assign(partition, now)?;
                self.aggregator.compute_watermark()
            }
            SourceEvent::Closed(partition) => match self.aggregator.close(partition) {
                Ok(watermark) => watermark,
                Err(e) => {
                    warn!("ignoring close in {}: {}", self.task_info, e);
                    None
                }
            },
        };

        self.forward_watermark(watermark).await
    }

    async fn route(&mut self, record: Record<T>, disposition: EventDisposition) -> anyhow::Result<()> {
        if let EventDisposition::Late {
            watermark,
            within_allowed_lateness,
        } = disposition
        {
            TaskCounters::LateEvents.for_task(&self.task_info, |c| c.inc());
            debug!(
                "late record at {:?} behind watermark {:?} (within allowed lateness: {})",
                record.timestamp, watermark, within_allowed_lateness
            );

            if let Some(late_tx) = &self.late_tx {
                if late_tx.send(record).await.is_err() {
                    warn!("late output of {} is closed; dropping record", self.task_info);
                }
                return Ok(());
            }
        }

        self.collector.collect(record).await
    }

    async fn handle_tick(&mut self) -> anyhow::Result<()> {
        let went_idle = self.aggregator.tick(self.clock.now());
        if went_idle > 0 {
            debug!("{} partitions of {} went idle", went_idle, self.task_info);
        }
        self.gauges
            .set_idle_partitions(self.aggregator.excluded_partitions());

        let watermark = self.aggregator.compute_watermark();
        self.forward_watermark(watermark).await
    }

    async fn forward_watermark(&mut self, watermark: Option<Watermark>) -> anyhow::Result<()> {
        let Some(watermark) = watermark else {
            return Ok(());
        };

        self.gauges.set_watermark(watermark);
        TaskCounters::WatermarksEmitted.for_task(&self.task_info, |c| c.inc());
        self.collector
            .broadcast(Message::Signal(SignalMessage::Watermark(watermark)))
            .await
    }

    async fn end_of_data(&mut self) -> anyhow::Result<()> {
        info!("source {} reached end of data", self.task_info);

        let open: Vec<PartitionId> = self
            .aggregator
            .partitions()
            .filter(|p| p.status() != PartitionStatus::Closed)
            .map(|p| p.partition_id())
            .collect();

        for partition in open {
            let watermark = self.aggregator.close(partition)?;
            self.forward_watermark(watermark).await?;
        }

        // covers a source that never had a partition
        let watermark = self.aggregator.compute_watermark();
        self.forward_watermark(watermark).await?;

        self.collector
            .broadcast(Message::Signal(SignalMessage::EndOfData))
            .await
    }

    async fn checkpoint(&mut self, epoch: u32) -> anyhow::Result<()> {
        debug!("checkpointing {} for epoch {}", self.task_info, epoch);
        let snapshot = encode_snapshot(&self.aggregator.snapshot())?;

        self.control
            .respond(ControlResp::CheckpointCompleted {
                operator_id: self.task_info.operator_id.clone(),
                task_index: self.task_info.task_index,
                epoch,
                watermark: self.aggregator.current_watermark(),
                snapshot,
            })
            .await;
        Ok(())
    }
}

/// What operator logic can do while handling a record or a timer.
pub struct OperatorContext<'a, T: Data, K: Key> {
    pub task_info: &'a TaskInfo,
    timers: &'a mut (dyn TimerRegistry<K> + Send),
    output: &'a mut Vec<Message<T>>,
}

impl<'a, T: Data, K: Key> OperatorContext<'a, T, K> {
    /// Buffers a record; buffered output is sent in order once the current
    /// callback returns.
    pub fn collect(&mut self, record: Record<T>) {
        self.output.push(Message::Record(record));
    }

    pub fn register_timer(
        &mut self,
        fire_time: SystemTime,
        key: K,
        callback_id: CallbackId,
    ) -> Option<Timer<K>> {
        self.timers.register_timer(fire_time, key, callback_id)
    }

    pub fn cancel_timer(&mut self, key: &K) -> Option<Timer<K>> {
        self.timers.cancel_timer(key)
    }
}

/// User logic hosted by an [`OperatorTask`], e.g. a window that finalizes
/// itself on a timer.
pub trait WatermarkOperator<T: Data, K: Key>: Send {
    fn name(&self) -> String;

    fn process_record(
        &mut self,
        record: Record<T>,
        disposition: EventDisposition,
        ctx: &mut OperatorContext<'_, T, K>,
    );

    fn handle_timer(&mut self, timer: Timer<K>, ctx: &mut OperatorContext<'_, T, K>);

    fn on_end_of_data(&mut self, _ctx: &mut OperatorContext<'_, T, K>) {}
}

fn timer_handler<'x, T: Data, K: Key>(
    operator: &'x mut Box<dyn WatermarkOperator<T, K>>,
    output: &'x mut Vec<Message<T>>,
    task_info: &'x TaskInfo,
) -> impl FnMut(Timer<K>, &mut TimerContext<'_, K>) + 'x {
    move |timer, timers| {
        let mut ctx = OperatorContext {
            task_info,
            timers,
            output: &mut *output,
        };
        operator.handle_timer(timer, &mut ctx);
    }
}

/// Drives one operator instance over its input edges.
pub struct OperatorTask<T: Data, K: Key> {
    task_info: Arc<TaskInfo>,
    operator: Box<dyn WatermarkOperator<T, K>>,
    state: OperatorWatermarkState<K>,
    in_qs: Vec<Receiver<Message<T>>>,
    collector: Collector<T>,
    control: ControlChannels,
    gauges: WatermarkGauges,
    buffer: Vec<Message<T>>,
    finished: HashSet<usize>,
}

impl<T: Data, K: Key> OperatorTask<T, K> {
    pub fn new(
        task_info: Arc<TaskInfo>,
        operator: Box<dyn WatermarkOperator<T, K>>,
        allowed_lateness: Duration,
        in_qs: Vec<Receiver<Message<T>>>,
        out_qs: Vec<Sender<Message<T>>>,
        control: ControlChannels,
    ) -> Self {
        Self {
            gauges: WatermarkGauges::register(&task_info),
            collector: Collector::new(task_info.clone(), out_qs),
            state: OperatorWatermarkState::new(in_qs.len(), allowed_lateness),
            task_info,
            operator,
            in_qs,
            control,
            buffer: vec![],
            finished: HashSet::new(),
        }
    }

    pub fn restore(&mut self, snapshot: &[u8]) -> anyhow::Result<()> {
        let snapshot: OperatorSnapshot<K> = decode_snapshot(snapshot)?;
        self.state.restore(snapshot)?;
        self.gauges
            .set_pending_timers(self.state.timers().len());
        info!(
            "restored {} with watermark {:?} and {} timers",
            self.task_info,
            self.state.watermark(),
            self.state.timers().len()
        );
        Ok(())
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        info!(
            "Running operator {} ({})",
            self.task_info,
            self.operator.name()
        );

        let result = self.run_loop().await;
        report_result(&self.task_info, &self.control, &result).await;
        result
    }

    async fn run_loop(&mut self) -> anyhow::Result<()> {
        let mut sel = StreamMap::new();
        for (i, q) in std::mem::take(&mut self.in_qs).into_iter().enumerate() {
            sel.insert(i, ReceiverStream::new(q));
        }

        loop {
            tokio::select! {
                Some(control_message) = self.control.rx.recv() => {
                    match control_message {
                        ControlMessage::Checkpoint { epoch } => self.checkpoint(epoch).await?,
                        ControlMessage::Stop => {
                            info!("stopping operator {}", self.task_info);
                            self.collector.broadcast(Message::Signal(SignalMessage::Stop)).await?;
                            return Ok(());
                        }
                    }
                }
                item = sel.next() => {
                    match item {
                        Some((idx, message)) => {
                            if self.handle_message(idx, message).await? {
                                return Ok(());
                            }
                        }
                        None => {
                            warn!("inputs of {} hung up without end of data", self.task_info);
                            self.collector.broadcast(Message::Signal(SignalMessage::Stop)).await?;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Returns true once every input has finished.
    async fn handle_message(&mut self, idx: usize, message: Message<T>) -> anyhow::Result<bool> {
        let edge = EdgeId(idx);

        match message {
            Message::Record(record) => {
                let disposition = self.state.classify(record.timestamp);
                if disposition.is_late() {
                    TaskCounters::LateEvents.for_task(&self.task_info, |c| c.inc());
                }

                {
                    let mut ctx = OperatorContext {
                        task_info: &self.task_info,
                        timers: &mut self.state,
                        output: &mut self.buffer,
                    };
                    self.operator.process_record(record, disposition, &mut ctx);
                }

                self.flush().await?;
                self.gauges
                    .set_pending_timers(self.state.timers().len());
            }
            Message::Signal(SignalMessage::Watermark(watermark)) => {
                debug!(
                    "received watermark {} on {} in {}",
                    watermark, edge, self.task_info
                );

                let advance = self.state.on_watermark(
                    edge,
                    watermark,
                    timer_handler(&mut self.operator, &mut self.buffer, &self.task_info),
                )?;
                self.after_advance(advance).await?;
            }
            Message::Signal(signal @ (SignalMessage::Stop | SignalMessage::EndOfData)) => {
                debug!("received {:?} on {} in {}", signal, edge, self.task_info);
                if signal == SignalMessage::EndOfData {
                    self.finished.insert(idx);
                }

                let advance = self.state.close_edge(
                    edge,
                    timer_handler(&mut self.operator, &mut self.buffer, &self.task_info),
                )?;
                self.after_advance(advance).await?;

                if self.state.all_inputs_closed() {
                    self.finish().await?;
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    async fn after_advance(&mut self, advance: WatermarkAdvance) -> anyhow::Result<()> {
        if advance.timers_fired > 0 {
            TaskCounters::TimersFired
                .for_task(&self.task_info, |c| c.inc_by(advance.timers_fired as u64));
        }

        // timer output goes out ahead of the watermark that fired it
        self.flush().await?;
        self.gauges
            .set_pending_timers(self.state.timers().len());

        if let Some(watermark) = advance.forward {
            self.gauges.set_watermark(watermark);
            TaskCounters::WatermarksEmitted.for_task(&self.task_info, |c| c.inc());
            self.collector
                .broadcast(Message::Signal(SignalMessage::Watermark(watermark)))
                .await?;
        }

        Ok(())
    }

    async fn finish(&mut self) -> anyhow::Result<()> {
        if self.finished.len() < self.state.merger().inputs() {
            info!("inputs of {} stopped", self.task_info);
            return self
                .collector
                .broadcast(Message::Signal(SignalMessage::Stop))
                .await;
        }

        info!("operator {} reached end of data", self.task_info);
        let fired = self.state.fire_all_timers(timer_handler(
            &mut self.operator,
            &mut self.buffer,
            &self.task_info,
        ));
        if fired > 0 {
            TaskCounters::TimersFired.for_task(&self.task_info, |c| c.inc_by(fired as u64));
        }

        {
            let mut ctx = OperatorContext {
                task_info: &self.task_info,
                timers: &mut self.state,
                output: &mut self.buffer,
            };
            self.operator.on_end_of_data(&mut ctx);
        }

        self.flush().await?;
        self.gauges.set_pending_timers(self.state.timers().len());
        self.collector
            .broadcast(Message::Signal(SignalMessage::EndOfData))
            .await
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        for message in std::mem::take(&mut self.buffer) {
            self.collector.send(message).await?;
        }
        Ok(())
    }

    async fn checkpoint(&mut self, epoch: u32) -> anyhow::Result<()> {
        debug!("checkpointing {} for epoch {}", self.task_info, epoch);
        let snapshot = encode_snapshot(&self.state.snapshot())?;

        self.control
            .respond(ControlResp::CheckpointCompleted {
                operator_id: self.task_info.operator_id.clone(),
                task_index: self.task_info.task_index,
                epoch,
                watermark: self.state.watermark(),
                snapshot,
            })
            .await;
        Ok(())
    }
}
