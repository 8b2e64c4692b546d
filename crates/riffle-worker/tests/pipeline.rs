use riffle_state::Timer;
use riffle_types::{
    CallbackId, EventDisposition, Message, PartitionId, Record, SignalMessage, SourceEvent,
    TaskInfo, Watermark,
};
use riffle_worker::{
    ControlChannels, ControlMessage, ControlResp, IdlenessConfig, OperatorContext, OperatorTask,
    SourceTask, SourceWatermarkAggregator, WatermarkOperator, WatermarkStrategy,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::{channel, Receiver, Sender};

fn secs(s: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(s)
}

fn as_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap().as_secs()
}

/// Tumbling 10s count windows, keyed by window end.
#[derive(Default)]
struct TumblingCount {
    counts: HashMap<u64, u64>,
}

impl WatermarkOperator<String, u64> for TumblingCount {
    fn name(&self) -> String {
        "tumbling_count".to_string()
    }

    fn process_record(
        &mut self,
        record: Record<String>,
        disposition: EventDisposition,
        ctx: &mut OperatorContext<'_, String, u64>,
    ) {
        assert_eq!(disposition, EventDisposition::OnTime, "{:?}", record);
        let end = (as_secs(record.timestamp) / 10 + 1) * 10;
        *self.counts.entry(end).or_default() += 1;
        ctx.register_timer(secs(end), end, CallbackId(0));
    }

    fn handle_timer(&mut self, timer: Timer<u64>, ctx: &mut OperatorContext<'_, String, u64>) {
        let count = self.counts.remove(&timer.key).unwrap_or_default();
        ctx.collect(Record {
            timestamp: timer.fire_time,
            partition: None,
            value: format!("{}:{}", timer.key, count),
        });
    }
}

#[derive(Debug, PartialEq)]
enum Out {
    Window(String),
    Watermark(Option<u64>),
    EndOfData,
    Stop,
}

fn out(message: Message<String>) -> Out {
    match message {
        Message::Record(r) => Out::Window(r.value),
        Message::Signal(SignalMessage::Watermark(Watermark::EventTime(t))) => {
            Out::Watermark(Some(as_secs(t)))
        }
        Message::Signal(SignalMessage::Watermark(Watermark::Idle)) => Out::Watermark(None),
        Message::Signal(SignalMessage::EndOfData) => Out::EndOfData,
        Message::Signal(SignalMessage::Stop) => Out::Stop,
    }
}

async fn drain(rx: &mut Receiver<Message<String>>) -> Vec<Out> {
    let mut messages = vec![];
    while let Some(message) = rx.recv().await {
        let end = message.is_end();
        messages.push(out(message));
        if end {
            break;
        }
    }
    messages
}

fn aggregator(partitions: u32) -> SourceWatermarkAggregator {
    let mut aggregator = SourceWatermarkAggregator::new(
        WatermarkStrategy::bounded(Duration::from_secs(2)).unwrap(),
        IdlenessConfig::try_new(Duration::from_secs(60), 1).unwrap(),
        Duration::ZERO,
    )
    .unwrap();

    // assign up front so the first tick doesn't see an empty (idle) source
    for p in 0..partitions {
        aggregator
            .assign(PartitionId(p), SystemTime::now())
            .unwrap();
    }
    aggregator
}

struct SourceHandle {
    events: Sender<SourceEvent<String>>,
    control: Sender<ControlMessage>,
    responses: Receiver<ControlResp>,
}

fn source(
    aggregator: SourceWatermarkAggregator,
    out_tx: Sender<Message<String>>,
) -> (SourceTask<String>, SourceHandle) {
    let (event_tx, event_rx) = channel(64);
    let (ctl_tx, ctl_rx) = channel(8);
    let (resp_tx, resp_rx) = channel(8);

    let task = SourceTask::new(
        Arc::new(TaskInfo::for_test("pipeline", "source")),
        aggregator,
        Duration::from_secs(1),
        event_rx,
        vec![out_tx],
        ControlChannels::new(ctl_rx, resp_tx),
    )
    .unwrap();

    (
        task,
        SourceHandle {
            events: event_tx,
            control: ctl_tx,
            responses: resp_rx,
        },
    )
}

async fn send(events: &Sender<SourceEvent<String>>, partition: u32, ts: u64) {
    events
        .send(SourceEvent::Record {
            partition: PartitionId(partition),
            timestamp: secs(ts),
            payload: format!("p{}@{}", partition, ts),
        })
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn idle_partition_stops_holding_back_windows() {
    let (source_out, operator_in) = channel(64);
    let (operator_out, mut output) = channel(64);
    let (_op_ctl_tx, op_ctl_rx) = channel(8);
    let (op_resp_tx, mut op_resp_rx) = channel(8);

    let (source_task, source_handle) = source(aggregator(3), source_out);
    let operator_task = OperatorTask::new(
        Arc::new(TaskInfo::for_test("pipeline", "window")),
        Box::<TumblingCount>::default(),
        Duration::ZERO,
        vec![operator_in],
        vec![operator_out],
        ControlChannels::new(op_ctl_rx, op_resp_tx),
    );

    let source = tokio::spawn(source_task.run());
    let operator = tokio::spawn(operator_task.run());

    let SourceHandle {
        events,
        control: _source_ctl,
        mut responses,
    } = source_handle;

    // watermark = min(98, 96, 95)
    send(&events, 0, 100).await;
    send(&events, 1, 98).await;
    send(&events, 2, 97).await;

    // p0 and p1 keep talking, p2 goes quiet
    tokio::time::sleep(Duration::from_secs(50)).await;
    send(&events, 0, 100).await;
    send(&events, 1, 98).await;

    // p2 idles out at 61s, leaving min(98, 96)
    tokio::time::sleep(Duration::from_secs(20)).await;

    // p2 comes back far ahead; it doesn't move the minimum
    send(&events, 2, 200).await;
    send(&events, 0, 120).await;
    send(&events, 1, 125).await;
    drop(events);

    let output = drain(&mut output).await;
    source.await.unwrap().unwrap();
    operator.await.unwrap().unwrap();

    assert_eq!(
        output,
        vec![
            Out::Watermark(Some(95)),
            Out::Watermark(Some(96)),
            Out::Window("100:3".to_string()),
            Out::Window("110:2".to_string()),
            Out::Watermark(Some(118)),
            Out::Watermark(Some(123)),
            Out::Window("130:2".to_string()),
            Out::Watermark(Some(198)),
            Out::Watermark(None),
            Out::Window("210:1".to_string()),
            Out::EndOfData,
        ]
    );

    assert!(matches!(
        responses.recv().await,
        Some(ControlResp::TaskFinished { .. })
    ));
    assert!(matches!(
        op_resp_rx.recv().await,
        Some(ControlResp::TaskFinished { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn source_resumes_from_checkpoint_without_regressing() {
    let (out_tx, mut out_rx) = channel(64);
    let (task, mut handle) = source(aggregator(1), out_tx);
    let running = tokio::spawn(task.run());

    send(&handle.events, 0, 100).await;
    let mut seen = vec![];
    while seen.last() != Some(&Out::Watermark(Some(98))) {
        let message = out_rx.recv().await.unwrap();
        seen.push(out(message));
    }

    handle
        .control
        .send(ControlMessage::Checkpoint { epoch: 1 })
        .await
        .unwrap();
    let snapshot = match handle.responses.recv().await {
        Some(ControlResp::CheckpointCompleted {
            epoch,
            watermark,
            snapshot,
            ..
        }) => {
            assert_eq!(epoch, 1);
            assert_eq!(watermark, Some(Watermark::EventTime(secs(98))));
            snapshot
        }
        other => panic!("expected a checkpoint, got {:?}", other),
    };

    handle.control.send(ControlMessage::Stop).await.unwrap();
    assert_eq!(drain(&mut out_rx).await, vec![Out::Stop]);
    running.await.unwrap().unwrap();

    let (out_tx, mut out_rx) = channel(64);
    let (mut task, handle) = source(aggregator(1), out_tx);
    task.restore(&snapshot).unwrap();
    let running = tokio::spawn(task.run());

    // 99 is behind the restored max of 100, so nothing moves
    send(&handle.events, 0, 99).await;
    send(&handle.events, 0, 105).await;
    drop(handle.events);

    assert_eq!(
        drain(&mut out_rx).await,
        vec![
            Out::Window("p0@99".to_string()),
            Out::Window("p0@105".to_string()),
            Out::Watermark(Some(103)),
            Out::Watermark(None),
            Out::EndOfData,
        ]
    );
    running.await.unwrap().unwrap();
}
