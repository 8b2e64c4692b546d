use crate::emitter::WatermarkEmitter;
use bincode::{Decode, Encode};
use riffle_types::{EdgeId, Result, Watermark, WatermarkError};
use std::time::SystemTime;
use tracing::{debug, trace};

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Encode, Decode)]
pub struct InputEdgeState {
    pub last_received: Option<Watermark>,
    // highest event time seen on this edge, kept while the edge is idle
    pub last_event_time: Option<SystemTime>,
    pub closed: bool,
}

impl InputEdgeState {
    pub fn is_idle(&self) -> bool {
        self.last_received == Some(Watermark::Idle)
    }

    /// Applies an incoming watermark; returns false if it changes nothing.
    fn receive(&mut self, watermark: Watermark) -> bool {
        if self.closed {
            return false;
        }

        match watermark {
            Watermark::Idle => {
                if self.is_idle() {
                    return false;
                }
                self.last_received = Some(Watermark::Idle);
                true
            }
            Watermark::EventTime(t) => {
                let t = match self.last_event_time {
                    Some(last) if t <= last => {
                        if !self.is_idle() {
                            return false;
                        }
                        last
                    }
                    _ => t,
                };
                self.last_event_time = Some(t);
                self.last_received = Some(Watermark::EventTime(t));
                true
            }
        }
    }
}

/// Combines the watermarks arriving on every input edge of an operator.
///
/// The operator's watermark is the minimum over its edges, with idle and
/// closed edges carrying the idle sentinel. Nothing is forwarded until every
/// edge has reported once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkMerger {
    edges: Vec<InputEdgeState>,
    output: WatermarkEmitter,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct MergerSnapshot {
    pub edges: Vec<InputEdgeState>,
    pub output: WatermarkEmitter,
}

impl WatermarkMerger {
    pub fn new(inputs: usize) -> Self {
        Self {
            edges: vec![InputEdgeState::default(); inputs],
            output: WatermarkEmitter::default(),
        }
    }

    pub fn inputs(&self) -> usize {
        self.edges.len()
    }

    /// Handles a watermark from one edge and returns the watermark this
    /// operator should forward, if any.
    pub fn on_watermark_message(
        &mut self,
        edge: EdgeId,
        watermark: Watermark,
    ) -> Result<Option<Watermark>> {
        let state = self
            .edges
            .get_mut(edge.0)
            .ok_or(WatermarkError::UnknownEdge(edge))?;

        if !state.receive(watermark) {
            trace!("ignoring non-advancing watermark {} on {}", watermark, edge);
            return Ok(None);
        }

        Ok(self.update_watermark())
    }

    /// Permanently removes an edge from the minimum, e.g. once it has sent
    /// its end-of-data signal.
    pub fn close_edge(&mut self, edge: EdgeId) -> Result<Option<Watermark>> {
        let state = self
            .edges
            .get_mut(edge.0)
            .ok_or(WatermarkError::UnknownEdge(edge))?;

        if state.closed {
            return Ok(None);
        }

        state.last_received = Some(Watermark::Idle);
        state.closed = true;
        debug!("closed input {}", edge);

        Ok(self.update_watermark())
    }

    fn update_watermark(&mut self) -> Option<Watermark> {
        let candidate = self
            .edges
            .iter()
            .fold(Some(Watermark::Idle), |current, next| {
                Some(current?.min(next.last_received?))
            })?;

        self.output.offer(candidate)
    }

    pub fn watermark(&self) -> Option<Watermark> {
        self.output.current()
    }

    /// The last event-time watermark forwarded, even while idle.
    pub fn last_present_watermark(&self) -> Option<SystemTime> {
        self.output.last_event_time()
    }

    pub fn edge(&self, edge: EdgeId) -> Option<&InputEdgeState> {
        self.edges.get(edge.0)
    }

    pub fn all_closed(&self) -> bool {
        self.edges.iter().all(|e| e.closed)
    }

    pub fn snapshot(&self) -> MergerSnapshot {
        MergerSnapshot {
            edges: self.edges.clone(),
            output: self.output,
        }
    }

    pub fn restore(&mut self, snapshot: MergerSnapshot) -> Result<()> {
        if snapshot.edges.len() != self.edges.len() {
            return Err(WatermarkError::RestoreMismatch {
                kind: "edge",
                expected: (0..self.edges.len()).map(|i| EdgeId(i).to_string()).collect(),
                found: (0..snapshot.edges.len())
                    .map(|i| EdgeId(i).to_string())
                    .collect(),
            });
        }

        self.edges = snapshot.edges;
        self.output.restore(snapshot.output);
        Ok(())
    }
}
