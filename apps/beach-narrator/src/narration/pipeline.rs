use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::accumulator::{BatchPolicy, ChangeAccumulator, FlushEvent};
use crate::session::StreamEvent;

pub const DEFAULT_TICK: Duration = Duration::from_millis(250);
const MIN_TICK: Duration = Duration::from_millis(1);

/// Downstream consumer of flush events.
pub trait NarrationSink: Send + 'static {
    fn deliver(&mut self, event: FlushEvent);
}

impl<F> NarrationSink for F
where
    F: FnMut(FlushEvent) + Send + 'static,
{
    fn deliver(&mut self, event: FlushEvent) {
        (self)(event)
    }
}

/// Owns the accumulator for one stream. Snapshot arrival and the timed flush
/// run on the same task, so they never interleave.
#[derive(Debug, Clone)]
pub struct NarrationPipeline {
    policy: BatchPolicy,
    tick: Duration,
}

impl NarrationPipeline {
    pub fn new(policy: BatchPolicy) -> Self {
        Self {
            policy,
            tick: DEFAULT_TICK,
        }
    }

    /// Poll period for time-based flushes, clamped to at least 1 ms.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(MIN_TICK);
        self
    }

    pub fn spawn<S: NarrationSink>(
        self,
        events: broadcast::Receiver<StreamEvent>,
        sink: S,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(events, sink, cancel))
    }

    pub async fn run<S: NarrationSink>(
        self,
        mut events: broadcast::Receiver<StreamEvent>,
        mut sink: S,
        cancel: CancellationToken,
    ) {
        let mut accumulator = ChangeAccumulator::new(self.policy);
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(StreamEvent::Snapshot(snapshot)) => {
                        if let Some(flush) = accumulator.consume(&snapshot, Instant::now()) {
                            deliver(&mut sink, flush);
                        }
                    }
                    Ok(StreamEvent::Reset { session_id }) => {
                        if accumulator.has_pending() {
                            debug!(
                                target: "narrator::narration",
                                pending_chars = accumulator.pending_chars(),
                                "discarding pending batch on stream reset"
                            );
                        }
                        accumulator.reset();
                        debug!(target: "narrator::narration", session_id = ?session_id, "accumulator reset");
                    }
                    Ok(StreamEvent::Disconnected) => {
                        if accumulator.has_pending() {
                            debug!(
                                target: "narrator::narration",
                                pending_chars = accumulator.pending_chars(),
                                "discarding pending batch from a closed stream"
                            );
                        }
                        accumulator.reset();
                    }
                    Ok(StreamEvent::IncompatibleServer { failures }) => {
                        warn!(target: "narrator::narration", failures, "narration stalled: server frames cannot be decoded");
                    }
                    Ok(StreamEvent::AuthenticationLost) => {
                        warn!(target: "narrator::narration", "narration stalled: authentication lost");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: "narrator::narration", skipped, "narration fell behind the stream");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    if let Some(flush) = accumulator.poll(Instant::now()) {
                        deliver(&mut sink, flush);
                    }
                }
            }
        }

        if let Some(flush) = accumulator.drain() {
            deliver(&mut sink, flush);
        }
        info!(target: "narrator::narration", "narration pipeline stopped");
    }
}

fn deliver<S: NarrationSink>(sink: &mut S, event: FlushEvent) {
    debug!(
        target: "narrator::narration",
        trigger = ?event.trigger,
        chars = event.char_count,
        lines = event.line_count,
        truncated = event.truncated,
        "flushing narration batch"
    );
    sink.deliver(event);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use snapshot_wire::{Cell, Snapshot, SnapshotHeader};
    use tokio::sync::mpsc;

    use super::*;
    use crate::narration::FlushTrigger;

    fn screen(text: &str) -> Arc<Snapshot> {
        let header = SnapshotHeader {
            cols: 40,
            rows: 4,
            viewport_y: 0,
            cursor_x: 0,
            cursor_y: 0,
        };
        let rows = vec![text.chars().map(Cell::new).collect()];
        Arc::new(Snapshot::from_rows(header, rows).expect("snapshot"))
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn lone_change_is_flushed_by_the_tick() {
        let (events_tx, events_rx) = broadcast::channel(16);
        let (flush_tx, mut flush_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = NarrationPipeline::new(BatchPolicy::default()).spawn(
            events_rx,
            move |event: FlushEvent| {
                let _ = flush_tx.send(event);
            },
            cancel.clone(),
        );

        events_tx
            .send(StreamEvent::Snapshot(screen("$")))
            .expect("send");
        let started = Instant::now();
        let event = flush_rx.recv().await.expect("flush");
        assert_eq!(event.trigger, FlushTrigger::Time);
        assert_eq!(event.text, "$");
        assert!(started.elapsed() >= Duration::from_secs(2));

        cancel.cancel();
        task.await.expect("pipeline task");
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn closed_stream_discards_pending_text() {
        let (events_tx, events_rx) = broadcast::channel(16);
        let (flush_tx, mut flush_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = NarrationPipeline::new(BatchPolicy::default())
            .with_tick(Duration::ZERO)
            .spawn(
                events_rx,
                move |event: FlushEvent| {
                    let _ = flush_tx.send(event);
                },
                cancel.clone(),
            );

        events_tx.send(StreamEvent::Snapshot(screen("stale"))).expect("send");
        events_tx.send(StreamEvent::Disconnected).expect("send");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(flush_rx.try_recv().is_err());

        events_tx.send(StreamEvent::Snapshot(screen("stale"))).expect("send");
        let event = flush_rx.recv().await.expect("flush");
        assert_eq!(event.trigger, FlushTrigger::Time);
        assert_eq!(event.text, "stale");

        cancel.cancel();
        task.await.expect("pipeline task");
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn reset_drops_baseline_and_shutdown_drains() {
        let (events_tx, events_rx) = broadcast::channel(16);
        let (flush_tx, mut flush_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = NarrationPipeline::new(BatchPolicy::default()).spawn(
            events_rx,
            move |event: FlushEvent| {
                let _ = flush_tx.send(event);
            },
            cancel.clone(),
        );

        events_tx.send(StreamEvent::Snapshot(screen("old"))).expect("send");
        events_tx
            .send(StreamEvent::Reset {
                session_id: Some("next".into()),
            })
            .expect("send");
        events_tx.send(StreamEvent::Snapshot(screen("old"))).expect("send");
        drop(events_tx);

        task.await.expect("pipeline task");
        let event = flush_rx.recv().await.expect("drained batch");
        assert_eq!(event.trigger, FlushTrigger::Drain);
        assert_eq!(event.text, "old");
        assert!(flush_rx.recv().await.is_none());
    }
}
