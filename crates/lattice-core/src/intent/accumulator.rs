//! Batch accumulation of pending intent requests.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

use super::data::IntentData;
use super::key::Key;

enum Op {
    Add(IntentData),
    Ready,
}

/// Coalesces store `process` callbacks into batches.
///
/// A batch flushes when the time window elapses (measured from the first
/// buffered item) or the size threshold fills, whichever comes first.
/// Multiple requests for one key within a window collapse to the highest
/// version. Only one batch is ever in flight: flushing stops until the
/// pipeline signals [`ready`](IntentAccumulator::ready).
pub struct IntentAccumulator {
    ops: mpsc::UnboundedSender<Op>,
}

impl IntentAccumulator {
    /// Spawns the accumulator task. Flushed batches are delivered on
    /// `batches` in accumulation order.
    #[must_use]
    pub fn spawn(
        batches: mpsc::UnboundedSender<Vec<IntentData>>,
        window: Duration,
        max_items: usize,
    ) -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(ops_rx, batches, window, max_items));
        Self { ops: ops_tx }
    }

    /// Buffers a pending request.
    pub fn add(&self, data: IntentData) {
        let _ = self.ops.send(Op::Add(data));
    }

    /// Signals that the in-flight batch finished; the next batch may flush.
    pub fn ready(&self) {
        let _ = self.ops.send(Op::Ready);
    }
}

async fn run(
    mut ops: mpsc::UnboundedReceiver<Op>,
    batches: mpsc::UnboundedSender<Vec<IntentData>>,
    window: Duration,
    max_items: usize,
) {
    let mut buffer: HashMap<Key, IntentData> = HashMap::new();
    let mut order: Vec<Key> = Vec::new();
    let mut deadline: Option<Instant> = None;
    let mut in_flight = false;

    loop {
        tokio::select! {
            op = ops.recv() => match op {
                None => break,
                Some(Op::Add(data)) => {
                    merge(&mut buffer, &mut order, data);
                    if deadline.is_none() {
                        deadline = Some(Instant::now() + window);
                    }
                    if buffer.len() >= max_items && !in_flight {
                        flush(&mut buffer, &mut order, &mut deadline, &mut in_flight, &batches);
                    }
                }
                Some(Op::Ready) => {
                    in_flight = false;
                    if !buffer.is_empty() {
                        flush(&mut buffer, &mut order, &mut deadline, &mut in_flight, &batches);
                    }
                }
            },
            () = sleep_until(deadline.unwrap_or_else(Instant::now)),
                if deadline.is_some() && !in_flight =>
            {
                flush(&mut buffer, &mut order, &mut deadline, &mut in_flight, &batches);
            }
        }
    }
}

fn merge(buffer: &mut HashMap<Key, IntentData>, order: &mut Vec<Key>, data: IntentData) {
    match buffer.get(data.key()) {
        Some(existing) if existing.version() >= data.version() => {
            trace!(key = %data.key(), "coalesced request superseded by buffered version");
        }
        Some(_) => {
            buffer.insert(data.key().clone(), data);
        }
        None => {
            order.push(data.key().clone());
            buffer.insert(data.key().clone(), data);
        }
    }
}

fn flush(
    buffer: &mut HashMap<Key, IntentData>,
    order: &mut Vec<Key>,
    deadline: &mut Option<Instant>,
    in_flight: &mut bool,
    batches: &mpsc::UnboundedSender<Vec<IntentData>>,
) {
    let batch: Vec<IntentData> = order
        .drain(..)
        .filter_map(|key| buffer.remove(&key))
        .collect();
    *deadline = None;
    if batch.is_empty() {
        return;
    }
    trace!(items = batch.len(), "flushing intent batch");
    *in_flight = true;
    let _ = batches.send(batch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppId;
    use crate::intent::data::Version;
    use crate::intent::types::Intent;

    fn data(name: &str, version: Version) -> IntentData {
        let app = AppId::new(1, "lattice.test");
        let intent = Intent::builder(Key::of(name, app.clone()), app).build();
        let mut data = IntentData::submit(intent);
        data.set_version(version);
        data
    }

    #[tokio::test(start_paused = true)]
    async fn window_elapse_flushes_buffered_items() {
        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
        let accumulator =
            IntentAccumulator::spawn(batch_tx, Duration::from_millis(50), 500);

        accumulator.add(data("a", Version::new(1, 0)));
        accumulator.add(data("b", Version::new(1, 1)));

        let batch = batch_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn size_threshold_flushes_ahead_of_the_window() {
        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
        let accumulator =
            IntentAccumulator::spawn(batch_tx, Duration::from_secs(3600), 3);

        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            accumulator.add(data(name, Version::new(1, i as u64)));
        }

        let batch = batch_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_keeps_only_the_highest_version() {
        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
        let accumulator =
            IntentAccumulator::spawn(batch_tx, Duration::from_millis(50), 500);

        accumulator.add(data("a", Version::new(1, 5)));
        accumulator.add(data("a", Version::new(1, 2)));
        accumulator.add(data("a", Version::new(1, 9)));

        let batch = batch_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].version(), Some(Version::new(1, 9)));
    }

    #[tokio::test(start_paused = true)]
    async fn batches_are_held_until_ready() {
        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
        let accumulator =
            IntentAccumulator::spawn(batch_tx, Duration::from_millis(50), 500);

        accumulator.add(data("a", Version::new(1, 0)));
        let first = batch_rx.recv().await.unwrap();
        assert_eq!(first.len(), 1);

        // The pipeline has not signalled ready; the next add must not flush
        // even after the window elapses.
        accumulator.add(data("b", Version::new(1, 1)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(batch_rx.try_recv().is_err());

        accumulator.ready();
        let second = batch_rx.recv().await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].key().to_string(), "b");
    }
}
