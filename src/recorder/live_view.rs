use std::collections::VecDeque;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::debug;

use super::samples::SampleBatch;

/// Rolling window of the most recent samples on every channel.
#[derive(Debug, Clone)]
pub struct LiveView {
    window: usize,
    buffers: Vec<VecDeque<(f64, f64)>>, // (timestamp, value)
    batches_seen: usize,
}

impl LiveView {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            buffers: Vec::new(),
            batches_seen: 0,
        }
    }

    pub fn add_batch(&mut self, batch: &SampleBatch) {
        if self.buffers.len() < batch.channels.len() {
            self.buffers
                .resize_with(batch.channels.len(), || VecDeque::with_capacity(self.window));
        }
        for (buffer, samples) in self.buffers.iter_mut().zip(&batch.channels) {
            for (i, &value) in samples.iter().enumerate() {
                buffer.push_back((batch.time_of(i), value));
                if buffer.len() > self.window {
                    buffer.pop_front();
                }
            }
        }
        self.batches_seen += 1;
    }

    pub fn channel(&self, index: usize) -> Option<Vec<(f64, f64)>> {
        self.buffers
            .get(index)
            .map(|buffer| buffer.iter().copied().collect())
    }

    pub fn latest(&self) -> Vec<Option<f64>> {
        self.buffers
            .iter()
            .map(|buffer| buffer.back().map(|&(_, v)| v))
            .collect()
    }

    pub fn time_range(&self) -> Option<(f64, f64)> {
        let buffer = self.buffers.first()?;
        Some((buffer.front()?.0, buffer.back()?.0))
    }

    pub fn batches_seen(&self) -> usize {
        self.batches_seen
    }
}

pub type SharedLiveView = Arc<Mutex<LiveView>>;

/// Feeds batches from the recorder into a shared view until the recorder hangs up.
pub fn spawn_live_view(rx: Receiver<SampleBatch>, window: usize) -> (SharedLiveView, JoinHandle<()>) {
    let view = Arc::new(Mutex::new(LiveView::new(window)));
    let shared = Arc::clone(&view);
    let handle = thread::spawn(move || {
        while let Ok(batch) = rx.recv() {
            let mut view = shared.lock().unwrap_or_else(|p| p.into_inner());
            view.add_batch(&batch);
            debug!(latest = ?view.latest(), "live view");
        }
    });
    (view, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(start_time: f64, values: Vec<f64>) -> SampleBatch {
        SampleBatch {
            start_time,
            sample_rate_hz: 10.0,
            channels: vec![values.clone(), values],
        }
    }

    #[test]
    fn keeps_only_the_most_recent_window() {
        let mut view = LiveView::new(4);
        view.add_batch(&batch(0.0, vec![1.0, 2.0, 3.0]));
        view.add_batch(&batch(0.3, vec![4.0, 5.0, 6.0]));

        let channel = view.channel(1).unwrap();
        assert_eq!(channel.len(), 4);
        assert_eq!(channel[0].1, 3.0);
        assert_eq!(view.latest(), vec![Some(6.0), Some(6.0)]);
        assert_eq!(view.batches_seen(), 2);
        assert!(view.channel(2).is_none());
    }

    #[test]
    fn thread_stops_when_sender_drops() {
        let (tx, rx) = std::sync::mpsc::sync_channel(2);
        let (view, handle) = spawn_live_view(rx, 8);
        tx.send(batch(0.0, vec![1.0])).unwrap();
        drop(tx);
        handle.join().unwrap();
        assert_eq!(view.lock().unwrap().batches_seen(), 1);
    }
}
