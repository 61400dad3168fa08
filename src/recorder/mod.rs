//! Data-recording sidecar.
//!
//! Runs a [`SampleSource`] on its own thread and writes every batch to CSV.
//! The session talks to it through three channels only: a stop signal, a
//! failure flag and an optional bounded live-view queue. The sidecar
//! acknowledges with a [`RecorderReport`] once it has observed the stop
//! signal and flushed its output.

pub mod live_view;
pub mod samples;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

pub use live_view::{spawn_live_view, LiveView, SharedLiveView};
pub use samples::{MockSampleSource, SampleBatch, SampleSource};

use crate::config::RecorderConfig;
use crate::error::RecorderError;

/// Final accounting sent by the sidecar when it exits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecorderReport {
    pub path: PathBuf,
    pub batches: usize,
    pub samples: usize,
    /// Batches the live view was too slow to take.
    pub dropped_live: usize,
    pub error: Option<String>,
}

pub struct Recorder;

impl Recorder {
    /// Opens the output file and starts the sidecar thread.
    pub fn spawn(
        config: &RecorderConfig,
        source: Box<dyn SampleSource>,
        live: Option<SyncSender<SampleBatch>>,
    ) -> Result<RecorderHandle, RecorderError> {
        let writer = open_writer(&config.path, source.channel_count())?;
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ack_tx, ack_rx) = mpsc::channel::<RecorderReport>();
        let failed = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            source,
            writer,
            live,
            period: Duration::from_millis(config.batch_ms),
            failed: Arc::clone(&failed),
            report: RecorderReport {
                path: config.path.clone(),
                ..RecorderReport::default()
            },
        };
        let join = thread::Builder::new()
            .name("recorder".into())
            .spawn(move || worker.run(stop_rx, ack_tx))?;
        info!("recorder writing to {}", config.path.display());

        Ok(RecorderHandle {
            stop_tx,
            ack_rx,
            failed,
            join: Some(join),
            join_timeout: Duration::from_millis(config.join_timeout_ms),
        })
    }
}

fn open_writer(path: &Path, channels: usize) -> Result<csv::Writer<File>, RecorderError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    let mut header = vec!["time".to_string()];
    header.extend((0..channels).map(|c| format!("ch{}", c)));
    writer.write_record(&header)?;
    Ok(writer)
}

struct Worker {
    source: Box<dyn SampleSource>,
    writer: csv::Writer<File>,
    live: Option<SyncSender<SampleBatch>>,
    period: Duration,
    failed: Arc<AtomicBool>,
    report: RecorderReport,
}

impl Worker {
    fn run(mut self, stop_rx: Receiver<()>, ack_tx: Sender<RecorderReport>) {
        let mut stopped = false;
        loop {
            match stop_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => {
                    stopped = true;
                    break;
                }
                Err(TryRecvError::Empty) => {}
            }
            if let Err(e) = self.step() {
                error!("recorder failed: {}", e);
                self.failed.store(true, Ordering::SeqCst);
                self.report.error = Some(e.to_string());
                break;
            }
        }

        if let Err(e) = self.writer.flush() {
            self.failed.store(true, Ordering::SeqCst);
            if self.report.error.is_none() {
                self.report.error = Some(e.to_string());
            }
        }
        if !stopped {
            // Failed: hold the acknowledgement until the session asks us to stop.
            let _ = stop_rx.recv();
        }
        let _ = ack_tx.send(self.report);
    }

    fn step(&mut self) -> Result<(), RecorderError> {
        let batch = self.source.read_batch(self.period)?;
        batch.check_shape()?;
        for (time, values) in batch.rows() {
            let mut row = Vec::with_capacity(values.len() + 1);
            row.push(format!("{:.4}", time));
            row.extend(values.iter().map(|v| format!("{:.3}", v)));
            self.writer.write_record(&row)?;
        }
        self.report.batches += 1;
        self.report.samples += batch.len();

        if let Some(live) = &self.live {
            match live.try_send(batch) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => self.report.dropped_live += 1,
                Err(TrySendError::Disconnected(_)) => self.live = None,
            }
        }
        Ok(())
    }
}

// HANDLE ----------------------------------------------------------------------

pub struct RecorderHandle {
    stop_tx: Sender<()>,
    ack_rx: Receiver<RecorderReport>,
    failed: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    join_timeout: Duration,
}

impl RecorderHandle {
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn failure_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.failed)
    }

    /// Signals stop and waits for the sidecar's acknowledgement.
    ///
    /// A sidecar that failed while running still acknowledges; its report
    /// carries the error.
    pub fn stop(mut self) -> Result<RecorderReport, RecorderError> {
        let _ = self.stop_tx.send(());
        match self.ack_rx.recv_timeout(self.join_timeout) {
            Ok(report) => {
                if let Some(join) = self.join.take() {
                    join.join().map_err(|_| RecorderError::Panicked)?;
                }
                info!(
                    batches = report.batches,
                    samples = report.samples,
                    dropped_live = report.dropped_live,
                    "recorder stopped"
                );
                Ok(report)
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("recorder did not acknowledge stop; detaching");
                Err(RecorderError::JoinTimeout(self.join_timeout.as_millis() as u64))
            }
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(join) = self.join.take() {
                    let _ = join.join();
                }
                Err(RecorderError::Panicked)
            }
        }
    }
}
