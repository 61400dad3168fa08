use chrono::{Local, SecondsFormat, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::processing::events::Label;
use crate::processing::trial::{Decision, DecoderSource, TrialRecord};

/// Appends a timestamped entry to `dir/filename`, creating both as needed.
pub fn log_to_file(dir: &Path, filename: &str, message: &str) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(filename))?;

    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    writeln!(file, "\n--- Log entry at {} ---", timestamp)?;
    writeln!(file, "{}", message)?;
    writeln!(file, "--- End of entry ---\n")?;
    file.flush()?;

    Ok(())
}

/// Like [`log_to_file`], framing the message under a header.
pub fn log_with_header(dir: &Path, filename: &str, header: &str, message: &str) -> io::Result<()> {
    let formatted_message = format!("===== {} =====\n{}\n====================", header, message);
    log_to_file(dir, filename, &formatted_message)
}

// TRIAL LOG -------------------------------------------------------------------

#[derive(Serialize)]
struct TrialLogRow<'a> {
    logged_at: String,
    session: &'a str,
    trial_index: usize,
    retry_of: Option<usize>,
    label: Label,
    trigger_time: Option<f64>,
    got_response: bool,
    source: Option<DecoderSource>,
    predicted_label: Option<Label>,
    decision: Option<Decision>,
    delay_s: f64,
    events: usize,
    warnings: usize,
}

/// One CSV row per completed trial, appended across sessions.
pub struct TrialLog {
    writer: csv::Writer<File>,
    path: PathBuf,
    session: String,
}

impl TrialLog {
    pub const FILENAME: &'static str = "trials.csv";

    pub fn open(dir: &Path, session: &str) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILENAME);
        let file_exists = path.exists();

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(!file_exists)
            .from_writer(file);
        Ok(Self {
            writer,
            path,
            session: session.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &TrialRecord) -> io::Result<()> {
        self.writer.serialize(TrialLogRow {
            logged_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            session: &self.session,
            trial_index: record.trial_index,
            retry_of: record.retry_of,
            label: record.label,
            trigger_time: record.trigger_time,
            got_response: record.got_response,
            source: record.decoder_result_source,
            predicted_label: record.predicted_label,
            decision: record.decision,
            delay_s: record.delay_s,
            events: record.events.len(),
            warnings: record.warnings.len(),
        })?;
        self.writer.flush()
    }
}
