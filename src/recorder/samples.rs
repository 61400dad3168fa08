use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::thread;
use std::time::Duration;

use crate::error::RecorderError;

/// A block of analog samples, one vector per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch {
    /// Time of the first sample, seconds since the recording started.
    pub start_time: f64,
    pub sample_rate_hz: f64,
    pub channels: Vec<Vec<f64>>,
}

impl SampleBatch {
    /// Samples per channel.
    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn time_of(&self, index: usize) -> f64 {
        self.start_time + index as f64 / self.sample_rate_hz
    }

    /// Fails unless every channel holds the same number of samples.
    pub fn check_shape(&self) -> Result<(), RecorderError> {
        let expected = self.len();
        match self.channels.iter().position(|channel| channel.len() != expected) {
            Some(channel) => Err(RecorderError::RaggedBatch {
                channel,
                expected,
                found: self.channels[channel].len(),
            }),
            None => Ok(()),
        }
    }

    /// Row-major view: `(time, value per channel)` for each sample. Missing
    /// samples of a short channel read as NaN.
    pub fn rows(&self) -> impl Iterator<Item = (f64, Vec<f64>)> + '_ {
        (0..self.len()).map(move |i| {
            (
                self.time_of(i),
                self.channels
                    .iter()
                    .map(|channel| channel.get(i).copied().unwrap_or(f64::NAN))
                    .collect(),
            )
        })
    }
}

// SAMPLE SOURCE COMPONENT -----------------------------------------------------
pub trait SampleSource: Send {
    /// Blocks for about `period` and returns the samples acquired in it.
    fn read_batch(&mut self, period: Duration) -> Result<SampleBatch, RecorderError>;

    fn channel_count(&self) -> usize;
}

const BASELINE_AMPLITUDE: f64 = 70.0;
const BACKGROUND_I_FREQ: f64 = 0.5;
const BACKGROUND_II_FREQ: f64 = 1.0;
const BACKGROUND_III_FREQ: f64 = 2.0;

/// Synthetic analog channels: slow sinusoids around a baseline plus noise.
pub struct MockSampleSource {
    channels: usize,
    sample_rate_hz: f64,
    /// Sleep for each batch period to pace like an acquisition device.
    paced: bool,
    sample_index: u64,
    rng: StdRng,
}

impl MockSampleSource {
    pub fn new(channels: usize, sample_rate_hz: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            channels,
            sample_rate_hz,
            paced: true,
            sample_index: 0,
            rng,
        }
    }

    /// Produces batches as fast as they are asked for.
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    fn sample(&mut self, channel: usize, time: f64) -> f64 {
        let phase = channel as f64 * 0.7;
        let noise = self.rng.gen_range(-10..10) as f64;
        10.0 * (BACKGROUND_I_FREQ * time + phase).sin()
            + BASELINE_AMPLITUDE / 2.0 * (BACKGROUND_II_FREQ * time + phase).sin()
            + BASELINE_AMPLITUDE
            + 5.0 * (BACKGROUND_III_FREQ * time).sin()
            + noise
    }
}

impl SampleSource for MockSampleSource {
    fn read_batch(&mut self, period: Duration) -> Result<SampleBatch, RecorderError> {
        if self.paced {
            thread::sleep(period);
        }
        let n = (period.as_secs_f64() * self.sample_rate_hz).round().max(1.0) as u64;
        let start_time = self.sample_index as f64 / self.sample_rate_hz;

        let mut channels = vec![Vec::with_capacity(n as usize); self.channels];
        for i in 0..n {
            let time = (self.sample_index + i) as f64 / self.sample_rate_hz;
            for channel in 0..self.channels {
                let value = self.sample(channel, time);
                channels[channel].push(value);
            }
        }
        self.sample_index += n;

        Ok(SampleBatch {
            start_time,
            sample_rate_hz: self.sample_rate_hz,
            channels,
        })
    }

    fn channel_count(&self) -> usize {
        self.channels
    }
}
