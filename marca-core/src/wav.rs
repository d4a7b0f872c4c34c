use std::sync::Arc;

/// An in-memory audio signal: interleaved float samples plus format
/// metadata.
///
/// Samples are shared behind an [`Arc`] so a signal can be handed to
/// thread-pool jobs by cloning without copying the audio data. The decode
/// pipeline never mutates a signal; degraded copies (clips, resampled
/// versions) are new `WavData` values.
#[derive(Debug, Clone)]
pub struct WavData {
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
    n_channels: u16,
    bit_depth: u16,
}

impl WavData {
    pub fn new(samples: Vec<f32>, n_channels: u16, sample_rate: u32, bit_depth: u16) -> Self {
        assert!(n_channels > 0, "signal must have at least one channel");
        Self {
            samples: Arc::new(samples),
            sample_rate,
            n_channels,
            bit_depth,
        }
    }

    /// Interleaved samples, all channels.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Total number of values (frames times channels).
    pub fn n_values(&self) -> usize {
        self.samples.len()
    }

    /// Number of sample frames (one value per channel each).
    pub fn n_frames(&self) -> usize {
        self.samples.len() / self.n_channels as usize
    }

    pub fn n_channels(&self) -> u16 {
        self.n_channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn bit_depth(&self) -> u16 {
        self.bit_depth
    }

    /// Duration in seconds.
    pub fn seconds(&self) -> f64 {
        self.n_frames() as f64 / self.sample_rate as f64
    }

    /// Copy out the sample-frame range `[start, end)` as a new signal with
    /// the same format.
    pub fn extract(&self, start_frame: usize, end_frame: usize) -> WavData {
        let ch = self.n_channels as usize;
        let start = start_frame * ch;
        let end = (end_frame * ch).min(self.samples.len());
        WavData::new(
            self.samples[start.min(end)..end].to_vec(),
            self.n_channels,
            self.sample_rate,
            self.bit_depth,
        )
    }
}
