use crate::error::{Error, Result};

/// Configuration for watermark embedding and detection.
///
/// All fields are fixed for the lifetime of a decode request. The derived
/// frame counts (`mark_sync_frame_count` etc.) define the block layout both
/// the encoder and the sync finder agree on.
#[derive(Debug, Clone)]
pub struct Params {
    /// Sample rate watermark generation and detection operate at.
    pub mark_sample_rate: u32,
    /// FFT frame size in samples. Must be a power of 2. Default: 1024.
    pub frame_size: usize,
    /// Lowest FFT bin carrying watermark bits.
    pub min_band: usize,
    /// Highest FFT bin carrying watermark bits (inclusive).
    pub max_band: usize,
    /// Number of up bands (and down bands) per frame.
    pub bands_per_frame: usize,
    /// Watermark strength (relative magnitude delta per band).
    pub water_delta: f64,
    /// Number of redundant sync bits per block.
    pub sync_bits: usize,
    /// Number of frames carrying each sync bit.
    pub sync_frames_per_bit: usize,
    /// Coarse search stepping in samples.
    pub sync_search_step: usize,
    /// Fine search stepping in samples.
    pub sync_search_fine: usize,
    /// Minimum refined sync quality for a match.
    pub sync_threshold2: f64,
    /// Number of candidates to keep even below threshold.
    pub get_n_best: usize,
    /// Padding frames before the first block, in case the track starts
    /// with silence.
    pub frames_pad_start: usize,
    /// Number of payload bits stored per block.
    pub payload_bits: usize,
    /// Number of data frames carrying each payload bit.
    pub frames_per_bit: usize,
    /// Slower but more accurate speed detection sweep.
    pub detect_speed_patient: bool,
    /// Testing hook: skip sync search and report scores at the encoder's
    /// nominal block positions.
    pub test_no_sync: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            mark_sample_rate: 44100,
            frame_size: 1024,
            min_band: 20,
            max_band: 100,
            bands_per_frame: 30,
            water_delta: 0.01,
            sync_bits: 6,
            sync_frames_per_bit: 85,
            sync_search_step: 256,
            sync_search_fine: 8,
            sync_threshold2: 0.7,
            get_n_best: 5,
            frames_pad_start: 250,
            payload_bits: 128,
            frames_per_bit: 2,
            detect_speed_patient: false,
            test_no_sync: false,
        }
    }
}

impl Params {
    /// Number of sync frames per block.
    pub fn mark_sync_frame_count(&self) -> usize {
        self.sync_bits * self.sync_frames_per_bit
    }

    /// Number of data frames per block.
    pub fn mark_data_frame_count(&self) -> usize {
        self.payload_bits * self.frames_per_bit
    }

    /// Total frames per block (sync frames interleaved with data frames).
    pub fn block_frame_count(&self) -> usize {
        self.mark_sync_frame_count() + self.mark_data_frame_count()
    }

    /// Number of spectral bands used for watermark bits.
    pub fn n_bands(&self) -> usize {
        self.max_band - self.min_band + 1
    }

    /// Approximate-search threshold, derived from the refined threshold.
    pub fn sync_threshold1(&self) -> f64 {
        self.sync_threshold2 * 0.75
    }

    /// Check parameter consistency. Inconsistent parameters are a caller
    /// bug, so the decode pipeline treats a failure here as fatal.
    pub fn validate(&self) -> Result<()> {
        if !self.frame_size.is_power_of_two() {
            return Err(Error::InvalidParams(format!(
                "frame_size must be a power of 2, got {}",
                self.frame_size
            )));
        }
        if self.sync_search_step == 0 || self.frame_size % self.sync_search_step != 0 {
            return Err(Error::InvalidParams(format!(
                "frame_size ({}) must be divisible by sync_search_step ({})",
                self.frame_size, self.sync_search_step
            )));
        }
        if self.sync_search_fine == 0 || self.sync_search_step % self.sync_search_fine != 0 {
            return Err(Error::InvalidParams(format!(
                "sync_search_step ({}) must be divisible by sync_search_fine ({})",
                self.sync_search_step, self.sync_search_fine
            )));
        }
        if self.min_band >= self.max_band || self.max_band >= self.frame_size / 2 {
            return Err(Error::InvalidParams(format!(
                "band range [{}, {}] invalid for frame_size {}",
                self.min_band, self.max_band, self.frame_size
            )));
        }
        if self.bands_per_frame * 2 > self.n_bands() {
            return Err(Error::InvalidParams(format!(
                "bands_per_frame ({}) needs {} distinct bands but only {} exist",
                self.bands_per_frame,
                self.bands_per_frame * 2,
                self.n_bands()
            )));
        }
        if self.sync_bits == 0 || self.sync_frames_per_bit == 0 {
            return Err(Error::InvalidParams(
                "sync pattern must contain at least one bit and one frame".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_frame_counts() {
        let params = Params::default();
        assert_eq!(params.mark_sync_frame_count(), 510);
        assert_eq!(params.mark_data_frame_count(), 256);
        assert_eq!(params.block_frame_count(), 766);
        assert_eq!(params.n_bands(), 81);
    }

    #[test]
    fn default_is_valid() {
        assert!(Params::default().validate().is_ok());
    }

    #[test]
    fn threshold1_is_three_quarters() {
        let params = Params {
            sync_threshold2: 0.8,
            ..Params::default()
        };
        assert!((params.sync_threshold1() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn rejects_unaligned_search_step() {
        let params = Params {
            sync_search_step: 300,
            ..Params::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn rejects_non_power_of_two_frame() {
        let params = Params {
            frame_size: 1000,
            ..Params::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn rejects_band_range_past_nyquist() {
        let params = Params {
            max_band: 512,
            ..Params::default()
        };
        assert!(params.validate().is_err());
    }
}
