//! Frame-level spectral analysis.
//!
//! Wraps realfft plans behind the two operations the pipeline needs:
//! windowed per-channel forward transforms straight out of an interleaved
//! sample buffer (`analyze_frame`), and unit-gain synthesis of a modified
//! spectrum (`synthesize`, used by the encoder for its delta signals).
//! All buffers are allocated once per instance so the per-frame loops stay
//! allocation-free.

use realfft::num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use std::sync::Arc;

/// dB floor used for spectral magnitudes; digital silence maps here.
pub const MIN_DB: f32 = -96.0;

/// Windowed FFT front-end for one fixed frame size.
pub struct SpectrumFft {
    size: usize,
    window: Vec<f32>,
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
    time_buf: Vec<f32>,
    freq_buf: Vec<Complex32>,
    fwd_scratch: Vec<Complex32>,
    inv_scratch: Vec<Complex32>,
}

impl SpectrumFft {
    /// `frame_size` must be even and non-zero.
    pub fn new(frame_size: usize) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(frame_size);
        let inverse = planner.plan_fft_inverse(frame_size);

        Self {
            size: frame_size,
            window: gen_normalized_window(frame_size),
            time_buf: vec![0.0; frame_size],
            freq_buf: forward.make_output_vec(),
            fwd_scratch: forward.make_scratch_vec(),
            inv_scratch: inverse.make_scratch_vec(),
            forward,
            inverse,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.size
    }

    /// Number of complex bins (frame_size / 2 + 1).
    pub fn bins(&self) -> usize {
        self.size / 2 + 1
    }

    /// Window and transform one channel's frame.
    ///
    /// `base` is the first sample frame of the window; `interleaved` must
    /// hold at least `(base + frame_size) * n_channels` values. The
    /// returned bins stay valid until the next call.
    pub fn analyze_frame(
        &mut self,
        interleaved: &[f32],
        base: usize,
        channel: usize,
        n_channels: usize,
    ) -> &[Complex32] {
        for (i, value) in self.time_buf.iter_mut().enumerate() {
            *value = interleaved[channel + (base + i) * n_channels] * self.window[i];
        }
        self.forward
            .process_with_scratch(&mut self.time_buf, &mut self.freq_buf, &mut self.fwd_scratch)
            .expect("buffer sizes fixed at construction");
        &self.freq_buf
    }

    /// Inverse-transform a spectrum into `out` at unit gain (realfft's
    /// inverse scales by the frame size; this undoes that).
    ///
    /// `spectrum` must keep zero imaginary parts at DC and Nyquist and
    /// both slices must match the configured frame size.
    pub fn synthesize(&mut self, spectrum: &mut [Complex32], out: &mut [f32]) {
        self.inverse
            .process_with_scratch(spectrum, out, &mut self.inv_scratch)
            .expect("spectrum and output match the configured frame size");

        let scale = 1.0 / self.size as f32;
        for s in out {
            *s *= scale;
        }
    }
}

/// Generate a Hann analysis window normalized to mean gain 1.0, so an
/// unmodulated sinusoid keeps its spectral magnitude after windowing.
pub fn gen_normalized_window(size: usize) -> Vec<f32> {
    let n = size as f32;
    let mut window: Vec<f32> = (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / n).cos()))
        .collect();
    let mean: f32 = window.iter().sum::<f32>() / n;
    for w in window.iter_mut() {
        *w /= mean;
    }
    window
}

/// Magnitude of a complex bin in dB, floored at `min_db`.
pub fn db_from_complex(c: Complex32, min_db: f32) -> f32 {
    let mag = c.norm();
    if mag > 0.0 {
        (20.0 * mag.log10()).max(min_db)
    } else {
        min_db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bins_count() {
        let fft = SpectrumFft::new(1024);
        assert_eq!(fft.bins(), 513);
        assert_eq!(fft.frame_size(), 1024);
    }

    #[test]
    fn tone_lands_in_its_bin() {
        let size = 1024;
        let mut fft = SpectrumFft::new(size);
        // sinusoid centered on bin 32
        let samples: Vec<f32> = (0..size)
            .map(|i| (2.0 * std::f32::consts::PI * 32.0 * i as f32 / size as f32).sin())
            .collect();

        let bins = fft.analyze_frame(&samples, 0, 0, 1);
        let peak = bins
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.norm().total_cmp(&b.1.norm()))
            .map(|(k, _)| k)
            .unwrap();
        assert_eq!(peak, 32);

        // the unit-mean window keeps the magnitude near frame_size / 2
        let expected = size as f32 / 2.0;
        assert!((bins[32].norm() - expected).abs() / expected < 0.05);
    }

    #[test]
    fn analyze_synthesize_round_trip() {
        let size = 1024;
        let mut fft = SpectrumFft::new(size);
        let samples: Vec<f32> = (0..size)
            .map(|i| {
                let t = i as f32 / size as f32;
                (2.0 * std::f32::consts::PI * 100.0 * t).sin()
                    + 0.5 * (2.0 * std::f32::consts::PI * 7.0 * t).cos()
            })
            .collect();

        let mut spectrum = fft.analyze_frame(&samples, 0, 0, 1).to_vec();
        let mut out = vec![0.0f32; size];
        fft.synthesize(&mut spectrum, &mut out);

        // synthesis undoes the transform but not the analysis window
        let window = gen_normalized_window(size);
        for i in 0..size {
            let expected = samples[i] * window[i];
            assert!(
                (out[i] - expected).abs() < 1e-3,
                "sample {i}: {} vs {expected}",
                out[i]
            );
        }
    }

    #[test]
    fn analyze_reads_the_requested_channel() {
        let mut fft = SpectrumFft::new(16);
        // stereo: left all 0.5, right all -0.25
        let mut interleaved = Vec::new();
        for _ in 0..16 {
            interleaved.push(0.5f32);
            interleaved.push(-0.25f32);
        }
        // the DC bin of a constant signal is its value times the window sum
        let left_dc = fft.analyze_frame(&interleaved, 0, 0, 2)[0].re;
        assert!((left_dc - 8.0).abs() < 1e-3);
        let right_dc = fft.analyze_frame(&interleaved, 0, 1, 2)[0].re;
        assert!((right_dc + 4.0).abs() < 1e-3);
    }

    #[test]
    fn window_has_unit_mean_gain() {
        let w = gen_normalized_window(1024);
        let mean: f32 = w.iter().sum::<f32>() / 1024.0;
        assert!((mean - 1.0).abs() < 1e-5);
        // still tapers to (near) zero at the edges
        assert!(w[0].abs() < 1e-5);
        assert!(w[512] > 1.9);
    }

    #[test]
    fn db_floor_applies() {
        assert_eq!(db_from_complex(Complex32::new(0.0, 0.0), MIN_DB), MIN_DB);
        let tiny = db_from_complex(Complex32::new(1e-10, 0.0), MIN_DB);
        assert_eq!(tiny, MIN_DB);
        let unit = db_from_complex(Complex32::new(1.0, 0.0), MIN_DB);
        assert!(unit.abs() < 1e-6);
        let loud = db_from_complex(Complex32::new(10.0, 0.0), MIN_DB);
        assert!((loud - 20.0).abs() < 1e-4);
    }
}
