//! Arbitrary-ratio resampling via windowed-sinc interpolation.
//!
//! The speed detector needs ratios like `1.0007^k` that have no small
//! rational form, so output samples are interpolated directly at fractional
//! input positions using a Blackman-windowed sinc kernel. When
//! downsampling, the kernel is stretched to act as the anti-aliasing
//! lowpass (cutoff at the output Nyquist).

use crate::wav::WavData;

/// Kernel width in input samples at cutoff 1.0.
const TAPS: usize = 48;

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-9 {
        1.0
    } else {
        let px = std::f64::consts::PI * x;
        px.sin() / px
    }
}

/// Blackman window over `x` in [-1, 1], zero outside.
fn blackman(x: f64) -> f64 {
    if x.abs() >= 1.0 {
        return 0.0;
    }
    let t = std::f64::consts::PI * (x + 1.0);
    0.42 - 0.5 * t.cos() + 0.08 * (2.0 * t).cos()
}

/// Resample to `out_rate`, treating the input as a rendition sped up by
/// `speed`, and truncate the output to `max_seconds`.
///
/// The output restores nominal timing: for `speed > 1` the input is
/// stretched back out, so the result is correspondingly longer. The speed
/// detector uses this to build candidate "what if the true speed were c"
/// renditions of a clip; the decode pipeline uses it to undo detected
/// drift before sync search.
pub fn resample_ratio_truncate(
    wav: &WavData,
    speed: f64,
    out_rate: u32,
    max_seconds: f64,
) -> WavData {
    let step = wav.sample_rate() as f64 / (speed * out_rate as f64);
    let max_frames = max_seconds * out_rate as f64;
    let max_frames = if max_frames >= usize::MAX as f64 {
        usize::MAX
    } else {
        max_frames as usize
    };
    resample_inner(wav, step, out_rate, max_frames)
}

/// Plain sample-rate conversion (no assumed speed, no truncation).
pub fn resample(wav: &WavData, out_rate: u32) -> WavData {
    let step = wav.sample_rate() as f64 / out_rate as f64;
    resample_inner(wav, step, out_rate, usize::MAX)
}

fn resample_inner(wav: &WavData, step: f64, out_rate: u32, max_frames: usize) -> WavData {
    let n_channels = wav.n_channels() as usize;
    let in_frames = wav.n_frames();
    let samples = wav.samples();

    let out_frames = ((in_frames as f64 / step) as usize).min(max_frames);

    // When downsampling, stretch the kernel so its cutoff lands at the
    // output Nyquist frequency.
    let cutoff = (1.0 / step).min(1.0);
    let half_width = TAPS as f64 / 2.0 / cutoff;

    let mut out = vec![0.0f32; out_frames * n_channels];
    let mut acc = vec![0.0f64; n_channels];

    for (i, frame) in out.chunks_exact_mut(n_channels).enumerate() {
        let t = i as f64 * step;
        let j_first = (t - half_width).ceil() as i64;
        let j_last = (t + half_width).floor() as i64;

        acc.iter_mut().for_each(|a| *a = 0.0);
        let mut weight_sum = 0.0f64;

        for j in j_first..=j_last {
            let u = j as f64 - t;
            let w = cutoff * sinc(cutoff * u) * blackman(u / half_width);
            weight_sum += w;
            // positions outside the input contribute silence
            if j >= 0 && (j as usize) < in_frames {
                let base = j as usize * n_channels;
                for (ch, a) in acc.iter_mut().enumerate() {
                    *a += samples[base + ch] as f64 * w;
                }
            }
        }

        if weight_sum.abs() > 1e-12 {
            for (ch, value) in frame.iter_mut().enumerate() {
                *value = (acc[ch] / weight_sum) as f32;
            }
        }
    }

    WavData::new(out, wav.n_channels(), out_rate, wav.bit_depth())
}
