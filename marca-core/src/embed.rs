//! Watermark embedding.
//!
//! For every frame of a block, a delta spectrum is built from the frame's
//! own windowed spectrum: the louder set of bands is scaled by
//! `+water_delta`, the quieter set by `-water_delta`, and the synthesized
//! delta signal is added back into the audio. Which set is "louder"
//! encodes the bit; B blocks invert the polarity of everything.
//!
//! Blocks start after `frames_pad_start` frames and alternate A,B,A,B
//! until the signal has no room for another full block. Payload bits are
//! repeated over `frames_per_bit` data frames each; forward error
//! correction is a concern of the message layer above this crate.

use realfft::num_complex::Complex32;

use crate::config::Params;
use crate::error::{Error, Result};
use crate::fft::SpectrumFft;
use crate::key::{Key, Stream};
use crate::pattern::{BitPosGen, UpDownGen};
use crate::wav::WavData;

#[derive(Clone, Copy)]
enum FrameUse {
    Sync(usize),
    Data(usize),
}

/// Embed `payload` into `wav_data`, returning the watermarked copy.
///
/// `payload` must contain exactly `params.payload_bits` bits. The input is
/// not modified; samples outside complete blocks pass through untouched.
pub fn embed(params: &Params, key: &Key, payload: &[bool], wav_data: &WavData) -> Result<WavData> {
    params.validate()?;
    if payload.len() != params.payload_bits {
        return Err(Error::InvalidPayloadLength {
            expected: params.payload_bits,
            got: payload.len(),
        });
    }

    let frame_size = params.frame_size;
    let n_channels = wav_data.n_channels() as usize;
    let block_frames = params.block_frame_count();

    // assign each block frame position its purpose
    let bit_pos_gen = BitPosGen::new(params, key);
    let mut frame_use = vec![FrameUse::Sync(0); block_frames];
    for i in 0..params.mark_sync_frame_count() {
        frame_use[bit_pos_gen.sync_frame(i)] = FrameUse::Sync(i);
    }
    for j in 0..params.mark_data_frame_count() {
        frame_use[bit_pos_gen.data_frame(j)] = FrameUse::Data(j);
    }

    let sync_gen = UpDownGen::new(params, key, Stream::SyncUpDown);
    let data_gen = UpDownGen::new(params, key, Stream::DataUpDown);
    let mut fft_proc = SpectrumFft::new(frame_size);
    let n_bins = fft_proc.bins();
    let delta = params.water_delta as f32;

    let samples = wav_data.samples();
    let mut out = samples.to_vec();

    let mut block = 0usize;
    loop {
        let block_start = params.frames_pad_start + block * block_frames;
        if (block_start + block_frames) * frame_size > wav_data.n_frames() {
            break;
        }
        let is_b_block = block & 1 == 1;

        for pos in 0..block_frames {
            let (up, down, expect) = match frame_use[pos] {
                FrameUse::Sync(i) => {
                    let (up, down) = sync_gen.get(i);
                    // sync bits alternate 0,1,0,1...
                    (up, down, (i / params.sync_frames_per_bit) & 1 == 1)
                }
                FrameUse::Data(j) => {
                    let (up, down) = data_gen.get(j);
                    (up, down, payload[j / params.frames_per_bit])
                }
            };
            // a 1 bit makes the down bands louder; B blocks flip it
            let amplify_down = expect ^ is_b_block;
            let (up_gain, down_gain) = if amplify_down {
                (-delta, delta)
            } else {
                (delta, -delta)
            };

            let frame_start = (block_start + pos) * frame_size;
            for ch in 0..n_channels {
                let bins = fft_proc.analyze_frame(samples, frame_start, ch, n_channels);

                let mut delta_spect = vec![Complex32::default(); n_bins];
                for &u in &up {
                    delta_spect[u as usize] = bins[u as usize] * up_gain;
                }
                for &d in &down {
                    delta_spect[d as usize] = bins[d as usize] * down_gain;
                }

                let mut delta_time = vec![0.0f32; frame_size];
                fft_proc.synthesize(&mut delta_spect, &mut delta_time);

                for (i, d) in delta_time.iter().enumerate() {
                    out[ch + (frame_start + i) * n_channels] += d;
                }
            }
        }
        block += 1;
    }

    Ok(WavData::new(
        out,
        wav_data.n_channels(),
        wav_data.sample_rate(),
        wav_data.bit_depth(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Random;

    fn test_payload(params: &Params) -> Vec<bool> {
        (0..params.payload_bits).map(|i| i % 3 == 0).collect()
    }

    fn make_noise(params: &Params, seconds: f64) -> WavData {
        let key = Key::new(&[77u8; 16]).unwrap();
        let mut rng = Random::new(&key, 0, Stream::SpeedClip);
        let n = (seconds * params.mark_sample_rate as f64) as usize;
        let samples: Vec<f32> = (0..n)
            .map(|_| (rng.random_double() as f32 - 0.5) * 0.34)
            .collect();
        WavData::new(samples, 1, params.mark_sample_rate, 16)
    }

    #[test]
    fn rejects_wrong_payload_length() {
        let params = Params::default();
        let key = Key::new(&[1u8; 16]).unwrap();
        let wav = make_noise(&params, 1.0);
        assert!(embed(&params, &key, &[true; 3], &wav).is_err());
    }

    #[test]
    fn embedding_is_deterministic() {
        let params = Params {
            water_delta: 0.05,
            ..Params::default()
        };
        let key = Key::new(&[2u8; 16]).unwrap();
        let wav = make_noise(&params, 25.0);
        let payload = test_payload(&params);
        let a = embed(&params, &key, &payload, &wav).unwrap();
        let b = embed(&params, &key, &payload, &wav).unwrap();
        assert_eq!(a.samples(), b.samples());
    }

    #[test]
    fn perturbation_is_small_and_present() {
        let params = Params {
            water_delta: 0.05,
            ..Params::default()
        };
        let key = Key::new(&[3u8; 16]).unwrap();
        let wav = make_noise(&params, 25.0);
        let marked = embed(&params, &key, &test_payload(&params), &wav).unwrap();

        let max_diff = wav
            .samples()
            .iter()
            .zip(marked.samples())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_diff > 0.0, "no watermark was written");
        assert!(max_diff < 0.1, "watermark perturbation too large: {max_diff}");
    }

    #[test]
    fn padding_region_passes_through() {
        let params = Params {
            water_delta: 0.05,
            ..Params::default()
        };
        let key = Key::new(&[4u8; 16]).unwrap();
        let wav = make_noise(&params, 25.0);
        let marked = embed(&params, &key, &test_payload(&params), &wav).unwrap();

        let pad_samples = params.frames_pad_start * params.frame_size;
        assert_eq!(&wav.samples()[..pad_samples], &marked.samples()[..pad_samples]);
    }

    #[test]
    fn too_short_signal_is_untouched() {
        let params = Params::default();
        let key = Key::new(&[5u8; 16]).unwrap();
        let wav = make_noise(&params, 2.0);
        let marked = embed(&params, &key, &test_payload(&params), &wav).unwrap();
        assert_eq!(wav.samples(), marked.samples());
    }
}
