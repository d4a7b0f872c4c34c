use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use marca_core::{BlockType, Key, Mode, Params, SyncFinder, WavData};

#[derive(Parser)]
#[command(name = "marca", about = "Audio watermarking tool", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Embed a watermark into a WAV file
    Add {
        /// Input WAV file
        #[arg(short, long)]
        input: PathBuf,

        /// Output WAV file
        #[arg(short, long)]
        output: PathBuf,

        /// Payload as 32-char hex string (128 bits)
        #[arg(short, long)]
        payload: String,

        /// Key passphrase
        #[arg(short, long, default_value = "marca-default-key")]
        key: String,

        /// Watermark strength (relative magnitude delta)
        #[arg(short, long, default_value = "0.01")]
        strength: f64,
    },
    /// Search a WAV file for watermark sync blocks
    Get {
        /// Input WAV file
        #[arg(short, long)]
        input: PathBuf,

        /// Key passphrase
        #[arg(short, long, default_value = "marca-default-key")]
        key: String,

        /// Watermark strength the file was encoded with
        #[arg(short, long, default_value = "0.01")]
        strength: f64,

        /// Treat the input as an arbitrary clip (pads with silence and
        /// searches for AB/BA block pairs)
        #[arg(long)]
        clip: bool,

        /// Detect and undo playback-speed drift before searching
        #[arg(long)]
        detect_speed: bool,

        /// Use the slower, more accurate speed sweep
        #[arg(long)]
        patient: bool,
    },
    /// Estimate playback-speed drift
    Speed {
        /// Input WAV file
        #[arg(short, long)]
        input: PathBuf,

        /// Key passphrase
        #[arg(short, long, default_value = "marca-default-key")]
        key: String,

        /// Watermark strength the file was encoded with
        #[arg(short, long, default_value = "0.01")]
        strength: f64,

        /// Use the slower, more accurate speed sweep
        #[arg(long)]
        patient: bool,
    },
}

fn read_wav(path: &Path) -> Result<WavData, Box<dyn std::error::Error>> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<f32>, _>>()?,
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            let max = (1i32 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .collect::<Result<Vec<i32>, _>>()?
                .into_iter()
                .map(|s| s as f32 / max)
                .collect()
        }
    };

    Ok(WavData::new(
        samples,
        spec.channels,
        spec.sample_rate,
        spec.bits_per_sample,
    ))
}

fn write_wav(path: &Path, wav: &WavData) -> Result<(), Box<dyn std::error::Error>> {
    let spec = hound::WavSpec {
        channels: wav.n_channels(),
        sample_rate: wav.sample_rate(),
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &s in wav.samples() {
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Parse a 32-char hex string into 128 payload bits, MSB first.
fn parse_payload(hex: &str, n_bits: usize) -> Result<Vec<bool>, String> {
    let expected_chars = n_bits / 4;
    if hex.len() != expected_chars {
        return Err(format!(
            "payload must be {expected_chars} hex chars, got {}",
            hex.len()
        ));
    }
    let mut bits = Vec::with_capacity(n_bits);
    for c in hex.chars() {
        let nibble = c
            .to_digit(16)
            .ok_or_else(|| format!("invalid hex char {c:?} in payload"))?;
        for shift in (0..4).rev() {
            bits.push((nibble >> shift) & 1 == 1);
        }
    }
    Ok(bits)
}

/// Bring a signal to the canonical watermark sample rate.
fn to_mark_rate(params: &Params, wav: WavData) -> WavData {
    if wav.sample_rate() == params.mark_sample_rate {
        wav
    } else {
        eprintln!(
            "Resampling {} Hz -> {} Hz...",
            wav.sample_rate(),
            params.mark_sample_rate
        );
        marca_core::resample(&wav, params.mark_sample_rate)
    }
}

/// Zero-pad a clip on both sides so a partial AB block pair can match.
fn pad_for_clip(params: &Params, wav: &WavData) -> WavData {
    let ch = wav.n_channels() as usize;
    let pad = params.block_frame_count() * params.frame_size * ch;
    let mut samples = vec![0.0f32; pad];
    samples.extend_from_slice(wav.samples());
    samples.resize(samples.len() + pad, 0.0);
    WavData::new(samples, wav.n_channels(), wav.sample_rate(), wav.bit_depth())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Add {
            input,
            output,
            payload,
            key,
            strength,
        } => {
            let params = Params {
                water_delta: strength,
                ..Params::default()
            };
            let wm_key = Key::from_passphrase(&key);
            let payload = parse_payload(&payload, params.payload_bits)?;

            let wav = to_mark_rate(&params, read_wav(&input)?);
            eprintln!(
                "Embedding watermark into {} ({:.1}s, {} channel(s))...",
                input.display(),
                wav.seconds(),
                wav.n_channels()
            );

            let block_samples =
                (params.frames_pad_start + params.block_frame_count()) * params.frame_size;
            if wav.n_frames() < block_samples {
                eprintln!(
                    "Warning: audio too short for a complete block; need at least {:.1}s.",
                    block_samples as f64 / params.mark_sample_rate as f64
                );
            }

            let marked = marca_core::embed(&params, &wm_key, &payload, &wav)?;
            write_wav(&output, &marked)?;
            eprintln!("Watermarked audio written to {}", output.display());
        }
        Command::Get {
            input,
            key,
            strength,
            clip,
            detect_speed,
            patient,
        } => {
            let params = Params {
                water_delta: strength,
                detect_speed_patient: patient,
                ..Params::default()
            };
            let wm_key = Key::from_passphrase(&key);
            let mut wav = to_mark_rate(&params, read_wav(&input)?);

            if detect_speed {
                let speeds = marca_core::detect_speed(&params, &[wm_key.clone()], &wav, false);
                if let Some(result) = speeds.first() {
                    eprintln!("Undoing detected speed drift: {:.4}", result.speed);
                    wav = marca_core::resample_ratio_truncate(
                        &wav,
                        result.speed,
                        params.mark_sample_rate,
                        f64::MAX,
                    );
                }
            }

            let (mode, search_wav) = if clip {
                (Mode::Clip, pad_for_clip(&params, &wav))
            } else {
                (Mode::Block, wav)
            };

            let mut finder = SyncFinder::new(&params);
            let results = finder.search(&[wm_key], &search_wav, mode);

            let mut found = 0;
            for result in &results {
                for score in &result.sync_scores {
                    let seconds =
                        score.index as f64 / (params.mark_sample_rate as f64);
                    let block_type = match score.block_type {
                        BlockType::A => "A",
                        BlockType::B => "B",
                    };
                    println!(
                        "sync {:>10}  {:8.3}s  type {}  quality {:.3}",
                        score.index, seconds, block_type, score.quality
                    );
                    if score.quality > params.sync_threshold2 {
                        found += 1;
                    }
                }
            }
            if found == 0 {
                eprintln!("No watermark detected.");
                std::process::exit(1);
            }
        }
        Command::Speed {
            input,
            key,
            strength,
            patient,
        } => {
            let params = Params {
                water_delta: strength,
                detect_speed_patient: patient,
                ..Params::default()
            };
            let wm_key = Key::from_passphrase(&key);
            let wav = to_mark_rate(&params, read_wav(&input)?);

            let results = marca_core::detect_speed(&params, &[wm_key], &wav, true);
            if results.is_empty() {
                eprintln!("No speed drift detected (or no watermark present).");
            } else {
                for result in &results {
                    println!("speed {:.6}", result.speed);
                }
            }
        }
    }

    Ok(())
}
