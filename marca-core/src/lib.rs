//! Audio watermarking engine: embed short keyed payloads into audio by
//! imperceptibly perturbing spectral magnitudes, and recover them from
//! degraded copies (transcoded, cropped, slightly sped up or slowed down).
//!
//! The decoder front-end is the heart of the crate: [`SyncFinder`] locates
//! watermark blocks in time, [`detect_speed`] estimates global
//! playback-speed drift, and [`resample_ratio_truncate`] undoes it before
//! the sync search runs.

pub mod config;
pub mod embed;
pub mod error;
pub mod fft;
pub mod key;
pub mod pattern;
pub mod pool;
pub mod resample;
pub mod speed;
pub mod sync;
pub mod wav;

// Re-export primary API types
pub use config::Params;
pub use embed::embed;
pub use error::{Error, Result};
pub use key::{Key, Random, Stream};
pub use pattern::{FrameBit, Mode};
pub use pool::{ThreadPool, split_jobs};
pub use resample::{resample, resample_ratio_truncate};
pub use speed::{DetectSpeedResult, detect_speed};
pub use sync::{BlockType, KeyResult, Score, SyncFinder};
pub use wav::WavData;
