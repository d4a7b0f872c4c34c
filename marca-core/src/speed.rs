//! Playback-speed detection.
//!
//! Estimates a global time-scale factor in roughly 0.8..1.25 so a
//! transcoded or slightly sped-up recording can be resampled back to the
//! canonical rate before sync search. The search is coarse-to-fine over a
//! geometric grid of candidate speeds:
//!
//! 1. scan1 sweeps the whole range around centers `step^(c*(2n+1))`,
//! 2. scan2 zooms into the N best peaks,
//! 3. scan3 sweeps densely around the single best match, and a smoothed
//!    maximum over the scan3 scores yields the final estimate.
//!
//! Each (key, center speed) pair owns a `SpeedSync`: a magnitude matrix
//! built once from a resampled clip (the expensive prepare phase) and then
//! compared against many nearby relative speeds (cheap search phase).
//! `split_jobs` batches prepares so at most a thread-pool's worth of
//! matrices is live at a time; each batch frees its matrices before the
//! next batch prepares.

use std::sync::{Arc, Mutex, RwLock};

use crate::config::Params;
use crate::fft::{self, MIN_DB, SpectrumFft};
use crate::key::{Key, Random, Stream};
use crate::pattern::{self, Mode};
use crate::pool::{ThreadPool, split_jobs};
use crate::resample::resample_ratio_truncate;
use crate::sync::SyncFinder;
use crate::wav::WavData;

/// Detected speed drift for one key.
#[derive(Debug, Clone)]
pub struct DetectSpeedResult {
    pub key: Key,
    pub speed: f64,
}

#[derive(Debug, Clone, Copy)]
struct SpeedScanParams {
    seconds: f64,
    step: f64,
    n_steps: i32,
    n_center_steps: i32,
}

#[derive(Debug, Clone, Copy, Default)]
struct SpeedScore {
    speed: f64,
    quality: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Mags {
    umag: f32,
    dmag: f32,
}

/// Column-major matrix of per-(frame step, sync bit) magnitude sums.
struct MagMatrix {
    data: Vec<Mags>,
    rows: usize,
}

impl MagMatrix {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            rows: 0,
        }
    }

    fn at(&self, row: usize, col: usize) -> Mags {
        self.data[col * self.rows + row]
    }

    fn set(&mut self, row: usize, col: usize, mags: Mags) {
        self.data[col * self.rows + row] = mags;
    }

    /// Contents are not preserved; shrinking releases the memory.
    fn resize(&mut self, rows: usize, cols: usize) {
        self.rows = rows;
        self.data = vec![Mags::default(); rows * cols];
    }

    fn rows(&self) -> usize {
        self.rows
    }
}

/// One repetition of a sync bit, flattened out of the block pattern.
struct SyncBit {
    bit: usize,
    frame: usize,
    up: Vec<u16>,
    down: Vec<u16>,
}

#[derive(Debug, Clone, Copy, Default)]
struct BitValue {
    umag: f32,
    dmag: f32,
    count: u32,
}

/// Accumulator for one candidate block-start offset. Offsets are stored in
/// 16.16 fixed point, pre-divided by the relative speed, so the inner loop
/// can address matrix rows with a shift instead of a float multiply.
struct CmpState {
    offset: i64,
    bit_values: Vec<BitValue>,
}

const OFFSET_SHIFT: u32 = 16;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// The three job phases of one `SpeedSync`.
struct SpeedJobs {
    prepare: Job,
    search_jobs: Vec<Job>,
    free_memory: Job,
}

/// Sync-quality evaluation of one clip at one center speed.
///
/// The magnitude matrix is written by the prepare job, read concurrently
/// by the search jobs, and released by `free_memory`; the surrounding
/// batching guarantees the phases never overlap.
struct SpeedSync {
    params: Params,
    clip_data: WavData,
    center: f64,
    frames_per_block: usize,
    sync_bits: Vec<SyncBit>,
    sync_matrix: RwLock<MagMatrix>,
    result_scores: Mutex<Vec<SpeedScore>>,
}

impl SpeedSync {
    fn new(params: &Params, key: &Key, clip_data: WavData, center: f64) -> Self {
        // runs on the main thread; everything that is not thread-safe
        // happens here
        let mut sync_bits = Vec::new();
        for (bit, frame_bits) in pattern::get_sync_bits(params, key, Mode::Block)
            .iter()
            .enumerate()
        {
            for fb in frame_bits {
                sync_bits.push(SyncBit {
                    bit,
                    frame: fb.frame,
                    up: fb.up.clone(),
                    down: fb.down.clone(),
                });
            }
        }
        sync_bits.sort_by_key(|sb| sb.frame);

        Self {
            params: params.clone(),
            clip_data,
            center,
            frames_per_block: params.block_frame_count(),
            sync_bits,
            sync_matrix: RwLock::new(MagMatrix::new()),
            result_scores: Mutex::new(Vec::new()),
        }
    }

    fn center_speed(&self) -> f64 {
        self.center
    }

    fn scores(&self) -> Vec<SpeedScore> {
        self.result_scores
            .lock()
            .expect("scores mutex poisoned")
            .clone()
    }

    fn get_jobs(this: &Arc<Self>, scan: SpeedScanParams, speed: f64) -> SpeedJobs {
        this.result_scores
            .lock()
            .expect("scores mutex poisoned")
            .clear();

        let prepare_self = Arc::clone(this);
        let prepare: Job = Box::new(move || prepare_self.prepare_mags(&scan));

        let mut search_jobs: Vec<Job> = Vec::new();
        for p in -scan.n_steps..=scan.n_steps {
            let relative_speed = scan.step.powi(p) * speed / this.center;
            let search_self = Arc::clone(this);
            search_jobs.push(Box::new(move || search_self.compare(relative_speed)));
        }

        let free_self = Arc::clone(this);
        let free_memory: Job = Box::new(move || {
            free_self
                .sync_matrix
                .write()
                .expect("matrix lock poisoned")
                .resize(0, 0);
        });

        SpeedJobs {
            prepare,
            search_jobs,
            free_memory,
        }
    }

    /// Build the magnitude matrix for this center speed.
    ///
    /// The clip is resampled as if its true speed were `center`, at half
    /// the canonical rate to cut the FFT cost, then a sub-frame FFT runs
    /// every half search step and each sync bit's up/down band sums are
    /// stored per column.
    fn prepare_mags(&self, scan: &SpeedScanParams) {
        let params = &self.params;
        let sub = resample_ratio_truncate(
            &self.clip_data,
            self.center,
            params.mark_sample_rate / 2,
            scan.seconds / self.center,
        );

        let sub_frame_size = params.frame_size / 2;
        let sub_sync_search_step = params.sync_search_step / 2;
        let mut fft_proc = SpectrumFft::new(sub_frame_size);

        let n_channels = sub.n_channels() as usize;
        let samples = sub.samples();
        let n_bands = params.n_bands();

        let mut n_rows = 0usize;
        let mut ppos = 0usize;
        while ppos + sub_frame_size < sub.n_frames() {
            n_rows += 1;
            ppos += sub_sync_search_step;
        }

        let mut matrix = self.sync_matrix.write().expect("matrix lock poisoned");
        matrix.resize(n_rows, self.sync_bits.len());

        let mut fft_out_db = vec![0.0f32; n_bands];
        let mut pos = 0usize;
        let mut row = 0usize;
        while pos + sub_frame_size < sub.n_frames() {
            fft_out_db.fill(0.0);
            for ch in 0..n_channels {
                let bins = fft_proc.analyze_frame(samples, pos, ch, n_channels);
                for b in params.min_band..=params.max_band {
                    fft_out_db[b - params.min_band] += fft::db_from_complex(bins[b], MIN_DB);
                }
            }

            for (col, sync_bit) in self.sync_bits.iter().enumerate() {
                let mut umag = 0.0f32;
                let mut dmag = 0.0f32;
                for i in 0..sync_bit.up.len() {
                    umag += fft_out_db[sync_bit.up[i] as usize];
                    dmag += fft_out_db[sync_bit.down[i] as usize];
                }
                matrix.set(row, col, Mags { umag, dmag });
            }
            row += 1;
            pos += sub_sync_search_step;
        }
        debug_assert_eq!(row, n_rows);
    }

    /// Score one relative speed against the prepared matrix and record the
    /// best (speed, quality) over all block-start offsets.
    fn compare(&self, relative_speed: f64) {
        let params = &self.params;
        let steps_per_frame = params.frame_size / params.sync_search_step;
        // one extra frame of overlap to handle boundaries
        let pad_start = self.frames_per_block * steps_per_frame + steps_per_frame;

        let matrix = self.sync_matrix.read().expect("matrix lock poisoned");

        let mut cmp_states: Vec<CmpState> = Vec::with_capacity(pad_start);
        for offset in -(pad_start as i64)..0 {
            cmp_states.push(CmpState {
                offset: (offset as f64 * ((1u64 << OFFSET_SHIFT) as f64 / relative_speed)) as i64,
                bit_values: vec![BitValue::default(); params.sync_bits],
            });
        }

        // three consecutive blocks: one because every offset in
        // (-pad_start, 0] must be tested, two more because the scan window
        // is longer than a single block
        for block in 0..3 {
            self.compare_bits(&matrix, &mut cmp_states, block, relative_speed);
        }

        let mut best_score = SpeedScore::default();
        for cs in &cmp_states {
            let mut sync_quality = 0.0f64;
            let mut bit_count = 0u64;

            for (bit, bv) in cs.bit_values.iter().enumerate() {
                sync_quality += SyncFinder::bit_quality(bv.umag, bv.dmag, bit) * bv.count as f64;
                bit_count += bv.count as u64;
            }
            if bit_count > 0 {
                sync_quality /= bit_count as f64;
                sync_quality = SyncFinder::normalize_sync_quality(params, sync_quality).abs();

                if sync_quality > best_score.quality {
                    best_score.quality = sync_quality;
                    best_score.speed = relative_speed * self.center;
                }
            }
        }

        self.result_scores
            .lock()
            .expect("scores mutex poisoned")
            .push(best_score);
    }

    fn compare_bits(
        &self,
        matrix: &MagMatrix,
        cmp_states: &mut [CmpState],
        block: usize,
        relative_speed: f64,
    ) {
        let params = &self.params;
        let steps_per_frame = params.frame_size / params.sync_search_step;
        let relative_speed_inv = 1.0 / relative_speed;
        let rows = matrix.rows() as i64;

        let mut begin = cmp_states.len();
        let mut end = cmp_states.len();
        for (mi, sync_bit) in self.sync_bits.iter().enumerate() {
            // + 0.5 steps so the shift below rounds to the nearest row
            let frame_offset = ((((block * self.frames_per_block + sync_bit.frame)
                * steps_per_frame) as f64
                * relative_speed_inv
                + 0.5)
                * (1u64 << OFFSET_SHIFT) as f64) as i64;

            // sync bits are sorted by frame, so both boundaries only ever
            // move left: amortized O(n) over all bits
            while begin > 0 {
                // unshifted check: the offset must be positive so the
                // shifted value rounds to a valid row
                let index = cmp_states[begin - 1].offset + frame_offset;
                if index < 0 {
                    break;
                }
                begin -= 1;
            }
            while end > 0 {
                let index = (cmp_states[end - 1].offset + frame_offset) >> OFFSET_SHIFT;
                if index < rows {
                    break;
                }
                end -= 1;
            }

            for cs in &mut cmp_states[begin..end] {
                let index = ((cs.offset + frame_offset) >> OFFSET_SHIFT) as usize;
                let mags = matrix.at(index, mi);
                let bv = &mut cs.bit_values[sync_bit.bit];
                if block & 1 == 1 {
                    // odd blocks are B blocks: polarity inverted
                    bv.umag += mags.dmag;
                    bv.dmag += mags.umag;
                } else {
                    bv.umag += mags.umag;
                    bv.dmag += mags.dmag;
                }
                bv.count += 1;
            }
        }
    }
}

/// Per-key speed search state across the three scan passes.
struct SpeedSearch {
    in_data: WavData,
    clip_location: f64,
    speed_sync: Vec<Arc<SpeedSync>>,
}

impl SpeedSearch {
    fn new(in_data: WavData, clip_location: f64) -> Self {
        Self {
            in_data,
            clip_location,
            speed_sync: Vec::new(),
        }
    }

    fn get_jobs(
        &mut self,
        params: &Params,
        key: &Key,
        scan: SpeedScanParams,
        speeds: &[f64],
    ) -> Vec<SpeedJobs> {
        // speed is between 0.8 and 1.25, so a clip factor of 1.3 provides
        // enough samples for every center
        let clipped = get_speed_clip(self.clip_location, &self.in_data, scan.seconds * 1.3);

        self.speed_sync.clear();
        for &speed in speeds {
            for c in -scan.n_center_steps..=scan.n_center_steps {
                let c_speed = speed * scan.step.powi(c * (scan.n_steps * 2 + 1));
                self.speed_sync
                    .push(Arc::new(SpeedSync::new(params, key, clipped.clone(), c_speed)));
            }
        }

        self.speed_sync
            .iter()
            .map(|s| SpeedSync::get_jobs(s, scan, s.center_speed()))
            .collect()
    }

    fn results(&self) -> Vec<SpeedScore> {
        self.speed_sync.iter().flat_map(|s| s.scores()).collect()
    }
}

fn get_speed_clip(location: f64, in_data: &WavData, clip_seconds: f64) -> WavData {
    let end_sec = in_data.n_frames() as f64 / in_data.sample_rate() as f64;
    let start_sec = (location * (end_sec - clip_seconds)).max(0.0);

    let start_point = (start_sec * in_data.sample_rate() as f64) as usize;
    let end_point = (start_point + (clip_seconds * in_data.sample_rate() as f64) as usize)
        .min(in_data.n_frames());
    in_data.extract(start_point, end_point)
}

/// Deterministic candidate clip locations in [0, 1).
///
/// The stream is re-seeded from a hash over a sparse sample subset, so the
/// chosen locations depend on the audio content as well as the key.
fn get_clip_locations(key: &Key, in_data: &WavData, n: usize) -> Vec<f64> {
    let mut rng = Random::new(key, 0, Stream::SpeedClip);

    // hashing every sample would be wasteful; walk with random strides
    let samples = in_data.samples();
    let mut xsamples = Vec::new();
    let mut p = 0usize;
    while p < samples.len() {
        xsamples.push(samples[p]);
        p += ((rng.next_u64() % 1000) as usize).max(1);
    }
    rng.reseed(Random::seed_from_hash(&xsamples), Stream::SpeedClip);

    (0..n).map(|_| rng.random_double()).collect()
}

/// Of `candidates` possible clip locations, pick the one with the highest
/// signal energy, so no scan pass is wasted on silence.
fn get_best_clip_location(key: &Key, in_data: &WavData, seconds: f64, candidates: usize) -> f64 {
    let mut clip_location = 0.0;
    let mut best_energy = 0.0;

    for location in get_clip_locations(key, in_data, candidates) {
        let wd = get_speed_clip(location, in_data, seconds);

        let energy: f64 = wd.samples().iter().map(|s| *s as f64 * *s as f64).sum();
        if energy > best_energy {
            best_energy = energy;
            clip_location = location;
        }
    }
    clip_location
}

fn window_cos(x: f64) -> f64 {
    if x.abs() > 1.0 {
        0.0
    } else {
        ((x * std::f64::consts::PI).cos() + 1.0) * 0.5
    }
}

/// Find the best speed from noisy scan scores.
///
/// The raw local maximum is unreliable, so the scores are smoothed with a
/// raised-cosine window and the maximum of the smoothed curve is located
/// on a 1e-6 speed grid.
fn score_smooth_find_best(in_scores: &[SpeedScore], step: f64, distance: f64) -> f64 {
    let mut scores = in_scores.to_vec();
    scores.sort_by(|a, b| a.speed.partial_cmp(&b.speed).unwrap_or(std::cmp::Ordering::Equal));
    let Some(first) = scores.first() else {
        return 0.0;
    };
    let last_speed = scores[scores.len() - 1].speed;

    let mut best_speed = 0.0;
    let mut best_quality = 0.0;

    let mut speed = first.speed;
    while speed < last_speed {
        let mut quality_sum = 0.0;
        let mut quality_div = 0.0;

        for s in &scores {
            let w = window_cos((s.speed - speed) / (step * distance));
            quality_sum += s.quality * w;
            quality_div += w;
        }
        if quality_div > 0.0 {
            quality_sum /= quality_div;
            if quality_sum > best_quality {
                best_quality = quality_sum;
                best_speed = speed;
            }
        }
        speed += 0.000001;
    }
    best_speed
}

/// Keep the `n` best local maxima of the speed-sorted score list.
fn select_n_best_scores(scores: &mut Vec<SpeedScore>, n: usize) {
    scores.sort_by(|a, b| a.speed.partial_cmp(&b.speed).unwrap_or(std::cmp::Ordering::Equal));

    let get_quality = |pos: isize| -> f64 {
        if pos >= 0 && (pos as usize) < scores.len() {
            scores[pos as usize].quality
        } else {
            0.0
        }
    };

    let mut lmax_scores = Vec::new();
    let mut x = 0usize;
    while x < scores.len() {
        // single peak: the middle value beats both neighbours
        // double peak: two equal values beat both outer neighbours
        let q1 = get_quality(x as isize - 1);
        let q2 = get_quality(x as isize);
        let q3 = get_quality(x as isize + 1);

        if q1 <= q2 && q2 >= q3 {
            lmax_scores.push(scores[x]);
            x += 1; // the score with quality q3 cannot be a local maximum
        }
        x += 1;
    }

    lmax_scores.sort_by(|a, b| {
        b.quality
            .partial_cmp(&a.quality)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.speed.partial_cmp(&b.speed).unwrap_or(std::cmp::Ordering::Equal))
    });
    lmax_scores.truncate(n);
    *scores = lmax_scores;
}

struct KeySpeedSearch {
    key: Key,
    search: SpeedSearch,
    scores: Vec<SpeedScore>,
}

/// Detect playback-speed drift for each key.
///
/// Returns only keys whose best estimate deviates from 1.0 by more than
/// 0.0001 and clears the quality threshold; everything else decodes fine
/// without stretching. Signals shorter than 0.25 s yield no results.
/// Inconsistent parameters are a caller bug and fatal.
pub fn detect_speed(
    params: &Params,
    key_list: &[Key],
    in_data: &WavData,
    print_results: bool,
) -> Vec<DetectSpeedResult> {
    params.validate().expect("invalid parameters");

    let mut results = Vec::new();

    // even strong watermarks need a few seconds of audio; really short
    // input cannot work at all
    if in_data.seconds() < 0.25 {
        return results;
    }

    // first pass: find an approximation, speed roughly 0.8..1.25
    let scan1 = if params.detect_speed_patient {
        SpeedScanParams {
            seconds: 50.0,
            step: 1.00035,
            n_steps: 11,
            n_center_steps: 28,
        }
    } else {
        SpeedScanParams {
            seconds: 25.0,
            step: 1.0007,
            n_steps: 5,
            n_center_steps: 28,
        }
    };

    // second pass: improve the approximation
    let scan2 = if params.detect_speed_patient {
        SpeedScanParams {
            seconds: 50.0,
            step: 1.000175,
            n_steps: 1,
            n_center_steps: 0,
        }
    } else {
        SpeedScanParams {
            seconds: 50.0,
            step: 1.00035,
            n_steps: 1,
            n_center_steps: 0,
        }
    };

    // third pass: fast dense refine (not always perfect)
    let scan3 = SpeedScanParams {
        seconds: 50.0,
        step: 1.00005,
        n_steps: 40,
        n_center_steps: 0,
    };
    let scan3_smooth_distance = 20.0;
    let speed_sync_threshold = 0.4;
    let n_best = if params.detect_speed_patient { 15 } else { 5 };
    let clip_candidates = 5;

    let mut searches: Vec<KeySpeedSearch> = key_list
        .iter()
        .map(|key| {
            let clip_location =
                get_best_clip_location(key, in_data, scan1.seconds, clip_candidates);
            KeySpeedSearch {
                key: key.clone(),
                search: SpeedSearch::new(in_data.clone(), clip_location),
                scores: Vec::new(),
            }
        })
        .collect();

    let pool = ThreadPool::new();

    let run_search =
        |searches: &mut Vec<KeySpeedSearch>,
         scan: SpeedScanParams,
         get_speeds: &dyn Fn(&mut KeySpeedSearch) -> Vec<f64>| {
            let mut jobs: Vec<SpeedJobs> = Vec::new();
            for ks in searches.iter_mut() {
                let speeds = get_speeds(ks);
                jobs.extend(ks.search.get_jobs(params, &ks.key, scan, &speeds));
            }

            let mut job_iter = jobs.into_iter();
            for count in split_jobs(job_iter.len(), pool.n_threads()) {
                let batch: Vec<SpeedJobs> = job_iter.by_ref().take(count).collect();

                let mut batch_searches = Vec::with_capacity(batch.len());
                let mut batch_frees = Vec::with_capacity(batch.len());
                for job in batch {
                    pool.add_job(job.prepare);
                    batch_searches.push(job.search_jobs);
                    batch_frees.push(job.free_memory);
                }
                pool.wait_all();

                for search_jobs in batch_searches {
                    for job in search_jobs {
                        pool.add_job(job);
                    }
                }
                pool.wait_all();

                // release the magnitude matrices before the next batch
                // prepares its own
                for free in batch_frees {
                    free();
                }
            }

            for ks in searches.iter_mut() {
                ks.scores = ks.search.results();
            }
        };

    // initial search using the full grid
    run_search(&mut searches, scan1, &|_: &mut KeySpeedSearch| vec![1.0]);

    // improve the N best matches
    run_search(&mut searches, scan2, &|ks: &mut KeySpeedSearch| {
        select_n_best_scores(&mut ks.scores, n_best);
        ks.scores.iter().map(|s| s.speed).collect()
    });

    // improve the best match
    for ks in searches.iter_mut() {
        select_n_best_scores(&mut ks.scores, 1);
    }
    run_search(&mut searches, scan3, &|ks: &mut KeySpeedSearch| {
        ks.scores.first().map(|s| vec![s.speed]).unwrap_or_default()
    });

    for ks in &searches {
        if ks.scores.is_empty() {
            continue;
        }
        let best_speed = score_smooth_find_best(&ks.scores, 1.0 - scan3.step, scan3_smooth_distance);
        let best_quality = ks.scores.iter().fold(0.0f64, |acc, s| acc.max(s.quality));

        if print_results {
            println!("detect_speed {best_speed:.6} {best_quality:.6}");
        }

        if best_quality > speed_sync_threshold {
            // speeds closer to 1.0 than this decode fine without stretching
            if best_speed < 0.9999 || best_speed > 1.0001 {
                results.push(DetectSpeedResult {
                    key: ks.key.clone(),
                    speed: best_speed,
                });
            }
        }
    }
    results
}
