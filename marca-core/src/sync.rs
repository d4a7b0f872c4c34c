//! Sync search: locate watermark block boundaries in a possibly degraded
//! signal.
//!
//! The search runs in two stages. `search_approx` scans the whole signal
//! at a coarse stepping of `sync_search_step` samples, scoring every
//! candidate start position against the key's sync pattern. The surviving
//! candidates are then refined at `sync_search_fine` stepping.
//!
//! Block and clip decoding have similar but not identical needs, so both
//! run through this finder with their own [`Mode`]:
//!
//! * `Mode::Block` — search for full A or B blocks; candidates are
//!   selected by thresholds only; zero samples get no special treatment.
//! * `Mode::Clip` — search for an AB (or BA) block pair in an excerpt that
//!   the caller has zero-padded on both sides; at most `max(get_n_best, 5)`
//!   candidates survive, and frames inside the padding are skipped cheaply
//!   (no FFT) without affecting the score.
//!
//! Raw sync quality carries a key- and audio-dependent local bias, so a
//! local mean over nearby (but non-adjacent) scores is subtracted before
//! peak selection.

use std::sync::{Arc, Mutex};

use crate::config::Params;
use crate::fft::{self, MIN_DB, SpectrumFft};
use crate::key::Key;
use crate::pattern::{self, FrameBit, Mode};
use crate::pool::ThreadPool;
use crate::wav::WavData;

/// Neighbor radius (in coarse steps) for the local quality mean.
const LOCAL_MEAN_DISTANCE: usize = 20;

/// Watermark block polarity. The encoder alternates A and B blocks; B has
/// all up/down band roles inverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    A,
    B,
}

/// One detected sync position.
#[derive(Debug, Clone)]
pub struct Score {
    /// Sample index of the block start.
    pub index: usize,
    /// De-biased sync quality; roughly 1.0 for a clean block.
    pub quality: f64,
    pub block_type: BlockType,
}

/// All sync positions found for one key.
#[derive(Debug, Clone)]
pub struct KeyResult {
    pub key: Key,
    pub sync_scores: Vec<Score>,
}

#[derive(Debug, Clone, Copy)]
struct SearchScore {
    index: usize,
    raw_quality: f64,
    local_mean: f64,
}

impl SearchScore {
    fn abs_quality(&self) -> f64 {
        (self.raw_quality - self.local_mean).abs()
    }
}

pub struct SyncFinder {
    params: Params,
    n_threads: Option<usize>,
    // non-zero sample range: [wav_data_first, wav_data_last)
    wav_data_first: usize,
    wav_data_last: usize,
}

impl SyncFinder {
    /// Inconsistent parameters are a caller bug and fatal.
    pub fn new(params: &Params) -> Self {
        params.validate().expect("invalid parameters");
        Self {
            params: params.clone(),
            n_threads: None,
            wav_data_first: 0,
            wav_data_last: 0,
        }
    }

    /// Finder with an explicit worker count; results are identical for any
    /// count.
    pub fn with_threads(params: &Params, n_threads: usize) -> Self {
        Self {
            n_threads: Some(n_threads),
            ..Self::new(params)
        }
    }

    /// Build the sync signature for a key (see [`pattern::get_sync_bits`]).
    pub fn get_sync_bits(params: &Params, key: &Key, mode: Mode) -> Vec<Vec<FrameBit>> {
        pattern::get_sync_bits(params, key, mode)
    }

    /// Signed confidence that one sync bit was received as its expected
    /// value (sync bits alternate 0,1,0,1...).
    ///
    /// `umag`/`dmag` are the summed dB magnitudes of the bit's up and down
    /// bands. The conversion avoids bias: the result is symmetric around
    /// zero, inside [-1, 1], and zero when either magnitude sum is zero.
    ///
    /// Safe to call from any thread.
    pub fn bit_quality(umag: f32, dmag: f32, bit: usize) -> f64 {
        let expect_data_bit = bit & 1;

        let raw_bit = if umag == 0.0 || dmag == 0.0 {
            0.0
        } else if umag < dmag {
            1.0 - umag as f64 / dmag as f64
        } else {
            dmag as f64 / umag as f64 - 1.0
        };
        if expect_data_bit == 1 { raw_bit } else { -raw_bit }
    }

    /// Rescale raw sync quality so one threshold works for any watermark
    /// strength.
    ///
    /// This is an approximation: typical output is 1.0 or more for sync
    /// blocks and close to 0.0 elsewhere.
    ///
    /// Safe to call from any thread.
    pub fn normalize_sync_quality(params: &Params, raw_quality: f64) -> f64 {
        raw_quality / params.water_delta.min(0.080) / 2.9
    }

    /// Search for sync blocks of all keys in `wav_data`.
    pub fn search(&mut self, key_list: &[Key], wav_data: &WavData, mode: Mode) -> Vec<KeyResult> {
        if self.params.test_no_sync {
            return self.fake_sync(key_list, wav_data, mode);
        }

        if mode == Mode::Clip {
            // in clip mode we optimize handling large areas of padding
            // which is silent
            self.scan_silence(wav_data);
        } else {
            self.wav_data_first = 0;
            self.wav_data_last = wav_data.n_values();
        }

        let pool = match self.n_threads {
            Some(n) => ThreadPool::with_threads(n),
            None => ThreadPool::new(),
        };

        let sync_bits: Arc<Vec<Vec<Vec<FrameBit>>>> = Arc::new(
            key_list
                .iter()
                .map(|key| pattern::get_sync_bits(&self.params, key, mode))
                .collect(),
        );

        let mut key_scores = self.search_approx(&pool, key_list.len(), &sync_bits, wav_data, mode);

        let mut key_results = Vec::with_capacity(key_list.len());
        for (k, key) in key_list.iter().enumerate() {
            let scores = &mut key_scores[k];
            sync_select_local_maxima(scores);
            sync_mask_avg_false_positives(&self.params, scores);

            // select: threshold1 & at least n_best
            sync_select_threshold_and_n_best(&self.params, scores, self.params.sync_threshold1());

            if mode == Mode::Clip {
                // enforce a maximum number of matches: at most n_best but
                // at least 5
                let n_max = self.params.get_n_best.max(5);
                sync_select_truncate_n(scores, n_max);
            }

            let mut refined = self.search_refine(
                &pool,
                wav_data,
                mode,
                std::mem::take(scores),
                &sync_bits,
                k,
            );

            // select: threshold2 & at least n_best
            sync_select_threshold_and_n_best(&self.params, &mut refined, self.params.sync_threshold2);
            refined.sort_by_key(|s| s.index);

            let sync_scores = refined
                .iter()
                .map(|s| {
                    let q = s.raw_quality - s.local_mean;
                    Score {
                        index: s.index,
                        quality: q.abs(),
                        block_type: if q > 0.0 { BlockType::A } else { BlockType::B },
                    }
                })
                .collect();
            key_results.push(KeyResult {
                key: key.clone(),
                sync_scores,
            });
        }
        key_results
    }

    fn scan_silence(&mut self, wav_data: &WavData) {
        let samples = wav_data.samples();

        let mut first = 0;
        while first < samples.len() && samples[first] == 0.0 {
            first += 1;
        }
        let mut last = samples.len();
        while last > first && samples[last - 1] == 0.0 {
            last -= 1;
        }
        self.wav_data_first = first;
        self.wav_data_last = last;
    }

    fn search_approx(
        &self,
        pool: &ThreadPool,
        n_keys: usize,
        sync_bits: &Arc<Vec<Vec<Vec<FrameBit>>>>,
        wav_data: &WavData,
        mode: Mode,
    ) -> Vec<Vec<SearchScore>> {
        let params = &self.params;
        let n_bands = params.n_bands();
        let mut total_frame_count = params.block_frame_count();
        if mode == Mode::Clip {
            total_frame_count *= 2;
        }

        let results: Arc<Mutex<Vec<Vec<SearchScore>>>> =
            Arc::new(Mutex::new(vec![Vec::new(); n_keys]));

        // compute multiple time-shifted fft vectors
        for sync_shift in (0..params.frame_size).step_by(params.sync_search_step) {
            let (fft_db, have_frames) = self.sync_fft_parallel(pool, wav_data, sync_shift);
            let fft_db = Arc::new(fft_db);
            let have_frames = Arc::new(have_frames);

            let start_frames: Vec<usize> = (0..wav_data.n_frames() / params.frame_size)
                .filter(|start_frame| (start_frame + total_frame_count) * n_bands < fft_db.len())
                .collect();

            for k in 0..n_keys {
                // batch the candidates to keep scheduling overhead low
                for chunk in start_frames.chunks(256) {
                    let chunk = chunk.to_vec();
                    let params = params.clone();
                    let sync_bits = Arc::clone(sync_bits);
                    let fft_db = Arc::clone(&fft_db);
                    let have_frames = Arc::clone(&have_frames);
                    let results = Arc::clone(&results);
                    pool.add_job(move || {
                        let mut scores = Vec::with_capacity(chunk.len());
                        for start_frame in chunk {
                            let quality = sync_decode(
                                &params,
                                &sync_bits[k],
                                start_frame,
                                &fft_db,
                                &have_frames,
                            );
                            scores.push(SearchScore {
                                index: start_frame * params.frame_size + sync_shift,
                                raw_quality: quality,
                                // filled in after all search scores are ready
                                local_mean: 0.0,
                            });
                        }
                        results.lock().expect("results mutex poisoned")[k].extend(scores);
                    });
                }
            }
            pool.wait_all();
        }

        let mut key_scores = std::mem::take(&mut *results.lock().expect("results mutex poisoned"));
        for scores in &mut key_scores {
            scores.sort_by_key(|s| s.index);
            compute_local_means(scores);
        }
        key_scores
    }

    fn search_refine(
        &self,
        pool: &ThreadPool,
        wav_data: &WavData,
        mode: Mode,
        scores: Vec<SearchScore>,
        sync_bits: &Arc<Vec<Vec<Vec<FrameBit>>>>,
        k: usize,
    ) -> Vec<SearchScore> {
        let params = &self.params;
        let mut total_frame_count = params.block_frame_count();
        if mode == Mode::Clip {
            total_frame_count *= 2;
        }

        // only the pattern's sync frames matter here; skipping the data
        // frames saves about half of the FFTs
        let mut want_frames = vec![false; total_frame_count];
        for frame_bits in &sync_bits[k] {
            for fb in frame_bits {
                want_frames[fb.frame] = true;
            }
        }
        let want_frames = Arc::new(want_frames);

        let results: Arc<Mutex<Vec<SearchScore>>> =
            Arc::new(Mutex::new(Vec::with_capacity(scores.len())));
        let silence = (self.wav_data_first, self.wav_data_last);

        for score in scores {
            let params = params.clone();
            let wav_data = wav_data.clone();
            let sync_bits = Arc::clone(sync_bits);
            let want_frames = Arc::clone(&want_frames);
            let results = Arc::clone(&results);
            pool.add_job(move || {
                let mut best_quality = score.raw_quality;
                let mut best_index = score.index;

                let start = score.index.saturating_sub(params.sync_search_step);
                let end = score.index + params.sync_search_step;
                let mut fine_index = start;
                while fine_index <= end {
                    let (fft_db, have_frames) = sync_fft(
                        &params,
                        &wav_data,
                        fine_index,
                        total_frame_count,
                        Some(want_frames.as_slice()),
                        silence,
                    );
                    if !fft_db.is_empty() {
                        let q = sync_decode(&params, &sync_bits[k], 0, &fft_db, &have_frames);
                        if (q - score.local_mean).abs() > (best_quality - score.local_mean).abs() {
                            best_quality = q;
                            best_index = fine_index;
                        }
                    }
                    fine_index += params.sync_search_fine;
                }

                results.lock().expect("results mutex poisoned").push(SearchScore {
                    index: best_index,
                    raw_quality: best_quality,
                    local_mean: score.local_mean,
                });
            });
        }
        pool.wait_all();

        let mut refined = std::mem::take(&mut *results.lock().expect("results mutex poisoned"));
        refined.sort_by(|a, b| {
            a.index.cmp(&b.index).then_with(|| {
                b.abs_quality()
                    .partial_cmp(&a.abs_quality())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        });
        refined
    }

    /// Compute the parallel full-signal FFT starting at sample offset
    /// `index`; chunks of 256 frames run as pool jobs and are concatenated
    /// in original order.
    fn sync_fft_parallel(
        &self,
        pool: &ThreadPool,
        wav_data: &WavData,
        index: usize,
    ) -> (Vec<f32>, Vec<bool>) {
        const FRAMES_PER_JOB: usize = 256;

        let total_frames = wav_data.n_frames().saturating_sub(index) / self.params.frame_size;
        let results: Arc<Mutex<Vec<(usize, Vec<f32>, Vec<bool>)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let silence = (self.wav_data_first, self.wav_data_last);

        for start_frame in (0..total_frames).step_by(FRAMES_PER_JOB) {
            let frames = FRAMES_PER_JOB.min(total_frames - start_frame);
            let params = self.params.clone();
            let wav_data = wav_data.clone();
            let results = Arc::clone(&results);
            pool.add_job(move || {
                let (fft_db, have_frames) = sync_fft(
                    &params,
                    &wav_data,
                    index + start_frame * params.frame_size,
                    frames,
                    None,
                    silence,
                );
                results
                    .lock()
                    .expect("results mutex poisoned")
                    .push((start_frame, fft_db, have_frames));
            });
        }
        pool.wait_all();

        let mut partial = std::mem::take(&mut *results.lock().expect("results mutex poisoned"));
        partial.sort_by_key(|(start_frame, _, _)| *start_frame);

        let mut fft_db = Vec::with_capacity(total_frames * self.params.n_bands());
        let mut have_frames = Vec::with_capacity(total_frames);
        for (_, chunk_db, chunk_have) in partial {
            fft_db.extend(chunk_db);
            have_frames.extend(chunk_have);
        }
        (fft_db, have_frames)
    }

    /// Testing hook: report scores at the encoder's nominal block
    /// positions instead of searching.
    fn fake_sync(&self, key_list: &[Key], wav_data: &WavData, mode: Mode) -> Vec<KeyResult> {
        let params = &self.params;
        let mut result_scores = Vec::new();

        if mode == Mode::Block {
            let expect_step = params.block_frame_count() * params.frame_size;
            let expect_end = (wav_data.n_frames() / params.frame_size) * params.frame_size;

            let mut expect_index = params.frames_pad_start * params.frame_size;
            let mut ab = 0;
            while expect_index + expect_step < expect_end {
                result_scores.push(Score {
                    index: expect_index,
                    quality: 1.0,
                    block_type: if ab & 1 == 1 { BlockType::B } else { BlockType::A },
                });
                ab += 1;
                expect_index += expect_step;
            }
        }

        key_list
            .iter()
            .map(|key| KeyResult {
                key: key.clone(),
                sync_scores: result_scores.clone(),
            })
            .collect()
    }
}

/// Score one candidate start frame against a sync pattern.
///
/// Sums `bit_quality` over all frame bits, weighted by how many pattern
/// frames were actually present, and normalizes the result.
fn sync_decode(
    params: &Params,
    sync_bits: &[Vec<FrameBit>],
    start_frame: usize,
    fft_out_db: &[f32],
    have_frames: &[bool],
) -> f64 {
    let n_bands = params.n_bands();
    let mut sync_quality = 0.0;
    let mut bit_count = 0usize;

    for (bit, frame_bits) in sync_bits.iter().enumerate() {
        let mut umag = 0.0f32;
        let mut dmag = 0.0f32;
        let mut frame_bit_count = 0usize;

        for frame_bit in frame_bits {
            if have_frames[start_frame + frame_bit.frame] {
                let index = (start_frame + frame_bit.frame) * n_bands;
                for i in 0..frame_bit.up.len() {
                    umag += fft_out_db[index + frame_bit.up[i] as usize];
                    dmag += fft_out_db[index + frame_bit.down[i] as usize];
                }
                frame_bit_count += 1;
            }
        }
        sync_quality += SyncFinder::bit_quality(umag, dmag, bit) * frame_bit_count as f64;
        bit_count += frame_bit_count;
    }
    if bit_count > 0 {
        sync_quality /= bit_count as f64;
    }
    SyncFinder::normalize_sync_quality(params, sync_quality)
}

/// Windowed per-frame FFT over `frame_count` frames starting at sample
/// offset `index`, summed across channels into per-band dB values.
///
/// Frames that are not wanted, or that lie entirely inside the silent
/// padding, are left zero-filled with `have_frames[f] == false`. A request
/// that extends past the signal returns empty output.
fn sync_fft(
    params: &Params,
    wav_data: &WavData,
    index: usize,
    frame_count: usize,
    want_frames: Option<&[bool]>,
    silence_range: (usize, usize),
) -> (Vec<f32>, Vec<bool>) {
    let n_channels = wav_data.n_channels() as usize;

    // read past end? -> fail
    if wav_data.n_values() < (index + frame_count * params.frame_size) * n_channels {
        return (Vec::new(), Vec::new());
    }

    let (silence_first, silence_last) = silence_range;
    let n_bands = params.n_bands();
    let samples = wav_data.samples();
    let mut fft = SpectrumFft::new(params.frame_size);

    let mut fft_out_db = vec![0.0f32; n_bands * frame_count];
    let mut have_frames = vec![false; frame_count];

    for f in 0..frame_count {
        let f_first = (index + f * params.frame_size) * n_channels;
        let f_last = (index + (f + 1) * params.frame_size) * n_channels;

        if want_frames.is_some_and(|w| !w[f])     // frame not wanted?
            || f_last < silence_first             // frame in silence before input?
            || f_first > silence_last
        // frame in silence after input?
        {
            continue;
        }

        let out_pos = f * n_bands;
        let base = index + f * params.frame_size;
        for ch in 0..n_channels {
            let bins = fft.analyze_frame(samples, base, ch, n_channels);

            // computing db-magnitude is expensive, so do it once here
            for b in params.min_band..=params.max_band {
                fft_out_db[out_pos + b - params.min_band] += fft::db_from_complex(bins[b], MIN_DB);
            }
        }
        have_frames[f] = true;
    }
    (fft_out_db, have_frames)
}

/// Estimate the local bias of each score from its neighborhood.
///
/// Raw sync quality tends to sit above or below zero in whole regions of
/// the signal. Subtracting the local mean makes peaks stand out. The four
/// nearest neighbors on each side are excluded so a genuine peak does not
/// cancel itself.
fn compute_local_means(scores: &mut [SearchScore]) {
    let n = scores.len() as isize;
    let raw: Vec<f64> = scores.iter().map(|s| s.raw_quality).collect();

    for (i, score) in scores.iter_mut().enumerate() {
        let mut avg = 0.0;
        let mut count = 0usize;
        for j in -(LOCAL_MEAN_DISTANCE as isize)..=(LOCAL_MEAN_DISTANCE as isize) {
            if j.abs() >= 4 {
                let idx = i as isize + j;
                if idx >= 0 && idx < n {
                    avg += raw[idx as usize];
                    count += 1;
                }
            }
        }
        if count > 0 {
            avg /= count as f64;
        }
        score.local_mean = avg;
    }
}

fn sync_select_local_maxima(sync_scores: &mut Vec<SearchScore>) {
    let mut selected = Vec::new();

    let mut i = 0;
    while i < sync_scores.len() {
        let q = sync_scores[i].abs_quality();
        let q_last = if i > 0 {
            sync_scores[i - 1].abs_quality()
        } else {
            0.0
        };
        let q_next = if i + 1 < sync_scores.len() {
            sync_scores[i + 1].abs_quality()
        } else {
            0.0
        };

        if q >= q_last && q >= q_next {
            selected.push(sync_scores[i]);
            i += 1; // the score with quality q_next cannot be a local maximum
        }
        i += 1;
    }
    *sync_scores = selected;
}

/// Drop inverse ghost peaks created by the local-mean subtraction.
///
/// Around each strong peak, subtracting the local mean biases nearby
/// scores in the opposite direction. A peak is masked when a much stronger
/// peak of opposite sign sits within masking distance.
fn sync_mask_avg_false_positives(params: &Params, sync_scores: &mut Vec<SearchScore>) {
    const MASK_DISTANCE: usize = LOCAL_MEAN_DISTANCE + 3;
    const MASK_FACTOR: f64 = 3.0;

    let quality_sign = |score: &SearchScore| {
        if score.raw_quality - score.local_mean < 0.0 {
            -1
        } else {
            1
        }
    };

    let n = sync_scores.len() as isize;
    let mut out_scores = Vec::with_capacity(sync_scores.len());
    for i in 0..sync_scores.len() {
        let mut mask = false;

        // the real distance between two entries is larger than their index
        // distance, because sync_scores only contains the peaks
        for d in -(MASK_DISTANCE as isize)..=(MASK_DISTANCE as isize) {
            let j = i as isize + d;
            if j != i as isize && j >= 0 && j < n {
                let j = j as usize;
                let distance =
                    sync_scores[i].index.abs_diff(sync_scores[j].index) / params.sync_search_step;
                if distance <= MASK_DISTANCE
                    && sync_scores[j].abs_quality() > sync_scores[i].abs_quality() * MASK_FACTOR
                    && quality_sign(&sync_scores[j]) != quality_sign(&sync_scores[i])
                {
                    mask = true;
                }
            }
        }
        if !mask {
            out_scores.push(sync_scores[i]);
        }
    }
    *sync_scores = out_scores;
}

/// Keep all scores above `threshold`, but never fewer than `get_n_best`
/// (when that many exist).
fn sync_select_threshold_and_n_best(params: &Params, scores: &mut Vec<SearchScore>, threshold: f64) {
    sort_by_quality_desc(scores);

    let above = scores
        .iter()
        .take_while(|s| s.abs_quality() > threshold)
        .count();
    if above >= params.get_n_best {
        scores.truncate(above);
    } else {
        scores.truncate(params.get_n_best);
    }
}

fn sync_select_truncate_n(sync_scores: &mut Vec<SearchScore>, n: usize) {
    sort_by_quality_desc(sync_scores);
    sync_scores.truncate(n);
}

fn sort_by_quality_desc(scores: &mut [SearchScore]) {
    // the index tie-break keeps results identical across worker counts
    scores.sort_by(|a, b| {
        b.abs_quality()
            .partial_cmp(&a.abs_quality())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.index.cmp(&b.index))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(index: usize, raw: f64, mean: f64) -> SearchScore {
        SearchScore {
            index,
            raw_quality: raw,
            local_mean: mean,
        }
    }

    #[test]
    fn bit_quality_balanced_is_zero() {
        assert_eq!(SyncFinder::bit_quality(1.0, 1.0, 0), 0.0);
        assert_eq!(SyncFinder::bit_quality(1.0, 1.0, 1), 0.0);
    }

    #[test]
    fn bit_quality_zero_magnitudes() {
        assert_eq!(SyncFinder::bit_quality(0.0, 1.0, 1), 0.0);
        assert_eq!(SyncFinder::bit_quality(1.0, 0.0, 1), 0.0);
        assert_eq!(SyncFinder::bit_quality(0.0, 0.0, 0), 0.0);
    }

    #[test]
    fn bit_quality_ratio_values() {
        // down louder than up reads as a received 1 bit
        assert!((SyncFinder::bit_quality(0.5, 1.0, 1) - 0.5).abs() < 1e-12);
        assert!((SyncFinder::bit_quality(1.0, 0.5, 1) + 0.5).abs() < 1e-12);
    }

    #[test]
    fn bit_quality_symmetry() {
        for (u, d) in [(0.3f32, 0.9f32), (2.0, 1.0), (5.0, 5.0), (0.0, 1.0)] {
            let q0 = SyncFinder::bit_quality(u, d, 0);
            let q1 = SyncFinder::bit_quality(u, d, 1);
            assert_eq!(q0, -q1);
            assert!((-1.0..=1.0).contains(&q0));
        }
    }

    #[test]
    fn bit_quality_range_is_open_unit_interval() {
        // extreme ratios approach but never reach +/- 1
        let q = SyncFinder::bit_quality(1e-6, 1.0, 1);
        assert!(q > 0.999 && q < 1.0);
        let q = SyncFinder::bit_quality(1.0, 1e-6, 1);
        assert!(q < -0.999 && q > -1.0);
    }

    #[test]
    fn normalize_zero_and_monotonic() {
        let params = Params::default();
        assert_eq!(SyncFinder::normalize_sync_quality(&params, 0.0), 0.0);
        let a = SyncFinder::normalize_sync_quality(&params, 0.01);
        let b = SyncFinder::normalize_sync_quality(&params, 0.02);
        assert!(b > a && a > 0.0);
    }

    #[test]
    fn normalize_clamps_strength() {
        // strengths above 0.080 must not dilute the scale
        let strong = Params {
            water_delta: 0.5,
            ..Params::default()
        };
        let capped = Params {
            water_delta: 0.080,
            ..Params::default()
        };
        assert_eq!(
            SyncFinder::normalize_sync_quality(&strong, 0.1),
            SyncFinder::normalize_sync_quality(&capped, 0.1)
        );
    }

    #[test]
    fn local_mean_excludes_near_neighbors() {
        // single spike at position 10, zero elsewhere
        let mut scores: Vec<SearchScore> = (0..40)
            .map(|i| score(i * 256, if i == 10 { 1.0 } else { 0.0 }, 0.0))
            .collect();
        compute_local_means(&mut scores);

        // within +/-3 of the peak the spike must not contribute
        for i in 7..=13 {
            if i == 10 {
                continue;
            }
            assert_eq!(scores[i].local_mean, 0.0, "index {i}");
        }
        // outside the exclusion zone (but within distance 20) it must
        assert!(scores[14].local_mean > 0.0);
        assert!(scores[30].local_mean > 0.0);
        // and far away it must not
        assert_eq!(scores[31].local_mean, 0.0);
    }

    #[test]
    fn local_maxima_selection() {
        let mut scores = vec![
            score(0, 0.1, 0.0),
            score(256, 0.5, 0.0),
            score(512, 0.3, 0.0),
            score(768, 0.2, 0.0),
            score(1024, 0.8, 0.0),
            score(1280, 0.1, 0.0),
        ];
        sync_select_local_maxima(&mut scores);
        let indices: Vec<usize> = scores.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![256, 1024]);
    }

    #[test]
    fn mask_drops_opposite_sign_ghost() {
        // strong positive peak with a weak negative ghost right next to it
        let mut scores = vec![score(0, 1.0, 0.0), score(256, -0.2, 0.0)];
        sync_mask_avg_false_positives(&Params::default(), &mut scores);
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].index, 0);
    }

    #[test]
    fn mask_keeps_same_sign_neighbor() {
        let mut scores = vec![score(0, 1.0, 0.0), score(256, 0.2, 0.0)];
        sync_mask_avg_false_positives(&Params::default(), &mut scores);
        assert_eq!(scores.len(), 2);
    }

    #[test]
    fn mask_ignores_distant_ghost() {
        // same index distance in the scores vector, but far apart in samples
        let far = 24 * 256;
        let mut scores = vec![score(0, 1.0, 0.0), score(far, -0.2, 0.0)];
        sync_mask_avg_false_positives(&Params::default(), &mut scores);
        assert_eq!(scores.len(), 2);
    }

    #[test]
    fn threshold_keeps_all_above_or_n_best() {
        let params = Params {
            get_n_best: 2,
            ..Params::default()
        };
        // five scores above threshold 0.5 -> keep all five
        let mut scores: Vec<SearchScore> =
            (0..10).map(|i| score(i * 256, 0.95 - i as f64 * 0.1, 0.0)).collect();
        sync_select_threshold_and_n_best(&params, &mut scores, 0.5);
        assert_eq!(scores.len(), 5);

        // nothing above threshold -> still keep n_best
        let mut scores: Vec<SearchScore> =
            (0..10).map(|i| score(i * 256, 0.01 * i as f64, 0.0)).collect();
        sync_select_threshold_and_n_best(&params, &mut scores, 0.5);
        assert_eq!(scores.len(), 2);
    }

    #[test]
    fn sync_fft_rejects_out_of_range() {
        let params = Params::default();
        let wav = WavData::new(vec![0.1; 4096], 1, 44100, 16);
        let (fft_db, have) = sync_fft(&params, &wav, 0, 100, None, (0, 4096));
        assert!(fft_db.is_empty());
        assert!(have.is_empty());
    }

    #[test]
    fn sync_fft_zero_fills_unwanted_frames() {
        let params = Params::default();
        let samples: Vec<f32> = (0..8192).map(|i| ((i * 37) % 101) as f32 / 101.0 - 0.5).collect();
        let wav = WavData::new(samples, 1, 44100, 16);
        let want = vec![true, false, true, false];
        let (fft_db, have) = sync_fft(&params, &wav, 0, 4, Some(want.as_slice()), (0, 8192));
        let n_bands = params.n_bands();
        assert_eq!(have, vec![true, false, true, false]);
        assert!(fft_db[n_bands..2 * n_bands].iter().all(|&v| v == 0.0));
        assert!(fft_db[..n_bands].iter().any(|&v| v != 0.0));
    }

    #[test]
    fn sync_fft_skips_silent_padding() {
        let params = Params::default();
        let mut samples = vec![0.0f32; 8192];
        for (i, s) in samples.iter_mut().enumerate().skip(4096) {
            *s = ((i * 13) % 89) as f32 / 89.0 - 0.5;
        }
        let wav = WavData::new(samples, 1, 44100, 16);
        // frames 0..4 are fully inside the silent prefix
        let (_, have) = sync_fft(&params, &wav, 0, 8, None, (4096, 8192));
        assert_eq!(&have[..3], &[false, false, false]);
        assert!(have[4..].iter().all(|&h| h));
    }

    #[test]
    fn fake_sync_reports_block_grid() {
        let params = Params {
            test_no_sync: true,
            ..Params::default()
        };
        let key = Key::new(&[1u8; 16]).unwrap();
        // room for pad + 2 blocks and change
        let n_frames = (params.frames_pad_start + 2 * params.block_frame_count() + 10)
            * params.frame_size;
        let wav = WavData::new(vec![0.0; n_frames], 1, 44100, 16);

        let mut finder = SyncFinder::new(&params);
        let results = finder.search(&[key], &wav, Mode::Block);
        assert_eq!(results.len(), 1);
        let scores = &results[0].sync_scores;
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].index, params.frames_pad_start * params.frame_size);
        assert_eq!(scores[0].block_type, BlockType::A);
        assert_eq!(scores[1].block_type, BlockType::B);
        assert_eq!(
            scores[1].index - scores[0].index,
            params.block_frame_count() * params.frame_size
        );
    }

    #[test]
    #[should_panic(expected = "invalid parameters")]
    fn inconsistent_params_are_fatal() {
        let params = Params {
            sync_search_step: 300,
            ..Params::default()
        };
        let _ = SyncFinder::new(&params);
    }

    #[test]
    fn search_on_empty_signal_returns_no_scores() {
        let params = Params::default();
        let key = Key::new(&[1u8; 16]).unwrap();
        let wav = WavData::new(vec![0.0; 1024], 1, 44100, 16);
        let mut finder = SyncFinder::with_threads(&params, 2);
        let results = finder.search(&[key], &wav, Mode::Block);
        assert_eq!(results.len(), 1);
        assert!(results[0].sync_scores.is_empty());
    }
}
