//! Sync pattern generation.
//!
//! A watermark block interleaves sync frames and data frames; which frame
//! position serves which purpose, and which spectral bands encode each bit,
//! are deterministic functions of the key. The sync finder and the speed
//! detector both consume the pattern produced here.

use crate::config::Params;
use crate::key::{Key, Random, Stream};

/// Search mode.
///
/// `Block` looks for single A or B blocks on the encoder's grid. `Clip`
/// looks for AB (or BA) pairs in an arbitrary, silence-padded excerpt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Block,
    Clip,
}

/// Spectral footprint of one repetition of a sync bit: the frame it lives
/// in plus the up/down band sets (relative to `min_band`, both sorted,
/// equal length).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBit {
    pub frame: usize,
    pub up: Vec<u16>,
    pub down: Vec<u16>,
}

/// Draws the up/down band sets for a frame index from one of the key's
/// band streams.
pub struct UpDownGen<'a> {
    params: &'a Params,
    key: &'a Key,
    stream: Stream,
}

impl<'a> UpDownGen<'a> {
    pub fn new(params: &'a Params, key: &'a Key, stream: Stream) -> Self {
        Self {
            params,
            key,
            stream,
        }
    }

    /// Absolute band numbers: `bands_per_frame` up bands and as many down
    /// bands, all distinct, drawn from `[min_band, max_band]`.
    pub fn get(&self, index: usize) -> (Vec<u16>, Vec<u16>) {
        let mut rng = Random::new(self.key, index as u64, self.stream);
        let mut bands: Vec<u16> =
            (self.params.min_band as u16..=self.params.max_band as u16).collect();

        // partial Fisher-Yates: only the first 2 * bands_per_frame slots
        // are needed
        let need = self.params.bands_per_frame * 2;
        for i in 0..need {
            let j = i + (rng.next_u64() as usize) % (bands.len() - i);
            bands.swap(i, j);
        }

        let up = bands[..self.params.bands_per_frame].to_vec();
        let down = bands[self.params.bands_per_frame..need].to_vec();
        (up, down)
    }
}

/// Key-seeded assignment of block frame positions to sync and data slots.
///
/// A block has `block_frame_count()` frame positions; a shuffle driven by
/// the frame-order stream decides which positions carry sync bits and
/// which carry data bits, spreading both kinds across the whole block.
pub struct BitPosGen {
    sync_count: usize,
    positions: Vec<usize>,
}

impl BitPosGen {
    pub fn new(params: &Params, key: &Key) -> Self {
        let mut positions: Vec<usize> = (0..params.block_frame_count()).collect();
        let mut rng = Random::new(key, 0, Stream::FrameOrder);
        rng.shuffle(&mut positions);
        Self {
            sync_count: params.mark_sync_frame_count(),
            positions,
        }
    }

    /// Frame position of the i-th sync frame within a block.
    pub fn sync_frame(&self, i: usize) -> usize {
        self.positions[i]
    }

    /// Frame position of the i-th data frame within a block.
    pub fn data_frame(&self, i: usize) -> usize {
        self.positions[self.sync_count + i]
    }
}

/// Build the sync signature for a key.
///
/// Returns one `Vec<FrameBit>` per sync bit. In `Clip` mode every
/// repetition is emitted twice: once for the first block, and once shifted
/// by one block length with up/down swapped, so an A-then-B (or B-then-A)
/// pair scores coherently wherever the clip boundary falls.
pub fn get_sync_bits(params: &Params, key: &Key, mode: Mode) -> Vec<Vec<FrameBit>> {
    let first_block_end = params.block_frame_count();
    let block_count = if mode == Mode::Clip { 2 } else { 1 };
    let min_band = params.min_band as u16;

    let up_down_gen = UpDownGen::new(params, key, Stream::SyncUpDown);
    let bit_pos_gen = BitPosGen::new(params, key);

    let mut sync_bits = Vec::with_capacity(params.sync_bits);
    for bit in 0..params.sync_bits {
        let mut frame_bits = Vec::with_capacity(params.sync_frames_per_bit * block_count);
        for f in 0..params.sync_frames_per_bit {
            let index = f + bit * params.sync_frames_per_bit;
            let (frame_up, frame_down) = up_down_gen.get(index);

            for block in 0..block_count {
                // the second block copy detects the complementary block
                // type, so its polarity is inverted
                let (up_src, down_src) = if block == 0 {
                    (&frame_up, &frame_down)
                } else {
                    (&frame_down, &frame_up)
                };
                let mut up: Vec<u16> = up_src.iter().map(|u| u - min_band).collect();
                let mut down: Vec<u16> = down_src.iter().map(|d| d - min_band).collect();
                up.sort_unstable();
                down.sort_unstable();

                frame_bits.push(FrameBit {
                    frame: bit_pos_gen.sync_frame(index) + block * first_block_end,
                    up,
                    down,
                });
            }
        }
        frame_bits.sort_by_key(|fb| fb.frame);
        sync_bits.push(frame_bits);
    }
    sync_bits
}
