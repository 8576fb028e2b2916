//! Target and space model: per-space block sizing, address transforms,
//! pluggable send-filter/checksum/empty-block behavior, and exclusion ranges.
//!
//! Spec §9 REDESIGN FLAGS calls for a tagged variant dispatching the three
//! pluggable shapes instead of first-class function values; `SpaceKind` is
//! that tagged enum, with `SpaceConfig` carrying the non-behavioral fields
//! (sizes, addressing, offsets, exclusion ranges).

use crate::crc;
use crate::hex::{Block, BlockStore, FILL_BYTE};

/// Which `send_filter` / `block_is_empty` family a space uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    /// Plain 4-byte-address-then-verbatim-block framing; all-0xFF emptiness.
    Simple,
    /// Microchip HMI/PIC24 framing: strips the phantom 4th byte of every
    /// 4-byte stride; PIC24-stride emptiness.
    HmiPic24,
}

/// Which whole-range checksum a space computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    /// Feed 0xFF for absent blocks, block bytes for present ones.
    Fill,
    /// Feed only present, non-empty blocks; absent/empty blocks contribute
    /// nothing (PIC16 tiny-bootloader semantics).
    NoFill,
    /// Always 0 (HMI application spaces are hexmate-balanced offline; see
    /// DESIGN.md Open Question).
    Zero,
}

/// What a space's `load_filter` does to the block store after parsing, once,
/// before CRC.
#[derive(Debug, Clone)]
pub enum LoadFilter {
    /// No post-parse mutation.
    Identity,
    /// Drop every block whose natural range falls inside an excluded range.
    ExcludeRanges(Vec<ExcludeRange>),
}

#[derive(Debug, Clone, Copy)]
pub struct ExcludeRange {
    pub start: u32,
    pub end: u32,
    pub exclude: bool,
}

/// Per-space parameters and pluggable behavior (spec §3 `SpaceConfig`).
#[derive(Debug, Clone)]
pub struct SpaceConfig {
    pub name: &'static str,
    pub kind: SpaceKind,
    pub checksum: ChecksumKind,
    /// Block size used when parsing the HEX file.
    pub hex_block: usize,
    /// Payload size actually framed per DATA command.
    pub send_block: usize,
    /// Bytes-per-address-unit: 1, or 2 for PIC24.
    pub addressing: u32,
    /// Value added to the natural block address before transmission.
    pub data_offset: i64,
    /// Whether empty blocks are dropped before transmission.
    pub skip_empty_blocks: bool,
    pub load_filter: LoadFilter,
    /// Per-space override of the target's select-to-reset delay.
    pub select_delay_ms: Option<u64>,
}

impl SpaceConfig {
    /// Packs the on-wire DATA payload for one retained block (§4.3).
    pub fn send_filter(&self, block_index: u32, block: &Block) -> Vec<u8> {
        let address = natural_address(block_index, block.len(), self.addressing, self.data_offset);
        match self.kind {
            SpaceKind::Simple => {
                let mut out = Vec::with_capacity(4 + block.len());
                out.extend_from_slice(&address.to_be_bytes());
                out.extend_from_slice(block.as_bytes());
                out
            }
            SpaceKind::HmiPic24 => {
                let mut out = Vec::with_capacity(4 + block.len() * 3 / 4);
                out.extend_from_slice(&address.to_be_bytes());
                for stride in block.as_bytes().chunks(4) {
                    let take = stride.len().min(3);
                    out.extend_from_slice(&stride[..take]);
                }
                out
            }
        }
    }

    /// Whole-range checksum over `[start, end)`, seeded with [`crc::SEED`]
    /// (§4.3). Must be computed before any empty-block filtering so it
    /// agrees with what the device computes.
    pub fn checksum(&self, start: u32, end: u32, blocks: &BlockStore) -> u16 {
        match self.checksum {
            ChecksumKind::Zero => 0,
            ChecksumKind::Fill => self.checksum_fill(start, end, blocks),
            ChecksumKind::NoFill => self.checksum_no_fill(start, end, blocks),
        }
    }

    fn checksum_fill(&self, start: u32, end: u32, blocks: &BlockStore) -> u16 {
        let hex_block = blocks.hex_block_size() as u32;
        let mut crc = crc::SEED;
        let mut addr = start - (start % hex_block);
        while addr < end {
            let index = addr / hex_block;
            match blocks.get(index) {
                Some(block) => {
                    for &b in block.as_bytes() {
                        crc = crc::update(crc, b);
                    }
                }
                None => {
                    for _ in 0..hex_block {
                        crc = crc::update(crc, FILL_BYTE);
                    }
                }
            }
            addr += hex_block;
        }
        crc
    }

    fn checksum_no_fill(&self, start: u32, end: u32, blocks: &BlockStore) -> u16 {
        let hex_block = blocks.hex_block_size() as u32;
        let mut crc = crc::SEED;
        let mut addr = start - (start % hex_block);
        while addr < end {
            let index = addr / hex_block;
            if let Some(block) = blocks.get(index) {
                if !self.block_is_empty(block) {
                    for &b in block.as_bytes() {
                        crc = crc::update(crc, b);
                    }
                }
            }
            addr += hex_block;
        }
        crc
    }

    /// True iff `block` reads back as erased flash for this space's kind (§4.3).
    pub fn block_is_empty(&self, block: &Block) -> bool {
        match self.kind {
            SpaceKind::Simple => block.is_all_ff(),
            SpaceKind::HmiPic24 => block.as_bytes().chunks(4).all(|stride| {
                let take = stride.len().min(3);
                stride[..take].iter().all(|&b| b == 0xFF)
            }),
        }
    }

    /// Runs this space's post-parse, pre-CRC mutation (§4.3).
    pub fn apply_load_filter(&self, blocks: &mut BlockStore) {
        if let LoadFilter::ExcludeRanges(ranges) = &self.load_filter {
            let hex_block = blocks.hex_block_size() as u32;
            for range in ranges {
                if !range.exclude {
                    continue;
                }
                let first = range.start / hex_block;
                let last = range.end / hex_block;
                for index in first..=last {
                    blocks.remove(index);
                }
            }
        }
    }
}

/// The address a block occupies on the wire, before any empty-block
/// filtering. Shared by `send_filter` (to frame the payload) and by the
/// engine's import pass (to decide whether a block falls inside
/// `[app_start, app_end)`), so the two always agree.
pub(crate) fn natural_address(block_index: u32, block_len: usize, addressing: u32, data_offset: i64) -> u32 {
    let addr = (block_index as u64) * (block_len as u64) / (addressing as u64);
    (addr as i64 + data_offset) as u32
}

/// Immutable per-target configuration: product identity, default phase
/// timeouts, and the ordered list of memory spaces the device exposes
/// (spec §3 `TargetConfig`).
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub product_code: ProductCode,
    pub product_type: u8,
    pub supports_passthru: bool,
    pub timeouts: PhaseTimeouts,
    pub enquire_retries: u32,
    pub data_retries: u32,
    pub spaces: Vec<SpaceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductCode {
    Any,
    Code(u8),
}

impl ProductCode {
    pub fn matches(&self, code: u8) -> bool {
        match self {
            ProductCode::Any => true,
            ProductCode::Code(c) => *c == code,
        }
    }
}

/// Default phase timeouts, in milliseconds, overridable per-space.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimeouts {
    pub enquire_ms: u64,
    pub select_ms: u64,
    pub erase_ms: u64,
    pub data_ms: u64,
    pub verify_ms: u64,
    pub finish_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hex::Block;

    fn simple_space() -> SpaceConfig {
        SpaceConfig {
            name: "test",
            kind: SpaceKind::Simple,
            checksum: ChecksumKind::Fill,
            hex_block: 64,
            send_block: 64,
            addressing: 1,
            data_offset: 0,
            skip_empty_blocks: true,
            load_filter: LoadFilter::Identity,
            select_delay_ms: None,
        }
    }

    #[test]
    fn simple_send_filter_shape() {
        let space = simple_space();
        let mut block = Block::new(64);
        block.as_bytes_mut().copy_from_slice(&[0x42; 64]);
        let payload = space.send_filter(2, &block);
        let expected_addr: u32 = 2 * 64 / 1;
        assert_eq!(&payload[0..4], &expected_addr.to_be_bytes());
        assert_eq!(&payload[4..], block.as_bytes());
    }

    #[test]
    fn hmi_send_filter_strips_fourth_byte() {
        let space = SpaceConfig {
            kind: SpaceKind::HmiPic24,
            checksum: ChecksumKind::Zero,
            addressing: 2,
            ..simple_space()
        };
        let mut block = Block::new(256);
        for (i, b) in block.as_bytes_mut().iter_mut().enumerate() {
            *b = (i % 4) as u8;
        }
        let payload = space.send_filter(0, &block);
        assert_eq!(payload.len(), 4 + (3 * 256 / 4));
    }

    #[test]
    fn fill_checksum_treats_absent_as_all_ff() {
        let space = simple_space();

        let mut present_as_ff = BlockStore::new(64);
        present_as_ff.write_for_test(0, &[0xFF; 64]);
        let crc_present_ff = space.checksum(0, 64, &present_as_ff);

        let absent = BlockStore::new(64);
        let crc_absent = space.checksum(0, 64, &absent);

        assert_eq!(crc_present_ff, crc_absent);
    }

    #[test]
    fn block_is_empty_agrees_with_fill_checksum() {
        let space = simple_space();
        let mut store = BlockStore::new(64);
        store.write_for_test(0, &[0xFF; 64]);
        let block = store.get(0).unwrap();
        assert!(space.block_is_empty(block));
    }

    #[test]
    fn no_fill_checksum_of_only_empty_blocks_is_seed() {
        let space = SpaceConfig {
            checksum: ChecksumKind::NoFill,
            ..simple_space()
        };
        let mut store = BlockStore::new(64);
        store.write_for_test(0, &[0xFF; 64]);
        assert_eq!(space.checksum(0, 64, &store), crc::SEED);
    }

    #[test]
    fn exclusion_removes_blocks_before_transmission() {
        let space = SpaceConfig {
            load_filter: LoadFilter::ExcludeRanges(vec![ExcludeRange {
                start: 0,
                end: 63,
                exclude: true,
            }]),
            ..simple_space()
        };
        let mut store = BlockStore::new(64);
        store.write_for_test(0, &[0x11; 64]);
        assert_eq!(store.block_count(), 1);
        space.apply_load_filter(&mut store);
        assert_eq!(store.block_count(), 0);
    }

    #[test]
    fn crc_round_trip_through_reserialized_hex() {
        use crate::hex::{parse, serialize_to_hex};
        use std::io::Cursor;

        let space = simple_space();
        let mut store = BlockStore::new(64);
        store.write_for_test(0, &[0x11; 64]);
        store.write_for_test(128, &[0x22; 64]);

        let original_crc = space.checksum(0, 192, &store);

        let text = serialize_to_hex(&store);
        let reparsed = parse(Cursor::new(text), 64).unwrap();
        let reparsed_crc = space.checksum(0, 192, &reparsed);

        assert_eq!(original_crc, reparsed_crc);
    }
}
