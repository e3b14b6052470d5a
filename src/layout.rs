//! Logical block address classification.
//!
//! Blocks below [`SYNTHETIC_BLOCKS`] are served from the static FAT image;
//! everything above maps linearly onto the reserved flash region, one block
//! per 512 bytes.

use crate::config::{
    BLOCK_SIZE, SLOT_BLOCKS, SLOT_COUNT, SLOT_REGION_OFFSET, SLOT_REGION_SIZE, SLOT_SIZE,
    SYNTHETIC_BLOCKS,
};
use crate::fat::SyntheticBlock;

/// Where the bytes of a logical block live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Region {
    /// One of the compile-time metadata blocks.
    Synthetic(SyntheticBlock),
    /// Flash-backed block starting at this absolute flash offset.
    Backing { address: u32 },
}

/// Index of an EEPROM slot (0-based; slot 0 is `EEPROM01.PME`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Slot(u8);

impl Slot {
    pub fn new(index: usize) -> Option<Self> {
        (index < SLOT_COUNT).then_some(Slot(index as u8))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Absolute flash offset of the slot image.
    pub fn flash_address(self) -> u32 {
        SLOT_REGION_OFFSET + self.0 as u32 * SLOT_SIZE as u32
    }
}

pub fn classify(lba: u32) -> Region {
    match SyntheticBlock::from_lba(lba) {
        Some(block) => Region::Synthetic(block),
        None => Region::Backing {
            address: SLOT_REGION_OFFSET
                .saturating_add((lba - SYNTHETIC_BLOCKS).saturating_mul(BLOCK_SIZE as u32)),
        },
    }
}

/// Slot whose 16-block window contains `lba`, if any.
pub fn slot_for(lba: u32) -> Option<Slot> {
    let rel = lba.checked_sub(SYNTHETIC_BLOCKS)?;
    Slot::new((rel / SLOT_BLOCKS) as usize)
}

/// First logical block of `slot`.
pub const fn slot_first_block(slot: usize) -> u32 {
    SYNTHETIC_BLOCKS + slot as u32 * SLOT_BLOCKS
}

/// Whether `[address, address + len)` lies entirely inside the slot region.
pub fn in_slot_region(address: u32, len: usize) -> bool {
    let end = SLOT_REGION_OFFSET + SLOT_REGION_SIZE;
    address >= SLOT_REGION_OFFSET && (address as u64 + len as u64) <= end as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_blocks_are_synthetic() {
        assert_eq!(classify(0), Region::Synthetic(SyntheticBlock::BootSector));
        assert_eq!(classify(1), Region::Synthetic(SyntheticBlock::Fat));
        assert_eq!(classify(2), Region::Synthetic(SyntheticBlock::RootDirectory));
    }

    #[test]
    fn backing_blocks_map_linearly() {
        assert_eq!(classify(3), Region::Backing { address: SLOT_REGION_OFFSET });
        assert_eq!(classify(4), Region::Backing { address: SLOT_REGION_OFFSET + 512 });
        assert_eq!(
            classify(19),
            Region::Backing { address: SLOT_REGION_OFFSET + 8192 }
        );
    }

    #[test]
    fn slots_cover_sixteen_blocks_each() {
        assert_eq!(slot_for(2), None);
        assert_eq!(slot_for(3).map(Slot::index), Some(0));
        assert_eq!(slot_for(18).map(Slot::index), Some(0));
        assert_eq!(slot_for(19).map(Slot::index), Some(1));
        assert_eq!(slot_for(50).map(Slot::index), Some(2));
        assert_eq!(slot_for(51), None);
        assert_eq!(slot_for(127), None);
    }

    #[test]
    fn slot_addresses_match_block_mapping() {
        for index in 0..SLOT_COUNT {
            let slot = Slot::new(index).unwrap();
            let Region::Backing { address } = classify(slot_first_block(index)) else {
                panic!("slot {} starts in synthetic region", index);
            };
            assert_eq!(address, slot.flash_address());
        }
        assert!(Slot::new(SLOT_COUNT).is_none());
    }

    #[test]
    fn region_bounds() {
        assert!(in_slot_region(SLOT_REGION_OFFSET, SLOT_REGION_SIZE as usize));
        assert!(!in_slot_region(SLOT_REGION_OFFSET + SLOT_REGION_SIZE, 1));
        assert!(!in_slot_region(SLOT_REGION_OFFSET - 1, 1));
        let Region::Backing { address } = classify(51) else { unreachable!() };
        assert!(!in_slot_region(address, 512));
    }
}
