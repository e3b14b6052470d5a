//! Synthetic FAT12 volume: boot sector, FAT and root directory.
//!
//! The three metadata blocks are built by `const fn` at compile time and never
//! change at runtime. They describe one file per EEPROM slot, laid out so the
//! first data sector of file `n` is exactly the first block of slot `n`:
//!
//! ```text
//! block 0        boot sector
//! block 1        FAT (single copy)
//! block 2        root directory (16 entries)
//! block 3..19    EEPROM01.PME  clusters 2..=5
//! block 19..35   EEPROM02.PME  clusters 6..=9
//! block 35..51   EEPROM03.PME  clusters 10..=13
//! ```

use crate::config::{BLOCK_COUNT, BLOCK_SIZE, SLOT_COUNT, SLOT_SIZE, SYNTHETIC_BLOCKS};

pub const SECTORS_PER_CLUSTER: u8 = 4;
pub const RESERVED_SECTORS: u16 = 1;
pub const FAT_COUNT: u8 = 1;
pub const SECTORS_PER_FAT: u16 = 1;
pub const ROOT_ENTRIES: u16 = 16;
pub const MEDIA_DESCRIPTOR: u8 = 0xF8;
pub const VOLUME_SERIAL: u32 = 0x1234;

/// Volume label, used by both the boot sector and the root directory.
pub const VOLUME_LABEL: [u8; 11] = *b"PM2040     ";

pub const CLUSTER_SIZE: usize = SECTORS_PER_CLUSTER as usize * BLOCK_SIZE;
pub const CLUSTERS_PER_SLOT: u16 = (SLOT_SIZE / CLUSTER_SIZE) as u16;

/// First cluster number of the data area.
pub const FIRST_DATA_CLUSTER: u16 = 2;

const DIR_ENTRY_SIZE: usize = 32;
const ATTR_ARCHIVE: u8 = 0x20;
const ATTR_VOLUME_ID: u8 = 0x08;
const FAT12_EOC: u16 = 0xFFF;

/// Fixed timestamp stamped on every directory entry: 2024-01-01 12:00:00.
const DIR_DATE: u16 = fat_date(2024, 1, 1);
const DIR_TIME: u16 = fat_time(12, 0, 0);

// The slot data must start right after the metadata blocks.
const _: () = assert!(
    RESERVED_SECTORS as u32
        + FAT_COUNT as u32 * SECTORS_PER_FAT as u32
        + (ROOT_ENTRIES as u32 * DIR_ENTRY_SIZE as u32) / BLOCK_SIZE as u32
        == SYNTHETIC_BLOCKS
);
const _: () = assert!(CLUSTERS_PER_SLOT as usize * CLUSTER_SIZE == SLOT_SIZE);
const _: () = assert!(SLOT_COUNT + 1 <= ROOT_ENTRIES as usize);

// =============================================================================
// Metadata blocks
// =============================================================================

/// Identifies one of the three synthetic metadata blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyntheticBlock {
    BootSector,
    Fat,
    RootDirectory,
}

impl SyntheticBlock {
    pub fn from_lba(lba: u32) -> Option<Self> {
        match lba {
            0 => Some(SyntheticBlock::BootSector),
            1 => Some(SyntheticBlock::Fat),
            2 => Some(SyntheticBlock::RootDirectory),
            _ => None,
        }
    }

    /// Static contents of this block.
    pub fn bytes(self) -> &'static [u8; BLOCK_SIZE] {
        match self {
            SyntheticBlock::BootSector => &BOOT_SECTOR,
            SyntheticBlock::Fat => &FAT_TABLE,
            SyntheticBlock::RootDirectory => &ROOT_DIRECTORY,
        }
    }
}

pub static BOOT_SECTOR: [u8; BLOCK_SIZE] = boot_sector();
pub static FAT_TABLE: [u8; BLOCK_SIZE] = fat_table();
pub static ROOT_DIRECTORY: [u8; BLOCK_SIZE] = root_directory();

/// First cluster of the file backing `slot`.
pub const fn slot_first_cluster(slot: usize) -> u16 {
    FIRST_DATA_CLUSTER + slot as u16 * CLUSTERS_PER_SLOT
}

// =============================================================================
// Builders
// =============================================================================

const fn put_bytes<const N: usize>(
    mut block: [u8; BLOCK_SIZE],
    at: usize,
    bytes: &[u8; N],
) -> [u8; BLOCK_SIZE] {
    let mut i = 0;
    while i < N {
        block[at + i] = bytes[i];
        i += 1;
    }
    block
}

const fn boot_sector() -> [u8; BLOCK_SIZE] {
    let mut b = [0u8; BLOCK_SIZE];
    b = put_bytes(b, 0, &[0xEB, 0x3C, 0x90]);
    b = put_bytes(b, 3, b"MSDOS5.0");
    b = put_bytes(b, 11, &(BLOCK_SIZE as u16).to_le_bytes());
    b[13] = SECTORS_PER_CLUSTER;
    b = put_bytes(b, 14, &RESERVED_SECTORS.to_le_bytes());
    b[16] = FAT_COUNT;
    b = put_bytes(b, 17, &ROOT_ENTRIES.to_le_bytes());
    b = put_bytes(b, 19, &(BLOCK_COUNT as u16).to_le_bytes());
    b[21] = MEDIA_DESCRIPTOR;
    b = put_bytes(b, 22, &SECTORS_PER_FAT.to_le_bytes());
    // sectors per track, heads
    b = put_bytes(b, 24, &1u16.to_le_bytes());
    b = put_bytes(b, 26, &1u16.to_le_bytes());
    // 28..36: hidden sectors and 32-bit sector count stay zero
    b[36] = 0x80;
    b[38] = 0x29;
    b = put_bytes(b, 39, &VOLUME_SERIAL.to_le_bytes());
    b = put_bytes(b, 43, &VOLUME_LABEL);
    b = put_bytes(b, 54, b"FAT12   ");
    b[510] = 0x55;
    b[511] = 0xAA;
    b
}

/// Store a 12-bit FAT entry.
const fn with_fat12_entry(mut fat: [u8; BLOCK_SIZE], cluster: u16, value: u16) -> [u8; BLOCK_SIZE] {
    let at = cluster as usize * 3 / 2;
    if cluster & 1 == 0 {
        fat[at] = value as u8;
        fat[at + 1] = (fat[at + 1] & 0xF0) | ((value >> 8) as u8 & 0x0F);
    } else {
        fat[at] = (fat[at] & 0x0F) | ((value as u8 & 0x0F) << 4);
        fat[at + 1] = (value >> 4) as u8;
    }
    fat
}

const fn fat_table() -> [u8; BLOCK_SIZE] {
    let mut fat = [0u8; BLOCK_SIZE];
    fat = with_fat12_entry(fat, 0, 0xF00 | MEDIA_DESCRIPTOR as u16);
    fat = with_fat12_entry(fat, 1, FAT12_EOC);

    let mut slot = 0;
    while slot < SLOT_COUNT {
        let first = slot_first_cluster(slot);
        let last = first + CLUSTERS_PER_SLOT - 1;
        let mut cluster = first;
        while cluster < last {
            fat = with_fat12_entry(fat, cluster, cluster + 1);
            cluster += 1;
        }
        fat = with_fat12_entry(fat, last, FAT12_EOC);
        slot += 1;
    }
    fat
}

/// 8.3 name of the file backing `slot`: `EEPROM01.PME`, `EEPROM02.PME`, ...
const fn slot_file_name(slot: usize) -> [u8; 11] {
    let n = slot + 1;
    let mut name = *b"EEPROM00PME";
    name[6] = b'0' + (n / 10) as u8;
    name[7] = b'0' + (n % 10) as u8;
    name
}

const fn with_dir_entry(
    mut dir: [u8; BLOCK_SIZE],
    index: usize,
    name: &[u8; 11],
    attr: u8,
    first_cluster: u16,
    size: u32,
) -> [u8; BLOCK_SIZE] {
    let at = index * DIR_ENTRY_SIZE;
    dir = put_bytes(dir, at, name);
    dir[at + 11] = attr;
    dir = put_bytes(dir, at + 14, &DIR_TIME.to_le_bytes());
    dir = put_bytes(dir, at + 16, &DIR_DATE.to_le_bytes());
    dir = put_bytes(dir, at + 18, &DIR_DATE.to_le_bytes());
    dir = put_bytes(dir, at + 22, &DIR_TIME.to_le_bytes());
    dir = put_bytes(dir, at + 24, &DIR_DATE.to_le_bytes());
    dir = put_bytes(dir, at + 26, &first_cluster.to_le_bytes());
    dir = put_bytes(dir, at + 28, &size.to_le_bytes());
    dir
}

const fn root_directory() -> [u8; BLOCK_SIZE] {
    let mut dir = [0u8; BLOCK_SIZE];
    dir = with_dir_entry(dir, 0, &VOLUME_LABEL, ATTR_VOLUME_ID, 0, 0);

    let mut slot = 0;
    while slot < SLOT_COUNT {
        dir = with_dir_entry(
            dir,
            slot + 1,
            &slot_file_name(slot),
            ATTR_ARCHIVE,
            slot_first_cluster(slot),
            SLOT_SIZE as u32,
        );
        slot += 1;
    }
    dir
}

const fn fat_date(year: u16, month: u16, day: u16) -> u16 {
    ((year - 1980) << 9) | (month << 5) | day
}

const fn fat_time(hour: u16, minute: u16, second: u16) -> u16 {
    (hour << 11) | (minute << 5) | (second / 2)
}
