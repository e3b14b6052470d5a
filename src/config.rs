// Device identity, disk geometry and timing constants.

use embassy_time::Duration;

// =============================================================================
// USB descriptors
// =============================================================================

/// pid.codes test VID/PID pair.
pub const USB_VID: u16 = 0x1209;
pub const USB_PID: u16 = 0x0001;

pub const USB_MANUFACTURER: &str = "eeprom-pico";
pub const USB_PRODUCT: &str = "EEPROM Disk";
pub const USB_SERIAL: &str = "EEP000001";

/// USB max packet size for Full Speed bulk endpoints.
pub const USB_MAX_PACKET_SIZE: u16 = 64;

// =============================================================================
// SCSI INQUIRY identity (8 / 16 / 4 characters)
// =============================================================================

pub const INQUIRY_VENDOR: &[u8] = b"EEPROM";
pub const INQUIRY_PRODUCT: &[u8] = b"Pico EEPROM Disk";
pub const INQUIRY_REVISION: &[u8] = b"1.0";

// =============================================================================
// Logical disk
// =============================================================================

/// Size of one logical block as reported by READ CAPACITY.
pub const BLOCK_SIZE: usize = 512;

/// Total logical blocks presented to the host.
pub const BLOCK_COUNT: u32 = 128;

/// Blocks 0..3 are the synthetic boot sector, FAT and root directory.
pub const SYNTHETIC_BLOCKS: u32 = 3;

// =============================================================================
// EEPROM slots
// =============================================================================

/// Size of one slot image (one presented file).
pub const SLOT_SIZE: usize = 8192;

/// Number of slots / presented files.
pub const SLOT_COUNT: usize = 3;

/// Blocks covered by one slot.
pub const SLOT_BLOCKS: u32 = (SLOT_SIZE / BLOCK_SIZE) as u32;

/// The pending write buffer holds two slot images so an oversized host
/// write run is detected instead of overrunning memory.
pub const PENDING_BUFFER_SIZE: usize = SLOT_SIZE * 2;

// =============================================================================
// Internal flash
// =============================================================================

/// Pico boards carry 2 MiB of QSPI flash.
pub const FLASH_SIZE: usize = 2 * 1024 * 1024;

/// Smallest erasable unit of the flash chip.
pub const FLASH_ERASE_SIZE: usize = 4096;

/// Slots live at the very top of flash. memory.x keeps code out of this range.
pub const SLOT_REGION_OFFSET: u32 = (FLASH_SIZE - SLOT_COUNT * SLOT_SIZE) as u32;

/// Size in bytes of the reserved slot region.
pub const SLOT_REGION_SIZE: u32 = (SLOT_COUNT * SLOT_SIZE) as u32;

// =============================================================================
// Reboot after commit
// =============================================================================

/// Time the host gets to finish the USB transaction before the device resets.
pub const RESET_DEBOUNCE: Duration = Duration::from_millis(500);

/// How often the reboot scheduler is polled.
pub const REBOOT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Watchdog timeout used to force the reset.
pub const RESET_WATCHDOG_TIMEOUT: Duration = Duration::from_millis(1);
