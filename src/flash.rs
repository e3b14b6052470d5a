//! Internal flash access: XIP reads and the interrupt-free erase+program commit.

use crate::config::FLASH_ERASE_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// Address range falls outside the flash.
    OutOfBounds,
    /// Erase range not aligned to the erase unit.
    Unaligned,
    /// The flash controller refused the operation.
    Other,
}

/// Flash as seen by the disk: transparent reads plus the atomic commit.
///
/// Implementations are not reentrant; `&mut self` is the exclusivity guarantee.
pub trait SlotFlash {
    /// Copy `buf.len()` bytes starting at absolute flash offset `address`.
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Erase `erase_span(image.len())` bytes at `address`, then program `image`.
    fn commit(&mut self, address: u32, image: &[u8]) -> Result<(), FlashError>;
}

/// Length rounded up to whole erase units.
pub const fn erase_span(len: usize) -> usize {
    len.div_ceil(FLASH_ERASE_SIZE) * FLASH_ERASE_SIZE
}

// =============================================================================
// RP2040 internal flash
// =============================================================================

#[cfg(feature = "rp2040")]
pub use self::rp::InternalFlash;

#[cfg(feature = "rp2040")]
mod rp {
    use embassy_rp::flash::{self, Blocking, Flash};
    use embassy_rp::peripherals::FLASH;
    use embassy_rp::Peri;

    use super::{erase_span, FlashError, SlotFlash};
    use crate::config::FLASH_SIZE;

    impl From<flash::Error> for FlashError {
        fn from(e: flash::Error) -> Self {
            match e {
                flash::Error::OutOfBounds => FlashError::OutOfBounds,
                flash::Error::Unaligned => FlashError::Unaligned,
                _ => FlashError::Other,
            }
        }
    }

    /// The QSPI flash the firmware itself executes from.
    pub struct InternalFlash<'d> {
        flash: Flash<'d, FLASH, Blocking, FLASH_SIZE>,
    }

    impl<'d> InternalFlash<'d> {
        pub fn new(flash: Peri<'d, FLASH>) -> Self {
            Self {
                flash: Flash::new_blocking(flash),
            }
        }
    }

    impl SlotFlash for InternalFlash<'_> {
        fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
            self.flash.blocking_read(address, buf)?;
            Ok(())
        }

        fn commit(&mut self, address: u32, image: &[u8]) -> Result<(), FlashError> {
            let end = address + erase_span(image.len()) as u32;

            // XIP is unavailable while the array is erased or programmed, so
            // nothing may fetch from flash until both steps are done. The
            // embassy-rp routines run from RAM.
            critical_section::with(|_| -> Result<(), FlashError> {
                self.flash.blocking_erase(address, end)?;
                self.flash.blocking_write(address, image)?;
                Ok(())
            })
        }
    }
}
