//! Mass-storage callbacks for the EEPROM disk.
//!
//! [`MassStorage`] is the contract between the bulk-only transport and a
//! medium; [`EepromDisk`] implements it over the synthetic FAT image and the
//! flash slot region. All mutable disk state lives in the one `EepromDisk`
//! value the transport borrows, so callbacks never run concurrently.

use embassy_time::Instant;

use crate::commit::{CommitPolicy, CommitState, DirectoryWrite, WriteAccumulator, WriteOutcome};
use crate::config::{
    BLOCK_COUNT, BLOCK_SIZE, INQUIRY_PRODUCT, INQUIRY_REVISION, INQUIRY_VENDOR,
};
use crate::flash::SlotFlash;
use crate::layout::{self, Region, Slot};
use crate::scsi::{self, Sense};

/// INQUIRY identification strings (8 / 16 / 4 bytes, padded by the transport).
#[derive(Clone, Copy, Debug)]
pub struct Identity {
    pub vendor: &'static [u8],
    pub product: &'static [u8],
    pub revision: &'static [u8],
}

/// Storage-class callbacks, invoked one at a time by the transport.
pub trait MassStorage {
    fn inquiry(&self) -> Identity;

    /// (block count, block size)
    fn capacity(&self) -> (u32, u16);

    fn test_unit_ready(&mut self) -> Result<(), Sense>;

    fn start_stop(&mut self, power_condition: u8, start: bool, load_eject: bool)
        -> Result<(), Sense>;

    fn is_writable(&self) -> bool;

    /// Fill `buf` from block `lba` starting at byte `offset`; returns bytes copied.
    fn read10(&mut self, lba: u32, offset: u32, buf: &mut [u8]) -> Result<usize, Sense>;

    /// Accept `data` for block `lba` at byte `offset`; returns bytes accepted.
    fn write10(&mut self, lba: u32, offset: u32, data: &[u8]) -> Result<usize, Sense>;

    /// Commands the transport does not handle itself. Returns the number of
    /// response bytes placed in `buf`.
    fn scsi_passthrough(&mut self, cdb: &[u8], buf: &mut [u8]) -> Result<usize, Sense>;
}

pub struct EepromDisk<F, P = DirectoryWrite> {
    flash: F,
    writes: WriteAccumulator<P>,
    ejected: bool,
    on_commit: Option<fn(Slot, Instant)>,
    clock: fn() -> Instant,
}

impl<F: SlotFlash> EepromDisk<F, DirectoryWrite> {
    pub fn new(flash: F) -> Self {
        Self::with_policy(flash, DirectoryWrite)
    }
}

impl<F: SlotFlash, P: CommitPolicy> EepromDisk<F, P> {
    pub fn with_policy(flash: F, policy: P) -> Self {
        Self {
            flash,
            writes: WriteAccumulator::with_policy(policy),
            ejected: false,
            on_commit: None,
            clock: Instant::now,
        }
    }

    /// Time source for the commit instant. Defaults to `Instant::now`.
    pub fn with_clock(mut self, clock: fn() -> Instant) -> Self {
        self.clock = clock;
        self
    }

    /// Called once, right after a slot image has been committed.
    pub fn on_commit(mut self, hook: fn(Slot, Instant)) -> Self {
        self.on_commit = Some(hook);
        self
    }

    pub fn is_ejected(&self) -> bool {
        self.ejected
    }

    pub fn commit_state(&self) -> CommitState {
        self.writes.state()
    }

    pub fn committed_at(&self) -> Option<Instant> {
        self.writes.committed_at()
    }

    pub fn pending_bytes(&self) -> usize {
        self.writes.offset()
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }
}

impl<F: SlotFlash, P: CommitPolicy> MassStorage for EepromDisk<F, P> {
    fn inquiry(&self) -> Identity {
        Identity {
            vendor: INQUIRY_VENDOR,
            product: INQUIRY_PRODUCT,
            revision: INQUIRY_REVISION,
        }
    }

    fn capacity(&self) -> (u32, u16) {
        (BLOCK_COUNT, BLOCK_SIZE as u16)
    }

    fn test_unit_ready(&mut self) -> Result<(), Sense> {
        if self.ejected {
            return Err(Sense::MEDIUM_NOT_PRESENT);
        }
        Ok(())
    }

    fn start_stop(
        &mut self,
        power_condition: u8,
        start: bool,
        load_eject: bool,
    ) -> Result<(), Sense> {
        debug!(
            "START STOP UNIT: power={} start={} load_eject={}",
            power_condition, start, load_eject
        );
        if load_eject && !start {
            info!("medium ejected by host");
            self.ejected = true;
        }
        Ok(())
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn read10(&mut self, lba: u32, offset: u32, buf: &mut [u8]) -> Result<usize, Sense> {
        match layout::classify(lba) {
            Region::Synthetic(block) => {
                let start = offset as usize;
                let src = block
                    .bytes()
                    .get(start..start + buf.len())
                    .ok_or(Sense::INVALID_FIELD_IN_CDB)?;
                buf.copy_from_slice(src);
            }
            Region::Backing { address } => {
                let address = address + offset;
                if layout::in_slot_region(address, buf.len()) {
                    self.flash.read(address, buf).map_err(|e| {
                        error!("flash read at 0x{:08x} failed: {}", address, e);
                        Sense::UNRECOVERED_READ_ERROR
                    })?;
                } else {
                    // Past the last slot there is no reserved flash.
                    buf.fill(0);
                }
            }
        }
        Ok(buf.len())
    }

    fn write10(&mut self, lba: u32, offset: u32, data: &[u8]) -> Result<usize, Sense> {
        trace!("WRITE10 lba={} offset={} len={}", lba, offset, data.len());
        if let WriteOutcome::Committed { slot, at } =
            self.writes.write(&mut self.flash, lba, data, self.clock)
        {
            if let Some(hook) = self.on_commit {
                hook(slot, at);
            }
        }
        // The host always sees the full payload accepted.
        Ok(data.len())
    }

    fn scsi_passthrough(&mut self, cdb: &[u8], _buf: &mut [u8]) -> Result<usize, Sense> {
        match cdb.first().copied() {
            Some(scsi::PREVENT_ALLOW_MEDIUM_REMOVAL) => Ok(0),
            other => {
                debug!("unsupported SCSI opcode {}", other);
                Err(Sense::INVALID_COMMAND)
            }
        }
    }
}
