//! Write accumulation and the flash commit state machine.
//!
//! The host streams a file as a series of 512-byte WRITE(10) transfers with no
//! close notification. Data blocks are appended to a pending buffer; when the
//! [`CommitPolicy`] reports the end of a transfer and exactly one slot image
//! has arrived, the image is committed to flash. At most one commit happens
//! per power cycle.

use embassy_time::Instant;

use crate::config::{PENDING_BUFFER_SIZE, SLOT_SIZE};
use crate::fat::SyntheticBlock;
use crate::flash::{FlashError, SlotFlash};
use crate::layout::{self, Region, Slot};

// =============================================================================
// Commit trigger policy
// =============================================================================

/// Decides which write marks the end of a host file transfer.
pub trait CommitPolicy {
    /// `true` if a write to `region` closes the current accumulation run.
    fn is_commit_edge(&mut self, region: Region) -> bool;
}

/// FAT drivers rewrite the directory entry after all data clusters of a file,
/// so a write to the root directory block is taken as "transfer complete".
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectoryWrite;

impl CommitPolicy for DirectoryWrite {
    fn is_commit_edge(&mut self, region: Region) -> bool {
        region == Region::Synthetic(SyntheticBlock::RootDirectory)
    }
}

// =============================================================================
// Accumulator
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommitState {
    Idle,
    Accumulating,
    Committed,
}

/// What a single write did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriteOutcome {
    /// Data appended to the pending image.
    Buffered,
    /// Write to read-only metadata, dropped.
    Discarded,
    /// Commit edge seen without a complete image (or after a prior commit);
    /// the pending image was dropped.
    Reset,
    /// Image written to `slot`.
    Committed { slot: Slot, at: Instant },
    /// Flash refused the commit; the pending image was dropped.
    Failed(FlashError),
}

pub struct WriteAccumulator<P = DirectoryWrite> {
    buf: [u8; PENDING_BUFFER_SIZE],
    offset: usize,
    target: Option<Slot>,
    committed_at: Option<Instant>,
    policy: P,
}

impl WriteAccumulator<DirectoryWrite> {
    pub const fn new() -> Self {
        Self::with_policy(DirectoryWrite)
    }
}

impl Default for WriteAccumulator<DirectoryWrite> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: CommitPolicy> WriteAccumulator<P> {
    pub const fn with_policy(policy: P) -> Self {
        Self {
            buf: [0; PENDING_BUFFER_SIZE],
            offset: 0,
            target: None,
            committed_at: None,
            policy,
        }
    }

    pub fn state(&self) -> CommitState {
        if self.committed_at.is_some() {
            CommitState::Committed
        } else if self.offset > 0 {
            CommitState::Accumulating
        } else {
            CommitState::Idle
        }
    }

    /// Bytes accumulated since the last commit edge.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Instant of the completed commit, if any.
    pub fn committed_at(&self) -> Option<Instant> {
        self.committed_at
    }

    /// Handle one WRITE(10) payload for `lba`. `clock` is read only when a
    /// commit has finished and its instant has to be recorded.
    pub fn write<F: SlotFlash, C: FnOnce() -> Instant>(
        &mut self,
        flash: &mut F,
        lba: u32,
        data: &[u8],
        clock: C,
    ) -> WriteOutcome {
        let region = layout::classify(lba);

        if self.policy.is_commit_edge(region) {
            return self.close_run(flash, clock);
        }

        match region {
            Region::Backing { .. } => {
                self.append(lba, data);
                WriteOutcome::Buffered
            }
            Region::Synthetic(block) => {
                debug!("write to {} ignored", block);
                WriteOutcome::Discarded
            }
        }
    }

    fn append(&mut self, lba: u32, data: &[u8]) {
        if self.offset == 0 {
            self.target = layout::slot_for(lba);
        }

        let start = self.offset.min(PENDING_BUFFER_SIZE);
        let n = data.len().min(PENDING_BUFFER_SIZE - start);
        if n < data.len() {
            warn!(
                "pending buffer full, dropping {} bytes at lba {}",
                data.len() - n,
                lba
            );
        }
        self.buf[start..start + n].copy_from_slice(&data[..n]);
        // Keep counting past the end so an oversized run never matches a slot.
        self.offset = self.offset.saturating_add(data.len());
    }

    fn close_run<F: SlotFlash, C: FnOnce() -> Instant>(
        &mut self,
        flash: &mut F,
        clock: C,
    ) -> WriteOutcome {
        let len = self.offset;
        let target = self.target.take();
        self.offset = 0;

        if self.committed_at.is_some() {
            debug!("commit edge after commit, {} bytes dropped", len);
            return WriteOutcome::Reset;
        }
        if len != SLOT_SIZE {
            debug!("commit edge with {} bytes pending, expected {}", len, SLOT_SIZE);
            return WriteOutcome::Reset;
        }
        let Some(slot) = target else {
            debug!("commit edge for data outside any slot");
            return WriteOutcome::Reset;
        };

        let address = slot.flash_address();
        info!(
            "committing slot {} ({} bytes) at 0x{:08x}",
            slot.index(),
            len,
            address
        );
        match flash.commit(address, &self.buf[..SLOT_SIZE]) {
            Ok(()) => {
                // Stamped after erase+program so the reset debounce starts
                // once the flash is idle again.
                let now = clock();
                self.committed_at = Some(now);
                WriteOutcome::Committed { slot, at: now }
            }
            Err(e) => {
                error!("flash commit failed: {}", e);
                WriteOutcome::Failed(e)
            }
        }
    }
}
