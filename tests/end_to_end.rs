//! Host-side walk through a complete file upload: the block traffic a FAT
//! driver produces when copying an 8 KiB file onto the disk, the flash commit
//! it triggers and the reset that follows.

use embassy_time::{Duration, Instant};

use eeprom_pico::commit::CommitState;
use eeprom_pico::config::{BLOCK_SIZE, SLOT_REGION_OFFSET, SLOT_REGION_SIZE, SLOT_SIZE};
use eeprom_pico::disk::{EepromDisk, MassStorage};
use eeprom_pico::flash::{FlashError, SlotFlash};
use eeprom_pico::msc::{encode_csw, Cbw, CswStatus, CBW_SIGNATURE};
use eeprom_pico::reboot::{DeviceAction, RebootScheduler};
use eeprom_pico::scsi::{self, Command, Reply, Sense};

/// Slot region in RAM, counting every erase+program.
struct RecordingFlash {
    mem: Vec<u8>,
    commits: Vec<(u32, Vec<u8>)>,
}

impl RecordingFlash {
    fn new() -> Self {
        let mem = (0..SLOT_REGION_SIZE as usize).map(|i| (i * 7 % 256) as u8).collect();
        Self {
            mem,
            commits: Vec::new(),
        }
    }

    fn offset(address: u32, len: usize) -> Result<usize, FlashError> {
        let start = address
            .checked_sub(SLOT_REGION_OFFSET)
            .ok_or(FlashError::OutOfBounds)? as usize;
        if start + len > SLOT_REGION_SIZE as usize {
            return Err(FlashError::OutOfBounds);
        }
        Ok(start)
    }
}

impl SlotFlash for RecordingFlash {
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let start = Self::offset(address, buf.len())?;
        buf.copy_from_slice(&self.mem[start..start + buf.len()]);
        Ok(())
    }

    fn commit(&mut self, address: u32, image: &[u8]) -> Result<(), FlashError> {
        let start = Self::offset(address, image.len())?;
        self.mem[start..start + image.len()].copy_from_slice(image);
        self.commits.push((address, image.to_vec()));
        Ok(())
    }
}

const DIRECTORY_LBA: u32 = 2;
const FIRST_SLOT_LBA: u32 = 3;

fn read_block(disk: &mut EepromDisk<RecordingFlash>, lba: u32) -> Vec<u8> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    assert_eq!(disk.read10(lba, 0, &mut buf), Ok(BLOCK_SIZE));
    buf
}

fn commit_clock() -> Instant {
    Instant::from_millis(10_003)
}

#[test]
fn upload_commits_once_and_schedules_reset() {
    let mut disk = EepromDisk::new(RecordingFlash::new()).with_clock(commit_clock);
    let mut scheduler = RebootScheduler::new();

    // Host reads the existing file before overwriting it.
    let before = read_block(&mut disk, FIRST_SLOT_LBA);
    assert_eq!(&before[..], &disk.flash().mem[..BLOCK_SIZE]);

    // FAT drivers touch the FAT, stream the data, then rewrite the directory.
    disk.write10(1, 0, &[0u8; BLOCK_SIZE]).unwrap();
    for i in 0..16 {
        let n = disk.write10(FIRST_SLOT_LBA + i, 0, &[0xAB; BLOCK_SIZE]).unwrap();
        assert_eq!(n, BLOCK_SIZE);
    }
    assert!(disk.flash().commits.is_empty());
    assert_eq!(disk.commit_state(), CommitState::Accumulating);

    disk.write10(DIRECTORY_LBA, 0, &[0u8; BLOCK_SIZE]).unwrap();
    let commit_at = commit_clock();

    let commits = &disk.flash().commits;
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].0, SLOT_REGION_OFFSET);
    assert_eq!(commits[0].1, vec![0xAB; SLOT_SIZE]);
    assert_eq!(disk.committed_at(), Some(commit_at));

    // Repeated directory writes from the host's cache flush change nothing.
    disk.write10(DIRECTORY_LBA, 0, &[0u8; BLOCK_SIZE]).unwrap();
    assert_eq!(disk.flash().commits.len(), 1);
    assert_eq!(disk.committed_at(), Some(commit_at));

    // The new image reads back immediately.
    assert_eq!(read_block(&mut disk, FIRST_SLOT_LBA + 15), vec![0xAB; BLOCK_SIZE]);

    let committed_at = disk.committed_at().unwrap();
    scheduler.arm(committed_at);
    assert_eq!(scheduler.poll(commit_at + Duration::from_millis(100)), None);
    assert_eq!(scheduler.poll(commit_at + Duration::from_millis(500)), None);
    assert_eq!(
        scheduler.poll(commit_at + Duration::from_millis(501)),
        Some(DeviceAction::Reset)
    );
}

#[test]
fn short_upload_is_dropped() {
    let mut disk = EepromDisk::new(RecordingFlash::new());

    for i in 0..15 {
        disk.write10(FIRST_SLOT_LBA + i, 0, &[0x11; BLOCK_SIZE]).unwrap();
    }
    disk.write10(DIRECTORY_LBA, 0, &[0u8; BLOCK_SIZE]).unwrap();

    assert!(disk.flash().commits.is_empty());
    assert_eq!(disk.committed_at(), None);
    assert_eq!(disk.commit_state(), CommitState::Idle);
}

#[test]
fn eject_reports_medium_not_present() {
    let mut disk = EepromDisk::new(RecordingFlash::new());
    let mut last_sense = Sense::NONE;
    let mut buf = [0u8; 64];

    let eject = [scsi::START_STOP_UNIT, 0, 0, 0, 0x02, 0];
    let cmd = scsi::parse_cdb(&eject).unwrap();
    assert_eq!(
        scsi::execute(&mut disk, cmd, &eject, &mut last_sense, &mut buf),
        Ok(Reply::Status)
    );

    for _ in 0..3 {
        let tur = [scsi::TEST_UNIT_READY, 0, 0, 0, 0, 0];
        let r = scsi::execute(&mut disk, Command::TestUnitReady, &tur, &mut last_sense, &mut buf);
        assert_eq!(r, Err(Sense::MEDIUM_NOT_PRESENT));
    }

    // The transport records the failure; REQUEST SENSE reports it.
    last_sense = Sense::MEDIUM_NOT_PRESENT;
    let rs = [scsi::REQUEST_SENSE, 0, 0, 0, 18, 0];
    let cmd = scsi::parse_cdb(&rs).unwrap();
    assert_eq!(
        scsi::execute(&mut disk, cmd, &rs, &mut last_sense, &mut buf),
        Ok(Reply::DataIn(18))
    );
    assert_eq!((buf[2], buf[12], buf[13]), (0x02, 0x3A, 0x00));
}

#[test]
fn wire_framing_for_a_read() {
    let mut raw = [0u8; 31];
    raw[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
    raw[4..8].copy_from_slice(&42u32.to_le_bytes());
    raw[8..12].copy_from_slice(&(BLOCK_SIZE as u32).to_le_bytes());
    raw[12] = 0x80;
    raw[14] = 10;
    raw[15..25].copy_from_slice(&[scsi::READ_10, 0, 0, 0, 0, 0, 0, 0, 1, 0]);

    let cbw = Cbw::parse(&raw).unwrap();
    assert_eq!(
        scsi::parse_cdb(cbw.cdb()),
        Ok(Command::Read10 { lba: 0, blocks: 1 })
    );

    let mut disk = EepromDisk::new(RecordingFlash::new());
    let block = read_block(&mut disk, 0);
    assert_eq!(&block[510..], &[0x55, 0xAA]);

    let csw = encode_csw(cbw.tag, 0, CswStatus::Passed);
    assert_eq!(&csw[4..8], &42u32.to_le_bytes());
    assert_eq!(csw[12], 0);
}
