// SCSI transparent command set: opcodes, CDB parsing and fixed responses.

use crate::disk::MassStorage;

// =============================================================================
// Operation codes
// =============================================================================

pub const TEST_UNIT_READY: u8 = 0x00;
pub const REQUEST_SENSE: u8 = 0x03;
pub const INQUIRY: u8 = 0x12;
pub const MODE_SENSE_6: u8 = 0x1A;
pub const START_STOP_UNIT: u8 = 0x1B;
pub const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
pub const READ_FORMAT_CAPACITIES: u8 = 0x23;
pub const READ_CAPACITY_10: u8 = 0x25;
pub const READ_10: u8 = 0x28;
pub const WRITE_10: u8 = 0x2A;
pub const MODE_SENSE_10: u8 = 0x5A;

// =============================================================================
// Sense data
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SenseKey {
    NoSense = 0x00,
    NotReady = 0x02,
    MediumError = 0x03,
    IllegalRequest = 0x05,
}

/// Sense key plus additional sense code / qualifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sense {
    pub key: SenseKey,
    pub asc: u8,
    pub ascq: u8,
}

impl Sense {
    pub const NONE: Sense = Sense::new(SenseKey::NoSense, 0x00, 0x00);
    pub const MEDIUM_NOT_PRESENT: Sense = Sense::new(SenseKey::NotReady, 0x3A, 0x00);
    pub const INVALID_COMMAND: Sense = Sense::new(SenseKey::IllegalRequest, 0x20, 0x00);
    pub const LBA_OUT_OF_RANGE: Sense = Sense::new(SenseKey::IllegalRequest, 0x21, 0x00);
    pub const INVALID_FIELD_IN_CDB: Sense = Sense::new(SenseKey::IllegalRequest, 0x24, 0x00);
    pub const UNRECOVERED_READ_ERROR: Sense = Sense::new(SenseKey::MediumError, 0x11, 0x00);

    pub const fn new(key: SenseKey, asc: u8, ascq: u8) -> Self {
        Self { key, asc, ascq }
    }
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    TestUnitReady,
    RequestSense { alloc_len: u16 },
    Inquiry { evpd: bool, alloc_len: u16 },
    ModeSense6 { alloc_len: u16 },
    ModeSense10 { alloc_len: u16 },
    StartStopUnit { power_condition: u8, start: bool, load_eject: bool },
    ReadFormatCapacities { alloc_len: u16 },
    ReadCapacity10,
    Read10 { lba: u32, blocks: u16 },
    Write10 { lba: u32, blocks: u16 },
    /// Anything else; handed to the passthrough callback.
    Other(u8),
}

fn be16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// Decode a command descriptor block. Short CDBs for known opcodes are
/// rejected with INVALID FIELD IN CDB.
pub fn parse_cdb(cdb: &[u8]) -> Result<Command, Sense> {
    let Some(&opcode) = cdb.first() else {
        return Err(Sense::INVALID_COMMAND);
    };

    let need = match opcode {
        TEST_UNIT_READY | REQUEST_SENSE | INQUIRY | MODE_SENSE_6 | START_STOP_UNIT => 6,
        READ_FORMAT_CAPACITIES | READ_CAPACITY_10 | READ_10 | WRITE_10 | MODE_SENSE_10 => 10,
        _ => return Ok(Command::Other(opcode)),
    };
    if cdb.len() < need {
        return Err(Sense::INVALID_FIELD_IN_CDB);
    }

    let cmd = match opcode {
        TEST_UNIT_READY => Command::TestUnitReady,
        REQUEST_SENSE => Command::RequestSense { alloc_len: cdb[4] as u16 },
        INQUIRY => Command::Inquiry {
            evpd: cdb[1] & 0x01 != 0,
            alloc_len: be16(&cdb[3..5]),
        },
        MODE_SENSE_6 => Command::ModeSense6 { alloc_len: cdb[4] as u16 },
        START_STOP_UNIT => Command::StartStopUnit {
            power_condition: cdb[4] >> 4,
            start: cdb[4] & 0x01 != 0,
            load_eject: cdb[4] & 0x02 != 0,
        },
        READ_FORMAT_CAPACITIES => Command::ReadFormatCapacities { alloc_len: be16(&cdb[7..9]) },
        READ_CAPACITY_10 => Command::ReadCapacity10,
        READ_10 => Command::Read10 {
            lba: be32(&cdb[2..6]),
            blocks: be16(&cdb[7..9]),
        },
        WRITE_10 => Command::Write10 {
            lba: be32(&cdb[2..6]),
            blocks: be16(&cdb[7..9]),
        },
        MODE_SENSE_10 => Command::ModeSense10 { alloc_len: be16(&cdb[7..9]) },
        _ => Command::Other(opcode),
    };
    Ok(cmd)
}

// =============================================================================
// Fixed response payloads
// =============================================================================

fn pad_into(dst: &mut [u8], src: &[u8]) {
    dst.fill(b' ');
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
}

/// Standard INQUIRY data: removable direct-access device.
pub fn inquiry_response(vendor: &[u8], product: &[u8], revision: &[u8]) -> [u8; 36] {
    let mut r = [0u8; 36];
    r[1] = 0x80; // RMB
    r[2] = 0x02; // SPC-2 style
    r[3] = 0x02; // response data format
    r[4] = 36 - 5; // additional length
    pad_into(&mut r[8..16], vendor);
    pad_into(&mut r[16..32], product);
    pad_into(&mut r[32..36], revision);
    r
}

pub fn read_capacity_10_response(block_count: u32, block_size: u16) -> [u8; 8] {
    let mut r = [0u8; 8];
    r[0..4].copy_from_slice(&block_count.saturating_sub(1).to_be_bytes());
    r[4..8].copy_from_slice(&(block_size as u32).to_be_bytes());
    r
}

pub fn read_format_capacities_response(block_count: u32, block_size: u16) -> [u8; 12] {
    let mut r = [0u8; 12];
    r[3] = 8; // capacity list length
    r[4..8].copy_from_slice(&block_count.to_be_bytes());
    r[8] = 0x02; // formatted media
    r[9..12].copy_from_slice(&(block_size as u32).to_be_bytes()[1..]);
    r
}

pub fn mode_sense_6_response(write_protected: bool) -> [u8; 4] {
    [0x03, 0x00, if write_protected { 0x80 } else { 0x00 }, 0x00]
}

pub fn mode_sense_10_response(write_protected: bool) -> [u8; 8] {
    [0x00, 0x06, 0x00, if write_protected { 0x80 } else { 0x00 }, 0, 0, 0, 0]
}

/// Fixed-format sense data.
pub fn request_sense_response(sense: Sense) -> [u8; 18] {
    let mut r = [0u8; 18];
    r[0] = 0x70;
    r[2] = sense.key as u8;
    r[7] = 10;
    r[12] = sense.asc;
    r[13] = sense.ascq;
    r
}

// =============================================================================
// Non-streaming command execution
// =============================================================================

/// Result of a command that does not stream blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Reply {
    /// No data phase.
    Status,
    /// The first `n` bytes of the scratch buffer go to the host.
    DataIn(usize),
}

fn reply_with(buf: &mut [u8], data: &[u8], alloc_len: u16) -> Reply {
    let n = data.len().min(alloc_len as usize).min(buf.len());
    buf[..n].copy_from_slice(&data[..n]);
    Reply::DataIn(n)
}

/// Run every command except READ(10)/WRITE(10). `last_sense` is reported and
/// cleared by REQUEST SENSE.
pub fn execute<S: MassStorage>(
    storage: &mut S,
    cmd: Command,
    cdb: &[u8],
    last_sense: &mut Sense,
    buf: &mut [u8],
) -> Result<Reply, Sense> {
    match cmd {
        Command::TestUnitReady => storage.test_unit_ready().map(|()| Reply::Status),
        Command::RequestSense { alloc_len } => {
            let data = request_sense_response(*last_sense);
            *last_sense = Sense::NONE;
            Ok(reply_with(buf, &data, alloc_len))
        }
        Command::Inquiry { evpd: true, .. } => Err(Sense::INVALID_FIELD_IN_CDB),
        Command::Inquiry { evpd: false, alloc_len } => {
            let id = storage.inquiry();
            let data = inquiry_response(id.vendor, id.product, id.revision);
            Ok(reply_with(buf, &data, alloc_len))
        }
        Command::ModeSense6 { alloc_len } => {
            let data = mode_sense_6_response(!storage.is_writable());
            Ok(reply_with(buf, &data, alloc_len))
        }
        Command::ModeSense10 { alloc_len } => {
            let data = mode_sense_10_response(!storage.is_writable());
            Ok(reply_with(buf, &data, alloc_len))
        }
        Command::StartStopUnit {
            power_condition,
            start,
            load_eject,
        } => storage
            .start_stop(power_condition, start, load_eject)
            .map(|()| Reply::Status),
        Command::ReadFormatCapacities { alloc_len } => {
            let (count, size) = storage.capacity();
            let data = read_format_capacities_response(count, size);
            Ok(reply_with(buf, &data, alloc_len))
        }
        Command::ReadCapacity10 => {
            let (count, size) = storage.capacity();
            let data = read_capacity_10_response(count, size);
            Ok(reply_with(buf, &data, data.len() as u16))
        }
        Command::Read10 { .. } | Command::Write10 { .. } => Err(Sense::INVALID_COMMAND),
        Command::Other(_) => {
            let n = storage.scsi_passthrough(cdb, buf)?;
            Ok(if n == 0 { Reply::Status } else { Reply::DataIn(n) })
        }
    }
}

/// Validate a READ(10)/WRITE(10) range against the medium size.
pub fn check_range(lba: u32, blocks: u16, block_count: u32) -> Result<(), Sense> {
    match lba.checked_add(blocks as u32) {
        Some(end) if end <= block_count => Ok(()),
        _ => Err(Sense::LBA_OUT_OF_RANGE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::EepromDisk;
    use crate::flash::testing::RamFlash;

    fn disk() -> EepromDisk<RamFlash> {
        EepromDisk::new(RamFlash::new())
    }

    #[test]
    fn parses_read10_and_write10() {
        let cdb = [READ_10, 0, 0, 0, 0, 3, 0, 0, 16, 0];
        assert_eq!(parse_cdb(&cdb), Ok(Command::Read10 { lba: 3, blocks: 16 }));

        let cdb = [WRITE_10, 0, 0x00, 0x01, 0x02, 0x03, 0, 0x01, 0x00, 0];
        assert_eq!(
            parse_cdb(&cdb),
            Ok(Command::Write10 { lba: 0x0001_0203, blocks: 256 })
        );
    }

    #[test]
    fn parses_start_stop_bits() {
        let eject = [START_STOP_UNIT, 0, 0, 0, 0x02, 0];
        assert_eq!(
            parse_cdb(&eject),
            Ok(Command::StartStopUnit { power_condition: 0, start: false, load_eject: true })
        );
    }

    #[test]
    fn unknown_and_short_cdbs() {
        assert_eq!(parse_cdb(&[0xA0, 0, 0]), Ok(Command::Other(0xA0)));
        assert_eq!(
            parse_cdb(&[PREVENT_ALLOW_MEDIUM_REMOVAL, 0, 0, 0, 1, 0]),
            Ok(Command::Other(PREVENT_ALLOW_MEDIUM_REMOVAL))
        );
        assert_eq!(parse_cdb(&[READ_10, 0, 0]), Err(Sense::INVALID_FIELD_IN_CDB));
        assert_eq!(parse_cdb(&[]), Err(Sense::INVALID_COMMAND));
    }

    #[test]
    fn inquiry_is_space_padded() {
        let r = inquiry_response(b"EEPROM", b"Disk", b"1.0");
        assert_eq!(&r[8..16], b"EEPROM  ");
        assert_eq!(&r[16..32], b"Disk            ");
        assert_eq!(&r[32..36], b"1.0 ");
        assert_eq!(r[1], 0x80);
    }

    #[test]
    fn capacity_reports_last_lba() {
        assert_eq!(read_capacity_10_response(128, 512), [0, 0, 0, 127, 0, 0, 2, 0]);
        let f = read_format_capacities_response(128, 512);
        assert_eq!(&f[4..12], &[0, 0, 0, 128, 0x02, 0x00, 0x02, 0x00]);
    }

    #[test]
    fn request_sense_reports_and_clears() {
        let mut d = disk();
        let mut sense = Sense::MEDIUM_NOT_PRESENT;
        let mut buf = [0u8; 64];

        let r = execute(&mut d, Command::RequestSense { alloc_len: 18 }, &[REQUEST_SENSE], &mut sense, &mut buf);
        assert_eq!(r, Ok(Reply::DataIn(18)));
        assert_eq!(buf[2], SenseKey::NotReady as u8);
        assert_eq!((buf[12], buf[13]), (0x3A, 0x00));
        assert_eq!(sense, Sense::NONE);
    }

    #[test]
    fn allocation_length_truncates() {
        let mut d = disk();
        let mut sense = Sense::NONE;
        let mut buf = [0u8; 64];
        let r = execute(&mut d, Command::Inquiry { evpd: false, alloc_len: 5 }, &[INQUIRY], &mut sense, &mut buf);
        assert_eq!(r, Ok(Reply::DataIn(5)));
    }

    #[test]
    fn mode_sense_reports_writable() {
        let mut d = disk();
        let mut sense = Sense::NONE;
        let mut buf = [0u8; 64];
        let r = execute(&mut d, Command::ModeSense6 { alloc_len: 192 }, &[MODE_SENSE_6], &mut sense, &mut buf);
        assert_eq!(r, Ok(Reply::DataIn(4)));
        assert_eq!(buf[2] & 0x80, 0);
    }

    #[test]
    fn passthrough_accepts_only_prevent_allow() {
        let mut d = disk();
        let mut sense = Sense::NONE;
        let mut buf = [0u8; 64];

        let prevent = [PREVENT_ALLOW_MEDIUM_REMOVAL, 0, 0, 0, 1, 0];
        let r = execute(&mut d, Command::Other(prevent[0]), &prevent, &mut sense, &mut buf);
        assert_eq!(r, Ok(Reply::Status));

        let sync_cache = [0x35, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let r = execute(&mut d, Command::Other(sync_cache[0]), &sync_cache, &mut sense, &mut buf);
        assert_eq!(r, Err(Sense::INVALID_COMMAND));
    }

    #[test]
    fn range_check() {
        assert_eq!(check_range(0, 128, 128), Ok(()));
        assert_eq!(check_range(127, 1, 128), Ok(()));
        assert_eq!(check_range(127, 2, 128), Err(Sense::LBA_OUT_OF_RANGE));
        assert_eq!(check_range(u32::MAX, 1, 128), Err(Sense::LBA_OUT_OF_RANGE));
    }
}
