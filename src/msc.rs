//! USB Mass Storage class, Bulk-Only Transport.
//!
//! One interface (class 0x08, SCSI transparent subclass, BBB protocol) with a
//! bulk OUT/IN endpoint pair. Class control requests are answered by
//! [`MscControl`] from the USB device task; the command/data/status loop runs
//! in [`MscClass::run`].

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_usb::control::{InResponse, OutResponse, Recipient, Request, RequestType};
use embassy_usb::driver::{Driver, Endpoint as _, EndpointError, EndpointIn, EndpointOut};
use embassy_usb::types::InterfaceNumber;
use embassy_usb::{Builder, Handler};

use crate::config::BLOCK_SIZE;
use crate::disk::MassStorage;
use crate::scsi::{self, Command, Reply, Sense};

// =============================================================================
// Class constants
// =============================================================================

pub const CLASS_MASS_STORAGE: u8 = 0x08;
pub const SUBCLASS_SCSI: u8 = 0x06;
pub const PROTOCOL_BULK_ONLY: u8 = 0x50;

pub const REQ_GET_MAX_LUN: u8 = 0xFE;
pub const REQ_BULK_ONLY_RESET: u8 = 0xFF;

pub const CBW_SIGNATURE: u32 = 0x4342_5355;
pub const CSW_SIGNATURE: u32 = 0x5342_5355;
pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;

// =============================================================================
// Command Block Wrapper / Command Status Wrapper
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataDirection {
    /// Device to host.
    In,
    /// Host to device.
    Out,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CbwError {
    Length(usize),
    Signature(u32),
    Lun(u8),
    CdbLength(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cbw {
    pub tag: u32,
    pub data_len: u32,
    pub direction: DataDirection,
    pub lun: u8,
    cdb: [u8; 16],
    cdb_len: u8,
}

impl Cbw {
    pub fn parse(buf: &[u8]) -> Result<Self, CbwError> {
        if buf.len() != CBW_LEN {
            return Err(CbwError::Length(buf.len()));
        }
        let signature = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if signature != CBW_SIGNATURE {
            return Err(CbwError::Signature(signature));
        }
        let lun = buf[13] & 0x0F;
        if lun != 0 {
            return Err(CbwError::Lun(lun));
        }
        let cdb_len = buf[14] & 0x1F;
        if !(1..=16).contains(&cdb_len) {
            return Err(CbwError::CdbLength(cdb_len));
        }

        let mut cdb = [0u8; 16];
        cdb.copy_from_slice(&buf[15..31]);
        Ok(Self {
            tag: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            data_len: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            direction: if buf[12] & 0x80 != 0 {
                DataDirection::In
            } else {
                DataDirection::Out
            },
            lun,
            cdb,
            cdb_len,
        })
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cdb[..self.cdb_len as usize]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CswStatus {
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}

pub fn encode_csw(tag: u32, residue: u32, status: CswStatus) -> [u8; CSW_LEN] {
    let mut csw = [0u8; CSW_LEN];
    csw[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
    csw[4..8].copy_from_slice(&tag.to_le_bytes());
    csw[8..12].copy_from_slice(&residue.to_le_bytes());
    csw[12] = status as u8;
    csw
}

// =============================================================================
// Control requests (EP0)
// =============================================================================

/// State shared between the control handler and the bulk loop.
pub struct ControlShared {
    reset: Signal<CriticalSectionRawMutex, ()>,
}

impl Default for ControlShared {
    fn default() -> Self {
        Self {
            reset: Signal::new(),
        }
    }
}

/// Backing storage for [`MscClass`]; must outlive the USB device.
#[derive(Default)]
pub struct State<'d> {
    control: Option<MscControl<'d>>,
    shared: ControlShared,
}

pub struct MscControl<'d> {
    iface: InterfaceNumber,
    shared: &'d ControlShared,
}

impl MscControl<'_> {
    fn is_ours(&self, req: &Request) -> bool {
        req.request_type == RequestType::Class
            && req.recipient == Recipient::Interface
            && req.index == u8::from(self.iface) as u16
    }
}

impl Handler for MscControl<'_> {
    fn configured(&mut self, configured: bool) {
        if configured {
            info!("USB configured");
        } else {
            info!("USB deconfigured");
        }
    }

    fn suspended(&mut self, suspended: bool) {
        debug!("USB suspended={}", suspended);
    }

    fn reset(&mut self) {
        debug!("USB bus reset");
    }

    fn control_out(&mut self, req: Request, _data: &[u8]) -> Option<OutResponse> {
        if !self.is_ours(&req) {
            return None;
        }

        match req.request {
            REQ_BULK_ONLY_RESET => {
                info!("Bulk-Only Mass Storage Reset");
                self.shared.reset.signal(());
                Some(OutResponse::Accepted)
            }
            _ => {
                debug!("Unknown class OUT request 0x{:02x}", req.request);
                Some(OutResponse::Rejected)
            }
        }
    }

    fn control_in<'a>(&'a mut self, req: Request, buf: &'a mut [u8]) -> Option<InResponse<'a>> {
        if !self.is_ours(&req) {
            return None;
        }

        match req.request {
            REQ_GET_MAX_LUN if !buf.is_empty() => {
                // Single logical unit.
                buf[0] = 0;
                Some(InResponse::Accepted(&buf[..1]))
            }
            _ => {
                debug!("Unknown class IN request 0x{:02x}", req.request);
                Some(InResponse::Rejected)
            }
        }
    }
}

// =============================================================================
// Bulk-Only Transport
// =============================================================================

pub struct MscClass<'d, D: Driver<'d>> {
    transport: BulkOnly<'d, D::EndpointIn, D::EndpointOut>,
}

/// Command/data/status state machine over one bulk endpoint pair.
pub(crate) struct BulkOnly<'d, I, O> {
    ep_in: I,
    ep_out: O,
    shared: &'d ControlShared,
    max_packet_size: usize,
    last_sense: Sense,
}

/// What the data phase did, for the CSW.
struct Outcome {
    status: CswStatus,
    transferred: u32,
}

impl Outcome {
    fn passed(transferred: u32) -> Self {
        Self { status: CswStatus::Passed, transferred }
    }
}

impl<'d, D: Driver<'d>> MscClass<'d, D> {
    pub fn new(builder: &mut Builder<'d, D>, state: &'d mut State<'d>, max_packet_size: u16) -> Self {
        let mut func = builder.function(CLASS_MASS_STORAGE, SUBCLASS_SCSI, PROTOCOL_BULK_ONLY);
        let mut iface = func.interface();
        let iface_num = iface.interface_number();
        let mut alt = iface.alt_setting(CLASS_MASS_STORAGE, SUBCLASS_SCSI, PROTOCOL_BULK_ONLY, None);

        let ep_out = alt.endpoint_bulk_out(None, max_packet_size);
        let ep_in = alt.endpoint_bulk_in(None, max_packet_size);

        drop(func); // release borrow on builder

        let State { control, shared } = state;
        let shared: &'d ControlShared = shared;
        let control = control.insert(MscControl {
            iface: iface_num,
            shared,
        });
        builder.handler(control);

        Self {
            transport: BulkOnly::new(ep_in, ep_out, shared, max_packet_size),
        }
    }

    /// Serve commands forever. Endpoint errors (bus reset, unplug) restart
    /// the loop once the endpoints are enabled again.
    pub async fn run<S: MassStorage>(&mut self, storage: &mut S) -> ! {
        self.transport.run(storage).await
    }
}

impl<'d, I: EndpointIn, O: EndpointOut> BulkOnly<'d, I, O> {
    pub(crate) fn new(ep_in: I, ep_out: O, shared: &'d ControlShared, max_packet_size: u16) -> Self {
        Self {
            ep_in,
            ep_out,
            shared,
            max_packet_size: max_packet_size as usize,
            last_sense: Sense::NONE,
        }
    }

    async fn run<S: MassStorage>(&mut self, storage: &mut S) -> ! {
        loop {
            self.ep_out.wait_enabled().await;
            info!("Mass storage interface enabled");

            loop {
                if let Err(e) = self.serve_one(storage).await {
                    warn!("Bulk endpoint error: {}", e);
                    break;
                }
            }
        }
    }

    async fn serve_one<S: MassStorage>(&mut self, storage: &mut S) -> Result<(), EndpointError> {
        let mut packet = [0u8; 64];
        let shared = self.shared;

        let n = match select(self.ep_out.read(&mut packet), shared.reset.wait()).await {
            Either::First(n) => n?,
            Either::Second(()) => {
                self.last_sense = Sense::NONE;
                return Ok(());
            }
        };

        let cbw = match Cbw::parse(&packet[..n]) {
            Ok(cbw) => cbw,
            Err(e) => {
                warn!("Invalid CBW: {}", e);
                return Ok(());
            }
        };

        let outcome = self.dispatch(storage, &cbw).await?;
        let residue = cbw.data_len.saturating_sub(outcome.transferred);
        if outcome.status != CswStatus::Passed {
            debug!(
                "CSW tag=0x{:08x} status={} residue={}",
                cbw.tag, outcome.status, residue
            );
        }
        self.ep_in
            .write(&encode_csw(cbw.tag, residue, outcome.status))
            .await
    }

    async fn dispatch<S: MassStorage>(
        &mut self,
        storage: &mut S,
        cbw: &Cbw,
    ) -> Result<Outcome, EndpointError> {
        let cmd = match scsi::parse_cdb(cbw.cdb()) {
            Ok(cmd) => cmd,
            Err(sense) => return self.fail(cbw, sense).await,
        };
        trace!("SCSI {}", cmd);

        match cmd {
            Command::Read10 { lba, blocks } => self.read10(storage, cbw, lba, blocks).await,
            Command::Write10 { lba, blocks } => self.write10(storage, cbw, lba, blocks).await,
            _ => {
                let mut buf = [0u8; 64];
                match scsi::execute(storage, cmd, cbw.cdb(), &mut self.last_sense, &mut buf) {
                    Ok(Reply::Status) => {
                        self.finish_data_phase(cbw, 0).await?;
                        Ok(Outcome::passed(0))
                    }
                    Ok(Reply::DataIn(n)) => {
                        if cbw.direction != DataDirection::In && cbw.data_len > 0 {
                            self.finish_data_phase(cbw, 0).await?;
                            return Ok(Outcome {
                                status: CswStatus::PhaseError,
                                transferred: 0,
                            });
                        }
                        let n = n.min(cbw.data_len as usize);
                        write_packets(&mut self.ep_in, &buf[..n], self.max_packet_size).await?;
                        self.finish_data_phase(cbw, n as u32).await?;
                        Ok(Outcome::passed(n as u32))
                    }
                    Err(sense) => self.fail(cbw, sense).await,
                }
            }
        }
    }

    async fn read10<S: MassStorage>(
        &mut self,
        storage: &mut S,
        cbw: &Cbw,
        lba: u32,
        blocks: u16,
    ) -> Result<Outcome, EndpointError> {
        let (block_count, _) = storage.capacity();
        if let Err(sense) = scsi::check_range(lba, blocks, block_count) {
            return self.fail(cbw, sense).await;
        }
        if cbw.direction != DataDirection::In && blocks > 0 {
            return self.phase_error(cbw).await;
        }
        debug!("READ10 lba={} blocks={}", lba, blocks);

        let mut block = [0u8; BLOCK_SIZE];
        let mut sent = 0u32;
        for i in 0..blocks as u32 {
            if sent as usize + BLOCK_SIZE > cbw.data_len as usize {
                break;
            }
            if let Err(sense) = storage.read10(lba + i, 0, &mut block) {
                error!("READ10 failed at lba {}", lba + i);
                self.last_sense = sense;
                self.finish_data_phase(cbw, sent).await?;
                return Ok(Outcome { status: CswStatus::Failed, transferred: sent });
            }
            write_packets(&mut self.ep_in, &block, self.max_packet_size).await?;
            sent += BLOCK_SIZE as u32;
        }

        self.finish_data_phase(cbw, sent).await?;
        if (sent as usize) < blocks as usize * BLOCK_SIZE {
            // Host asked for fewer bytes than the CDB implies.
            return Ok(Outcome { status: CswStatus::PhaseError, transferred: sent });
        }
        Ok(Outcome::passed(sent))
    }

    async fn write10<S: MassStorage>(
        &mut self,
        storage: &mut S,
        cbw: &Cbw,
        lba: u32,
        blocks: u16,
    ) -> Result<Outcome, EndpointError> {
        let (block_count, _) = storage.capacity();
        if let Err(sense) = scsi::check_range(lba, blocks, block_count) {
            return self.fail(cbw, sense).await;
        }
        if cbw.direction != DataDirection::Out && blocks > 0 {
            return self.phase_error(cbw).await;
        }
        if !storage.is_writable() {
            return self.fail(cbw, Sense::INVALID_COMMAND).await;
        }
        debug!("WRITE10 lba={} blocks={}", lba, blocks);

        let mut block = [0u8; BLOCK_SIZE];
        let mut received = 0u32;
        for i in 0..blocks as u32 {
            if received as usize + BLOCK_SIZE > cbw.data_len as usize {
                break;
            }
            read_bulk_block(&mut self.ep_out, &mut block).await?;
            received += BLOCK_SIZE as u32;
            if let Err(sense) = storage.write10(lba + i, 0, &block) {
                self.last_sense = sense;
                self.finish_data_phase(cbw, received).await?;
                return Ok(Outcome { status: CswStatus::Failed, transferred: received });
            }
        }

        self.finish_data_phase(cbw, received).await?;
        if (received as usize) < blocks as usize * BLOCK_SIZE {
            return Ok(Outcome { status: CswStatus::PhaseError, transferred: received });
        }
        Ok(Outcome::passed(received))
    }

    async fn fail(&mut self, cbw: &Cbw, sense: Sense) -> Result<Outcome, EndpointError> {
        debug!("SCSI command failed: {}", sense);
        self.last_sense = sense;
        self.finish_data_phase(cbw, 0).await?;
        Ok(Outcome { status: CswStatus::Failed, transferred: 0 })
    }

    async fn phase_error(&mut self, cbw: &Cbw) -> Result<Outcome, EndpointError> {
        self.finish_data_phase(cbw, 0).await?;
        Ok(Outcome { status: CswStatus::PhaseError, transferred: 0 })
    }

    /// Close out a data phase that moved `done` of the `data_len` bytes the
    /// host announced. The endpoints cannot be stalled from here, so a short
    /// IN phase is ended with a short or zero-length packet and leftover OUT
    /// data is read and dropped.
    async fn finish_data_phase(&mut self, cbw: &Cbw, done: u32) -> Result<(), EndpointError> {
        if done >= cbw.data_len {
            return Ok(());
        }
        match cbw.direction {
            DataDirection::In => {
                if done as usize % self.max_packet_size == 0 {
                    self.ep_in.write(&[]).await?;
                }
            }
            DataDirection::Out => {
                let mut left = (cbw.data_len - done) as usize;
                let mut scratch = [0u8; 64];
                while left > 0 {
                    let want = left.min(scratch.len());
                    let n = self.ep_out.read(&mut scratch[..want]).await?;
                    if n == 0 {
                        break;
                    }
                    left = left.saturating_sub(n);
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Bulk endpoint helpers
// =============================================================================

/// Write `data` to a bulk IN endpoint in max-packet chunks.
async fn write_packets<E: EndpointIn>(
    ep: &mut E,
    data: &[u8],
    max_packet_size: usize,
) -> Result<(), EndpointError> {
    for chunk in data.chunks(max_packet_size) {
        ep.write(chunk).await?;
    }
    Ok(())
}

/// Read a full 512-byte block from a bulk OUT endpoint.
async fn read_bulk_block<E: EndpointOut>(
    ep: &mut E,
    buf: &mut [u8; BLOCK_SIZE],
) -> Result<(), EndpointError> {
    let mut offset = 0;
    while offset < BLOCK_SIZE {
        let n = ep.read(&mut buf[offset..]).await?;
        offset += n;
    }
    Ok(())
}
