#![no_std]
#![no_main]

use defmt::*;
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_futures::join::join3;
use embassy_rp::bind_interrupts;
use embassy_rp::peripherals::USB;
use embassy_rp::usb::{Driver, InterruptHandler};
use embassy_rp::watchdog::Watchdog;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Instant, Ticker};
use embassy_usb::Builder;
use panic_probe as _;
use static_cell::StaticCell;

use eeprom_pico::config::*;
use eeprom_pico::disk::EepromDisk;
use eeprom_pico::flash::InternalFlash;
use eeprom_pico::layout::Slot;
use eeprom_pico::msc::{self, MscClass};
use eeprom_pico::reboot::{DeviceAction, RebootScheduler};

// =============================================================================
// Interrupt bindings
// =============================================================================

bind_interrupts!(struct Irqs {
    USBCTRL_IRQ => InterruptHandler<USB>;
});

// =============================================================================
// Shared state between the MSC transport and the reboot poller
// =============================================================================

/// Instant of the flash commit, set once from inside the WRITE(10) path.
static COMMITTED: Signal<CriticalSectionRawMutex, Instant> = Signal::new();

fn note_commit(slot: Slot, at: Instant) {
    info!("slot {} committed at {} ms", slot.index(), at.as_millis());
    COMMITTED.signal(at);
}

// =============================================================================
// Entry point
// =============================================================================

#[embassy_executor::main]
async fn main(_spawner: Spawner) {
    let p = embassy_rp::init(Default::default());

    info!("eeprom-pico starting up");

    // ---- USB driver ----
    let driver = Driver::new(p.USB, Irqs);

    let mut usb_config = embassy_usb::Config::new(USB_VID, USB_PID);
    usb_config.manufacturer = Some(USB_MANUFACTURER);
    usb_config.product = Some(USB_PRODUCT);
    usb_config.serial_number = Some(USB_SERIAL);
    usb_config.max_power = 100;
    usb_config.max_packet_size_0 = 64;

    // Descriptor buffers (must be 'static)
    static CONFIG_DESC: StaticCell<[u8; 256]> = StaticCell::new();
    static BOS_DESC: StaticCell<[u8; 256]> = StaticCell::new();
    static MSOS_DESC: StaticCell<[u8; 256]> = StaticCell::new();
    static CONTROL_BUF: StaticCell<[u8; 128]> = StaticCell::new();

    let mut builder = Builder::new(
        driver,
        usb_config,
        CONFIG_DESC.init([0; 256]),
        BOS_DESC.init([0; 256]),
        MSOS_DESC.init([0; 256]),
        CONTROL_BUF.init([0; 128]),
    );

    // ---- Mass storage interface ----
    static MSC_STATE: StaticCell<msc::State<'static>> = StaticCell::new();
    let mut msc = MscClass::new(
        &mut builder,
        MSC_STATE.init(msc::State::default()),
        USB_MAX_PACKET_SIZE,
    );

    let mut usb = builder.build();

    // The pending write buffer is two slots wide; keep it off the stack.
    static DISK: StaticCell<EepromDisk<InternalFlash<'static>>> = StaticCell::new();
    let disk = DISK.init(EepromDisk::new(InternalFlash::new(p.FLASH)).on_commit(note_commit));

    let mut watchdog = Watchdog::new(p.WATCHDOG);

    info!(
        "eeprom-pico ready, VID:PID = {:04x}:{:04x}, slots at 0x{:08x}",
        USB_VID, USB_PID, SLOT_REGION_OFFSET
    );

    // ---- Reboot poller ----
    let reboot = async {
        let mut scheduler = RebootScheduler::new();
        let mut ticker = Ticker::every(REBOOT_POLL_INTERVAL);
        loop {
            ticker.next().await;

            if let Some(at) = COMMITTED.try_take() {
                scheduler.arm(at);
            }
            if let Some(DeviceAction::Reset) = scheduler.poll(Instant::now()) {
                info!("resetting so the host re-enumerates");
                watchdog.start(RESET_WATCHDOG_TIMEOUT);
                loop {
                    cortex_m::asm::nop();
                }
            }
        }
    };

    join3(usb.run(), msc.run(disk), reboot).await;
}
