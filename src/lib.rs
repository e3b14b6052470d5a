#![cfg_attr(not(test), no_std)]
//! RP2040 firmware library that presents the top of internal flash as a
//! small FAT12 USB disk holding three fixed-size EEPROM image files.
//!
//! Everything except `flash::InternalFlash` and the USB driver wiring in
//! the binary is hardware independent and tested on the host.

// This must go first so the logging macros are visible to every module.
pub(crate) mod fmt;

pub mod commit;
pub mod config;
pub mod disk;
pub mod fat;
pub mod flash;
pub mod layout;
pub mod msc;
pub mod reboot;
pub mod scsi;
