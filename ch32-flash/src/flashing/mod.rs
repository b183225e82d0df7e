//! Flash programming operations.
//!
//! This module provides flash unlocking, erasing, programming and
//! verification for the CH32V2 code flash, plus a high level entry point
//! that runs the whole programming sequence against a halted target.

mod download;
mod error;
mod flasher;
mod progress;

pub use download::{download_firmware, download_firmware_with_options, DownloadOptions};
pub use error::FlashError;
pub use flasher::{Ctlr, Flasher, Statr, BLOCK_SIZE};
pub use progress::{FlashProgress, ProgressEvent};

/// Start of the code flash region.
pub const FLASH_BASE: u32 = 0x0800_0000;

/// Size of the code flash region.
pub const FLASH_SIZE: u32 = 16 * 1024;

/// End of the code flash region, exclusive.
pub const FLASH_END: u32 = FLASH_BASE + FLASH_SIZE;

/// FLASH key register, takes the unlock key pair for the control register.
pub const FLASH_KEYR: u32 = 0x4002_2004;

/// FLASH option byte key register.
pub const FLASH_OBKEYR: u32 = 0x4002_2008;

/// FLASH status register.
pub const FLASH_STATR: u32 = 0x4002_200c;

/// FLASH control register.
pub const FLASH_CTLR: u32 = 0x4002_2010;

/// FLASH address register.
pub const FLASH_ADDR: u32 = 0x4002_2014;

/// FLASH fast mode key register.
pub const FLASH_MODEKEYR: u32 = 0x4002_2024;

/// First half of the unlock key pair.
pub const FLASH_KEY1: u32 = 0x4567_0123;

/// Second half of the unlock key pair.
pub const FLASH_KEY2: u32 = 0xcdef_89ab;
