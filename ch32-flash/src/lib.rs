//! # In-circuit flash programming for WCH CH32V2 microcontrollers
//!
//! This crate drives the on-chip debug module of a CH32V2 over an already
//! established single-wire debug link: it halts the core, unlocks and
//! reprograms the internal code flash, verifies the written contents and
//! restarts the core. It is meant for hosts that own the physical link, such
//! as a companion microcontroller or a PC side utility, and want to push new
//! firmware into the target without an external programmer.
//!
//! The physical wire protocol is not implemented here. It is consumed
//! through the [`RvswdProbe`] trait, whose four operations (`init`, `reset`,
//! register read, register write) are all this crate needs. Everything else
//! is built on top of that trait: CPU control, the abstract command
//! interface, program buffer execution, the memory bridge and the flash
//! controller handshakes.
//!
//! # Examples
//!
//! ## Programming a firmware image
//!
//! ```no_run
//! use ch32_flash::{download_firmware, RvswdProbe};
//!
//! # fn open_probe() -> Box<dyn RvswdProbe> { unimplemented!() }
//! let mut probe = open_probe();
//!
//! let firmware = std::fs::read("firmware.bin")?;
//! download_firmware(probe.as_mut(), &firmware)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Watching progress
//!
//! ```no_run
//! use ch32_flash::{
//!     download_firmware_with_options, DownloadOptions, FlashProgress, RvswdProbe,
//! };
//!
//! # fn open_probe() -> Box<dyn RvswdProbe> { unimplemented!() }
//! let mut probe = open_probe();
//!
//! let progress = FlashProgress::new(|event| println!("Event: {:?}", event));
//! let options = DownloadOptions {
//!     progress: Some(&progress),
//! };
//! download_firmware_with_options(probe.as_mut(), &[0u8; 512], options)?;
//! # Ok::<(), ch32_flash::FlashError>(())
//! ```

#[warn(missing_docs)]
pub mod assembly;
#[warn(missing_docs)]
pub mod communication_interface;
pub mod fake_probe;
#[warn(missing_docs)]
pub mod flashing;
mod memory_interface;
#[warn(missing_docs)]
mod probe;

pub use crate::communication_interface::{
    Ch32CommunicationInterface, Ch32Error, RetryPolicy, CSR_BASE, GPR_BASE,
};
pub use crate::fake_probe::FakeProbe;
pub use crate::flashing::{
    download_firmware, download_firmware_with_options, DownloadOptions, FlashError, FlashProgress,
    Flasher, ProgressEvent, BLOCK_SIZE, FLASH_BASE, FLASH_END, FLASH_SIZE,
};
pub use crate::probe::{DebugProbeError, RvswdProbe};
