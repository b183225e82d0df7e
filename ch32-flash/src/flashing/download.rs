//! The high level programming sequence.

use super::{FlashError, FlashProgress, Flasher, FLASH_BASE};
use crate::communication_interface::{Ch32CommunicationInterface, Ch32Error};
use crate::probe::RvswdProbe;

/// Options for downloading a firmware image onto a target chip.
#[derive(Default)]
pub struct DownloadOptions<'progress> {
    /// An optional progress reporter which is used if this argument is set
    /// to `Some(...)`. Otherwise progress is reported through the log.
    pub progress: Option<&'progress FlashProgress>,
}

/// Program `firmware` into the code flash of the target and restart it.
///
/// This drives the full sequence: initialize and reset the link, halt the
/// core, unlock the flash controller, erase, program and verify the image
/// block by block, and finally reset the core so it runs the new firmware.
///
/// If you want to observe progress, have a look at
/// [`download_firmware_with_options`].
pub fn download_firmware(probe: &mut dyn RvswdProbe, firmware: &[u8]) -> Result<(), FlashError> {
    download_firmware_with_options(probe, firmware, DownloadOptions::default())
}

/// Program `firmware` into the code flash of the target and restart it.
///
/// Like [`download_firmware`], with a caller supplied progress sink.
///
/// The first failing step aborts the sequence; there is no cleanup or
/// rollback. A failure mid-way can leave the core halted and the flash
/// partially written.
pub fn download_firmware_with_options(
    probe: &mut dyn RvswdProbe,
    firmware: &[u8],
    options: DownloadOptions<'_>,
) -> Result<(), FlashError> {
    probe.init().map_err(Ch32Error::Probe)?;
    probe.reset().map_err(Ch32Error::Probe)?;

    let mut interface = Ch32CommunicationInterface::new(probe);
    interface.halt()?;

    let fallback = FlashProgress::log();
    let progress = options.progress.unwrap_or(&fallback);

    let mut flasher = Flasher::new(&mut interface);
    flasher.unlock()?;
    flasher.write_flash(FLASH_BASE, firmware, progress)?;

    interface.reset_and_run()?;

    tracing::info!("Firmware download complete, {} bytes written", firmware.len());

    Ok(())
}
