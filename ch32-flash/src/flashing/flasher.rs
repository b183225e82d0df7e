//! Flash controller handshakes: unlock, erase, program, verify.

use std::time::Duration;

use bitfield::bitfield;

use super::{
    FlashError, FlashProgress, FLASH_ADDR, FLASH_CTLR, FLASH_END, FLASH_KEY1, FLASH_KEY2,
    FLASH_KEYR, FLASH_MODEKEYR, FLASH_OBKEYR, FLASH_STATR,
};
use crate::communication_interface::{Ch32CommunicationInterface, RetryPolicy};

/// The unit of erase and programming, a fast-mode page.
pub const BLOCK_SIZE: usize = 256;

/// Words per flash block.
const WORDS_PER_BLOCK: usize = BLOCK_SIZE / 4;

/// Polling budget for the controller busy flag around erase and page start.
const CONTROLLER_RETRIES: RetryPolicy = RetryPolicy {
    attempts: 100,
    interval: Duration::from_millis(1),
};

/// Polling budget for the per-word write busy flag. The controller drains a
/// single word quickly, so this spins without a pause.
const WORD_WRITE_RETRIES: RetryPolicy = RetryPolicy {
    attempts: 10_000,
    interval: Duration::ZERO,
};

/// Settling time after a page programming operation, before read back.
const PROGRAM_SETTLE: Duration = Duration::from_millis(1);

bitfield! {
    /// FLASH status register.
    #[derive(Copy, Clone)]
    pub struct Statr(u32);
    impl Debug;

    pub eop, set_eop: 5;
    pub wrbusy, _: 1;
    pub busy, _: 0;
}

bitfield! {
    /// FLASH control register.
    #[derive(Copy, Clone)]
    pub struct Ctlr(u32);
    impl Debug;

    pub pgstrt, set_pgstrt: 21;
    pub fter, set_fter: 17;
    pub ftpg, set_ftpg: 16;
    pub flock, _: 15;
    pub lock, _: 7;
    pub strt, set_strt: 6;
    pub ober, set_ober: 5;
    pub obg, set_obg: 4;
    pub mer, set_mer: 2;
    pub per, set_per: 1;
    pub pg, set_pg: 0;
}

/// Driver for the erase and program handshakes of the CH32V2 flash
/// controller.
///
/// The controller lives in target memory space, so every register access
/// goes through the memory bridge of the halted core. The core must be
/// halted before any of these operations are used.
#[derive(Debug)]
pub struct Flasher<'a, 'probe> {
    interface: &'a mut Ch32CommunicationInterface<'probe>,
}

impl<'a, 'probe> Flasher<'a, 'probe> {
    /// Create a flasher on top of an interface to a halted core.
    pub fn new(interface: &'a mut Ch32CommunicationInterface<'probe>) -> Self {
        Self { interface }
    }

    /// Poll the status register until the controller leaves its busy state.
    fn wait_for_controller(&mut self, policy: RetryPolicy) -> Result<(), FlashError> {
        let mut statr = Statr(0);

        for attempt in 0..policy.attempts {
            if attempt > 0 {
                std::thread::sleep(policy.interval);
            }

            statr = Statr(self.interface.read_word_32(FLASH_STATR)?);

            if !statr.busy() {
                return Ok(());
            }
        }

        Err(FlashError::ControllerTimeout { statr: statr.0 })
    }

    /// Poll the status register until the controller has drained the last
    /// written word.
    fn wait_for_word_write(&mut self, policy: RetryPolicy) -> Result<(), FlashError> {
        let mut statr = Statr(0);

        for attempt in 0..policy.attempts {
            if attempt > 0 {
                std::thread::sleep(policy.interval);
            }

            statr = Statr(self.interface.read_word_32(FLASH_STATR)?);

            if !statr.wrbusy() {
                return Ok(());
            }
        }

        Err(FlashError::ControllerTimeout { statr: statr.0 })
    }

    /// Unlock the flash controller.
    ///
    /// The full key sequence is entered unconditionally; entering it on an
    /// already unlocked controller is harmless. Succeeds only if both lock
    /// bits read back clear afterwards.
    pub fn unlock(&mut self) -> Result<(), FlashError> {
        let ctlr = self.interface.read_word_32(FLASH_CTLR)?;
        tracing::debug!("CTLR before unlock: {:#010x}", ctlr);

        for key_register in [FLASH_KEYR, FLASH_OBKEYR, FLASH_MODEKEYR] {
            self.interface.write_word_32(key_register, FLASH_KEY1)?;
            self.interface.write_word_32(key_register, FLASH_KEY2)?;
        }

        let ctlr = Ctlr(self.interface.read_word_32(FLASH_CTLR)?);
        tracing::debug!("CTLR after unlock: {:#010x}", ctlr.0);

        if ctlr.lock() || ctlr.flock() {
            return Err(FlashError::UnlockFailed { ctlr: ctlr.0 });
        }

        Ok(())
    }

    /// Erase a [`BLOCK_SIZE`] byte block of flash.
    ///
    /// The controller must be unlocked. `address` must be block aligned;
    /// violations are rejected before any hardware access.
    pub fn erase_block(&mut self, address: u32) -> Result<(), FlashError> {
        if address as usize % BLOCK_SIZE != 0 {
            return Err(FlashError::UnalignedAddress {
                address,
                alignment: BLOCK_SIZE as u32,
            });
        }

        self.wait_for_controller(CONTROLLER_RETRIES)?;

        let mut ctlr = Ctlr(0);
        ctlr.set_fter(true);
        self.interface.write_word_32(FLASH_CTLR, ctlr.0)?;

        self.interface.write_word_32(FLASH_ADDR, address)?;

        ctlr.set_strt(true);
        self.interface.write_word_32(FLASH_CTLR, ctlr.0)?;

        self.wait_for_controller(CONTROLLER_RETRIES)?;
        self.interface.write_word_32(FLASH_CTLR, 0)?;

        Ok(())
    }

    /// Program a [`BLOCK_SIZE`] byte block of flash and verify it by read
    /// back.
    ///
    /// The block must have been erased before. The controller accepts one
    /// word at a time, so every word write waits for the write busy flag to
    /// clear before the next one. After the page start, all words are read
    /// back and compared byte for byte; a mismatch fails the operation and
    /// is not retried.
    pub fn program_block(&mut self, address: u32, data: &[u8; BLOCK_SIZE]) -> Result<(), FlashError> {
        if address as usize % BLOCK_SIZE != 0 {
            return Err(FlashError::UnalignedAddress {
                address,
                alignment: BLOCK_SIZE as u32,
            });
        }

        self.wait_for_controller(CONTROLLER_RETRIES)?;

        let mut ctlr = Ctlr(0);
        ctlr.set_ftpg(true);
        self.interface.write_word_32(FLASH_CTLR, ctlr.0)?;

        self.interface.write_word_32(FLASH_ADDR, address)?;

        let mut written = [0u32; WORDS_PER_BLOCK];
        for (index, chunk) in data.chunks_exact(4).enumerate() {
            let word = u32::from_le_bytes(chunk.try_into().unwrap());
            written[index] = word;

            self.interface
                .write_word_32(address + (index * 4) as u32, word)?;
            self.wait_for_word_write(WORD_WRITE_RETRIES)?;
        }

        ctlr.set_pgstrt(true);
        self.interface.write_word_32(FLASH_CTLR, ctlr.0)?;

        self.wait_for_controller(CONTROLLER_RETRIES)?;
        self.interface.write_word_32(FLASH_CTLR, 0)?;

        std::thread::sleep(PROGRAM_SETTLE);

        let mut read = [0u32; WORDS_PER_BLOCK];
        for (index, word) in read.iter_mut().enumerate() {
            *word = self.interface.read_word_32(address + (index * 4) as u32)?;
        }

        if written != read {
            tracing::error!("Write block mismatch at {:#010x}", address);
            tracing::error!("Write:");
            for (index, word) in written.iter().enumerate() {
                tracing::error!("{:2x}: {:08x}", index, word);
            }
            tracing::error!("Read:");
            for (index, word) in read.iter().enumerate() {
                tracing::error!("{:2x}: {:08x}", index, word);
            }
            return Err(FlashError::VerifyFailed { address });
        }

        Ok(())
    }

    /// Erase and program a range of flash, block by block.
    ///
    /// `address` must be block aligned and the range must fit into the code
    /// flash region; both are checked before any hardware access. A final
    /// partial block is padded with the erased byte pattern. The first
    /// failing block aborts the whole range; flash contents past the failure
    /// are left as they were.
    pub fn write_flash(
        &mut self,
        address: u32,
        data: &[u8],
        progress: &FlashProgress,
    ) -> Result<(), FlashError> {
        if address as usize % BLOCK_SIZE != 0 {
            return Err(FlashError::UnalignedAddress {
                address,
                alignment: BLOCK_SIZE as u32,
            });
        }

        if address < super::FLASH_BASE || address as u64 + data.len() as u64 > FLASH_END as u64 {
            return Err(FlashError::OutOfBounds {
                address,
                len: data.len(),
            });
        }

        progress.started_programming(data.len());

        for (index, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            let block_address = address + (index * BLOCK_SIZE) as u32;

            progress.programming_block(block_address, index * BLOCK_SIZE, data.len());

            let mut block = [0xff; BLOCK_SIZE];
            block[..chunk.len()].copy_from_slice(chunk);

            let result = self
                .erase_block(block_address)
                .and_then(|()| self.program_block(block_address, &block));

            if let Err(error) = result {
                tracing::error!("Failed to write flash at {:#010x}: {}", block_address, error);
                progress.failed_programming();
                return Err(error);
            }
        }

        progress.finished_programming();

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{Flasher, BLOCK_SIZE};
    use crate::communication_interface::Ch32CommunicationInterface;
    use crate::fake_probe::FakeProbe;
    use crate::flashing::{FlashError, FlashProgress, FLASH_BASE};

    fn block(seed: u8) -> [u8; BLOCK_SIZE] {
        let mut data = [0; BLOCK_SIZE];
        for (index, byte) in data.iter_mut().enumerate() {
            *byte = seed.wrapping_add(index as u8);
        }
        data
    }

    #[test]
    fn erase_rejects_unaligned_address_without_transfers() {
        let mut probe = FakeProbe::new();
        let mut interface = Ch32CommunicationInterface::new(&mut probe);
        let mut flasher = Flasher::new(&mut interface);

        assert!(matches!(
            flasher.erase_block(FLASH_BASE + 0x40),
            Err(FlashError::UnalignedAddress { alignment: 256, .. })
        ));

        assert!(probe.operations().is_empty());
    }

    #[test]
    fn program_rejects_unaligned_address_without_transfers() {
        let mut probe = FakeProbe::new();
        let mut interface = Ch32CommunicationInterface::new(&mut probe);
        let mut flasher = Flasher::new(&mut interface);

        assert!(matches!(
            flasher.program_block(FLASH_BASE + 0x80, &block(0)),
            Err(FlashError::UnalignedAddress { alignment: 256, .. })
        ));

        assert!(probe.operations().is_empty());
    }

    #[test]
    fn write_flash_rejects_unaligned_base_without_transfers() {
        let mut probe = FakeProbe::new();
        let mut interface = Ch32CommunicationInterface::new(&mut probe);
        let mut flasher = Flasher::new(&mut interface);
        let progress = FlashProgress::new(|_| {});

        // 64 byte aligned is not enough; blocks are 256 bytes.
        assert!(matches!(
            flasher.write_flash(FLASH_BASE + 0x40, &[0; 512], &progress),
            Err(FlashError::UnalignedAddress { alignment: 256, .. })
        ));
        assert!(matches!(
            flasher.write_flash(FLASH_BASE + 0x20, &[0; 512], &progress),
            Err(FlashError::UnalignedAddress { alignment: 256, .. })
        ));

        assert!(probe.operations().is_empty());
    }

    #[test]
    fn write_flash_rejects_oversized_image_without_transfers() {
        let mut probe = FakeProbe::new();
        let mut interface = Ch32CommunicationInterface::new(&mut probe);
        let mut flasher = Flasher::new(&mut interface);
        let progress = FlashProgress::new(|_| {});

        let image = vec![0; 16 * 1024 + 1];
        assert!(matches!(
            flasher.write_flash(FLASH_BASE, &image, &progress),
            Err(FlashError::OutOfBounds { len, .. }) if len == image.len()
        ));

        assert!(probe.operations().is_empty());
    }

    #[test]
    fn unlock_clears_the_lock_bits() {
        let mut probe = FakeProbe::new();
        let mut interface = Ch32CommunicationInterface::new(&mut probe);
        let mut flasher = Flasher::new(&mut interface);

        flasher.unlock().unwrap();

        assert!(!probe.flash_locked());
    }

    #[test]
    fn unlock_fails_when_the_keys_are_not_accepted() {
        let mut probe = FakeProbe::new();
        probe.refuse_unlock();
        let mut interface = Ch32CommunicationInterface::new(&mut probe);
        let mut flasher = Flasher::new(&mut interface);

        assert!(matches!(
            flasher.unlock(),
            Err(FlashError::UnlockFailed { ctlr: 0x8080 })
        ));
    }

    #[test]
    fn erased_block_reads_back_erased_pattern() {
        let mut probe = FakeProbe::new();
        let mut interface = Ch32CommunicationInterface::new(&mut probe);
        let mut flasher = Flasher::new(&mut interface);

        let address = FLASH_BASE + 0x400;
        flasher.unlock().unwrap();
        flasher.erase_block(address).unwrap();
        flasher.program_block(address, &block(0x42)).unwrap();
        flasher.erase_block(address).unwrap();

        for offset in (0..BLOCK_SIZE as u32).step_by(4) {
            assert_eq!(
                flasher.interface.read_word_32(address + offset).unwrap(),
                0xffff_ffff
            );
        }
    }

    #[test]
    fn programmed_block_reads_back_exactly() {
        let mut probe = FakeProbe::new();
        let mut interface = Ch32CommunicationInterface::new(&mut probe);
        let mut flasher = Flasher::new(&mut interface);

        let data = block(0x17);
        flasher.unlock().unwrap();
        flasher.erase_block(FLASH_BASE).unwrap();
        flasher.program_block(FLASH_BASE, &data).unwrap();

        assert_eq!(&probe.flash_contents()[..BLOCK_SIZE], &data[..]);
    }

    #[test]
    fn single_bit_flip_fails_verification() {
        let mut probe = FakeProbe::new();
        probe.corrupt_read(FLASH_BASE + 0x08, 0x0000_0100);
        let mut interface = Ch32CommunicationInterface::new(&mut probe);
        let mut flasher = Flasher::new(&mut interface);

        flasher.unlock().unwrap();
        flasher.erase_block(FLASH_BASE).unwrap();

        assert!(matches!(
            flasher.program_block(FLASH_BASE, &block(0x99)),
            Err(FlashError::VerifyFailed { address }) if address == FLASH_BASE
        ));
    }

    #[test]
    fn busy_controller_times_out() {
        let mut probe = FakeProbe::new();
        probe.hold_controller_busy();
        let mut interface = Ch32CommunicationInterface::new(&mut probe);
        let mut flasher = Flasher::new(&mut interface);

        assert!(matches!(
            flasher.erase_block(FLASH_BASE),
            Err(FlashError::ControllerTimeout { statr }) if statr & 1 == 1
        ));
    }
}
