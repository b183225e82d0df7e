//! A simulated CH32V2 target for tests and dry runs.
//!
//! [`FakeProbe`] implements [`RvswdProbe`] on top of an in-memory model of
//! the debug module, the core's general-purpose registers and the flash
//! controller. It executes the two memory snippets this crate loads into the
//! program buffer, honors the flash key sequence and keeps a full log of
//! every transport operation, so the whole programming sequence can run
//! without hardware.

use std::fmt;

use crate::assembly;
use crate::communication_interface::{
    AccessRegisterCommand, Data0, DebugRegister, Dmcontrol, Dmstatus, Progbuf0, GPR_BASE,
};
use crate::flashing::{
    FLASH_ADDR, FLASH_BASE, FLASH_CTLR, FLASH_END, FLASH_KEY1, FLASH_KEY2, FLASH_KEYR,
    FLASH_MODEKEYR, FLASH_OBKEYR, FLASH_SIZE, FLASH_STATR,
};
use crate::probe::{DebugProbeError, RvswdProbe};

const DATA0: u8 = Data0::ADDRESS;
const DMCONTROL: u8 = Dmcontrol::ADDRESS;
const DMSTATUS: u8 = Dmstatus::ADDRESS;
const COMMAND: u8 = AccessRegisterCommand::ADDRESS;
const PROGBUF0: u8 = Progbuf0::ADDRESS;
const PROGBUF7: u8 = Progbuf0::ADDRESS + 7;

// dmcontrol request bits.
const DMCONTROL_HALTREQ: u32 = 1 << 31;
const DMCONTROL_RESUMEREQ: u32 = 1 << 30;
const DMCONTROL_ACKHAVERESET: u32 = 1 << 28;
const DMCONTROL_NDMRESET: u32 = 1 << 1;

// command fields of the access register command.
const COMMAND_POSTEXEC: u32 = 1 << 18;
const COMMAND_TRANSFER: u32 = 1 << 17;
const COMMAND_WRITE: u32 = 1 << 16;

// Flash control register bits.
const CTLR_STRT: u32 = 1 << 6;
const CTLR_LOCK: u32 = 1 << 7;
const CTLR_FLOCK: u32 = 1 << 15;
const CTLR_FTPG: u32 = 1 << 16;
const CTLR_FTER: u32 = 1 << 17;
const CTLR_PGSTRT: u32 = 1 << 21;

/// A record of a single transport operation performed against the fake
/// probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// The link was initialized.
    Init,
    /// The link was reset.
    Reset,
    /// A debug module register was read.
    ReadDmRegister {
        /// The register address.
        address: u8,
    },
    /// A debug module register was written.
    WriteDmRegister {
        /// The register address.
        address: u8,
        /// The written value.
        value: u32,
    },
}

/// This is a mock probe which simulates a CH32V2 target. It can be used for
/// mocking things in tests or for dry runs.
pub struct FakeProbe {
    operations: Vec<Operation>,
    fail_after: Option<usize>,

    // Core state.
    halted: bool,
    resume_ack: bool,
    have_reset: bool,
    halt_on_request: bool,
    resume_on_request: bool,
    reset_on_request: bool,

    // Abstract command state.
    data0: u32,
    progbuf: [u32; 8],
    gprs: [u32; 32],

    // Flash controller state.
    flash: Vec<u8>,
    flash_addr: u32,
    ctlr_mode: u32,
    lock: bool,
    flock: bool,
    keyr_stage: u8,
    obkeyr_stage: u8,
    modekeyr_stage: u8,
    accept_keys: bool,
    controller_busy: bool,
    corrupt_read: Option<(u32, u32)>,
    erases: usize,
    programs: usize,
}

impl FakeProbe {
    /// Create a fake probe attached to a blank target: core running, flash
    /// locked and fully erased.
    pub fn new() -> Self {
        FakeProbe {
            operations: Vec::new(),
            fail_after: None,

            halted: false,
            resume_ack: false,
            have_reset: false,
            halt_on_request: true,
            resume_on_request: true,
            reset_on_request: true,

            data0: 0,
            progbuf: [0; 8],
            gprs: [0; 32],

            flash: vec![0xff; FLASH_SIZE as usize],
            flash_addr: 0,
            ctlr_mode: 0,
            lock: true,
            flock: true,
            keyr_stage: 0,
            obkeyr_stage: 0,
            modekeyr_stage: 0,
            accept_keys: true,
            controller_busy: false,
            corrupt_read: None,
            erases: 0,
            programs: 0,
        }
    }

    /// Let the first `count` operations succeed and fail every operation
    /// after them.
    pub fn fail_after(&mut self, count: usize) {
        self.fail_after = Some(count);
    }

    /// Ignore halt requests, so halting the core times out.
    pub fn ignore_halt_requests(&mut self) {
        self.halt_on_request = false;
    }

    /// Ignore resume requests, so resuming the core times out.
    pub fn ignore_resume_requests(&mut self) {
        self.resume_on_request = false;
    }

    /// Ignore reset requests, so resetting the core times out.
    pub fn ignore_reset_requests(&mut self) {
        self.reset_on_request = false;
    }

    /// Ignore the flash key sequence, so unlocking fails.
    pub fn refuse_unlock(&mut self) {
        self.accept_keys = false;
    }

    /// Report the flash controller as busy indefinitely.
    pub fn hold_controller_busy(&mut self) {
        self.controller_busy = true;
    }

    /// XOR `mask` into every memory word read from `address`.
    pub fn corrupt_read(&mut self, address: u32, mask: u32) {
        self.corrupt_read = Some((address, mask));
    }

    /// The log of all transport operations performed so far, including a
    /// failed one.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Whether the core is currently halted.
    pub fn core_halted(&self) -> bool {
        self.halted
    }

    /// Whether any of the flash lock bits is still set.
    pub fn flash_locked(&self) -> bool {
        self.lock || self.flock
    }

    /// The simulated flash contents.
    pub fn flash_contents(&self) -> &[u8] {
        &self.flash
    }

    /// Number of block erases performed.
    pub fn erase_count(&self) -> usize {
        self.erases
    }

    /// Number of page program operations started.
    pub fn program_count(&self) -> usize {
        self.programs
    }

    /// Record `operation` and apply the fault injection budget.
    fn record(&mut self, operation: Operation) -> Result<(), DebugProbeError> {
        let index = self.operations.len();
        self.operations.push(operation);

        match self.fail_after {
            Some(count) if index >= count => Err(match operation {
                Operation::Init => DebugProbeError::Init,
                Operation::Reset => DebugProbeError::Reset,
                Operation::ReadDmRegister { address }
                | Operation::WriteDmRegister { address, .. } => {
                    DebugProbeError::Transfer { address }
                }
            }),
            _ => Ok(()),
        }
    }

    fn dmstatus(&self) -> u32 {
        let mut value = 0;

        if self.halted {
            value |= 0b11 << 8; // allhalted | anyhalted
        } else {
            value |= 0b11 << 10; // allrunning | anyrunning
        }
        if self.resume_ack {
            value |= 0b11 << 16; // allresumeack | anyresumeack
        }
        if self.have_reset {
            value |= 0b11 << 18; // allhavereset | anyhavereset
        }

        value
    }

    fn write_dmcontrol(&mut self, value: u32) {
        if value & DMCONTROL_HALTREQ != 0 {
            self.resume_ack = false;
            if self.halt_on_request {
                self.halted = true;
            }
        }
        if value & DMCONTROL_RESUMEREQ != 0 && self.resume_on_request {
            self.halted = false;
            self.resume_ack = true;
        }
        if value & DMCONTROL_NDMRESET != 0 && self.reset_on_request {
            // The core restarts from the reset vector and runs.
            self.halted = false;
            self.have_reset = true;
        }
        if value & DMCONTROL_ACKHAVERESET != 0 {
            self.have_reset = false;
        }
    }

    fn execute_command(&mut self, command: u32) {
        if command >> 24 != 0 {
            // Only the access register command is modeled.
            return;
        }

        if command & COMMAND_TRANSFER != 0 {
            let regno = (command & 0xffff) as u16;

            if (GPR_BASE..GPR_BASE + 32).contains(&regno) {
                let index = (regno - GPR_BASE) as usize;
                if command & COMMAND_WRITE != 0 {
                    // x0 is hardwired to zero.
                    if index != 0 {
                        self.gprs[index] = self.data0;
                    }
                } else {
                    self.data0 = self.gprs[index];
                }
            } else if command & COMMAND_WRITE == 0 {
                // CSRs are not modeled.
                self.data0 = 0;
            }
        }

        if command & COMMAND_POSTEXEC != 0 {
            self.execute_progbuf();
        }
    }

    fn execute_progbuf(&mut self) {
        let snippet = self.progbuf[0];

        if snippet == u32::from_le_bytes(assembly::READ_WORD) {
            self.gprs[10] = self.read_memory_word(self.gprs[11]);
        } else if snippet == u32::from_le_bytes(assembly::WRITE_WORD) {
            self.write_memory_word(self.gprs[11], self.gprs[10]);
        } else {
            panic!("unsupported program buffer contents {snippet:#010x}");
        }
    }

    fn read_memory_word(&self, address: u32) -> u32 {
        let mut value = if (FLASH_BASE..FLASH_END).contains(&address) {
            let offset = (address - FLASH_BASE) as usize;
            u32::from_le_bytes(self.flash[offset..offset + 4].try_into().unwrap())
        } else {
            match address {
                FLASH_STATR => {
                    if self.controller_busy {
                        0b11 // busy | wrbusy
                    } else {
                        0
                    }
                }
                FLASH_CTLR => self.ctlr_value(),
                FLASH_ADDR => self.flash_addr,
                _ => 0,
            }
        };

        if let Some((corrupt_address, mask)) = self.corrupt_read {
            if corrupt_address == address {
                value ^= mask;
            }
        }

        value
    }

    fn write_memory_word(&mut self, address: u32, value: u32) {
        if (FLASH_BASE..FLASH_END).contains(&address) {
            // Word writes land in flash only in fast programming mode, and
            // programming can only clear bits.
            if !self.flock && self.ctlr_mode & CTLR_FTPG != 0 {
                let offset = (address - FLASH_BASE) as usize;
                for (index, byte) in value.to_le_bytes().iter().enumerate() {
                    self.flash[offset + index] &= byte;
                }
            }
            return;
        }

        match address {
            FLASH_KEYR => {
                if self.accept_keys {
                    self.keyr_stage = key_sequence(self.keyr_stage, value);
                    if self.keyr_stage == 2 {
                        self.lock = false;
                    }
                }
            }
            FLASH_OBKEYR => {
                if self.accept_keys {
                    self.obkeyr_stage = key_sequence(self.obkeyr_stage, value);
                }
            }
            FLASH_MODEKEYR => {
                if self.accept_keys {
                    self.modekeyr_stage = key_sequence(self.modekeyr_stage, value);
                    if self.modekeyr_stage == 2 {
                        self.flock = false;
                    }
                }
            }
            FLASH_ADDR => self.flash_addr = value,
            FLASH_CTLR => {
                if self.lock {
                    // Control writes are ignored while the flash is locked.
                    return;
                }
                self.ctlr_mode = value & !(CTLR_LOCK | CTLR_FLOCK);
                if !self.flock && value & CTLR_FTER != 0 && value & CTLR_STRT != 0 {
                    self.erase_block_at(self.flash_addr);
                }
                if !self.flock && value & CTLR_FTPG != 0 && value & CTLR_PGSTRT != 0 {
                    self.programs += 1;
                }
            }
            _ => {}
        }
    }

    fn erase_block_at(&mut self, address: u32) {
        if (FLASH_BASE..FLASH_END).contains(&address) {
            let offset = (address - FLASH_BASE) as usize;
            let end = usize::min(offset + 256, self.flash.len());
            self.flash[offset..end].fill(0xff);
            self.erases += 1;
        }
    }

    fn ctlr_value(&self) -> u32 {
        let mut value = self.ctlr_mode;
        if self.lock {
            value |= CTLR_LOCK;
        }
        if self.flock {
            value |= CTLR_FLOCK;
        }
        value
    }
}

impl Default for FakeProbe {
    fn default() -> Self {
        FakeProbe::new()
    }
}

impl fmt::Debug for FakeProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeProbe")
            .field("operations", &self.operations.len())
            .field("halted", &self.halted)
            .field("have_reset", &self.have_reset)
            .field("lock", &self.lock)
            .field("flock", &self.flock)
            .field("erases", &self.erases)
            .field("programs", &self.programs)
            .finish()
    }
}

impl RvswdProbe for FakeProbe {
    fn init(&mut self) -> Result<(), DebugProbeError> {
        self.record(Operation::Init)
    }

    fn reset(&mut self) -> Result<(), DebugProbeError> {
        self.record(Operation::Reset)
    }

    fn read_dm_register(&mut self, address: u8) -> Result<u32, DebugProbeError> {
        self.record(Operation::ReadDmRegister { address })?;

        let value = match address {
            DMSTATUS => self.dmstatus(),
            DATA0 => self.data0,
            _ => 0,
        };

        Ok(value)
    }

    fn write_dm_register(&mut self, address: u8, value: u32) -> Result<(), DebugProbeError> {
        self.record(Operation::WriteDmRegister { address, value })?;

        match address {
            DMCONTROL => self.write_dmcontrol(value),
            DATA0 => self.data0 = value,
            COMMAND => self.execute_command(value),
            PROGBUF0..=PROGBUF7 => self.progbuf[(address - PROGBUF0) as usize] = value,
            _ => {}
        }

        Ok(())
    }
}

/// Advance a flash key register through its two-value unlock sequence.
fn key_sequence(stage: u8, value: u32) -> u8 {
    match (stage, value) {
        (0, FLASH_KEY1) => 1,
        (1, FLASH_KEY2) => 2,
        (2, _) => 2,
        _ => 0,
    }
}

#[cfg(test)]
mod test {
    use super::FakeProbe;
    use crate::flashing::{FLASH_KEY1, FLASH_KEY2, FLASH_KEYR};
    use crate::probe::RvswdProbe;

    // The key registers only unlock on the exact two-value sequence.
    #[test]
    fn wrong_key_order_keeps_the_flash_locked() {
        let mut probe = FakeProbe::new();

        probe.write_memory_word(FLASH_KEYR, FLASH_KEY2);
        probe.write_memory_word(FLASH_KEYR, FLASH_KEY1);

        assert!(probe.flash_locked());
    }

    #[test]
    fn halt_request_halts_the_core() {
        let mut probe = FakeProbe::new();

        probe.write_dm_register(0x10, 0x8000_0001).unwrap();

        assert!(probe.core_halted());
    }
}
