//! Debug module communication.
//!
//! This module implements communication with the debug module of the CH32V2
//! family, which follows the RISCV debug specification v0.13: halting and
//! restarting the core through `dmcontrol`/`dmstatus`, and core register
//! access plus program buffer execution through the abstract command
//! interface.

use std::time::Duration;

use bitfield::bitfield;
use thiserror::Error;

use crate::probe::{DebugProbeError, RvswdProbe};

/// Offset added to a register number to address the CSR space through an
/// access register command.
pub const CSR_BASE: u16 = 0x0000;

/// Offset added to a register number to address the general-purpose register
/// space through an access register command.
pub const GPR_BASE: u16 = 0x1000;

/// Size of the program buffer in bytes, eight 32-bit words.
pub const PROGRAM_BUFFER_SIZE: usize = 8 * 4;

/// Key that unlocks writes to the debug module configuration registers
/// (`cfgr`/`shdwcfgr`), placed in the upper half of the written value.
pub const CFGR_KEY: u32 = 0x5aa5_0000;

/// Output-enable bit of the debug module configuration registers.
pub const CFGR_OUTEN: u32 = 1 << 10;

/// A bounded polling budget for operations that wait on a hardware status
/// bit: the status is read at most `attempts` times, `interval` apart.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Number of status reads before the wait is abandoned.
    pub attempts: u32,
    /// Pause between consecutive status reads.
    pub interval: Duration,
}

/// Polling budget for the halt, resume and reset acknowledgements.
const CORE_STATE_RETRIES: RetryPolicy = RetryPolicy {
    attempts: 5,
    interval: Duration::from_millis(10),
};

/// Settling time between the writes of the reset acknowledge sequence.
const RESET_SETTLE: Duration = Duration::from_millis(10);

/// This error occurs whenever communication through the debug module fails.
#[derive(Error, Debug)]
pub enum Ch32Error {
    /// An error during the transport of a debug module register.
    #[error("Error during the transport of a debug module register")]
    Probe(#[from] DebugProbeError),
    /// The core did not acknowledge the halt request.
    #[error("Timeout while waiting for the core to halt, dmstatus: {0:#010x}")]
    HaltTimeout(u32),
    /// The core did not acknowledge the resume request.
    #[error("Timeout while waiting for the core to resume, dmstatus: {0:#010x}")]
    ResumeTimeout(u32),
    /// The core did not report the requested reset.
    #[error("Timeout while waiting for the core to reset, dmstatus: {0:#010x}")]
    ResetTimeout(u32),
    /// A debug program does not fit into the program buffer.
    #[error("Debug program of {0} bytes is too long for the {PROGRAM_BUFFER_SIZE} byte program buffer")]
    ProgramBufferTooLong(usize),
    /// A debug program is not a whole number of 16-bit instruction parcels.
    #[error("Debug program length {0} is not a multiple of 2")]
    UnalignedProgram(usize),
}

/// A debug module register, identified by its address on the wire.
pub trait DebugRegister: From<u32> + Into<u32> {
    /// Address of this register in the debug module register file.
    const ADDRESS: u8;
    /// Name of this register.
    const NAME: &'static str;
}

macro_rules! data_register {
    ($i:ident, $addr:expr, $name:expr) => {
        #[derive(Debug, Copy, Clone)]
        struct $i(u32);

        impl DebugRegister for $i {
            const ADDRESS: u8 = $addr;
            const NAME: &'static str = $name;
        }

        impl From<$i> for u32 {
            fn from(register: $i) -> Self {
                register.0
            }
        }

        impl From<u32> for $i {
            fn from(value: u32) -> Self {
                Self(value)
            }
        }
    };

    (pub $i:ident, $addr:expr, $name:expr) => {
        #[doc = concat!("`", $name, "` register.")]
        #[derive(Debug, Copy, Clone)]
        pub struct $i(pub u32);

        impl DebugRegister for $i {
            const ADDRESS: u8 = $addr;
            const NAME: &'static str = $name;
        }

        impl From<$i> for u32 {
            fn from(register: $i) -> Self {
                register.0
            }
        }

        impl From<u32> for $i {
            fn from(value: u32) -> Self {
                Self(value)
            }
        }
    };
}

data_register! { pub Data0, 0x04, "data0" }
data_register! { pub Data1, 0x05, "data1" }
data_register! { pub Hartinfo, 0x12, "hartinfo" }
data_register! { pub Abstractauto, 0x18, "abstractauto" }
data_register! { pub Progbuf0, 0x20, "progbuf0" }
data_register! { pub Haltsum0, 0x40, "haltsum0" }
data_register! { pub Cpbr, 0x7c, "cpbr" }
data_register! { pub Cfgr, 0x7d, "cfgr" }
data_register! { pub Shdwcfgr, 0x7e, "shdwcfgr" }

bitfield! {
    /// `dmcontrol` register, located at address 0x10.
    #[derive(Copy, Clone)]
    pub struct Dmcontrol(u32);
    impl Debug;

    pub _, set_haltreq: 31;
    pub _, set_resumereq: 30;
    pub hartreset, set_hartreset: 29;
    pub _, set_ackhavereset: 28;
    pub _, set_resethaltreq: 3;
    pub _, set_clrresethaltreq: 2;
    pub ndmreset, set_ndmreset: 1;
    pub dmactive, set_dmactive: 0;
}

impl DebugRegister for Dmcontrol {
    const ADDRESS: u8 = 0x10;
    const NAME: &'static str = "dmcontrol";
}

impl From<Dmcontrol> for u32 {
    fn from(register: Dmcontrol) -> Self {
        register.0
    }
}

impl From<u32> for Dmcontrol {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

bitfield! {
    /// Readonly `dmstatus` register, located at address 0x11.
    #[derive(Copy, Clone)]
    pub struct Dmstatus(u32);
    impl Debug;

    pub allhavereset, _: 19;
    pub anyhavereset, _: 18;
    pub allresumeack, _: 17;
    pub anyresumeack, _: 16;
    pub allunavail, _: 13;
    pub anyunavail, _: 12;
    pub allrunning, _: 11;
    pub anyrunning, _: 10;
    pub allhalted, _: 9;
    pub anyhalted, _: 8;
    pub authenticated, _: 7;
    pub version, _: 3, 0;
}

impl DebugRegister for Dmstatus {
    const ADDRESS: u8 = 0x11;
    const NAME: &'static str = "dmstatus";
}

impl From<Dmstatus> for u32 {
    fn from(value: Dmstatus) -> Self {
        value.0
    }
}

impl From<u32> for Dmstatus {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

bitfield! {
    /// `abstractcs` register, located at address 0x16.
    #[derive(Copy, Clone)]
    pub struct Abstractcs(u32);
    impl Debug;

    pub progbufsize, _: 28, 24;
    pub busy, _: 12;
    pub cmderr, set_cmderr: 10, 8;
    pub datacount, _: 3, 0;
}

impl DebugRegister for Abstractcs {
    const ADDRESS: u8 = 0x16;
    const NAME: &'static str = "abstractcs";
}

impl From<Abstractcs> for u32 {
    fn from(register: Abstractcs) -> Self {
        register.0
    }
}

impl From<u32> for Abstractcs {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

bitfield! {
    /// The `command` register view for the access register command, located
    /// at address 0x17.
    #[derive(Copy, Clone)]
    pub struct AccessRegisterCommand(u32);
    impl Debug;

    pub _, set_cmd_type: 31, 24;
    pub _, set_aarsize: 22, 20;
    pub _, set_aarpostincrement: 19;
    pub _, set_postexec: 18;
    pub _, set_transfer: 17;
    pub _, set_write: 16;
    pub regno, set_regno: 15, 0;
}

impl DebugRegister for AccessRegisterCommand {
    const ADDRESS: u8 = 0x17;
    const NAME: &'static str = "command";
}

impl From<AccessRegisterCommand> for u32 {
    fn from(register: AccessRegisterCommand) -> Self {
        register.0
    }
}

impl From<u32> for AccessRegisterCommand {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Communication interface to the debug module of a CH32V2.
///
/// Exclusively borrows the wire transport for the duration of a programming
/// session; none of its operations may be issued concurrently on the same
/// probe.
#[derive(Debug)]
pub struct Ch32CommunicationInterface<'probe> {
    probe: &'probe mut dyn RvswdProbe,
}

impl<'probe> Ch32CommunicationInterface<'probe> {
    /// Create a new interface on top of an initialized transport.
    pub fn new(probe: &'probe mut dyn RvswdProbe) -> Self {
        Self { probe }
    }

    fn read_dm_register<R: DebugRegister>(&mut self) -> Result<R, Ch32Error> {
        let value = self.probe.read_dm_register(R::ADDRESS)?;

        tracing::trace!("Read DM register {} = {:#010x}", R::NAME, value);

        Ok(R::from(value))
    }

    fn write_dm_register<R: DebugRegister>(&mut self, register: R) -> Result<(), Ch32Error> {
        let value: u32 = register.into();

        tracing::trace!("Write DM register {} = {:#010x}", R::NAME, value);

        self.probe.write_dm_register(R::ADDRESS, value)?;

        Ok(())
    }

    fn write_dm_register_untyped(&mut self, address: u8, value: u32) -> Result<(), Ch32Error> {
        tracing::trace!("Write DM register {:#04x} = {:#010x}", address, value);

        self.probe.write_dm_register(address, value)?;

        Ok(())
    }

    /// Poll `dmstatus` until `condition` holds, within the given budget.
    ///
    /// The inner result carries the last observed `dmstatus` value when the
    /// budget runs out.
    fn wait_for_dmstatus(
        &mut self,
        policy: RetryPolicy,
        condition: impl Fn(&Dmstatus) -> bool,
    ) -> Result<Result<(), u32>, Ch32Error> {
        let mut last = 0;

        for attempt in 0..policy.attempts {
            if attempt > 0 {
                std::thread::sleep(policy.interval);
            }

            let dmstatus: Dmstatus = self.read_dm_register()?;

            if condition(&dmstatus) {
                return Ok(Ok(()));
            }

            last = dmstatus.into();
        }

        Ok(Err(last))
    }

    /// Halt the core.
    ///
    /// Enables the debug module, requests the halt and waits for the core to
    /// acknowledge it, then clears the request again.
    pub fn halt(&mut self) -> Result<(), Ch32Error> {
        let mut request = Dmcontrol(0);
        request.set_dmactive(true);
        request.set_haltreq(true);

        // The enable and the halt request are the same value; it is written
        // twice to give the module time to settle.
        self.write_dm_register(request)?;
        self.write_dm_register(request)?;

        if let Err(dmstatus) =
            self.wait_for_dmstatus(CORE_STATE_RETRIES, |status| {
                status.allhalted() && status.anyhalted()
            })?
        {
            tracing::error!("Failed to halt the core, dmstatus: {:#010x}", dmstatus);
            return Err(Ch32Error::HaltTimeout(dmstatus));
        }

        // Clear the halt request.
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        self.write_dm_register(dmcontrol)?;

        tracing::info!("Core halted");

        Ok(())
    }

    /// Resume the core.
    pub fn resume(&mut self) -> Result<(), Ch32Error> {
        let mut request = Dmcontrol(0);
        request.set_dmactive(true);
        request.set_haltreq(true);

        self.write_dm_register(request)?;
        self.write_dm_register(request)?;

        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        self.write_dm_register(dmcontrol)?;

        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_resumereq(true);
        self.write_dm_register(dmcontrol)?;

        if let Err(dmstatus) =
            self.wait_for_dmstatus(CORE_STATE_RETRIES, |status| {
                status.allresumeack() && status.anyresumeack()
            })?
        {
            tracing::error!("Failed to resume the core, dmstatus: {:#010x}", dmstatus);
            return Err(Ch32Error::ResumeTimeout(dmstatus));
        }

        tracing::info!("Core resumed");

        Ok(())
    }

    /// Reset the core and let it run from the reset vector.
    ///
    /// After the reset is observed in `dmstatus` the reset status latch is
    /// acknowledged explicitly, with a settling pause after each step of the
    /// acknowledge sequence.
    pub fn reset_and_run(&mut self) -> Result<(), Ch32Error> {
        let mut request = Dmcontrol(0);
        request.set_dmactive(true);
        request.set_haltreq(true);

        self.write_dm_register(request)?;
        self.write_dm_register(request)?;

        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        self.write_dm_register(dmcontrol)?;

        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_ndmreset(true);
        self.write_dm_register(dmcontrol)?;

        if let Err(dmstatus) =
            self.wait_for_dmstatus(CORE_STATE_RETRIES, |status| {
                status.allhavereset() && status.anyhavereset()
            })?
        {
            tracing::error!("Failed to reset the core, dmstatus: {:#010x}", dmstatus);
            return Err(Ch32Error::ResetTimeout(dmstatus));
        }

        // Clear the reset request.
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        self.write_dm_register(dmcontrol)?;
        std::thread::sleep(RESET_SETTLE);

        // Acknowledge the reset status latch.
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_ackhavereset(true);
        self.write_dm_register(dmcontrol)?;
        std::thread::sleep(RESET_SETTLE);

        // Clear the acknowledge request.
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        self.write_dm_register(dmcontrol)?;
        std::thread::sleep(RESET_SETTLE);

        tracing::info!("Core reset");

        Ok(())
    }

    /// Write a core register through the abstract command interface.
    ///
    /// `regno` addresses either the CSR space ([`CSR_BASE`]) or the
    /// general-purpose register space ([`GPR_BASE`]). The command is not
    /// polled for completion; a caller that needs the write to have landed
    /// before its next step has to allow for the target's settling time.
    pub fn write_register(&mut self, regno: u16, value: u32) -> Result<(), Ch32Error> {
        self.write_dm_register(Data0(value))?;

        let mut command = AccessRegisterCommand(0);
        command.set_cmd_type(0);
        command.set_transfer(true);
        command.set_write(true);
        command.set_aarsize(2);
        command.set_regno(regno as u32);
        self.write_dm_register(command)?;

        Ok(())
    }

    /// Read a core register through the abstract command interface.
    ///
    /// Like [`write_register`](Self::write_register), the command status is
    /// not polled for completion.
    pub fn read_register(&mut self, regno: u16) -> Result<u32, Ch32Error> {
        let mut command = AccessRegisterCommand(0);
        command.set_cmd_type(0);
        command.set_transfer(true);
        command.set_aarsize(2);
        command.set_regno(regno as u32);
        self.write_dm_register(command)?;

        let data: Data0 = self.read_dm_register()?;

        Ok(data.0)
    }

    /// Load an instruction sequence into the program buffer and start it.
    ///
    /// The sequence may be at most [`PROGRAM_BUFFER_SIZE`] bytes of whole
    /// 16-bit instruction parcels; anything else is rejected before the
    /// program buffer is touched. Execution is fire-and-forget: the caller
    /// knows the snippet's effect and synchronizes through subsequent
    /// register reads.
    pub fn run_debug_code(&mut self, code: &[u8]) -> Result<(), Ch32Error> {
        if code.len() > PROGRAM_BUFFER_SIZE {
            return Err(Ch32Error::ProgramBufferTooLong(code.len()));
        }
        if code.len() % 2 != 0 {
            return Err(Ch32Error::UnalignedProgram(code.len()));
        }

        // Zero-pad into the eight program buffer words.
        let mut words = [0u32; PROGRAM_BUFFER_SIZE / 4];
        for (word, chunk) in words.iter_mut().zip(code.chunks(4)) {
            let mut bytes = [0u8; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            *word = u32::from_le_bytes(bytes);
        }

        for (index, word) in words.iter().enumerate() {
            self.write_dm_register_untyped(Progbuf0::ADDRESS + index as u8, *word)?;
        }

        // Run the program buffer, transferring no register.
        let mut command = AccessRegisterCommand(0);
        command.set_cmd_type(0);
        command.set_postexec(true);
        command.set_aarsize(2);
        self.write_dm_register(command)?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{Ch32CommunicationInterface, Ch32Error, GPR_BASE};
    use crate::fake_probe::{FakeProbe, Operation};

    #[test]
    fn register_write_read_roundtrip() {
        let mut probe = FakeProbe::new();
        let mut interface = Ch32CommunicationInterface::new(&mut probe);

        interface.write_register(GPR_BASE + 5, 0xdead_beef).unwrap();

        assert_eq!(interface.read_register(GPR_BASE + 5).unwrap(), 0xdead_beef);
    }

    #[test]
    fn debug_code_too_long_is_rejected_without_transfers() {
        let mut probe = FakeProbe::new();
        let mut interface = Ch32CommunicationInterface::new(&mut probe);

        let code = [0u8; 34];
        assert!(matches!(
            interface.run_debug_code(&code),
            Err(Ch32Error::ProgramBufferTooLong(34))
        ));

        assert!(probe.operations().is_empty());
    }

    #[test]
    fn odd_length_debug_code_is_rejected_without_transfers() {
        let mut probe = FakeProbe::new();
        let mut interface = Ch32CommunicationInterface::new(&mut probe);

        let code = [0u8; 7];
        assert!(matches!(
            interface.run_debug_code(&code),
            Err(Ch32Error::UnalignedProgram(7))
        ));

        assert!(probe.operations().is_empty());
    }

    fn dmstatus_reads(probe: &FakeProbe) -> usize {
        probe
            .operations()
            .iter()
            .filter(|operation| matches!(operation, Operation::ReadDmRegister { address: 0x11 }))
            .count()
    }

    #[test]
    fn halt_times_out_after_five_polls() {
        let mut probe = FakeProbe::new();
        probe.ignore_halt_requests();
        let mut interface = Ch32CommunicationInterface::new(&mut probe);

        assert!(matches!(interface.halt(), Err(Ch32Error::HaltTimeout(_))));
        assert_eq!(dmstatus_reads(&probe), 5);
    }

    #[test]
    fn resume_times_out_after_five_polls() {
        let mut probe = FakeProbe::new();
        probe.ignore_resume_requests();
        let mut interface = Ch32CommunicationInterface::new(&mut probe);

        assert!(matches!(
            interface.resume(),
            Err(Ch32Error::ResumeTimeout(_))
        ));
        assert_eq!(dmstatus_reads(&probe), 5);
    }

    #[test]
    fn reset_times_out_after_five_polls() {
        let mut probe = FakeProbe::new();
        probe.ignore_reset_requests();
        let mut interface = Ch32CommunicationInterface::new(&mut probe);

        assert!(matches!(
            interface.reset_and_run(),
            Err(Ch32Error::ResetTimeout(_))
        ));
        assert_eq!(dmstatus_reads(&probe), 5);
    }

    #[test]
    fn halt_clears_the_request_after_the_acknowledge() {
        let mut probe = FakeProbe::new();
        let mut interface = Ch32CommunicationInterface::new(&mut probe);

        interface.halt().unwrap();

        assert!(probe.core_halted());
        assert_eq!(
            probe.operations().last(),
            Some(&Operation::WriteDmRegister {
                address: 0x10,
                value: 0x0000_0001
            })
        );
    }
}
