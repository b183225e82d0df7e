use thiserror::Error;

use crate::communication_interface::Ch32Error;

/// Describes any error that happened during the flashing procedure.
#[derive(Error, Debug)]
pub enum FlashError {
    /// Something during the interaction with the core went wrong.
    #[error("Something during the interaction with the core went wrong")]
    Core(#[from] Ch32Error),
    /// An erase or program address violates the required alignment.
    #[error("Flash address {address:#010x} is not aligned to {alignment} bytes")]
    UnalignedAddress {
        /// The offending address.
        address: u32,
        /// The required alignment in bytes.
        alignment: u32,
    },
    /// A write range does not fit into the code flash region.
    #[error("A write of {len} bytes at {address:#010x} does not fit into the code flash region")]
    OutOfBounds {
        /// Start address of the write.
        address: u32,
        /// Length of the write in bytes.
        len: usize,
    },
    /// The lock bits are still set after the key sequence.
    #[error("Flash is still locked after the unlock key sequence, CTLR: {ctlr:#010x}")]
    UnlockFailed {
        /// The control register value read back after the key sequence.
        ctlr: u32,
    },
    /// The flash controller did not leave its busy state.
    #[error("Timeout while waiting for the flash controller, STATR: {statr:#010x}")]
    ControllerTimeout {
        /// The last observed status register value.
        statr: u32,
    },
    /// The contents read back after programming a block did not match what
    /// was written.
    #[error("Verification of the flash block at {address:#010x} failed")]
    VerifyFailed {
        /// Start address of the block.
        address: u32,
    },
}
