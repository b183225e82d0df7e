//! The single-wire debug transport.
//!
//! The physical link to the target is not implemented by this crate. It is
//! consumed through the narrow [`RvswdProbe`] trait, which a host provides on
//! top of whatever actually drives the wire (a bit-banged GPIO pair, a USB
//! adapter, a simulation).

use std::fmt;

use thiserror::Error;

/// A probe speaking the single-wire debug protocol of the CH32V2 family.
///
/// The four operations map directly onto the link primitives: bring the link
/// up, reset it, and move single debug module registers across it. All higher
/// layers of this crate are written against this trait only.
///
/// A probe represents the one physical link to one target. Operations are
/// blocking and must not be issued concurrently; callers sharing a probe
/// between sessions have to serialize access themselves.
pub trait RvswdProbe: fmt::Debug {
    /// Initialize the physical link.
    fn init(&mut self) -> Result<(), DebugProbeError>;

    /// Reset the link, bringing the target's debug module to a known state.
    fn reset(&mut self) -> Result<(), DebugProbeError>;

    /// Read a debug module register.
    fn read_dm_register(&mut self, address: u8) -> Result<u32, DebugProbeError>;

    /// Write a debug module register.
    fn write_dm_register(&mut self, address: u8, value: u32) -> Result<(), DebugProbeError>;
}

/// Describes an error on the wire side of the link.
#[derive(Error, Debug)]
pub enum DebugProbeError {
    /// The link initialization sequence failed.
    #[error("The link initialization sequence failed")]
    Init,
    /// The link reset sequence failed.
    #[error("The link reset sequence failed")]
    Reset,
    /// A register transfer was not acknowledged by the target.
    #[error("Transfer of debug module register {address:#04x} was not acknowledged")]
    Transfer {
        /// The debug module register the transfer was addressed to.
        address: u8,
    },
    /// An error specific to a probe implementation occurred.
    #[error("An error specific to the probe occurred")]
    ProbeSpecific(#[source] Box<dyn std::error::Error + Send + Sync>),
}
