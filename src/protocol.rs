//! JoyBus wire protocol: opcodes, JSTAT flags, frame geometry, and the
//! result kinds returned by endpoint operations.

/// Reset the GBA's JoyBus interface.
pub const CMD_RESET: u8 = 0xff;
/// Query the JSTAT register.
pub const CMD_STATUS: u8 = 0x00;
/// Read a 4-byte packet from the GBA.
pub const CMD_READ: u8 = 0x14;
/// Write a 4-byte packet to the GBA.
pub const CMD_WRITE: u8 = 0x15;

/// Command/response frame size: opcode plus a 4-byte payload.
pub const FRAME_LEN: usize = 5;

/// All JSTAT bits carried on the wire.
pub const JSTAT_MASK: u8 = 0x3a;
/// Both general-purpose state flags.
pub const JSTAT_FLAGS_MASK: u8 = 0x30;
/// State flag 1; toggled by the GBA after every 4-byte write it receives.
pub const JSTAT_PSF1: u8 = 0x20;
/// State flag 0.
pub const JSTAT_PSF0: u8 = 0x10;
/// The GBA has a packet ready for reading.
pub const JSTAT_SEND: u8 = 0x08;
/// The GBA is waiting on a packet from us.
pub const JSTAT_RECV: u8 = 0x02;

/// Canonical loopback TCP port for the data channel.
pub const DATA_PORT: u16 = 0xd6ba;
/// Canonical loopback TCP port for the clock channel.
pub const CLOCK_PORT: u16 = 0xc10c;

/// Result of an endpoint operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoyReturn {
    /// Request accepted or completed.
    Ready,
    /// Another command is pending, or the endpoint is stopped.
    NotReady,
    /// A JoyBoot or command is in flight (process-status query only).
    Busy,
    /// The GBA's JSTAT did not match the expected value at a handshake stage.
    JoyBootUnknownState,
    /// JoyBoot parameters violated a precondition.
    JoyBootErrInvalid,
}
