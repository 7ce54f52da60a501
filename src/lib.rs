//! GameCube-side JoyBus link for Game Boy Advance emulators.
//!
//! Speaks to GBA emulator processes over loopback TCP sockets, performing the
//! Kawasedo BootROM challenge that uploads and launches a multiboot program,
//! followed by ordinary JoyBus command I/O (STATUS, RESET, READ, WRITE).
//!
//! A [`listener::Listener`] accepts paired data/clock connections; each pair
//! becomes an independent [`endpoint::Endpoint`] with its own transfer thread
//! and virtual SI channel. Completion callbacks receive a
//! [`endpoint::LocalEndpoint`] through which the next command in a sequence
//! can be issued without re-entering the lock.

/// The pure BootROM challenge packer.
pub mod crypto;

/// Per-GBA command engine and its transfer thread.
pub mod endpoint;

/// Paired-socket acceptor that materializes endpoints.
pub mod listener;

/// JoyBus opcodes, JSTAT flags, and operation results.
pub mod protocol;

/// GameCube tick source.
pub mod ticks;

mod joyboot;

pub use endpoint::{Endpoint, LocalEndpoint, PacketCell, StatusCell, TransferCallback};
pub use listener::{ListenError, Listener};
pub use protocol::JoyReturn;
