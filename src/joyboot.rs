//! Kawasedo's BootROM challenge: negotiates a nonce with the GBA BIOS,
//! derives the session keystream, streams the encrypted multiboot image in
//! 4-byte packets, and validates the boot acknowledgement.
//!
//! The challenge is not driven directly; it is started through
//! [`crate::endpoint::Endpoint::joy_boot_async`] and advanced by the transfer
//! thread each time one of its commands completes.

use log::debug;

use crate::crypto::{self, CIPHER_PAD, KAWA_MAGIC, round_up_8};
use crate::endpoint::{Continuation, LocalEndpoint, PacketCell, StatusCell, TransferCallback};
use crate::protocol::{
    CMD_READ, CMD_RESET, CMD_STATUS, CMD_WRITE, JSTAT_FLAGS_MASK, JSTAT_PSF0, JSTAT_PSF1,
    JSTAT_RECV, JSTAT_SEND, JoyReturn,
};

/// Image offset where the header's game code lands in the stream.
const GAME_ID_OFFSET: u32 = 0xac;

/// Image offset whose packet is replaced with the SI channel assignment.
const CHANNEL_OFFSET: u32 = 0xc4;

/// First encrypted/CRC-covered offset in the stream.
const CIPHER_START: u32 = 0xc0;

/// Next step of the handshake, keyed by which command just completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    /// Initial status probe done; issue the reset.
    Reset,
    /// Reset done; its JSTAT must read back as SEND.
    PostResetStatus,
    /// Status done; JSTAT must carry the challenge-pending flags.
    ReadChallenge,
    /// Challenge nonce read; derive keys and open the transfer.
    BeginTransfer,
    /// One program packet acknowledged; verify parity and send the next.
    TransmitProgram,
    /// Final read done; start polling for the boot.
    StartBootPoll,
    /// Poll JSTAT until the client program raises SEND alone.
    BootPoll,
    /// Boot token read; echo it back.
    BootAcknowledge,
    /// Echo acknowledged; the client is running.
    BootDone,
}

/// Per-upload state for one BootROM challenge.
pub(crate) struct KawasedoChallenge {
    palette_color: i32,
    palette_speed: i32,
    program: Vec<u8>,
    prog_pos: usize,
    status: StatusCell,
    callback: Option<TransferCallback>,
    read_buf: PacketCell,
    write_buf: [u8; 4],
    stage: Stage,
    byte_in_window: i32,
    just_started: bool,
    bytes_sent: u32,
    total_bytes: u32,
    crc: u32,
    check_store: [u32; Self::CHECK_SLOTS],
    current_key: u32,
    init_message: u32,
    game_id: u32,
}

impl KawasedoChallenge {
    /// The BIOS check ceremony addresses seven live slots but its relative
    /// offsets can step one past either end; the extra slot absorbs the
    /// wraparound.
    const CHECK_SLOTS: usize = 8;

    pub(crate) fn new(
        palette_color: i32,
        palette_speed: i32,
        program: &[u8],
        status: StatusCell,
        callback: TransferCallback,
    ) -> Self {
        Self {
            palette_color,
            palette_speed,
            program: program.to_vec(),
            prog_pos: 0,
            status,
            callback: Some(callback),
            read_buf: PacketCell::new(),
            write_buf: [0; 4],
            stage: Stage::Reset,
            byte_in_window: 0,
            just_started: false,
            bytes_sent: 0,
            total_bytes: 0,
            crc: 0,
            check_store: [0; Self::CHECK_SLOTS],
            current_key: 0,
            init_message: 0,
            game_id: 0,
        }
    }

    /// Drop the terminal callback without firing it. The challenge then
    /// reads as done and ignores any stale continuation.
    pub(crate) fn abandon(&mut self) {
        self.callback = None;
    }

    pub(crate) fn is_done(&self) -> bool {
        self.callback.is_none()
    }

    pub(crate) fn percent_complete(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        (self.bytes_sent * 100 / self.total_bytes) as u8
    }

    /// Advance the handshake after one of our commands completed with
    /// `status`. Runs on the transfer thread with the endpoint lock held.
    pub(crate) fn advance(&mut self, endpoint: &mut LocalEndpoint<'_>, status: JoyReturn) {
        if self.is_done() {
            return;
        }
        if status != JoyReturn::Ready {
            self.finish(endpoint, status);
            return;
        }

        match self.stage {
            Stage::Reset => {
                self.stage = Stage::PostResetStatus;
                self.issue(endpoint, CMD_RESET, None, false);
            }
            Stage::PostResetStatus => {
                if self.status.get() != JSTAT_SEND {
                    self.finish(endpoint, JoyReturn::JoyBootUnknownState);
                    return;
                }
                self.stage = Stage::ReadChallenge;
                self.issue(endpoint, CMD_STATUS, None, false);
            }
            Stage::ReadChallenge => {
                if self.status.get() != (JSTAT_PSF0 | JSTAT_SEND) {
                    self.finish(endpoint, JoyReturn::JoyBootUnknownState);
                    return;
                }
                self.stage = Stage::BeginTransfer;
                self.issue(endpoint, CMD_READ, None, true);
            }
            Stage::BeginTransfer => {
                self.init_transfer(self.read_buf.word());
                self.stage = Stage::TransmitProgram;
                self.issue(endpoint, CMD_WRITE, Some(self.write_buf), false);
            }
            Stage::TransmitProgram => self.transmit_program(endpoint),
            Stage::StartBootPoll => {
                self.stage = Stage::BootPoll;
                self.issue(endpoint, CMD_STATUS, None, false);
            }
            Stage::BootPoll => {
                let jstat = self.status.get();
                if jstat & (JSTAT_FLAGS_MASK | JSTAT_RECV) != 0 {
                    self.finish(endpoint, JoyReturn::JoyBootUnknownState);
                    return;
                }
                if jstat != JSTAT_SEND {
                    // Client not up yet; keep polling.
                    self.issue(endpoint, CMD_STATUS, None, false);
                    return;
                }
                self.stage = Stage::BootAcknowledge;
                self.issue(endpoint, CMD_READ, None, true);
            }
            Stage::BootAcknowledge => {
                // Echo the boot token back as proof the session key was held.
                self.stage = Stage::BootDone;
                let echo = self.read_buf.bytes();
                self.issue(endpoint, CMD_WRITE, Some(echo), false);
            }
            Stage::BootDone => {
                self.status.set(0);
                debug!("JoyBoot complete (game id {:#010x})", self.game_id);
                self.finish(endpoint, JoyReturn::Ready);
            }
        }
    }

    /// Derive the session key and auth init code from the challenge nonce
    /// and prime the transfer counters.
    fn init_transfer(&mut self, challenge: u32) {
        let (key, auth_init_code) = crypto::process_gba_crypto(
            challenge,
            self.palette_color,
            self.palette_speed,
            self.program.len() as u32,
        );
        self.current_key = key;
        self.init_message = auth_init_code;

        self.total_bytes = round_up_8(self.program.len() as u32).max(512);
        self.byte_in_window = ((self.total_bytes - 512) / 8) as i32;
        self.write_buf = self.init_message.to_le_bytes();
        self.crc = 0x15a0;
        self.bytes_sent = 0;
        self.just_started = true;

        debug!(
            "JoyBoot: challenge {challenge:#010x}, uploading {} bytes",
            self.total_bytes
        );
    }

    fn transmit_program(&mut self, endpoint: &mut LocalEndpoint<'_>) {
        if self.just_started {
            // The init message carries no preceding packet to verify.
            self.just_started = false;
        } else {
            let jstat = self.status.get();
            let parity = (self.bytes_sent & 4) >> 2;
            if jstat & JSTAT_PSF1 == 0 || u32::from(jstat & JSTAT_PSF0) >> 4 != parity {
                self.finish(endpoint, JoyReturn::JoyBootUnknownState);
                return;
            }
            self.bytes_sent += 4;
        }

        if self.bytes_sent > self.total_bytes {
            self.stage = Stage::StartBootPoll;
            self.issue(endpoint, CMD_READ, None, true);
            return;
        }

        let mut crypt_window;
        if self.bytes_sent != self.total_bytes {
            self.byte_in_window = 0;
            crypt_window = 0u32;
            while self.byte_in_window < 4 {
                if self.prog_pos < self.program.len() {
                    crypt_window |=
                        u32::from(self.program[self.prog_pos]) << (self.byte_in_window * 8);
                    self.prog_pos += 1;
                }
                self.byte_in_window += 1;
            }

            if self.bytes_sent == GAME_ID_OFFSET {
                self.game_id = crypt_window;
            } else if self.bytes_sent == CHANNEL_OFFSET {
                // The SI channel assignment rides inside the cipherstream.
                crypt_window = u32::from(endpoint.chan()) << 8;
            }

            if self.bytes_sent >= CIPHER_START {
                let mut window = crypt_window;
                let mut crc = self.crc;
                for _ in 0..32 {
                    if (window ^ crc) & 1 != 0 {
                        crc = (crc >> 1) ^ 0xa1c1;
                    } else {
                        crc >>= 1;
                    }
                    window >>= 1;
                }
                self.crc = crc;
            }

            if self.bytes_sent == 0x1f8 {
                self.check_store[0] = crypt_window;
            } else if self.bytes_sent == 0x1fc {
                self.byte_in_window = 1;
                self.check_store[1] = crypt_window;
            }
        } else {
            // Terminal framing packet: CRC in the low half, byte count above.
            crypt_window = self.crc | (self.bytes_sent << 16);
        }

        if self.bytes_sent >= CIPHER_START {
            self.current_key = self.current_key.wrapping_mul(KAWA_MAGIC).wrapping_add(1);
            crypt_window ^= self.current_key;
            crypt_window ^= 0x0200_0000u32.wrapping_add(self.bytes_sent).wrapping_neg();
            crypt_window ^= CIPHER_PAD;
        }

        self.write_buf = crypt_window.to_le_bytes();

        if self.bytes_sent == 0x1f8 {
            self.check_store[2] = crypt_window;
        }

        if self.byte_in_window < 4 {
            let bwi = self.byte_in_window;
            self.store_check(2 + bwi, crypt_window);
            let product = self.load_check(1 + bwi).wrapping_mul(self.load_check(4 - bwi));
            self.store_check(5 - bwi, product);
            let product = self.load_check(1 + bwi).wrapping_mul(self.load_check(1 - bwi));
            self.store_check(4 + bwi, product);
            let product = self.load_check(-1 + bwi).wrapping_mul(self.load_check(4 - bwi));
            self.store_check(7 - bwi, product);
        }

        self.issue(endpoint, CMD_WRITE, Some(self.write_buf), false);
    }

    /// Queue the next command with this challenge as its continuation,
    /// failing the whole boot if it cannot be armed.
    fn issue(
        &mut self,
        endpoint: &mut LocalEndpoint<'_>,
        cmd: u8,
        payload: Option<[u8; 4]>,
        wants_read: bool,
    ) {
        let read_dst = wants_read.then(|| self.read_buf.clone());
        let result = endpoint.submit(
            cmd,
            payload,
            &self.status,
            read_dst.as_ref(),
            Continuation::JoyBoot,
        );
        if result != JoyReturn::Ready {
            self.finish(endpoint, result);
        }
    }

    fn finish(&mut self, endpoint: &mut LocalEndpoint<'_>, status: JoyReturn) {
        if let Some(callback) = self.callback.take() {
            callback(endpoint, status);
        }
    }

    fn check_slot(index: i32) -> usize {
        index.rem_euclid(Self::CHECK_SLOTS as i32) as usize
    }

    fn load_check(&self, index: i32) -> u32 {
        self.check_store[Self::check_slot(index)]
    }

    fn store_check(&mut self, index: i32, value: u32) {
        self.check_store[Self::check_slot(index)] = value;
    }
}
