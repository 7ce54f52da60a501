//! The per-GBA command engine.
//!
//! Each [`Endpoint`] owns a dedicated transfer thread that serializes command
//! issuance, paces the GBA with clock-sync packets on a side channel,
//! transports the 5-byte command/response frame, and dispatches completion
//! callbacks. A callback receives a [`LocalEndpoint`] through which it may
//! arm exactly one follow-up command; that command is picked up on the next
//! loop iteration without re-entering the lock.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, trace, warn};

use crate::joyboot::KawasedoChallenge;
use crate::protocol::{CMD_READ, CMD_RESET, CMD_STATUS, CMD_WRITE, FRAME_LEN, JoyReturn};
use crate::ticks;

/// Shared one-byte destination for JSTAT results.
///
/// The transfer thread writes the cell when the operation it was registered
/// for completes; the caller's clone stays valid for reading afterwards.
#[derive(Clone, Debug, Default)]
pub struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: u8) {
        self.0.store(value, Ordering::Release);
    }
}

/// Shared destination for the 4-byte packet a READ returns.
///
/// The packet is held as a little-endian word, matching how the GBA BIOS
/// interprets it.
#[derive(Clone, Debug, Default)]
pub struct PacketCell(Arc<AtomicU32>);

impl PacketCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn word(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn bytes(&self) -> [u8; 4] {
        self.word().to_le_bytes()
    }

    pub fn set_bytes(&self, bytes: [u8; 4]) {
        self.0.store(u32::from_le_bytes(bytes), Ordering::Release);
    }
}

/// Completion callback for asynchronous endpoint operations.
///
/// Fires exactly once per submitted operation, on the transfer thread, with
/// `Ready` if the connection is still open and `NotReady` if it was lost.
/// The endpoint lock is held while the callback runs: issue any follow-up
/// command through the provided [`LocalEndpoint`], never through the owning
/// [`Endpoint`].
pub type TransferCallback = Box<dyn FnOnce(&mut LocalEndpoint<'_>, JoyReturn) + Send>;

/// What to do when the armed command completes.
pub(crate) enum Continuation {
    /// Invoke a user callback.
    User(TransferCallback),
    /// Wake a synchronous caller parked on the sync condvar.
    SyncWakeup,
    /// Advance the active JoyBoot state machine.
    JoyBoot,
}

/// Command state guarded by the endpoint mutex.
struct EndpointState {
    buffer: [u8; FRAME_LEN],
    status_dst: Option<StatusCell>,
    read_dst: Option<PacketCell>,
    callback: Option<Continuation>,
    joyboot: Option<KawasedoChallenge>,
    cmd_issued: bool,
    /// Counts completed transfers; synchronous callers key their wait on it.
    completed: u64,
}

struct Shared {
    state: Mutex<EndpointState>,
    /// Wakes the transfer thread when a command is armed or stop is requested.
    issue_cv: Condvar,
    /// Wakes synchronous callers when a transfer completes or the loop exits.
    sync_cv: Condvar,
    running: AtomicBool,
    chan: AtomicU8,
}

/// Main handle for performing JoyBoot and subsequent JoyBus I/O operations.
///
/// Instances are normally obtained through [`crate::listener::Listener`].
/// All operations are callable from any thread; at most one command is in
/// flight at a time, and a second submission while one is pending returns
/// [`JoyReturn::NotReady`].
pub struct Endpoint {
    shared: Arc<Shared>,
    /// Clones kept only so `stop` can abort a blocking receive; the transfer
    /// thread owns the working sockets.
    data_shutdown: TcpStream,
    clock_shutdown: TcpStream,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    /// Wrap a paired data/clock connection and start the transfer thread.
    pub fn new(chan: u8, data: TcpStream, clock: TcpStream) -> io::Result<Self> {
        let _ = data.set_nodelay(true);
        let _ = clock.set_nodelay(true);
        let data_shutdown = data.try_clone()?;
        let clock_shutdown = clock.try_clone()?;

        let shared = Arc::new(Shared {
            state: Mutex::new(EndpointState {
                buffer: [0; FRAME_LEN],
                status_dst: None,
                read_dst: None,
                callback: None,
                joyboot: None,
                cmd_issued: false,
                completed: 0,
            }),
            issue_cv: Condvar::new(),
            sync_cv: Condvar::new(),
            running: AtomicBool::new(true),
            chan: AtomicU8::new(chan),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("joybus-chan{chan}"))
            .spawn(move || transfer_thread(thread_shared, data, clock))?;

        Ok(Self {
            shared,
            data_shutdown,
            clock_shutdown,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Virtual SI channel assigned to this endpoint.
    pub fn chan(&self) -> u8 {
        self.shared.chan.load(Ordering::Relaxed)
    }

    /// Reassign the virtual SI channel; out-of-range values clamp to 3.
    pub fn set_chan(&self, chan: u8) {
        self.shared.chan.store(chan.min(3), Ordering::Relaxed);
    }

    /// Whether the link is still up.
    pub fn connected(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Query the JSTAT register asynchronously.
    pub fn get_status_async(&self, status: &StatusCell, callback: TransferCallback) -> JoyReturn {
        self.submit(CMD_STATUS, None, status, None, Continuation::User(callback))
    }

    /// Query the JSTAT register, blocking until the GBA responds.
    pub fn get_status(&self, status: &StatusCell) -> JoyReturn {
        self.submit_sync(CMD_STATUS, None, status, None)
    }

    /// Send a RESET command asynchronously.
    pub fn reset_async(&self, status: &StatusCell, callback: TransferCallback) -> JoyReturn {
        self.submit(CMD_RESET, None, status, None, Continuation::User(callback))
    }

    /// Send a RESET command, blocking until the GBA responds.
    pub fn reset(&self, status: &StatusCell) -> JoyReturn {
        self.submit_sync(CMD_RESET, None, status, None)
    }

    /// Read a 4-byte packet asynchronously.
    pub fn read_async(
        &self,
        dst: &PacketCell,
        status: &StatusCell,
        callback: TransferCallback,
    ) -> JoyReturn {
        self.submit(CMD_READ, None, status, Some(dst), Continuation::User(callback))
    }

    /// Read a 4-byte packet, blocking until the GBA responds.
    pub fn read(&self, dst: &PacketCell, status: &StatusCell) -> JoyReturn {
        self.submit_sync(CMD_READ, None, status, Some(dst))
    }

    /// Write a 4-byte packet asynchronously.
    pub fn write_async(
        &self,
        src: [u8; 4],
        status: &StatusCell,
        callback: TransferCallback,
    ) -> JoyReturn {
        self.submit(CMD_WRITE, Some(src), status, None, Continuation::User(callback))
    }

    /// Write a 4-byte packet, blocking until the GBA responds.
    pub fn write(&self, src: [u8; 4], status: &StatusCell) -> JoyReturn {
        self.submit_sync(CMD_WRITE, Some(src), status, None)
    }

    /// Begin the Kawasedo BootROM challenge, uploading `program` to the GBA.
    ///
    /// `palette_color` (0..=6) and `palette_speed` (-4..=4) style the pulsing
    /// logo shown during the transfer. The terminal `callback` fires once,
    /// with `Ready` on a successful boot. Progress is available through
    /// [`Endpoint::process_status`].
    pub fn joy_boot_async(
        &self,
        palette_color: i32,
        palette_speed: i32,
        program: &[u8],
        status: &StatusCell,
        callback: TransferCallback,
    ) -> JoyReturn {
        if !self.connected() {
            return JoyReturn::NotReady;
        }
        if self.chan() > 3 {
            return JoyReturn::JoyBootErrInvalid;
        }
        if program.is_empty() || program.len() >= 0x40000 {
            return JoyReturn::JoyBootErrInvalid;
        }
        if !(-4..=4).contains(&palette_speed) {
            return JoyReturn::JoyBootErrInvalid;
        }
        if !(0..=6).contains(&palette_color) {
            return JoyReturn::JoyBootErrInvalid;
        }
        // A multiboot header must carry a nonzero byte at 0xac.
        if program.get(0xac).copied().unwrap_or(0) == 0 {
            return JoyReturn::JoyBootErrInvalid;
        }

        let Ok(mut state) = self.shared.state.lock() else {
            return JoyReturn::NotReady;
        };
        state.joyboot = Some(KawasedoChallenge::new(
            palette_color,
            palette_speed,
            program,
            status.clone(),
            callback,
        ));
        if state.cmd_issued {
            if let Some(boot) = state.joyboot.as_mut() {
                boot.abandon();
            }
            return JoyReturn::NotReady;
        }
        // Arm the initial status probe; its completion drives the reset stage.
        arm(&mut state, CMD_STATUS, None, status, None, Continuation::JoyBoot);
        drop(state);
        self.shared.issue_cv.notify_one();
        JoyReturn::Ready
    }

    /// Report JoyBoot progress, or whether a command is in flight.
    ///
    /// Returns `(Busy, percent)` while an upload or command is outstanding,
    /// `(Ready, percent)` when idle, and `(NotReady, 0)` once stopped.
    pub fn process_status(&self) -> (JoyReturn, u8) {
        if !self.connected() {
            return (JoyReturn::NotReady, 0);
        }
        let Ok(state) = self.shared.state.lock() else {
            return (JoyReturn::NotReady, 0);
        };
        let mut percent = 0;
        if let Some(boot) = state.joyboot.as_ref() {
            percent = boot.percent_complete();
            if !boot.is_done() {
                return (JoyReturn::Busy, percent);
            }
        }
        if state.cmd_issued {
            return (JoyReturn::Busy, percent);
        }
        (JoyReturn::Ready, percent)
    }

    /// Request stop of the transfer thread and block until joined.
    ///
    /// Any in-flight command completes with `NotReady`; further use of this
    /// endpoint returns `NotReady`. The destructor calls this implicitly.
    /// Must not be called from a completion callback.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.issue_cv.notify_all();
        // Abort a blocking receive so the thread can observe the stop.
        let _ = self.data_shutdown.shutdown(Shutdown::Both);
        let _ = self.clock_shutdown.shutdown(Shutdown::Both);
        if let Ok(mut thread) = self.thread.lock()
            && let Some(handle) = thread.take()
        {
            let _ = handle.join();
        }
        self.shared.sync_cv.notify_all();
    }

    fn submit(
        &self,
        cmd: u8,
        payload: Option<[u8; 4]>,
        status: &StatusCell,
        read_dst: Option<&PacketCell>,
        continuation: Continuation,
    ) -> JoyReturn {
        if !self.connected() {
            return JoyReturn::NotReady;
        }
        let Ok(mut state) = self.shared.state.lock() else {
            return JoyReturn::NotReady;
        };
        if state.cmd_issued {
            return JoyReturn::NotReady;
        }
        arm(&mut state, cmd, payload, status, read_dst, continuation);
        drop(state);
        self.shared.issue_cv.notify_one();
        JoyReturn::Ready
    }

    fn submit_sync(
        &self,
        cmd: u8,
        payload: Option<[u8; 4]>,
        status: &StatusCell,
        read_dst: Option<&PacketCell>,
    ) -> JoyReturn {
        if !self.connected() {
            return JoyReturn::NotReady;
        }
        let Ok(mut state) = self.shared.state.lock() else {
            return JoyReturn::NotReady;
        };
        if state.cmd_issued {
            return JoyReturn::NotReady;
        }
        arm(&mut state, cmd, payload, status, read_dst, Continuation::SyncWakeup);
        let seq = state.completed;
        self.shared.issue_cv.notify_one();

        let result = self.shared.sync_cv.wait_while(state, |s| {
            s.completed == seq && self.shared.running.load(Ordering::Acquire)
        });
        match result {
            Ok(_) if self.shared.running.load(Ordering::Acquire) => JoyReturn::Ready,
            _ => JoyReturn::NotReady,
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

fn arm(
    state: &mut EndpointState,
    cmd: u8,
    payload: Option<[u8; 4]>,
    status: &StatusCell,
    read_dst: Option<&PacketCell>,
    continuation: Continuation,
) {
    state.cmd_issued = true;
    state.buffer[0] = cmd;
    if let Some(payload) = payload {
        state.buffer[1..].copy_from_slice(&payload);
    }
    state.status_dst = Some(status.clone());
    state.read_dst = read_dst.cloned();
    state.callback = Some(continuation);
}

/// Capability token handed to completion callbacks.
///
/// Functionally the same asynchronous surface as [`Endpoint`], but it mutates
/// the already-locked command state directly: the exclusive borrow it holds
/// is the witness that the endpoint mutex is held by the transfer thread.
pub struct LocalEndpoint<'a> {
    state: &'a mut EndpointState,
    running: &'a AtomicBool,
    chan: &'a AtomicU8,
}

impl LocalEndpoint<'_> {
    /// Virtual SI channel assigned to this endpoint.
    pub fn chan(&self) -> u8 {
        self.chan.load(Ordering::Relaxed)
    }

    /// Query the JSTAT register asynchronously.
    pub fn get_status_async(&mut self, status: &StatusCell, callback: TransferCallback) -> JoyReturn {
        self.submit(CMD_STATUS, None, status, None, Continuation::User(callback))
    }

    /// Send a RESET command asynchronously.
    pub fn reset_async(&mut self, status: &StatusCell, callback: TransferCallback) -> JoyReturn {
        self.submit(CMD_RESET, None, status, None, Continuation::User(callback))
    }

    /// Read a 4-byte packet asynchronously.
    pub fn read_async(
        &mut self,
        dst: &PacketCell,
        status: &StatusCell,
        callback: TransferCallback,
    ) -> JoyReturn {
        self.submit(CMD_READ, None, status, Some(dst), Continuation::User(callback))
    }

    /// Write a 4-byte packet asynchronously.
    pub fn write_async(
        &mut self,
        src: [u8; 4],
        status: &StatusCell,
        callback: TransferCallback,
    ) -> JoyReturn {
        self.submit(CMD_WRITE, Some(src), status, None, Continuation::User(callback))
    }

    pub(crate) fn submit(
        &mut self,
        cmd: u8,
        payload: Option<[u8; 4]>,
        status: &StatusCell,
        read_dst: Option<&PacketCell>,
        continuation: Continuation,
    ) -> JoyReturn {
        if !self.running.load(Ordering::Acquire) || self.state.cmd_issued {
            return JoyReturn::NotReady;
        }
        arm(self.state, cmd, payload, status, read_dst, continuation);
        JoyReturn::Ready
    }
}

/// Socket-facing half of the engine, owned by the transfer thread and used
/// only while the state mutex is released.
struct IoDriver {
    data: TcpStream,
    clock: TcpStream,
    last_tick: u64,
    booted: bool,
}

impl IoDriver {
    /// One full transfer: clock sync, command out, response in.
    fn run_frame(&mut self, frame: &mut [u8; FRAME_LEN], running: &AtomicBool) -> usize {
        self.clock_sync(running);
        self.send_frame(frame, running);
        self.receive(frame, running)
    }

    /// Pace the emulated GBA: report the elapsed GameCube ticks since the
    /// previous command, scaled into GBA clock ticks, as a big-endian word on
    /// the clock channel.
    fn clock_sync(&mut self, running: &AtomicBool) {
        let now = ticks::now();
        let delta = if self.last_tick == 0 {
            // First transfer: synthesize one 60 Hz frame's worth.
            ticks::TICKS_PER_SEC / 60
        } else {
            now.wrapping_sub(self.last_tick)
        };
        self.last_tick = now;

        let gba_ticks = (u128::from(delta) * u128::from(ticks::GBA_TICKS_PER_SEC)
            / u128::from(ticks::TICKS_PER_SEC)) as u32;
        if let Err(err) = self.clock.write_all(&gba_ticks.to_be_bytes()) {
            warn!("clock send failed: {err}");
            running.store(false, Ordering::Release);
        }
    }

    fn send_frame(&mut self, frame: &[u8; FRAME_LEN], running: &AtomicBool) {
        let cmd = frame[0];
        let len = if cmd == CMD_WRITE { FRAME_LEN } else { 1 };
        let result = self.data.write_all(&frame[..len]);
        if cmd != CMD_STATUS {
            self.booted = true;
        }
        match result {
            Ok(()) => trace!(
                "sent {:02x} [> {:02x}{:02x}{:02x}{:02x}]",
                frame[0], frame[1], frame[2], frame[3], frame[4]
            ),
            Err(err) => {
                warn!("data send failed: {err}");
                running.store(false, Ordering::Release);
            }
        }
    }

    fn receive(&mut self, frame: &mut [u8; FRAME_LEN], running: &AtomicBool) -> usize {
        match self.data.read(frame) {
            Ok(0) => {
                debug!("data socket closed by peer");
                running.store(false, Ordering::Release);
                0
            }
            Ok(received) => {
                trace!(
                    "received [< {:02x}{:02x}{:02x}{:02x}{:02x}] ({received})",
                    frame[0], frame[1], frame[2], frame[3], frame[4]
                );
                received
            }
            Err(err) => {
                warn!("data recv failed: {err}");
                running.store(false, Ordering::Release);
                0
            }
        }
    }
}

fn transfer_thread(shared: Arc<Shared>, data: TcpStream, clock: TcpStream) {
    let chan = shared.chan.load(Ordering::Relaxed);
    debug!("starting JoyBus transfer thread for channel {chan}");

    let mut io = IoDriver {
        data,
        clock,
        last_tick: 0,
        booted: false,
    };

    // The lock is relinquished around socket I/O and while waiting for the
    // next request.
    let Ok(mut state) = shared.state.lock() else {
        return;
    };
    while shared.running.load(Ordering::Acquire) {
        if state.cmd_issued {
            let mut frame = state.buffer;
            let cmd = frame[0];
            drop(state);
            io.run_frame(&mut frame, &shared.running);
            let Ok(guard) = shared.state.lock() else {
                return;
            };
            state = guard;
            state.buffer = frame;
            state.cmd_issued = false;
            state.completed = state.completed.wrapping_add(1);

            let xfer_status = if shared.running.load(Ordering::Acquire) {
                JoyReturn::Ready
            } else {
                JoyReturn::NotReady
            };

            match cmd {
                CMD_RESET | CMD_STATUS => {
                    if let Some(cell) = state.status_dst.as_ref() {
                        cell.set(state.buffer[2]);
                    }
                }
                CMD_WRITE => {
                    if let Some(cell) = state.status_dst.as_ref() {
                        cell.set(state.buffer[0]);
                    }
                }
                CMD_READ => {
                    if let Some(cell) = state.status_dst.as_ref() {
                        cell.set(state.buffer[4]);
                    }
                    if let Some(cell) = state.read_dst.as_ref() {
                        cell.set_bytes([
                            state.buffer[0],
                            state.buffer[1],
                            state.buffer[2],
                            state.buffer[3],
                        ]);
                    }
                }
                _ => {}
            }
            state.status_dst = None;
            state.read_dst = None;

            if let Some(continuation) = state.callback.take() {
                match continuation {
                    Continuation::SyncWakeup => {}
                    Continuation::User(callback) => {
                        let mut local = LocalEndpoint {
                            state: &mut *state,
                            running: &shared.running,
                            chan: &shared.chan,
                        };
                        callback(&mut local, xfer_status);
                    }
                    Continuation::JoyBoot => {
                        if let Some(mut boot) = state.joyboot.take() {
                            let mut local = LocalEndpoint {
                                state: &mut *state,
                                running: &shared.running,
                                chan: &shared.chan,
                            };
                            boot.advance(&mut local, xfer_status);
                            state.joyboot = Some(boot);
                        }
                    }
                }
            }
            shared.sync_cv.notify_all();
        } else if !io.booted {
            // Poll the bus with status messages while inactive so the BIOS
            // keeps the JOY bus alive.
            let mut frame = [CMD_STATUS, 0, 0, 0, 0];
            drop(state);
            let received = io.run_frame(&mut frame, &shared.running);
            if received != 0 {
                ticks::sleep(ticks::TICKS_PER_SEC * 4 / 60);
            }
            let Ok(guard) = shared.state.lock() else {
                return;
            };
            state = guard;
        } else {
            let Ok(guard) = shared.issue_cv.wait(state) else {
                return;
            };
            state = guard;
        }
    }
    drop(state);
    shared.sync_cv.notify_all();
    debug!("stopping JoyBus transfer thread for channel {chan}");
}
