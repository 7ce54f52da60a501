//! Accepts paired connections from GBA emulator instances.
//!
//! An emulator connects twice: once on the data port and once on the clock
//! port. Each completed pair is wrapped into an [`Endpoint`] and queued for
//! [`Listener::accept`].

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel as cb;
use log::{debug, info, warn};
use thiserror::Error;

use crate::endpoint::Endpoint;
use crate::protocol::{CLOCK_PORT, DATA_PORT};
use crate::ticks;

#[derive(Debug, Error)]
pub enum ListenError {
    #[error("failed to bind data listener: {0}")]
    BindData(#[source] io::Error),
    #[error("failed to bind clock listener: {0}")]
    BindClock(#[source] io::Error),
    #[error("failed to spawn listener thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Server interface for accepting incoming connections from GBA emulator
/// instances.
pub struct Listener {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    queue: Option<cb::Receiver<Endpoint>>,
    data_addr: Option<SocketAddr>,
    clock_addr: Option<SocketAddr>,
}

impl Listener {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            queue: None,
            data_addr: None,
            clock_addr: None,
        }
    }

    /// Bind the canonical data/clock ports on loopback and start accepting.
    pub fn start(&mut self) -> Result<(), ListenError> {
        self.start_on(DATA_PORT, CLOCK_PORT)
    }

    /// Bind specific ports (0 picks ephemeral ones) and start accepting.
    pub fn start_on(&mut self, data_port: u16, clock_port: u16) -> Result<(), ListenError> {
        self.stop();

        let data = TcpListener::bind((Ipv4Addr::LOCALHOST, data_port))
            .map_err(ListenError::BindData)?;
        let clock = TcpListener::bind((Ipv4Addr::LOCALHOST, clock_port))
            .map_err(ListenError::BindClock)?;
        data.set_nonblocking(true).map_err(ListenError::BindData)?;
        clock.set_nonblocking(true).map_err(ListenError::BindClock)?;
        self.data_addr = data.local_addr().ok();
        self.clock_addr = clock.local_addr().ok();

        let (tx, rx) = cb::unbounded();
        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let thread = thread::Builder::new()
            .name("joybus-listener".into())
            .spawn(move || listener_thread(data, clock, tx, running))
            .map_err(ListenError::Spawn)?;

        self.thread = Some(thread);
        self.queue = Some(rx);
        Ok(())
    }

    /// Request stop of the listener thread and block until joined.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.queue = None;
        self.data_addr = None;
        self.clock_addr = None;
    }

    /// Pop the next paired endpoint, if one is ready.
    pub fn accept(&mut self) -> Option<Endpoint> {
        self.queue.as_ref()?.try_recv().ok()
    }

    /// Bound address of the data listener while started.
    pub fn data_addr(&self) -> Option<SocketAddr> {
        self.data_addr
    }

    /// Bound address of the clock listener while started.
    pub fn clock_addr(&self) -> Option<SocketAddr> {
        self.clock_addr
    }
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listener_thread(
    data: TcpListener,
    clock: TcpListener,
    queue: cb::Sender<Endpoint>,
    running: Arc<AtomicBool>,
) {
    info!("JoyBus listener started");

    let mut pending_data: Option<TcpStream> = None;
    let mut pending_clock: Option<TcpStream> = None;
    let mut accepted: u32 = 0;

    while running.load(Ordering::Acquire) {
        if pending_data.is_none() {
            pending_data = poll_accept(&data, "data");
        }
        if pending_clock.is_none() {
            pending_clock = poll_accept(&clock, "clock");
        }

        if let Some(data_stream) = pending_data.take() {
            if let Some(clock_stream) = pending_clock.take() {
                // Channels cycle through the four SI ports in accept order.
                let chan = (accepted % 4) as u8;
                accepted += 1;
                match Endpoint::new(chan, data_stream, clock_stream) {
                    Ok(endpoint) => {
                        info!("paired JoyBus endpoint on channel {chan}");
                        if queue.send(endpoint).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("failed to start endpoint: {err}"),
                }
            } else {
                pending_data = Some(data_stream);
            }
        }

        ticks::sleep(ticks::TICKS_PER_SEC / 60);
    }

    info!("JoyBus listener stopped");
}

fn poll_accept(listener: &TcpListener, label: &str) -> Option<TcpStream> {
    match listener.accept() {
        Ok((stream, addr)) => {
            debug!("accepted {label} connection from {addr}");
            // The transfer thread runs blocking I/O.
            let _ = stream.set_nonblocking(false);
            Some(stream)
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => None,
        Err(err) => {
            warn!("{label} accept error: {err}");
            None
        }
    }
}
