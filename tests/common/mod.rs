//! Loopback harness: a scripted GBA-side peer for driving an endpoint.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use joybus_link::protocol::CMD_WRITE;

/// A connected loopback socket pair.
pub fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let addr = listener.local_addr().expect("listener address");
    let client = TcpStream::connect(addr).expect("connect loopback");
    let (server, _) = listener.accept().expect("accept loopback");
    (client, server)
}

/// One JoyBus transaction as seen from the GBA side.
pub struct Transaction {
    /// Big-endian clock packet preceding the command.
    pub clock_ticks: u32,
    pub command: u8,
    /// Present for WRITE commands.
    pub payload: Option<[u8; 4]>,
}

/// GBA-side peer thread that records transactions and answers them through
/// a script. The script returns the response frame to send, or `None` to
/// drop the connection.
pub struct MockGba {
    pub transactions: Arc<Mutex<Vec<Transaction>>>,
    thread: Option<JoinHandle<()>>,
}

impl MockGba {
    pub fn spawn(
        mut data: TcpStream,
        mut clock: TcpStream,
        mut script: impl FnMut(u8, Option<[u8; 4]>) -> Option<Vec<u8>> + Send + 'static,
    ) -> Self {
        let transactions = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&transactions);
        let thread = std::thread::spawn(move || {
            loop {
                // The engine sends a clock packet before every command.
                let mut tick = [0u8; 4];
                if clock.read_exact(&mut tick).is_err() {
                    break;
                }
                let mut cmd = [0u8; 1];
                if data.read_exact(&mut cmd).is_err() {
                    break;
                }
                let payload = if cmd[0] == CMD_WRITE {
                    let mut word = [0u8; 4];
                    if data.read_exact(&mut word).is_err() {
                        break;
                    }
                    Some(word)
                } else {
                    None
                };
                log.lock().expect("transaction log").push(Transaction {
                    clock_ticks: u32::from_be_bytes(tick),
                    command: cmd[0],
                    payload,
                });
                match script(cmd[0], payload) {
                    Some(response) => {
                        if data.write_all(&response).is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        });
        Self {
            transactions,
            thread: Some(thread),
        }
    }

    /// Wait for the peer thread to exit (the endpoint must be stopped or
    /// dropped first so its sockets close).
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
