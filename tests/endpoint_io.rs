//! Endpoint command I/O against a scripted GBA peer.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use common::{MockGba, tcp_pair};
use joybus_link::endpoint::{Endpoint, PacketCell, StatusCell};
use joybus_link::protocol::{CMD_READ, CMD_RESET, CMD_STATUS, CMD_WRITE, JoyReturn};

fn basic_script(cmd: u8, _payload: Option<[u8; 4]>) -> Option<Vec<u8>> {
    match cmd {
        CMD_STATUS => Some(vec![0, 0, 0x10, 0, 0]),
        CMD_RESET => Some(vec![0, 0, 0x08, 0, 0]),
        CMD_READ => Some(vec![1, 2, 3, 4, 0x30]),
        CMD_WRITE => Some(vec![0x2a]),
        _ => Some(vec![0; 5]),
    }
}

#[test]
fn status_round_trip_reports_jstat() {
    let (engine_data, peer_data) = tcp_pair();
    let (engine_clock, peer_clock) = tcp_pair();
    let mock = MockGba::spawn(peer_data, peer_clock, basic_script);
    let endpoint = Endpoint::new(0, engine_data, engine_clock).expect("endpoint");
    let status = StatusCell::new();

    assert_eq!(endpoint.get_status(&status), JoyReturn::Ready);
    assert_eq!(status.get(), 0x10);

    {
        let log = mock.transactions.lock().expect("log");
        let first = log.first().expect("at least one transaction");
        // The first clock packet synthesizes one 60 Hz frame:
        // (486e6 / 60) * 2^24 / 486e6.
        assert_eq!(first.clock_ticks, 279_620);
        assert!(log.iter().all(|t| t.command == CMD_STATUS && t.payload.is_none()));
    }

    // A reset marks the endpoint booted, which silences the idle poll; from
    // here every request is exactly one transaction.
    assert_eq!(endpoint.reset(&status), JoyReturn::Ready);
    assert_eq!(status.get(), 0x08);
    let baseline = mock.transactions.lock().expect("log").len();

    assert_eq!(endpoint.get_status(&status), JoyReturn::Ready);
    assert_eq!(status.get(), 0x10);
    {
        let log = mock.transactions.lock().expect("log");
        assert_eq!(log.len(), baseline + 1);
        assert_eq!(log[baseline].command, CMD_STATUS);
        assert!(log[baseline].clock_ticks > 0);
    }

    endpoint.stop();
    mock.join();
}

#[test]
fn read_and_write_round_trip() {
    let (engine_data, peer_data) = tcp_pair();
    let (engine_clock, peer_clock) = tcp_pair();
    let mock = MockGba::spawn(peer_data, peer_clock, basic_script);
    let endpoint = Endpoint::new(0, engine_data, engine_clock).expect("endpoint");
    let status = StatusCell::new();

    assert_eq!(endpoint.reset(&status), JoyReturn::Ready);

    let word = PacketCell::new();
    assert_eq!(endpoint.read(&word, &status), JoyReturn::Ready);
    assert_eq!(word.bytes(), [1, 2, 3, 4]);
    assert_eq!(status.get(), 0x30);

    assert_eq!(endpoint.write([9, 8, 7, 6], &status), JoyReturn::Ready);
    assert_eq!(status.get(), 0x2a);
    {
        let log = mock.transactions.lock().expect("log");
        let write = log.last().expect("write transaction");
        assert_eq!(write.command, CMD_WRITE);
        assert_eq!(write.payload, Some([9, 8, 7, 6]));
    }

    endpoint.stop();
    mock.join();
}

#[test]
fn callback_reissue_is_serialized_and_fires_once() {
    let (engine_data, peer_data) = tcp_pair();
    let (engine_clock, peer_clock) = tcp_pair();
    let mock = MockGba::spawn(peer_data, peer_clock, basic_script);
    let endpoint = Endpoint::new(0, engine_data, engine_clock).expect("endpoint");
    let status = StatusCell::new();

    assert_eq!(endpoint.reset(&status), JoyReturn::Ready);

    let fires = Arc::new(AtomicUsize::new(0));
    let outer_fires = Arc::clone(&fires);
    let (outer_tx, outer_rx) = mpsc::channel();
    let (inner_tx, inner_rx) = mpsc::channel();
    let inner_status = StatusCell::new();
    let spare_status = StatusCell::new();

    let submitted = endpoint.get_status_async(
        &status,
        Box::new(move |local, outer_status| {
            outer_fires.fetch_add(1, Ordering::SeqCst);
            let first = local.get_status_async(
                &inner_status,
                Box::new(move |_local, inner| {
                    let _ = inner_tx.send(inner);
                }),
            );
            // A second submission while the first is armed must be refused.
            let second = local.get_status_async(&spare_status, Box::new(|_local, _status| {}));
            let _ = outer_tx.send((outer_status, first, second));
        }),
    );
    assert_eq!(submitted, JoyReturn::Ready);

    let (outer_status, first, second) = outer_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("outer callback");
    assert_eq!(outer_status, JoyReturn::Ready);
    assert_eq!(first, JoyReturn::Ready);
    assert_eq!(second, JoyReturn::NotReady);

    let inner = inner_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("chained callback");
    assert_eq!(inner, JoyReturn::Ready);
    assert_eq!(fires.load(Ordering::SeqCst), 1);

    endpoint.stop();
    mock.join();
}

#[test]
fn stop_unblocks_sync_waiters() {
    let (engine_data, peer_data) = tcp_pair();
    let (engine_clock, peer_clock) = tcp_pair();
    // A peer that accepts commands but never answers them.
    let mock = MockGba::spawn(peer_data, peer_clock, |_cmd, _payload| Some(Vec::new()));
    let endpoint = Endpoint::new(0, engine_data, engine_clock).expect("endpoint");
    let status = StatusCell::new();

    let waiter_status = status.clone();
    let result = std::thread::scope(|scope| {
        let waiter = scope.spawn(|| endpoint.get_status(&waiter_status));
        std::thread::sleep(Duration::from_millis(100));
        endpoint.stop();
        waiter.join().expect("join waiter")
    });
    assert_eq!(result, JoyReturn::NotReady);

    assert!(!endpoint.connected());
    assert_eq!(endpoint.get_status(&status), JoyReturn::NotReady);
    assert_eq!(endpoint.reset(&status), JoyReturn::NotReady);
    assert_eq!(endpoint.process_status(), (JoyReturn::NotReady, 0));
    mock.join();
}

#[test]
fn peer_disconnect_fails_pending_callback_once() {
    let (engine_data, peer_data) = tcp_pair();
    let (engine_clock, peer_clock) = tcp_pair();
    let mut reset_seen = false;
    let mock = MockGba::spawn(peer_data, peer_clock, move |cmd, _payload| match cmd {
        CMD_RESET => {
            reset_seen = true;
            Some(vec![0, 0, 0x08, 0, 0])
        }
        // Answer the pre-boot idle polls, then hang up.
        CMD_STATUS if !reset_seen => Some(vec![0; 5]),
        _ => None,
    });
    let endpoint = Endpoint::new(0, engine_data, engine_clock).expect("endpoint");
    let status = StatusCell::new();

    assert_eq!(endpoint.reset(&status), JoyReturn::Ready);

    let (tx, rx) = mpsc::channel();
    let submitted = endpoint.get_status_async(
        &status,
        Box::new(move |_local, result| {
            let _ = tx.send(result);
        }),
    );
    assert_eq!(submitted, JoyReturn::Ready);

    let result = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("failure callback");
    assert_eq!(result, JoyReturn::NotReady);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    endpoint.stop();
    mock.join();
}
