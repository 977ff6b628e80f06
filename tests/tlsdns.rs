// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end tests for the TLSDNS transport.

mod common;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use netmgr::{AcceptCallback, Error, Handle, Manager, Quota, RecvCallback};

use common::{connect, init_logging, recv_within, tls_pair, wait_until};

fn accept_all() -> AcceptCallback {
    Arc::new(|_handle, _res| Ok(()))
}

fn echo_frames() -> RecvCallback {
    Arc::new(|handle, res| {
        if let Ok(frame) = res {
            let data = frame.to_vec();
            handle.send(&data, Box::new(|_, _| {}));
        }
    })
}

fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[test]
fn listen_accept_echo() {
    init_logging();
    let (server_cfg, client_cfg) = tls_pair();
    let mgr = Manager::new(2).unwrap();

    let accepts = Arc::new(AtomicUsize::new(0));
    let accepts_cb = Arc::clone(&accepts);
    let accept_cb: AcceptCallback = Arc::new(move |_handle, _res| {
        accepts_cb.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let listener = mgr
        .listen_tlsdns(any_addr(), echo_frames(), accept_cb, 128, None, server_cfg)
        .unwrap();

    let handle = connect(&mgr, listener.local_addr(), client_cfg);

    let (read_tx, read_rx) = channel();
    handle.read(Box::new(move |_h, res| {
        let _ = read_tx.send(res.map(|b| b.to_vec()));
    }));

    let (send_tx, send_rx) = channel();
    handle.send(
        b"hello",
        Box::new(move |_h, res| {
            let _ = send_tx.send(res);
        }),
    );

    recv_within(&send_rx, Duration::from_secs(5), "send completion").unwrap();
    let echoed = recv_within(&read_rx, Duration::from_secs(5), "echoed frame").unwrap();
    assert_eq!(echoed, b"hello");

    // One connection: accept fires at TCP accept and at handshake end.
    assert_eq!(accepts.load(Ordering::SeqCst), 2);

    drop(handle);
    drop(listener);
    mgr.destroy();
}

#[test]
fn empty_frame_round_trips() {
    init_logging();
    let (server_cfg, client_cfg) = tls_pair();
    let mgr = Manager::new(1).unwrap();

    let listener = mgr
        .listen_tlsdns(any_addr(), echo_frames(), accept_all(), 16, None, server_cfg)
        .unwrap();

    let handle = connect(&mgr, listener.local_addr(), client_cfg);

    let (read_tx, read_rx) = channel();
    handle.read(Box::new(move |_h, res| {
        let _ = read_tx.send(res.map(|b| b.to_vec()));
    }));
    handle.send(b"", Box::new(|_, _| {}));

    let echoed = recv_within(&read_rx, Duration::from_secs(5), "empty frame").unwrap();
    assert_eq!(echoed, Vec::<u8>::new());

    drop(handle);
    drop(listener);
    mgr.destroy();
}

#[test]
fn idle_timeout_fires_once() {
    init_logging();
    let (server_cfg, client_cfg) = tls_pair();
    let mgr = Manager::new(1).unwrap();
    mgr.set_tcp_timeouts(100, 100, 100, 100);

    let (err_tx, err_rx) = channel();
    let recv_cb: RecvCallback = Arc::new(move |_handle, res| {
        if let Err(err) = res {
            let _ = err_tx.send(err);
        }
    });

    let listener = mgr
        .listen_tlsdns(any_addr(), recv_cb, accept_all(), 16, None, server_cfg)
        .unwrap();

    // Connect, complete the handshake, send nothing.
    let handle = connect(&mgr, listener.local_addr(), client_cfg);

    let err = recv_within(&err_rx, Duration::from_secs(2), "idle timeout");
    assert_eq!(err, Error::TimedOut);
    // Exactly once.
    assert!(err_rx.recv_timeout(Duration::from_millis(300)).is_err());

    drop(handle);
    drop(listener);
    mgr.destroy();
}

#[test]
fn quota_parks_second_accept() {
    init_logging();
    let (server_cfg, client_cfg) = tls_pair();
    let mgr = Manager::new(2).unwrap();

    let quota = Arc::new(Quota::new(1));
    let peers: Arc<Mutex<HashSet<SocketAddr>>> = Arc::new(Mutex::new(HashSet::new()));
    let peers_cb = Arc::clone(&peers);
    let accept_cb: AcceptCallback = Arc::new(move |handle, _res| {
        peers_cb.lock().unwrap().insert(handle.peer_addr());
        Ok(())
    });

    let listener = mgr
        .listen_tlsdns(
            any_addr(),
            echo_frames(),
            accept_cb,
            16,
            Some(Arc::clone(&quota)),
            server_cfg,
        )
        .unwrap();
    let addr = listener.local_addr();

    let first = connect(&mgr, addr, Arc::clone(&client_cfg));
    wait_until(Duration::from_secs(2), "first accept", || {
        peers.lock().unwrap().len() == 1
    });

    // The second connect completes TCP but its accept parks on the quota.
    let (tx, rx) = channel();
    mgr.connect_tlsdns(
        None,
        addr,
        Box::new(move |res| {
            let _ = tx.send(res);
        }),
        5_000,
        client_cfg,
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(peers.lock().unwrap().len(), 1, "second accept ran early");

    // Releasing the first connection frees the token and unparks it.
    drop(first);
    let second = recv_within(&rx, Duration::from_secs(5), "second connect").unwrap();
    wait_until(Duration::from_secs(2), "second accept", || {
        peers.lock().unwrap().len() == 2
    });

    drop(second);
    drop(listener);
    mgr.destroy();
}

#[test]
fn pipelined_frames_arrive_in_order() {
    init_logging();
    let (server_cfg, client_cfg) = tls_pair();
    let mgr = Manager::new(1).unwrap();

    let frames: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let frames_cb = Arc::clone(&frames);
    let recv_cb: RecvCallback = Arc::new(move |_handle, res| {
        if let Ok(frame) = res {
            frames_cb.lock().unwrap().push(frame.to_vec());
        }
    });

    let listener = mgr
        .listen_tlsdns(any_addr(), recv_cb, accept_all(), 16, None, server_cfg)
        .unwrap();

    let handle = connect(&mgr, listener.local_addr(), client_cfg);
    handle.send(b"one", Box::new(|_, _| {}));
    handle.send(b"two", Box::new(|_, _| {}));

    wait_until(Duration::from_secs(5), "both frames", || {
        frames.lock().unwrap().len() == 2
    });
    {
        let frames = frames.lock().unwrap();
        assert_eq!(frames[0], b"one");
        assert_eq!(frames[1], b"two");
    }
    // Exactly twice.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(frames.lock().unwrap().len(), 2);

    drop(handle);
    drop(listener);
    mgr.destroy();
}

#[test]
fn sequential_mode_waits_for_handle_release() {
    init_logging();
    let (server_cfg, client_cfg) = tls_pair();
    let mgr = Manager::new(1).unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let held: Arc<Mutex<Option<Handle>>> = Arc::new(Mutex::new(None));
    let seen_cb = Arc::clone(&seen);
    let held_cb = Arc::clone(&held);
    let recv_cb: RecvCallback = Arc::new(move |handle, res| {
        if res.is_ok() {
            let n = seen_cb.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                // First frame: disable pipelining and keep the handle.
                handle.sequential();
                *held_cb.lock().unwrap() = Some(handle.clone());
            }
        }
    });

    let listener = mgr
        .listen_tlsdns(any_addr(), recv_cb, accept_all(), 16, None, server_cfg)
        .unwrap();

    let handle = connect(&mgr, listener.local_addr(), client_cfg);
    handle.send(b"first", Box::new(|_, _| {}));
    handle.send(b"second", Box::new(|_, _| {}));

    wait_until(Duration::from_secs(5), "first frame", || {
        seen.load(Ordering::SeqCst) >= 1
    });
    // The second frame stays parked while the first handle is alive.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    // Releasing the handle resumes processing.
    held.lock().unwrap().take();
    wait_until(Duration::from_secs(5), "second frame", || {
        seen.load(Ordering::SeqCst) == 2
    });

    drop(handle);
    drop(listener);
    mgr.destroy();
}

#[test]
fn cancel_read_is_idempotent() {
    init_logging();
    let (server_cfg, client_cfg) = tls_pair();
    let mgr = Manager::new(1).unwrap();

    let listener = mgr
        .listen_tlsdns(any_addr(), echo_frames(), accept_all(), 16, None, server_cfg)
        .unwrap();

    let handle = connect(&mgr, listener.local_addr(), client_cfg);

    let (tx, rx) = channel();
    handle.read(Box::new(move |_h, res| {
        let _ = tx.send(res.map(|b| b.to_vec()));
    }));
    handle.cancel_read();
    handle.cancel_read();

    let first = recv_within(&rx, Duration::from_secs(2), "canceled read");
    assert_eq!(first.unwrap_err(), Error::Canceled);
    // At most one completion.
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    drop(handle);
    drop(listener);
    mgr.destroy();
}

#[test]
fn stop_listening_is_idempotent() {
    init_logging();
    let (server_cfg, client_cfg) = tls_pair();
    let mgr = Manager::new(2).unwrap();

    let listener = mgr
        .listen_tlsdns(any_addr(), echo_frames(), accept_all(), 16, None, server_cfg)
        .unwrap();
    let addr = listener.local_addr();

    listener.stop_listening();
    listener.stop_listening();

    // New connections are refused once the children are gone.
    wait_until(Duration::from_secs(2), "listener teardown", || {
        std::net::TcpStream::connect(addr).is_err()
    });

    let (tx, rx) = channel();
    mgr.connect_tlsdns(
        None,
        addr,
        Box::new(move |res| {
            let _ = tx.send(res.map(|_| ()));
        }),
        1_000,
        client_cfg,
    )
    .unwrap();
    let res = recv_within(&rx, Duration::from_secs(5), "refused connect");
    assert!(res.is_err());

    drop(listener);
    mgr.destroy();
}

#[test]
fn read_timeout_override_applies() {
    init_logging();
    let (server_cfg, client_cfg) = tls_pair();
    let mgr = Manager::new(1).unwrap();

    let listener = mgr
        .listen_tlsdns(any_addr(), echo_frames(), accept_all(), 16, None, server_cfg)
        .unwrap();

    let handle = connect(&mgr, listener.local_addr(), client_cfg);
    handle.set_timeout(100);

    let (tx, rx) = channel();
    handle.read(Box::new(move |_h, res| {
        let _ = tx.send(res.map(|b| b.to_vec()));
    }));

    let res = recv_within(&rx, Duration::from_secs(2), "read timeout");
    assert_eq!(res.unwrap_err(), Error::TimedOut);

    drop(handle);
    drop(listener);
    mgr.destroy();
}

#[test]
fn handle_data_round_trips() {
    init_logging();
    let (server_cfg, client_cfg) = tls_pair();
    let mgr = Manager::new(1).unwrap();

    let listener = mgr
        .listen_tlsdns(any_addr(), echo_frames(), accept_all(), 16, None, server_cfg)
        .unwrap();

    let handle = connect(&mgr, listener.local_addr(), client_cfg);
    handle.set_data(Arc::new(42usize), None, None);
    let data = handle.data().expect("stored data");
    assert_eq!(*data.downcast::<usize>().unwrap(), 42);

    assert_eq!(handle.peer_addr(), listener.local_addr());

    drop(handle);
    drop(listener);
    mgr.destroy();
}

#[test]
fn pause_halts_io_until_resume() {
    init_logging();
    let (server_cfg, client_cfg) = tls_pair();
    let mgr = Manager::new(2).unwrap();

    let listener = mgr
        .listen_tlsdns(any_addr(), echo_frames(), accept_all(), 16, None, server_cfg)
        .unwrap();
    let addr = listener.local_addr();

    mgr.pause();

    // A connect submitted while paused sits on the normal queue.
    let (tx, rx) = channel();
    let mgr2 = mgr.clone();
    let client2 = Arc::clone(&client_cfg);
    let submitter = std::thread::spawn(move || {
        mgr2.connect_tlsdns(
            None,
            addr,
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
            5_000,
            client2,
        )
        .unwrap();
    });

    std::thread::sleep(Duration::from_millis(200));
    assert!(
        rx.try_recv().is_err(),
        "connect made progress while the manager was paused"
    );

    mgr.resume();
    let handle = recv_within(&rx, Duration::from_secs(5), "connect after resume").unwrap();
    submitter.join().unwrap();

    drop(handle);
    drop(listener);
    mgr.destroy();
}

#[test]
fn knobs_round_trip() {
    init_logging();
    let mgr = Manager::new(1).unwrap();

    mgr.set_tcp_timeouts(1_000, 2_000, 3_000, 4_000);
    assert_eq!(mgr.tcp_timeouts(), (1_000, 2_000, 3_000, 4_000));

    mgr.set_max_udp_size(512);
    assert_eq!(mgr.max_udp_size(), 512);

    mgr.set_socket_buffer_sizes(64 * 1024, 64 * 1024);
    mgr.destroy();
}

#[test]
fn handle_controls_do_not_disturb_echo() {
    init_logging();
    let (server_cfg, client_cfg) = tls_pair();
    let mgr = Manager::new(1).unwrap();
    mgr.set_socket_buffer_sizes(64 * 1024, 64 * 1024);

    let listener = mgr
        .listen_tlsdns(any_addr(), echo_frames(), accept_all(), 16, None, server_cfg)
        .unwrap();

    let handle = connect(&mgr, listener.local_addr(), client_cfg);

    // Exercise the per-connection controls around a normal exchange.
    handle.keepalive(true);
    handle.pause_read();
    handle.resume_read();
    handle.clear_timeout();
    let extra = handle.attach();
    drop(extra);

    let (read_tx, read_rx) = channel();
    handle.read(Box::new(move |_h, res| {
        let _ = read_tx.send(res.map(|b| b.to_vec()));
    }));
    handle.send(b"still works", Box::new(|_, _| {}));

    let echoed = recv_within(&read_rx, Duration::from_secs(5), "echo").unwrap();
    assert_eq!(echoed, b"still works");

    // A cleared timeout must stay cleared across deliveries: the second
    // read on this connection completes with data, not a timeout.
    std::thread::sleep(Duration::from_millis(150));
    let (read_tx, read_rx) = channel();
    handle.read(Box::new(move |_h, res| {
        let _ = read_tx.send(res.map(|b| b.to_vec()));
    }));
    handle.send(b"second", Box::new(|_, _| {}));

    let echoed = recv_within(&read_rx, Duration::from_secs(5), "second echo").unwrap();
    assert_eq!(echoed, b"second");

    drop(handle);
    drop(listener);
    mgr.destroy();
}

#[test]
fn dropping_last_manager_tears_down() {
    init_logging();
    let (server_cfg, client_cfg) = tls_pair();
    let mgr = Manager::new(2).unwrap();

    // A dropped clone is only a detach; the pool keeps running.
    let clone = mgr.clone();
    drop(clone);

    let listener = mgr
        .listen_tlsdns(any_addr(), echo_frames(), accept_all(), 16, None, server_cfg)
        .unwrap();
    let handle = connect(&mgr, listener.local_addr(), client_cfg);

    let (read_tx, read_rx) = channel();
    handle.read(Box::new(move |_h, res| {
        let _ = read_tx.send(res.map(|b| b.to_vec()));
    }));
    handle.send(b"ping", Box::new(|_, _| {}));
    let echoed = recv_within(&read_rx, Duration::from_secs(5), "echo").unwrap();
    assert_eq!(echoed, b"ping");

    drop(handle);
    drop(listener);
    // The last reference drop performs the teardown, joining the workers.
    drop(mgr);
}

#[test]
fn shutdown_under_load_cancels_every_read_once() {
    init_logging();
    let (server_cfg, client_cfg) = tls_pair();
    let mgr = Manager::new(4).unwrap();

    let listener = mgr
        .listen_tlsdns(
            any_addr(),
            echo_frames(),
            accept_all(),
            256,
            None,
            server_cfg,
        )
        .unwrap();
    let addr = listener.local_addr();

    const CLIENTS: usize = 100;
    let mut handles = Vec::with_capacity(CLIENTS);
    for _ in 0..CLIENTS {
        handles.push(connect(&mgr, addr, Arc::clone(&client_cfg)));
    }

    // Every client has a read pending when the manager shuts down.
    let completions: Arc<Mutex<Vec<Error>>> = Arc::new(Mutex::new(Vec::new()));
    for handle in &handles {
        let completions = Arc::clone(&completions);
        handle.read(Box::new(move |_h, res| {
            if let Err(err) = res {
                completions.lock().unwrap().push(err);
            }
        }));
    }

    mgr.shutdown();

    wait_until(Duration::from_secs(10), "all reads canceled", || {
        completions.lock().unwrap().len() == CLIENTS
    });
    {
        let completions = completions.lock().unwrap();
        assert_eq!(completions.len(), CLIENTS);
        assert!(completions.iter().all(|err| *err == Error::Canceled));
    }

    drop(handles);
    drop(listener);
    // Destroy blocks until every socket is released.
    mgr.destroy();
}
