//! Worker-level tests: a reactor + transport pair driven directly, without
//! the endpoint facade, over real sockets and timerfds.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::{IntoRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use edgeline::error::Error;
use edgeline::transport::make_non_blocking;
use edgeline::{create_timer_fd, Handler, Peer, Reactor, Transport};

// ── Harness ─────────────────────────────────────────────────────────

struct WorkerHarness {
    reactor: Arc<Reactor>,
    transport: Arc<Transport>,
    join: thread::JoinHandle<Result<(), Error>>,
}

fn start_worker(handler: Box<dyn Handler>, max_payload: usize) -> WorkerHarness {
    let reactor = Arc::new(Reactor::new().unwrap());
    let transport = Transport::new(reactor.clone(), handler, max_payload);
    transport.bind_poller().unwrap();

    let thread_reactor = reactor.clone();
    let thread_transport = transport.clone();
    let join = thread::spawn(move || {
        thread_reactor.mark_thread();
        thread_reactor.run(&thread_transport)
    });

    WorkerHarness {
        reactor,
        transport,
        join,
    }
}

impl WorkerHarness {
    fn stop(self) {
        self.reactor.wake_shutdown().unwrap();
        self.join.join().unwrap().unwrap();
    }
}

/// Accept one connection and adopt it into the transport. Returns the
/// client-side stream and the adopted peer.
fn connect_peer(harness: &WorkerHarness) -> (TcpStream, Arc<Peer>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (accepted, peer_addr) = listener.accept().unwrap();

    let fd: RawFd = accepted.into_raw_fd();
    make_non_blocking(fd).unwrap();
    let peer = Peer::new(fd, peer_addr);
    harness.transport.handle_new_peer(peer.clone());
    (client, peer)
}

struct NullHandler;

impl Handler for NullHandler {
    fn on_input(&self, _buffer: &[u8], _peer: &Arc<Peer>) {}
}

struct EchoHandler;

impl Handler for EchoHandler {
    fn on_input(&self, buffer: &[u8], peer: &Arc<Peer>) {
        let _ = peer.send(buffer);
    }
}

struct CountingHandler {
    connections: Arc<AtomicUsize>,
    disconnections: Arc<AtomicUsize>,
}

impl Handler for CountingHandler {
    fn on_input(&self, _buffer: &[u8], _peer: &Arc<Peer>) {}

    fn on_connection(&self, _peer: &Arc<Peer>) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnection(&self, _peer: &Arc<Peer>) {
        self.disconnections.fetch_add(1, Ordering::SeqCst);
    }
}

/// Disarms the timer whose fd arrives as decimal text, then acks.
struct DisarmOnInput;

impl Handler for DisarmOnInput {
    fn on_input(&self, buffer: &[u8], peer: &Arc<Peer>) {
        let text = std::str::from_utf8(buffer).unwrap();
        let fd: RawFd = text.trim().parse().unwrap();
        let transport = peer.transport().unwrap();
        let _ = transport.disarm_timer(fd);
        let _ = peer.send(&b"ok"[..]);
    }
}

fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

// ── Timers ──────────────────────────────────────────────────────────

#[test]
fn timer_resolves_with_wakeup_count() {
    let harness = start_worker(Box::new(NullHandler), 4096);

    let fd = create_timer_fd().unwrap();
    let armed_at = Instant::now();
    let deferred = harness.transport.arm_timer_ms(fd, Duration::from_millis(50));

    let wakeups = deferred
        .wait_timeout(Duration::from_millis(200))
        .expect("timer did not fire in time")
        .unwrap();
    assert_eq!(wakeups, 1);
    assert!(armed_at.elapsed() >= Duration::from_millis(50));

    close_fd(fd);
    harness.stop();
}

#[test]
fn arming_twice_rejects_the_second() {
    let harness = start_worker(Box::new(NullHandler), 4096);

    let fd = create_timer_fd().unwrap();
    let first = harness.transport.arm_timer_ms(fd, Duration::from_millis(500));
    let second = harness.transport.arm_timer_ms(fd, Duration::from_millis(500));

    match second.wait_timeout(Duration::from_secs(1)) {
        Some(Err(Error::TimerAlreadyArmed)) => {}
        other => panic!("expected rejection, got {:?}", other.map(|r| r.is_ok())),
    }
    // The first timer is unaffected and still fires.
    assert_eq!(
        first.wait_timeout(Duration::from_secs(2)).unwrap().unwrap(),
        1
    );

    close_fd(fd);
    harness.stop();
}

#[test]
fn disarmed_timer_fire_is_dropped_silently() {
    let harness = start_worker(Box::new(DisarmOnInput), 4096);
    let (mut client, _peer) = connect_peer(&harness);

    let fd = create_timer_fd().unwrap();
    let deferred = harness.transport.arm_timer_ms(fd, Duration::from_millis(500));
    // Let the worker process the arm before the disarm request lands.
    thread::sleep(Duration::from_millis(50));

    // Ask the worker to disarm from its own thread, and wait for the ack.
    client.write_all(format!("{fd}").as_bytes()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut ack = [0u8; 2];
    client.read_exact(&mut ack).unwrap();
    assert_eq!(&ack, b"ok");

    // The fire is swallowed: no value, no error.
    assert!(deferred.wait_timeout(Duration::from_secs(2)).is_none());

    close_fd(fd);
    harness.stop();
}

// ── Writes ──────────────────────────────────────────────────────────

#[test]
fn zero_length_write_resolves_immediately() {
    let harness = start_worker(Box::new(NullHandler), 4096);
    let (_client, peer) = connect_peer(&harness);

    let deferred = harness.transport.async_write(&peer, Vec::new(), 0);
    assert_eq!(
        deferred.wait_timeout(Duration::from_millis(50)).unwrap().unwrap(),
        0
    );

    harness.stop();
}

#[test]
fn cross_thread_write_reaches_the_wire() {
    let harness = start_worker(Box::new(NullHandler), 4096);
    let (mut client, peer) = connect_peer(&harness);

    let payload = b"hello from another thread".to_vec();
    let deferred = harness.transport.async_write(&peer, payload.clone(), 0);
    assert_eq!(
        deferred.wait_timeout(Duration::from_secs(2)).unwrap().unwrap(),
        payload.len()
    );

    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut received = vec![0u8; payload.len()];
    client.read_exact(&mut received).unwrap();
    assert_eq!(received, payload);

    harness.stop();
}

#[test]
fn echo_through_worker() {
    let harness = start_worker(Box::new(EchoHandler), 4096);
    let (mut client, _peer) = connect_peer(&harness);
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    for i in 0..10 {
        let message = format!("message-{i}");
        client.write_all(message.as_bytes()).unwrap();
        let mut received = vec![0u8; message.len()];
        client.read_exact(&mut received).unwrap();
        assert_eq!(received, message.as_bytes());
    }

    harness.stop();
}

#[test]
fn parked_writes_reject_on_shutdown() {
    let harness = start_worker(Box::new(NullHandler), 4096);

    // Peers whose clients never read: large writes park on EAGAIN.
    let mut clients = Vec::new();
    let mut parked = Vec::new();
    for _ in 0..10 {
        let (client, peer) = connect_peer(&harness);
        let deferred = harness
            .transport
            .async_write(&peer, vec![0u8; 8 * 1024 * 1024], 0);
        clients.push(client);
        parked.push((peer, deferred));
    }

    // Give the worker time to attempt and park every write.
    thread::sleep(Duration::from_millis(200));

    let stop_started = Instant::now();
    harness.reactor.wake_shutdown().unwrap();
    harness.join.join().unwrap().unwrap();
    assert!(stop_started.elapsed() < Duration::from_secs(1));

    for (peer, deferred) in parked {
        match deferred.wait_timeout(Duration::from_secs(1)) {
            Some(Err(Error::ShuttingDown)) => {}
            other => panic!("expected shutdown rejection, got {:?}", other.map(|r| r.is_ok())),
        }
        assert!(peer.is_closed());
    }
}

// ── Connection lifecycle ────────────────────────────────────────────

#[test]
fn client_disconnect_cleans_up_peer() {
    let connections = Arc::new(AtomicUsize::new(0));
    let disconnections = Arc::new(AtomicUsize::new(0));
    let harness = start_worker(
        Box::new(CountingHandler {
            connections: connections.clone(),
            disconnections: disconnections.clone(),
        }),
        4096,
    );

    let (client, peer) = connect_peer(&harness);
    let deadline = Instant::now() + Duration::from_secs(2);
    while connections.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    drop(client);
    let deadline = Instant::now() + Duration::from_secs(2);
    while disconnections.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(disconnections.load(Ordering::SeqCst), 1);
    assert!(peer.is_closed());

    harness.stop();
}

#[test]
fn many_short_lived_peers_leave_no_residue() {
    let connections = Arc::new(AtomicUsize::new(0));
    let disconnections = Arc::new(AtomicUsize::new(0));
    let harness = start_worker(
        Box::new(CountingHandler {
            connections: connections.clone(),
            disconnections: disconnections.clone(),
        }),
        4096,
    );

    for _ in 0..50 {
        let (client, _peer) = connect_peer(&harness);
        drop(client);
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while disconnections.load(Ordering::SeqCst) < 50 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(connections.load(Ordering::SeqCst), 50);
    assert_eq!(disconnections.load(Ordering::SeqCst), 50);

    harness.stop();
}

// ── Worker load probe ───────────────────────────────────────────────

#[test]
fn thread_usage_resolves_on_the_worker() {
    let harness = start_worker(Box::new(NullHandler), 4096);

    let usage = harness
        .transport
        .thread_usage()
        .wait_timeout(Duration::from_secs(2))
        .expect("usage probe did not resolve")
        .unwrap();
    assert!(usage.user + usage.system < Duration::from_secs(60));

    harness.stop();
}
