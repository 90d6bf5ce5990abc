//! End-to-end tests: a REST endpoint driven over real TCP connections.
//!
//! Each test starts a full server (acceptor + workers), talks to it with
//! std TCP streams, and shuts it down explicitly at the end.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use edgeline::{Code, Config, Endpoint, Router};

// ── Helpers ─────────────────────────────────────────────────────────

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn wait_for_server(addr: &str) {
    for _ in 0..200 {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("server did not start on {addr}");
}

fn start_server(router: Router, config: Config) -> (Arc<Endpoint>, String, thread::JoinHandle<()>) {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let endpoint = Arc::new(Endpoint::new(addr.parse().unwrap(), config));
    endpoint.set_handler(router.into_handler());

    let serving = endpoint.clone();
    let join = thread::spawn(move || {
        serving.serve().expect("serve failed");
    });
    wait_for_server(&addr);
    (endpoint, addr, join)
}

/// One request over a fresh connection; returns (status, body). Asks for
/// `connection: close` so the response ends at EOF.
fn http_request(addr: &str, method: &str, path: &str, body: Option<&str>) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let body = body.unwrap_or("");
    let request = format!(
        "{method} {path} HTTP/1.1\r\nhost: test\r\nconnection: close\r\ncontent-length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).unwrap();
    stream.flush().unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    parse_response(&response)
}

fn parse_response(raw: &[u8]) -> (u16, String) {
    let text = String::from_utf8_lossy(raw);
    let status = text
        .split(' ')
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or_else(|| panic!("bad response: {text}"));
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

/// The canonical stats service: record a counter, read it back.
fn stats_router() -> Router {
    let store: Arc<Mutex<Vec<(String, i64)>>> = Arc::new(Mutex::new(Vec::new()));
    let mut router = Router::new();

    let record_store = store.clone();
    router
        .post("/record/:name/:value?", move |req, resp| {
            let name = req.param(":name").unwrap().value().to_string();
            let value = if req.has_param(":value") {
                req.param(":value").unwrap().parse::<i64>().unwrap()
            } else {
                1
            };

            let mut metrics = record_store.lock().unwrap();
            match metrics.iter_mut().find(|(n, _)| *n == name) {
                Some((_, total)) => {
                    *total += value;
                    let _ = resp.send(Code::Ok, total.to_string());
                }
                None => {
                    metrics.push((name, value));
                    let _ = resp.send(Code::Created, value.to_string());
                }
            }
        })
        .unwrap();

    let value_store = store;
    router
        .get("/value/:name", move |req, resp| {
            let name = req.param(":name").unwrap().value().to_string();
            let metrics = value_store.lock().unwrap();
            match metrics.iter().find(|(n, _)| *n == name) {
                Some((_, total)) => {
                    let _ = resp.send(Code::Ok, total.to_string());
                }
                None => {
                    let _ = resp.send(Code::NotFound, "Metric does not exist");
                }
            }
        })
        .unwrap();

    router
        .get("/ready", |_req, resp| {
            let _ = resp.send(Code::Ok, "1");
        })
        .unwrap();

    router
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn record_and_read_metrics() {
    let (endpoint, addr, join) = start_server(stats_router(), Config::default().threads(2));

    assert_eq!(
        http_request(&addr, "POST", "/record/hits/5", None),
        (201, "5".to_string())
    );
    assert_eq!(
        http_request(&addr, "POST", "/record/hits/2", None),
        (200, "7".to_string())
    );
    assert_eq!(
        http_request(&addr, "GET", "/value/hits", None),
        (200, "7".to_string())
    );
    assert_eq!(
        http_request(&addr, "GET", "/value/missing", None),
        (404, "Metric does not exist".to_string())
    );

    endpoint.shutdown();
    join.join().unwrap();
}

#[test]
fn record_without_optional_value_defaults_to_one() {
    let (endpoint, addr, join) = start_server(stats_router(), Config::default());

    assert_eq!(
        http_request(&addr, "POST", "/record/lonely", None),
        (201, "1".to_string())
    );
    assert_eq!(
        http_request(&addr, "GET", "/value/lonely", None),
        (200, "1".to_string())
    );

    endpoint.shutdown();
    join.join().unwrap();
}

#[test]
fn unmatched_route_gets_404() {
    let (endpoint, addr, join) = start_server(stats_router(), Config::default());

    let (status, body) = http_request(&addr, "GET", "/no/such/route", None);
    assert_eq!(status, 404);
    assert_eq!(body, "Could not find a matching route");

    endpoint.shutdown();
    join.join().unwrap();
}

#[test]
fn splat_route_matches_any_single_segment() {
    let mut router = Router::new();
    router
        .get("/*", |req, resp| {
            let splats: Vec<&str> = req.splats().iter().map(|s| s.value()).collect();
            let _ = resp.send(Code::Ok, splats.join(","));
        })
        .unwrap();

    let (endpoint, addr, join) = start_server(router, Config::default());

    assert_eq!(
        http_request(&addr, "GET", "/anything", None),
        (200, "anything".to_string())
    );
    assert_eq!(
        http_request(&addr, "GET", "/other", None),
        (200, "other".to_string())
    );
    // Two segments exceed the single-fragment route.
    assert_eq!(http_request(&addr, "GET", "/a/b", None).0, 404);

    endpoint.shutdown();
    join.join().unwrap();
}

#[test]
fn first_registered_route_wins() {
    let mut router = Router::new();
    router
        .get("/probe/:x", |req, resp| {
            let captured = req.param(":x").unwrap().value().to_string();
            let _ = resp.send(Code::Ok, format!("param:{captured}"));
        })
        .unwrap();
    router
        .get("/probe/fixed", |_req, resp| {
            let _ = resp.send(Code::Ok, "fixed");
        })
        .unwrap();

    let (endpoint, addr, join) = start_server(router, Config::default());

    assert_eq!(
        http_request(&addr, "GET", "/probe/fixed", None),
        (200, "param:fixed".to_string())
    );

    endpoint.shutdown();
    join.join().unwrap();
}

#[test]
fn concurrent_clients_across_workers() {
    let (endpoint, addr, join) = start_server(stats_router(), Config::default().threads(4));

    let mut clients = Vec::new();
    for _ in 0..8 {
        let addr = addr.clone();
        clients.push(thread::spawn(move || {
            for _ in 0..25 {
                assert_eq!(http_request(&addr, "GET", "/ready", None), (200, "1".to_string()));
            }
        }));
    }
    for client in clients {
        client.join().unwrap();
    }

    endpoint.shutdown();
    join.join().unwrap();
}

#[test]
fn oversize_payload_does_not_take_the_server_down() {
    let (endpoint, addr, join) = start_server(
        stats_router(),
        Config::default().max_payload(512),
    );

    // Flood one connection with far more than the receive budget. The server
    // answers 413 or drops the connection; either way it must stay up.
    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let big = vec![b'x'; 64 * 1024];
    let _ = stream.write_all(&big);
    let _ = stream.flush();
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response);
    if !response.is_empty() {
        assert_eq!(parse_response(&response).0, 413);
    }
    drop(stream);

    // Other peers are still served.
    assert_eq!(
        http_request(&addr, "GET", "/ready", None),
        (200, "1".to_string())
    );

    endpoint.shutdown();
    join.join().unwrap();
}

#[test]
fn pipelined_requests_are_answered_in_order() {
    let (endpoint, addr, join) = start_server(stats_router(), Config::default());

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(
            b"GET /ready HTTP/1.1\r\nhost: t\r\n\r\n\
              GET /ready HTTP/1.1\r\nhost: t\r\nconnection: close\r\n\r\n",
        )
        .unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    let text = String::from_utf8_lossy(&response);
    assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);

    endpoint.shutdown();
    join.join().unwrap();
}

#[test]
fn shutdown_unblocks_serve_promptly() {
    let (endpoint, addr, join) = start_server(stats_router(), Config::default().threads(2));

    assert_eq!(http_request(&addr, "GET", "/ready", None).0, 200);

    let start = Instant::now();
    endpoint.shutdown();
    join.join().unwrap();
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "shutdown took {:?}",
        start.elapsed()
    );

    // The port is released: nothing is listening any more.
    assert!(TcpStream::connect(&addr).is_err() || {
        // A TIME_WAIT race can let one connect through; a request must fail.
        let mut s = TcpStream::connect(&addr).unwrap();
        s.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        s.write_all(b"GET /ready HTTP/1.1\r\n\r\n").ok();
        let mut buf = [0u8; 1];
        matches!(s.read(&mut buf), Ok(0) | Err(_))
    });
}
