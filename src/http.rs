//! Minimal HTTP/1.x layer: incremental request parsing, the response
//! writer, and the glue that adapts the byte-level transport callbacks to
//! request/response dispatch.
//!
//! Parsing is deliberately small: request line, headers, and a
//! `Content-Length` body, with pipelined requests consumed one message at a
//! time. Anything malformed is answered 400 and the connection closed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tracing::warn;

use crate::deferred::{deferred, Deferred};
use crate::error::Error;
use crate::peer::Peer;
use crate::transport::Handler;

/// Request methods understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
}

impl Method {
    pub fn from_token(token: &str) -> Option<Method> {
        match token {
            "GET" => Some(Method::Get),
            "HEAD" => Some(Method::Head),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "PATCH" => Some(Method::Patch),
            "OPTIONS" => Some(Method::Options),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Ok,
    Created,
    NoContent,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    RequestTimeout,
    PayloadTooLarge,
    InternalServerError,
    NotImplemented,
}

impl Code {
    pub fn as_u16(self) -> u16 {
        match self {
            Code::Ok => 200,
            Code::Created => 201,
            Code::NoContent => 204,
            Code::BadRequest => 400,
            Code::NotFound => 404,
            Code::MethodNotAllowed => 405,
            Code::RequestTimeout => 408,
            Code::PayloadTooLarge => 413,
            Code::InternalServerError => 500,
            Code::NotImplemented => 501,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Created => "Created",
            Code::NoContent => "No Content",
            Code::BadRequest => "Bad Request",
            Code::NotFound => "Not Found",
            Code::MethodNotAllowed => "Method Not Allowed",
            Code::RequestTimeout => "Request Timeout",
            Code::PayloadTooLarge => "Payload Too Large",
            Code::InternalServerError => "Internal Server Error",
            Code::NotImplemented => "Not Implemented",
        }
    }
}

/// A parsed HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    resource: String,
    query: Option<String>,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Request {
    pub fn method(&self) -> Method {
        self.method
    }

    /// Request path with any query string stripped.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    fn wants_close(&self) -> bool {
        self.header("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
    }
}

/// Incremental parser holding the unconsumed tail of a peer's byte stream.
#[derive(Default)]
pub(crate) struct RequestParser {
    buf: BytesMut,
}

impl RequestParser {
    pub(crate) fn new() -> RequestParser {
        RequestParser::default()
    }

    /// Feed bytes; returns every request completed by them.
    pub(crate) fn advance(&mut self, bytes: &[u8]) -> Result<Vec<Request>, Error> {
        self.buf.extend_from_slice(bytes);
        let mut requests = Vec::new();
        while let Some((request, consumed)) = try_parse(&self.buf)? {
            self.buf.advance(consumed);
            requests.push(request);
        }
        Ok(requests)
    }
}

fn try_parse(buf: &[u8]) -> Result<Option<(Request, usize)>, Error> {
    let head_end = match find_head_end(buf) {
        Some(pos) => pos,
        None => return Ok(None),
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| Error::MalformedRequest("head is not valid UTF-8".into()))?;
    let mut lines = head.split("\r\n");

    let request_line = lines
        .next()
        .ok_or_else(|| Error::MalformedRequest("empty head".into()))?;
    let mut tokens = request_line.split(' ');
    let method_token = tokens
        .next()
        .ok_or_else(|| Error::MalformedRequest("missing method".into()))?;
    let target = tokens
        .next()
        .ok_or_else(|| Error::MalformedRequest("missing request target".into()))?;
    let version = tokens
        .next()
        .ok_or_else(|| Error::MalformedRequest("missing version".into()))?;
    if tokens.next().is_some() || !version.starts_with("HTTP/1.") {
        return Err(Error::MalformedRequest("bad request line".into()));
    }
    let method = Method::from_token(method_token)
        .ok_or_else(|| Error::MalformedRequest(format!("unknown method {method_token}")))?;

    let mut headers = Vec::new();
    let mut content_length = 0usize;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::MalformedRequest("header without colon".into()))?;
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value
                .parse()
                .map_err(|_| Error::MalformedRequest("bad content-length".into()))?;
        }
        headers.push((name.to_string(), value.to_string()));
    }

    let body_start = head_end + 4;
    let total = body_start + content_length;
    if buf.len() < total {
        return Ok(None);
    }

    let (resource, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (target.to_string(), None),
    };

    let request = Request {
        method,
        resource,
        query,
        headers,
        body: Bytes::copy_from_slice(&buf[body_start..total]),
    };
    Ok(Some((request, total)))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Writes one response back through the owning transport.
///
/// The handler must either call [`send`](ResponseWriter::send) once or hand
/// the writer to asynchronous work that eventually does.
pub struct ResponseWriter {
    peer: Arc<Peer>,
    close_after_send: bool,
}

impl ResponseWriter {
    pub(crate) fn new(peer: Arc<Peer>, close_after_send: bool) -> ResponseWriter {
        ResponseWriter {
            peer,
            close_after_send,
        }
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Serialize and send the response. Resolves with the bytes written once
    /// the full message is on the socket.
    pub fn send(&self, code: Code, body: impl AsRef<[u8]>) -> Deferred<usize> {
        let body = body.as_ref();
        let mut message = Vec::with_capacity(128 + body.len());
        message.extend_from_slice(b"HTTP/1.1 ");
        message.extend_from_slice(code.as_u16().to_string().as_bytes());
        message.push(b' ');
        message.extend_from_slice(code.reason().as_bytes());
        message.extend_from_slice(b"\r\ncontent-length: ");
        message.extend_from_slice(body.len().to_string().as_bytes());
        message.extend_from_slice(b"\r\n");
        if self.close_after_send {
            message.extend_from_slice(b"connection: close\r\n");
        }
        message.extend_from_slice(b"\r\n");
        message.extend_from_slice(body);

        let write = self.peer.send(message);
        if !self.close_after_send {
            return write;
        }

        // Close once the write resolves, then pass the outcome through.
        let (out, completer) = deferred();
        let peer = self.peer.clone();
        write.then(move |result| {
            if let Ok(transport) = peer.transport() {
                transport.close_peer(&peer);
            }
            match result {
                Ok(written) => completer.resolve(written),
                Err(err) => completer.reject(err),
            }
        });
        out
    }
}

/// Request-level handler installed on an endpoint. Shared by every worker;
/// implementations must be safe for concurrent calls on different peers.
pub trait HttpHandler: Send + Sync + 'static {
    fn on_request(&self, request: Request, response: ResponseWriter);
}

/// Per-worker adapter from byte-level transport callbacks to HTTP dispatch.
/// Holds each peer's parser state; lives and dies with its worker.
pub(crate) struct ServerHandler {
    dispatch: Arc<dyn HttpHandler>,
    parsers: RefCell<HashMap<RawFd, RequestParser>>,
}

impl ServerHandler {
    pub(crate) fn new(dispatch: Arc<dyn HttpHandler>) -> ServerHandler {
        ServerHandler {
            dispatch,
            parsers: RefCell::new(HashMap::new()),
        }
    }

    fn respond_and_close(&self, peer: &Arc<Peer>, code: Code) {
        let writer = ResponseWriter::new(peer.clone(), true);
        let _ = writer.send(code, "");
    }
}

impl Handler for ServerHandler {
    fn on_connection(&self, peer: &Arc<Peer>) {
        self.parsers
            .borrow_mut()
            .insert(peer.fd(), RequestParser::new());
    }

    fn on_disconnection(&self, peer: &Arc<Peer>) {
        self.parsers.borrow_mut().remove(&peer.fd());
    }

    fn on_input(&self, buffer: &[u8], peer: &Arc<Peer>) {
        // The parser borrow must end before dispatch: a handler may close
        // the peer, which re-enters on_disconnection above.
        let parsed = {
            let mut parsers = self.parsers.borrow_mut();
            let parser = parsers.entry(peer.fd()).or_default();
            parser.advance(buffer)
        };

        match parsed {
            Ok(requests) => {
                for request in requests {
                    let close = request.wants_close();
                    let writer = ResponseWriter::new(peer.clone(), close);
                    self.dispatch.on_request(request, writer);
                }
            }
            Err(err) => {
                warn!(peer = %peer, error = %err, "malformed request");
                self.respond_and_close(peer, Code::BadRequest);
            }
        }
    }

    fn on_payload_overrun(&self, peer: &Arc<Peer>) {
        // Partial state is useless once the window overflowed.
        self.parsers
            .borrow_mut()
            .insert(peer.fd(), RequestParser::new());
        self.respond_and_close(peer, Code::PayloadTooLarge);
    }
}
