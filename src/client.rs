//! Blocking HTTP client for the daemon's endpoints, used by `gazerctl`.
//!
//! Requests go over a plain `TcpStream` with `Connection: close`; the stream
//! endpoint is read line by line and fed through [`SseParser`].

use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).context("parse response JSON")
    }
}

/// Split a complete `Connection: close` response into status and body.
pub fn parse_response(raw: &[u8]) -> Result<Response> {
    let text = String::from_utf8_lossy(raw);
    let idx = text
        .find("\r\n\r\n")
        .ok_or_else(|| anyhow!("invalid HTTP response: no header terminator"))?;
    let status_line = text.lines().next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| anyhow!("invalid HTTP status line '{status_line}'"))?;
    Ok(Response {
        status,
        body: text[(idx + 4)..].to_string(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental server-sent-events parser. Lines that are not SSE fields
/// (comments, stray framing) are ignored.
#[derive(Debug, Default)]
pub struct SseParser {
    event: Option<String>,
    data: String,
    has_data: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns a frame when the line terminates an event.
    pub fn feed_line(&mut self, line: &str) -> Option<SseFrame> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if !self.has_data {
                self.event = None;
                return None;
            }
            self.has_data = false;
            return Some(SseFrame {
                event: self.event.take(),
                data: std::mem::take(&mut self.data),
            });
        }
        if let Some(value) = field_value(line, "data") {
            if self.has_data {
                self.data.push('\n');
            }
            self.data.push_str(value);
            self.has_data = true;
        } else if let Some(value) = field_value(line, "event") {
            self.event = Some(value.to_string());
        }
        None
    }
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

pub struct GazeClient {
    addr: SocketAddr,
    timeout: Duration,
}

impl GazeClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn connect(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect_timeout(&self.addr, self.timeout)
            .with_context(|| format!("connect to gazerd at {}", self.addr))?;
        Ok(stream)
    }

    fn exchange(&self, request: &[u8]) -> Result<Response> {
        let mut stream = self.connect()?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.write_all(request)?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).context("read HTTP response")?;
        parse_response(&buf)
    }

    pub fn get(&self, path: &str) -> Result<Response> {
        let request = format!(
            "GET {path} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.addr
        );
        self.exchange(request.as_bytes())
    }

    pub fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<Response> {
        let body = body.to_string();
        let request = format!(
            "POST {path} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            self.addr,
            body.len()
        );
        self.exchange(request.as_bytes())
    }

    /// Follow `/stream` until the server closes it or `on_frame` returns false.
    pub fn stream<F>(&self, mut on_frame: F) -> Result<()>
    where
        F: FnMut(SseFrame) -> bool,
    {
        let mut stream = self.connect()?;
        // HTTP/1.0 keeps the body close-delimited instead of chunked.
        let request = format!(
            "GET /stream HTTP/1.0\r\nHost: {}\r\nAccept: text/event-stream\r\n\r\n",
            self.addr
        );
        stream.write_all(request.as_bytes())?;
        let mut reader = BufReader::new(stream);

        let mut line = String::new();
        reader.read_line(&mut line)?;
        let status_line = line.trim_end().to_string();
        if !status_line.split_whitespace().nth(1).is_some_and(|code| code == "200") {
            return Err(anyhow!("stream request rejected: {status_line}"));
        }
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Err(anyhow!("stream closed before headers"));
            }
            if line == "\r\n" || line == "\n" {
                break;
            }
        }

        let mut parser = SseParser::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(());
            }
            if let Some(frame) = parser.feed_line(&line) {
                if !on_frame(frame) {
                    return Ok(());
                }
            }
        }
    }
}
