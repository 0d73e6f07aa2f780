//! Client helper for talking to visitlogd.
//!
//! The daemon is the only writer; every command goes through it. A request is
//! retried once only when the connection itself fails, since by then nothing
//! has been sent.

use chrono::Utc;
use serde_json::Value;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use visitlog_protocol::{Method, Request, Response, MAX_REQUEST_BYTES};

const SOCKET_ENV: &str = "VISITLOG_SOCKET";
const TOKEN_ENV: &str = "VISITLOG_TOKEN";
const SOCKET_NAME: &str = "daemon.sock";
// Above the daemon's default store busy timeout.
const READ_TIMEOUT_MS: u64 = 10_000;
const WRITE_TIMEOUT_MS: u64 = 1_000;
const RETRY_DELAY_MS: u64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Home directory not found")]
    NoHome,

    #[error("Failed to connect to daemon socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Daemon I/O failed: {0}")]
    Io(String),

    #[error("Timed out waiting for daemon response")]
    Timeout,

    #[error("Invalid daemon response: {0}")]
    InvalidResponse(String),

    #[error("{code}: {message}")]
    Daemon {
        code: String,
        message: String,
        retryable: bool,
    },
}

pub fn token(explicit: Option<String>) -> Option<String> {
    explicit
        .or_else(|| env::var(TOKEN_ENV).ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Sends one request and returns its `data` payload.
pub fn call(method: Method, params: Option<Value>, token: Option<String>) -> Result<Value, ClientError> {
    let mut request = Request::new(method, params).with_token(token);
    request.id = Some(make_request_id());

    let response = send_with_retry(&request)?;
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    Err(match response.error {
        Some(err) => ClientError::Daemon {
            code: err.code,
            message: err.message,
            retryable: err.retryable,
        },
        None => ClientError::InvalidResponse("error response without details".to_string()),
    })
}

fn socket_path() -> Result<PathBuf, ClientError> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or(ClientError::NoHome)?;
    Ok(home.join(".visitlog").join(SOCKET_NAME))
}

fn send_with_retry(request: &Request) -> Result<Response, ClientError> {
    match send_request(request) {
        Err(ClientError::Connect { path, source }) => {
            tracing::warn!(error = %source, path = %path.display(), "Daemon connect failed; retrying once");
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            send_request(request)
        }
        other => other,
    }
}

fn send_request(request: &Request) -> Result<Response, ClientError> {
    let socket = socket_path()?;
    let mut stream = UnixStream::connect(&socket).map_err(|source| ClientError::Connect {
        path: socket.clone(),
        source,
    })?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    tracing::debug!(method = ?request.method, id = ?request.id, "Sending daemon request");
    serde_json::to_writer(&mut stream, request)
        .map_err(|err| ClientError::Io(format!("Failed to write request: {}", err)))?;
    stream
        .write_all(b"\n")
        .map_err(|err| ClientError::Io(format!("Failed to flush request: {}", err)))?;
    stream.flush().ok();

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, ClientError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES * 4 {
                    return Err(ClientError::InvalidResponse(
                        "response exceeded maximum size".to_string(),
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ClientError::Timeout);
            }
            Err(err) => return Err(ClientError::Io(format!("Failed to read response: {}", err))),
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err(ClientError::InvalidResponse(
            "daemon response was empty".to_string(),
        ));
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| ClientError::InvalidResponse(err.to_string()))
}

fn make_request_id() -> String {
    format!(
        "cli-{}-{}",
        std::process::id(),
        Utc::now().timestamp_millis()
    )
}
