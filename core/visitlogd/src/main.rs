//! visitlogd entrypoint.
//!
//! A single-writer service that owns the visit store. Clients speak one JSON
//! request per connection over a Unix socket; the daemon validates it, scopes
//! it to the practitioner behind the request token, and runs it through the
//! engine.

use fs_err as fs;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use visitlog_core::{ClientId, NoteId, Session, SessionId, VisitError, VisitlogConfig};
use visitlog_protocol::{
    parse_params, AppendNoteParams, ClientParams, EditNoteParams, ErrorInfo, Method, NoteParams,
    QuickAddParams, RegisterClientParams, Request, Response, SessionParams, TranscriptParams,
    Validate, ERROR_INTERNAL, ERROR_INVALID_JSON, ERROR_PROTOCOL_MISMATCH,
    ERROR_REQUEST_TOO_LARGE, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

mod state;

use state::SharedState;

const SOCKET_NAME: &str = "daemon.sock";
const SOCKET_ENV: &str = "VISITLOG_SOCKET";
const DEBUG_LOG_ENV: &str = "VISITLOG_DEBUG_LOG";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

fn main() {
    init_logging();

    let config = match visitlog_core::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load visitlog config; using defaults");
            VisitlogConfig::default()
        }
    };

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let shared_state = match SharedState::from_config(&config) {
        Ok(state) => Arc::new(state),
        Err(err) => {
            error!(error = %err, "Failed to initialize visit store");
            std::process::exit(1);
        }
    };

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(
        path = %socket_path.display(),
        practitioners = config.practitioners.len(),
        categories = shared_state.engine().categories().len(),
        "visitlogd started"
    );

    if let Err(err) = shared_state.run_sweep("startup") {
        warn!(error = %err, "Startup stale-session sweep failed");
    }
    spawn_stale_session_sweeper(Arc::clone(&shared_state));

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                thread::spawn(move || handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn spawn_stale_session_sweeper(state: Arc<SharedState>) {
    let Some(interval) = state.sweep_interval() else {
        info!("Periodic stale-session sweep disabled");
        return;
    };
    thread::spawn(move || loop {
        thread::sleep(interval);
        if let Err(err) = state.run_sweep("periodic") {
            warn!(error = %err, "Periodic stale-session sweep failed");
        }
    });
}

fn init_logging() {
    let debug_enabled = env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    if let Some(path) = env::var_os(SOCKET_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".visitlog").join(SOCKET_NAME))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: Arc<SharedState>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, &state);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        ERROR_REQUEST_TOO_LARGE,
                        "request exceeded maximum size",
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
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            ERROR_INVALID_JSON,
            format!("request was not valid JSON: {}", err),
        )
    })
}

#[derive(Serialize)]
struct StartVisitData {
    session: Session,
    resumed: bool,
    expired: Option<Session>,
}

fn handle_request(request: Request, state: &SharedState) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            ERROR_PROTOCOL_MISMATCH,
            "unsupported protocol version",
        );
    }

    let Request {
        method,
        id,
        token,
        params,
        ..
    } = request;
    if !method.is_public() && token.is_none() {
        return Response::error_with_info(id, error_info(&VisitError::Unauthenticated));
    }
    let identity = state.identify(token.as_deref());
    let engine = state.engine();

    match method {
        Method::GetHealth => Response::ok(
            id,
            json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "active_index_entries": engine.index_len(),
                "sweep_interval_secs": state.sweep_interval().map(|interval| interval.as_secs()),
                "sweep": state.sweep_snapshot(),
            }),
        ),
        Method::ListCategories => respond(id, Ok(engine.categories())),
        Method::RegisterClient => with_params(id, params, |p: RegisterClientParams| {
            state.register_client(&identity, ClientId::new(p.client_id), &p.name, p.phone)
        }),
        Method::StartVisit => with_params(id, params, |p: ClientParams| {
            let resolution = engine.start_visit(&identity, &ClientId::new(p.client_id))?;
            let resumed = resolution.was_resumed();
            let (session, expired) = match resolution {
                visitlog_core::Resolution::Resumed(session) => (session, None),
                visitlog_core::Resolution::Created { session, expired } => (session, expired),
            };
            Ok(StartVisitData {
                session,
                resumed,
                expired,
            })
        }),
        Method::ViewSession => with_params(id, params, |p: SessionParams| {
            engine.view_session(&identity, &SessionId::new(p.session_id))
        }),
        Method::AppendNote => with_params(id, params, |p: AppendNoteParams| {
            engine.append_note(&identity, &SessionId::new(p.session_id), &p.content)
        }),
        Method::QuickAdd => with_params(id, params, |p: QuickAddParams| {
            engine.quick_add(
                &identity,
                &SessionId::new(p.session_id),
                &p.category_id,
                p.phrase_index,
            )
        }),
        Method::EditNote => with_params(id, params, |p: EditNoteParams| {
            engine.edit_note(&identity, &NoteId::new(p.note_id), &p.content)
        }),
        Method::DeleteNote => with_params(id, params, |p: NoteParams| {
            engine
                .delete_note(&identity, &NoteId::new(p.note_id))
                .map(|()| json!({ "deleted": true }))
        }),
        Method::ListNotes => with_params(id, params, |p: SessionParams| {
            engine.list_notes(&identity, &SessionId::new(p.session_id))
        }),
        Method::ComposeTranscript => with_params(id, params, |p: SessionParams| {
            engine
                .compose_transcript(&identity, &SessionId::new(p.session_id))
                .map(|text| json!({ "text": text }))
        }),
        Method::FinishSession => with_params(id, params, |p: TranscriptParams| {
            engine.finish(&identity, &SessionId::new(p.session_id), &p.text)
        }),
        Method::EndSession => with_params(id, params, |p: SessionParams| {
            engine.end_session(&identity, &SessionId::new(p.session_id))
        }),
        Method::ResendTranscript => with_params(id, params, |p: TranscriptParams| {
            engine.resend(&identity, &SessionId::new(p.session_id), &p.text)
        }),
        Method::ClientHistory => with_params(id, params, |p: ClientParams| {
            engine.client_history(&identity, &ClientId::new(p.client_id))
        }),
        Method::ActiveSessions => respond(id, engine.active_sessions(&identity)),
    }
}

fn with_params<P, T, F>(id: Option<String>, params: Option<Value>, op: F) -> Response
where
    P: DeserializeOwned + Validate,
    T: Serialize,
    F: FnOnce(P) -> visitlog_core::Result<T>,
{
    match parse_params::<P>(params) {
        Ok(parsed) => respond(id, op(parsed)),
        Err(err) => Response::error_with_info(id, err),
    }
}

fn respond<T: Serialize>(id: Option<String>, result: visitlog_core::Result<T>) -> Response {
    match result {
        Ok(data) => match serde_json::to_value(data) {
            Ok(value) => Response::ok(id, value),
            Err(err) => Response::error(
                id,
                ERROR_INTERNAL,
                format!("Failed to serialize response: {}", err),
            ),
        },
        Err(err) => {
            log_error(&err);
            Response::error_with_info(id, error_info(&err))
        }
    }
}

fn error_info(err: &VisitError) -> ErrorInfo {
    ErrorInfo::new(err.code(), err.to_string()).retryable(err.is_retryable())
}

fn log_error(err: &VisitError) {
    match err {
        VisitError::StoreUnavailable(_) | VisitError::HandOffFailed { .. } | VisitError::Io { .. } => {
            warn!(code = err.code(), error = %err, "Request failed");
        }
        _ => tracing::debug!(code = err.code(), error = %err, "Request rejected"),
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use visitlog_core::identity::PractitionerCredential;

    fn state(dir: &Path) -> SharedState {
        let mut config = VisitlogConfig::default();
        config.store.path = Some(dir.join("visitlog.db"));
        config.outbox.path = Some(dir.join("outbox.jsonl"));
        config.practitioners = vec![PractitionerCredential {
            id: "doula-1".to_string(),
            token: "secret".to_string(),
        }];
        SharedState::from_config(&config).expect("state")
    }

    fn call(state: &SharedState, method: Method, token: Option<&str>, params: Value) -> Response {
        let request = Request::new(method, Some(params)).with_token(token.map(str::to_string));
        handle_request(request, state)
    }

    fn error_code(response: &Response) -> &str {
        response
            .error
            .as_ref()
            .map(|err| err.code.as_str())
            .unwrap_or("none")
    }

    #[test]
    fn rejects_protocol_mismatch() {
        let dir = tempfile::tempdir().expect("temp dir");
        let state = state(dir.path());
        let mut request = Request::new(Method::GetHealth, None);
        request.protocol_version = 99;
        let response = handle_request(request, &state);
        assert!(!response.ok);
        assert_eq!(error_code(&response), ERROR_PROTOCOL_MISMATCH);
    }

    #[test]
    fn missing_token_is_unauthenticated() {
        let dir = tempfile::tempdir().expect("temp dir");
        let state = state(dir.path());
        let response = call(&state, Method::StartVisit, None, json!({ "client_id": "c-1" }));
        assert_eq!(error_code(&response), "unauthenticated");

        let response = call(&state, Method::ActiveSessions, Some("wrong"), json!({}));
        assert_eq!(error_code(&response), "unauthenticated");
    }

    #[test]
    fn categories_are_public() {
        let dir = tempfile::tempdir().expect("temp dir");
        let state = state(dir.path());
        let response = handle_request(Request::new(Method::ListCategories, None), &state);
        assert!(response.ok);
        assert!(response.data.unwrap().as_array().unwrap().len() >= 4);
    }

    #[test]
    fn engine_errors_map_to_wire_codes() {
        let dir = tempfile::tempdir().expect("temp dir");
        let state = state(dir.path());

        let response = call(
            &state,
            Method::StartVisit,
            Some("secret"),
            json!({ "client_id": "unknown" }),
        );
        assert_eq!(error_code(&response), "not_found");

        call(
            &state,
            Method::RegisterClient,
            Some("secret"),
            json!({ "client_id": "c-1", "name": "Ada" }),
        );
        let started = call(
            &state,
            Method::StartVisit,
            Some("secret"),
            json!({ "client_id": "c-1" }),
        );
        assert!(started.ok);
        let session_id = started.data.unwrap()["session"]["id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = call(
            &state,
            Method::AppendNote,
            Some("secret"),
            json!({ "session_id": session_id, "content": "   " }),
        );
        assert_eq!(error_code(&response), "validation_error");

        // No phone on file.
        let response = call(
            &state,
            Method::FinishSession,
            Some("secret"),
            json!({ "session_id": session_id, "text": "Hi Ada" }),
        );
        assert_eq!(error_code(&response), "validation_error");
    }

    #[test]
    fn invalid_params_are_rejected_before_engine() {
        let dir = tempfile::tempdir().expect("temp dir");
        let state = state(dir.path());
        let response = call(&state, Method::ViewSession, Some("secret"), json!({ "nope": 1 }));
        assert_eq!(error_code(&response), "invalid_params");
    }
}
