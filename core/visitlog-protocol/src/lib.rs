//! IPC protocol types and validation for visitlogd.
//!
//! Shared by the daemon and the CLI so both sides agree on the wire shape.
//! The daemon remains the authority on validation; clients can reuse the
//! same types to build requests that will pass it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 256 * 1024;
pub const MAX_ID_LEN: usize = 128;

pub const ERROR_INVALID_JSON: &str = "invalid_json";
pub const ERROR_INVALID_PARAMS: &str = "invalid_params";
pub const ERROR_PROTOCOL_MISMATCH: &str = "protocol_mismatch";
pub const ERROR_REQUEST_TOO_LARGE: &str = "request_too_large";
pub const ERROR_INTERNAL: &str = "internal_error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    RegisterClient,
    StartVisit,
    ViewSession,
    AppendNote,
    QuickAdd,
    EditNote,
    DeleteNote,
    ListNotes,
    ComposeTranscript,
    FinishSession,
    EndSession,
    ResendTranscript,
    ClientHistory,
    ActiveSessions,
    ListCategories,
}

impl Method {
    /// Methods that may be called without a practitioner token.
    pub fn is_public(self) -> bool {
        matches!(self, Method::GetHealth | Method::ListCategories)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    /// Practitioner bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: None,
            token: None,
            params,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    /// Whether re-sending the same request may succeed.
    #[serde(default)]
    pub retryable: bool,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Method parameters
// ─────────────────────────────────────────────────────────────────────────────

pub trait Validate {
    fn validate(&self) -> Result<(), ErrorInfo>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterClientParams {
    pub client_id: String,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
}

impl Validate for RegisterClientParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.client_id, "client_id")?;
        require_text(&self.name, "name")
    }
}

/// `start_visit`, `client_history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientParams {
    pub client_id: String,
}

impl Validate for ClientParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.client_id, "client_id")
    }
}

/// `view_session`, `list_notes`, `compose_transcript`, `end_session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionParams {
    pub session_id: String,
}

impl Validate for SessionParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.session_id, "session_id")
    }
}

// Note content emptiness is the engine's call; it reports validation_error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppendNoteParams {
    pub session_id: String,
    pub content: String,
}

impl Validate for AppendNoteParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.session_id, "session_id")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuickAddParams {
    pub session_id: String,
    pub category_id: String,
    pub phrase_index: usize,
}

impl Validate for QuickAddParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.session_id, "session_id")?;
        require_id(&self.category_id, "category_id")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditNoteParams {
    pub note_id: String,
    pub content: String,
}

impl Validate for EditNoteParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.note_id, "note_id")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoteParams {
    pub note_id: String,
}

impl Validate for NoteParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.note_id, "note_id")
    }
}

/// `finish_session`, `resend_transcript`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranscriptParams {
    pub session_id: String,
    pub text: String,
}

impl Validate for TranscriptParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.session_id, "session_id")
    }
}

pub fn parse_params<T>(params: Option<Value>) -> Result<T, ErrorInfo>
where
    T: DeserializeOwned + Validate,
{
    let params = params.ok_or_else(|| ErrorInfo::new(ERROR_INVALID_PARAMS, "params are required"))?;
    let parsed: T = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            ERROR_INVALID_PARAMS,
            format!("params are invalid: {}", err),
        )
    })?;
    parsed.validate()?;
    Ok(parsed)
}

fn require_id(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    if value.len() > MAX_ID_LEN {
        return Err(ErrorInfo::new(
            ERROR_INVALID_PARAMS,
            format!("{} must be {} characters or fewer", field, MAX_ID_LEN),
        ));
    }
    Ok(())
}

fn require_text(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_request_with_token() {
        let raw = r#"{"protocol_version":1,"method":"start_visit","id":"r1","token":"t","params":{"client_id":"c-1"}}"#;
        let request: Request = serde_json::from_str(raw).expect("request");
        assert_eq!(request.method, Method::StartVisit);
        assert_eq!(request.token.as_deref(), Some("t"));

        let params: ClientParams = parse_params(request.params).expect("params");
        assert_eq!(params.client_id, "c-1");
    }

    #[test]
    fn rejects_unknown_method_and_fields() {
        assert!(serde_json::from_str::<Request>(
            r#"{"protocol_version":1,"method":"drop_tables"}"#
        )
        .is_err());
        assert!(serde_json::from_str::<Request>(
            r#"{"protocol_version":1,"method":"get_health","extra":true}"#
        )
        .is_err());
    }

    #[test]
    fn missing_params_are_rejected() {
        let err = parse_params::<SessionParams>(None).expect_err("params required");
        assert_eq!(err.code, ERROR_INVALID_PARAMS);
    }

    #[test]
    fn blank_ids_are_rejected() {
        let err = parse_params::<SessionParams>(Some(json!({ "session_id": "  " })))
            .expect_err("blank id");
        assert_eq!(err.code, "missing_field");

        let err = parse_params::<NoteParams>(Some(json!({ "note_id": "n".repeat(200) })))
            .expect_err("long id");
        assert_eq!(err.code, ERROR_INVALID_PARAMS);
    }

    #[test]
    fn empty_note_content_passes_through_to_engine() {
        let params: AppendNoteParams =
            parse_params(Some(json!({ "session_id": "s-1", "content": "" }))).expect("params");
        assert!(params.content.is_empty());
    }

    #[test]
    fn register_client_requires_name() {
        let err = parse_params::<RegisterClientParams>(Some(json!({
            "client_id": "c-1",
            "name": ""
        })))
        .expect_err("name required");
        assert_eq!(err.code, "missing_field");
    }

    #[test]
    fn public_methods() {
        assert!(Method::GetHealth.is_public());
        assert!(Method::ListCategories.is_public());
        assert!(!Method::FinishSession.is_public());
    }

    #[test]
    fn error_response_omits_data() {
        let response = Response::error(Some("r1".to_string()), "not_found", "session not found");
        let value = serde_json::to_value(&response).expect("serialize");
        assert_eq!(value["ok"], json!(false));
        assert!(value.get("data").is_none());
        assert_eq!(value["error"]["code"], json!("not_found"));
    }
}
