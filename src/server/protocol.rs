//! Line-delimited JSON-RPC 2.0 framing.
//!
//! Each inbound line is one request `{"id", "method", "params"}`. Each
//! outbound line is either a response to exactly one request or an
//! asynchronous [`JobEvent`]. Only the writer thread touches the output
//! stream, so lines never interleave.

use std::io::Write;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::cache::CacheError;
use crate::jobs::{EventSink, JobError, JobEvent};
use crate::resources::ResourceError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Error codes. The standard JSON-RPC range plus engine-specific ones.
pub struct ErrorCode;

impl ErrorCode {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub const JOB_NOT_FOUND: i32 = -31001;

    pub const MODEL_NOT_FOUND: i32 = -30001;
    pub const MODEL_LOAD_FAILED: i32 = -30002;
    pub const INSUFFICIENT_MEMORY: i32 = -30003;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::PARSE_ERROR, format!("Parse error: {detail}"))
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::INVALID_REQUEST, detail)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(ErrorCode::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, format!("Invalid params: {detail}"))
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, format!("Internal error: {detail}"))
    }
}

impl From<JobError> for RpcError {
    fn from(err: JobError) -> Self {
        match &err {
            JobError::UnknownJobType(job_type) => RpcError::new(ErrorCode::INVALID_PARAMS, err.to_string())
                .with_data(json!({ "jobType": job_type })),
            JobError::NotFound(job_id) => {
                RpcError::new(ErrorCode::JOB_NOT_FOUND, err.to_string()).with_data(json!({ "jobId": job_id }))
            }
            JobError::ShuttingDown => RpcError::new(ErrorCode::INTERNAL_ERROR, err.to_string()),
        }
    }
}

impl From<ResourceError> for RpcError {
    fn from(err: ResourceError) -> Self {
        match &err {
            ResourceError::Unknown(id) => {
                RpcError::new(ErrorCode::MODEL_NOT_FOUND, err.to_string()).with_data(json!({ "modelId": id }))
            }
            ResourceError::BudgetExceeded {
                used,
                required,
                max,
                suggest_unload,
                ..
            } => RpcError::new(ErrorCode::INSUFFICIENT_MEMORY, err.to_string()).with_data(json!({
                "used": used,
                "required": required,
                "max": max,
                "suggestUnload": suggest_unload,
            })),
            ResourceError::LoadFailed { .. }
            | ResourceError::UnloadFailed { .. }
            | ResourceError::AlreadyLoaded(_) => RpcError::new(ErrorCode::MODEL_LOAD_FAILED, err.to_string()),
        }
    }
}

impl From<CacheError> for RpcError {
    fn from(err: CacheError) -> Self {
        RpcError::internal(err)
    }
}

/// Raw inbound request after framing checks.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Value,
    pub method: String,
    pub params: Value,
}

/// Parse one inbound line.
///
/// On failure returns the id to answer with (null when it could not be
/// recovered) alongside the error.
pub fn parse_request(line: &str) -> Result<Request, (Value, RpcError)> {
    let value: Value = serde_json::from_str(line).map_err(|e| (Value::Null, RpcError::parse_error(e)))?;

    let Value::Object(mut object) = value else {
        return Err((
            Value::Null,
            RpcError::invalid_request("Invalid Request: expected a JSON object"),
        ));
    };

    let id = object.remove("id").unwrap_or(Value::Null);
    let method = match object.remove("method") {
        Some(Value::String(method)) => method,
        Some(_) => {
            return Err((id, RpcError::invalid_request("Invalid Request: method must be a string")));
        }
        None => return Err((id, RpcError::invalid_request("Invalid Request: missing method"))),
    };
    let params = object.remove("params").unwrap_or(Value::Null);

    Ok(Request { id, method, params })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// One outbound line.
#[derive(Debug, Clone)]
pub enum Outbound {
    Response(Response),
    Event(JobEvent),
    /// Stop the writer once everything queued ahead of it is written.
    Close,
}

impl Outbound {
    fn encode(&self) -> Option<serde_json::Result<String>> {
        match self {
            Outbound::Response(response) => Some(serde_json::to_string(response)),
            Outbound::Event(event) => Some(serde_json::to_string(event)),
            Outbound::Close => None,
        }
    }
}

impl EventSink for Sender<Outbound> {
    fn emit(&self, event: JobEvent) {
        if self.send(Outbound::Event(event)).is_err() {
            debug!("Output channel closed; dropping event");
        }
    }
}

/// Spawn the single writer thread. It exits on [`Outbound::Close`] or once
/// every sender is dropped.
pub fn spawn_writer<W>(rx: Receiver<Outbound>, mut out: W) -> std::io::Result<JoinHandle<()>>
where
    W: Write + Send + 'static,
{
    thread::Builder::new()
        .name("ai-engine-writer".to_string())
        .spawn(move || {
            for message in rx {
                let line = match message.encode() {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        warn!(error = %e, "Failed to encode outbound message");
                        continue;
                    }
                };
                if let Err(e) = writeln!(out, "{line}").and_then(|_| out.flush()) {
                    warn!(error = %e, "Output stream closed");
                    break;
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_parse_valid_request() {
        let req = parse_request(r#"{"jsonrpc":"2.0","id":7,"method":"jobs.list"}"#).unwrap();
        assert_eq!(req.id, json!(7));
        assert_eq!(req.method, "jobs.list");
        assert!(req.params.is_null());
    }

    #[test]
    fn test_parse_error_has_null_id() {
        let (id, err) = parse_request("{nope").unwrap_err();
        assert!(id.is_null());
        assert_eq!(err.code, ErrorCode::PARSE_ERROR);
    }

    #[test]
    fn test_invalid_request_keeps_id() {
        let (id, err) = parse_request(r#"{"id":"abc","method":42}"#).unwrap_err();
        assert_eq!(id, json!("abc"));
        assert_eq!(err.code, ErrorCode::INVALID_REQUEST);

        let (id, err) = parse_request("[1,2,3]").unwrap_err();
        assert!(id.is_null());
        assert_eq!(err.code, ErrorCode::INVALID_REQUEST);
    }

    #[test]
    fn test_response_shape() {
        let ok = serde_json::to_value(Response::success(json!(1), json!({"a": 1}))).unwrap();
        assert_eq!(ok, json!({"jsonrpc": "2.0", "id": 1, "result": {"a": 1}}));

        let err = Response::failure(json!(2), RpcError::method_not_found("nope"));
        let err = serde_json::to_value(err).unwrap();
        assert_eq!(err["error"]["code"], -32601);
        assert!(err.get("result").is_none());
        assert!(err["error"].get("data").is_none());
    }

    #[test]
    fn test_budget_error_carries_detail() {
        let err: RpcError = ResourceError::BudgetExceeded {
            id: "whisper-medium".into(),
            used: 5,
            required: 3,
            max: 6,
            suggest_unload: vec!["easyocr-en".into()],
        }
        .into();
        assert_eq!(err.code, ErrorCode::INSUFFICIENT_MEMORY);
        let data = err.data.unwrap();
        assert_eq!(data["used"], 5);
        assert_eq!(data["suggestUnload"], json!(["easyocr-en"]));
    }

    #[test]
    fn test_writer_emits_one_line_per_message() {
        let buf = SharedBuf::default();
        let (tx, rx) = crossbeam_channel::unbounded();
        let writer = spawn_writer(rx, buf.clone()).unwrap();

        tx.send(Outbound::Response(Response::success(json!(1), json!(true))))
            .unwrap();
        tx.emit(JobEvent::cancelled("j1"));
        tx.send(Outbound::Close).unwrap();
        tx.send(Outbound::Response(Response::success(json!(2), json!(false))))
            .unwrap();
        writer.join().unwrap();

        let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let event: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(event["type"], "cancelled");
        assert_eq!(event["jobId"], "j1");
    }
}
