//! Produce the JSON lines that are written as responses.

use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{ErrorKind, InputError, SettlementError};

/// Classify an error coming out of a command.
pub fn error_kind(e: &anyhow::Error) -> ErrorKind {
    if let Some(e) = e.downcast_ref::<SettlementError>() {
        e.kind()
    } else if e.downcast_ref::<InputError>().is_some() {
        ErrorKind::Validation
    } else {
        ErrorKind::Internal
    }
}

pub fn format_success<T: Serialize>(data: &T) -> String {
    json!({ "ok": true, "data": data }).to_string()
}

pub fn format_error(e: &anyhow::Error) -> String {
    let kind = error_kind(e);
    let error: Value = json!({
        "kind": kind,
        "status": kind.status_code(),
        "message": e.to_string(),
    });
    json!({ "ok": false, "error": error }).to_string()
}
