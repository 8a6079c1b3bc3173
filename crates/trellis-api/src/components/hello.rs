//! `GET /` and `POST /echo`.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use trellis_core::RunMode;

use crate::catalog::HandlerResult;
use crate::context::RequestContext;
use crate::envelope::Reply;
use crate::error::AppError;

pub const WELCOME: &str = "Hello World! Welcome to your new Trellis API.";

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Serialize)]
struct Welcome {
    message: &'static str,
    timestamp: String,
    env: &'static str,
}

pub async fn index(_ctx: RequestContext, mode: RunMode) -> HandlerResult {
    Ok(Reply::ok(Welcome {
        message: WELCOME,
        timestamp: now(),
        env: mode.as_str(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Echo {
    original_message: Value,
    timestamp: String,
}

/// Null, `false`, zero and the empty string all count as absent.
fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

pub async fn echo(ctx: RequestContext) -> HandlerResult {
    let message = ctx
        .body()
        .as_value()
        .and_then(|body| body.get("message").cloned())
        .filter(|m| !is_blank(m))
        .ok_or_else(|| AppError::BadRequest("Message is required".to_string()))?;

    Ok(Reply::ok(Echo {
        original_message: message,
        timestamp: now(),
    }))
}
