//! Key/value access to the cache: `GET`, `PUT` and `DELETE /cache/:key`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use trellis_services::cache::DEFAULT_TTL;

use crate::catalog::HandlerResult;
use crate::context::RequestContext;
use crate::envelope::Reply;
use crate::error::{AppError, FieldError, Validate};

#[derive(Debug, Serialize)]
struct Entry {
    key: String,
    value: Value,
}

/// Body of `PUT /cache/:key`. `ttl` is in seconds; 0 stores without
/// expiry.
#[derive(Debug, Deserialize)]
pub struct PutEntry {
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub ttl: Option<u64>,
}

impl Validate for PutEntry {
    fn validate(&self) -> Vec<FieldError> {
        match self.value {
            Some(_) => vec![],
            None => vec![FieldError::new("value", "\"value\" is required")],
        }
    }
}

fn key(ctx: &RequestContext) -> Result<String, AppError> {
    ctx.param("key")
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::BadRequest("Cache key is required".to_string()))
}

pub async fn get(ctx: RequestContext) -> HandlerResult {
    let cache = ctx.cache()?;
    let key = key(&ctx)?;
    let value: Value = cache
        .get(&key)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Key {key} not found")))?;
    Ok(Reply::ok(Entry { key, value }))
}

pub async fn put(ctx: RequestContext) -> HandlerResult {
    let cache = ctx.cache()?;
    let key = key(&ctx)?;
    let entry: PutEntry = ctx.validated_json()?;
    let ttl = entry.ttl.map(Duration::from_secs).unwrap_or(DEFAULT_TTL);
    let value = entry.value.unwrap_or(Value::Null);
    cache.set(&key, &value, ttl).await?;
    Ok(Reply::ok(serde_json::json!({ "key": key, "ttl": ttl.as_secs() })))
}

pub async fn delete(ctx: RequestContext) -> HandlerResult {
    let cache = ctx.cache()?;
    let key = key(&ctx)?;
    if !cache.delete(&key).await? {
        return Err(AppError::NotFound(format!("Key {key} not found")));
    }
    Ok(Reply::no_content())
}
