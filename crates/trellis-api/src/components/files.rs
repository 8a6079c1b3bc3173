//! Object storage: `PUT`, `GET` and `DELETE /files/:name`.
//!
//! Uploads take the raw request body; the declared content type is stored
//! with the object and returned on download.

use crate::catalog::HandlerResult;
use crate::context::{ParsedBody, RequestContext};
use crate::envelope::Reply;
use crate::error::AppError;

const OCTET_STREAM: &str = "application/octet-stream";

fn name(ctx: &RequestContext) -> Result<String, AppError> {
    ctx.param("name")
        .filter(|n| !matches!(*n, "" | "." | "..") && !n.contains(['/', '\\']))
        .map(str::to_string)
        .ok_or_else(|| AppError::BadRequest("Invalid file name".to_string()))
}

/// Request body as bytes plus its content type. JSON and form bodies are
/// re-encoded as JSON.
fn upload(ctx: &RequestContext) -> Result<(Vec<u8>, String), AppError> {
    match ctx.body() {
        ParsedBody::Empty => Err(AppError::BadRequest("File content is required".to_string())),
        ParsedBody::Raw { content_type, bytes } => Ok((
            bytes.to_vec(),
            content_type.clone().unwrap_or_else(|| OCTET_STREAM.to_string()),
        )),
        body => {
            let value = body.as_value().unwrap_or_default();
            let bytes = serde_json::to_vec(&value).map_err(AppError::internal_from)?;
            Ok((bytes, "application/json".to_string()))
        }
    }
}

pub async fn put(ctx: RequestContext) -> HandlerResult {
    let storage = ctx.storage()?;
    let name = name(&ctx)?;
    let (bytes, content_type) = upload(&ctx)?;
    let info = storage.put_object(&name, bytes, &content_type).await?;
    Ok(Reply::created(info))
}

pub async fn get(ctx: RequestContext) -> HandlerResult {
    let storage = ctx.storage()?;
    let name = name(&ctx)?;
    let object = storage
        .get_object(&name)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("File {name} not found")))?;
    Ok(Reply::file(name, object.content_type, object.bytes))
}

pub async fn delete(ctx: RequestContext) -> HandlerResult {
    let storage = ctx.storage()?;
    let name = name(&ctx)?;
    storage.remove_object(&name).await?;
    Ok(Reply::no_content())
}
