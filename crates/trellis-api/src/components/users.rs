//! User CRUD over PostgreSQL.
//!
//! Routes declare `require-database`, so handlers only run when the pool is
//! available.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;

use crate::catalog::HandlerResult;
use crate::context::RequestContext;
use crate::envelope::Reply;
use crate::error::{AppError, FieldError, Validate};

const COLUMNS: &str = "id, name, email, age, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub age: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Body of create and update requests.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserInput {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub age: Option<i64>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

fn is_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.split('.').count() >= 2
        && domain.split('.').all(|part| !part.is_empty())
        && !s.chars().any(char::is_whitespace)
}

impl Validate for UserInput {
    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        match self.email.as_deref() {
            None | Some("") => errors.push(FieldError::new("email", "\"email\" is required")),
            Some(email) if !is_email(email) => {
                errors.push(FieldError::new("email", "\"email\" must be a valid email"))
            }
            Some(_) => {}
        }
        if self.name.as_deref().map_or(true, str::is_empty) {
            errors.push(FieldError::new("name", "\"name\" is required"));
        }
        match self.age {
            Some(age) if age < 0 => errors.push(FieldError::new(
                "age",
                "\"age\" must be greater than or equal to 0",
            )),
            Some(age) if age > i64::from(i32::MAX) => {
                errors.push(FieldError::new("age", "\"age\" is out of range"))
            }
            _ => {}
        }
        for key in self.unknown.keys() {
            errors.push(FieldError::new(key.clone(), format!("\"{key}\" is not allowed")));
        }
        errors
    }
}

/// Fields of a validated input.
struct NewUser {
    name: String,
    email: String,
    age: Option<i32>,
}

impl UserInput {
    fn into_new_user(self) -> NewUser {
        NewUser {
            name: self.name.unwrap_or_default(),
            email: self.email.unwrap_or_default(),
            age: self.age.and_then(|a| i32::try_from(a).ok()),
        }
    }
}

fn not_found() -> AppError {
    AppError::NotFound("User not found".to_string())
}

/// Unique violations are reported against the email column, the only
/// unique column besides the key.
fn write_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::Conflict("Email already exists".to_string())
        }
        sqlx::Error::RowNotFound => not_found(),
        _ => err.into(),
    }
}

pub async fn list_users(pool: &PgPool) -> Result<Vec<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!(
        "SELECT {COLUMNS} FROM users ORDER BY created_at DESC, id DESC"
    ))
    .fetch_all(pool)
    .await
}

pub async fn list(ctx: RequestContext) -> HandlerResult {
    let pool = ctx.database()?;
    let users = list_users(&pool).await?;
    Ok(Reply::ok(users))
}

pub async fn create(ctx: RequestContext) -> HandlerResult {
    let pool = ctx.database()?;
    let input = ctx.validated_json::<UserInput>()?.into_new_user();
    let user = sqlx::query_as::<_, User>(&format!(
        "INSERT INTO users (name, email, age) VALUES ($1, $2, $3) RETURNING {COLUMNS}"
    ))
    .bind(&input.name)
    .bind(&input.email)
    .bind(input.age)
    .fetch_one(&pool)
    .await
    .map_err(write_error)?;

    tracing::info!(namespace = "users", user_id = user.id, "user created");
    Ok(Reply::created(user))
}

pub async fn get(ctx: RequestContext) -> HandlerResult {
    let pool = ctx.database()?;
    let id: i64 = ctx.param_as("id")?;
    let user = sqlx::query_as::<_, User>(&format!("SELECT {COLUMNS} FROM users WHERE id = $1"))
        .bind(id)
        .fetch_optional(&pool)
        .await?
        .ok_or_else(not_found)?;
    Ok(Reply::ok(user))
}

pub async fn update(ctx: RequestContext) -> HandlerResult {
    let pool = ctx.database()?;
    let id: i64 = ctx.param_as("id")?;
    let input = ctx.validated_json::<UserInput>()?.into_new_user();
    let user = sqlx::query_as::<_, User>(&format!(
        "UPDATE users SET name = $1, email = $2, age = $3, updated_at = now() \
         WHERE id = $4 RETURNING {COLUMNS}"
    ))
    .bind(&input.name)
    .bind(&input.email)
    .bind(input.age)
    .bind(id)
    .fetch_one(&pool)
    .await
    .map_err(write_error)?;
    Ok(Reply::ok(user))
}

pub async fn delete(ctx: RequestContext) -> HandlerResult {
    let pool = ctx.database()?;
    let id: i64 = ctx.param_as("id")?;
    let result = sqlx::query("DELETE FROM users WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(not_found());
    }
    Ok(Reply::no_content())
}
