//! HTTP Basic Auth backed by an external Calibre-Web user database.
//!
//! The credential store belongs to the library manager, not to this service:
//! we open it read-only and verify Werkzeug-style password hashes
//! (`pbkdf2:sha256:<iterations>$<salt>$<hex digest>`). When no database is
//! configured, authentication is disabled entirely.

use std::path::Path;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use http::StatusCode;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use subtle::ConstantTimeEq;

use crate::api::AppState;

pub struct Authenticator {
    pool: Option<SqlitePool>,
}

impl Authenticator {
    /// Opens the credential database read-only, or builds a pass-through
    /// authenticator when no path is configured.
    pub async fn connect(db_path: Option<&Path>) -> color_eyre::Result<Self> {
        let Some(path) = db_path else {
            return Ok(Self { pool: None });
        };

        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .immutable(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        tracing::info!("authenticating against {}", path.display());
        Ok(Self { pool: Some(pool) })
    }

    pub fn is_disabled(&self) -> bool {
        self.pool.is_none()
    }

    /// Checks a username/password pair against the user table. Always true
    /// when no database is configured.
    pub async fn authenticate(&self, username: &str, password: &str) -> color_eyre::Result<bool> {
        let Some(pool) = &self.pool else {
            return Ok(true);
        };

        let row: Option<(String,)> = sqlx::query_as("SELECT password FROM user WHERE name = ?")
            .bind(username)
            .fetch_optional(pool)
            .await?;

        match row {
            Some((hash,)) => Ok(verify_werkzeug_hash(&hash, password)),
            None => Ok(false),
        }
    }
}

/// Verifies a Werkzeug `pbkdf2:sha256:<iterations>$<salt>$<hex>` hash.
///
/// The salt is the raw ASCII string Werkzeug generated; the digest is
/// lowercase hex. Anything malformed fails closed.
fn verify_werkzeug_hash(stored: &str, password: &str) -> bool {
    let Some(rest) = stored.strip_prefix("pbkdf2:sha256:") else {
        return false;
    };
    let mut parts = rest.splitn(3, '$');
    let (Some(iterations), Some(salt), Some(digest)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let Ok(iterations) = iterations.parse::<u32>() else {
        return false;
    };
    if iterations == 0 || digest.is_empty() || digest.len() % 2 != 0 {
        return false;
    }

    let mut derived = vec![0u8; digest.len() / 2];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt.as_bytes(), iterations, &mut derived);

    let derived_hex: String = derived.iter().map(|b| format!("{b:02x}")).collect();
    derived_hex
        .as_bytes()
        .ct_eq(digest.to_lowercase().as_bytes())
        .into()
}

/// Basic Auth middleware for the API routes.
pub async fn basic_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if state.auth.is_disabled() {
        return Ok(next.run(req).await);
    }

    let auth_header = match req
        .headers()
        .get("Authorization")
        .and_then(|val| val.to_str().ok())
    {
        Some(header) => header,
        None => return unauthorized_response(),
    };

    if !auth_header.starts_with("Basic ") {
        return unauthorized_response();
    }

    let credentials_b64 = auth_header.trim_start_matches("Basic ").trim();
    let decoded = match BASE64.decode(credentials_b64) {
        Ok(decoded) => decoded,
        Err(_) => return unauthorized_response(),
    };

    let decoded_str = match String::from_utf8(decoded) {
        Ok(str) => str,
        Err(_) => return unauthorized_response(),
    };

    let mut parts = decoded_str.splitn(2, ':');
    let (username, password) = match (parts.next(), parts.next()) {
        (Some(u), Some(p)) => (u, p),
        _ => return unauthorized_response(),
    };

    match state.auth.authenticate(username, password).await {
        Ok(true) => Ok(next.run(req).await),
        Ok(false) => {
            tracing::warn!("authentication failed for user {}", username);
            unauthorized_response()
        }
        Err(e) => {
            tracing::error!("authentication error for user {}: {}", username, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn unauthorized_response() -> Result<Response, StatusCode> {
    let mut response = (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    response.headers_mut().insert(
        http::header::WWW_AUTHENTICATE,
        http::header::HeaderValue::from_static("Basic"),
    );
    Ok(response)
}
