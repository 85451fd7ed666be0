use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc};
use tracing::{info, warn};

const KEY_HEADER: &str = "X-Engine-Key";

#[derive(Clone)]
pub struct AuthState {
    keys: Arc<HashMap<String, Operator>>,
}

/// Who issued a control request; attached to the request extensions.
#[derive(Clone, Debug)]
pub struct Operator {
    pub name: String,
    pub key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env::var("CONTROL_API_KEYS").unwrap_or_default();
        Self::parse(&raw)
    }

    /// Parses `name:key` pairs, comma separated. A bare `key` gets the name
    /// `operator`. With no usable entries every protected route answers 401.
    pub fn parse(raw: &str) -> Self {
        let mut keys = HashMap::new();
        for (idx, token) in raw.split(',').enumerate() {
            let trimmed = token.trim();
            if trimmed.is_empty() {
                continue;
            }
            let (name, secret) = match trimmed.split_once(':') {
                Some((name, secret)) => (name.trim(), secret.trim()),
                None => ("operator", trimmed),
            };
            if name.is_empty() || secret.is_empty() {
                warn!(
                    target = "crosslist.api",
                    "ignored malformed CONTROL_API_KEYS entry #{}",
                    idx + 1
                );
                continue;
            }
            keys.insert(
                secret.to_string(),
                Operator {
                    name: name.to_string(),
                    key_id: format!("key-{:02}", idx + 1),
                },
            );
        }

        if keys.is_empty() {
            warn!(
                target = "crosslist.api",
                "CONTROL_API_KEYS produced no keys; control routes will reject every request"
            );
        } else {
            info!(
                target = "crosslist.api",
                key_count = keys.len(),
                "loaded control API keys"
            );
        }
        Self {
            keys: Arc::new(keys),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<Operator> {
        self.keys.get(presented).cloned()
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized(
            "missing_api_key",
            "Provide X-Engine-Key or Bearer token",
        ));
    };
    let Some(operator) = state.authenticate(&presented) else {
        return Ok(unauthorized("invalid_api_key", "Key not recognized"));
    };
    request.extensions_mut().insert(operator);
    Ok(next.run(request).await)
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get(KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}
