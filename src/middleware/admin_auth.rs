//! Admin bootstrap-key gate, replacing the teacher's JWT-role-based
//! `admin_middleware`/`superadmin_middleware` (spec.md §6 "CLI surface").
//!
//! The gateway has no user accounts to hold roles — admin surfaces (key
//! CRUD, credit adjustment) are instead gated by a single bootstrap key
//! configured out of band, compared in constant time to resist timing
//! side-channels on the comparison itself.

use crate::transport::AppState;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

pub async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .or_else(|| request.headers().get("x-admin-key").and_then(|v| v.to_str().ok()));

    let Some(provided) = provided else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    if !keys_match(provided, &state.admin_bootstrap_key) {
        tracing::warn!("admin auth rejected: bootstrap key mismatch");
        return Err(StatusCode::FORBIDDEN);
    }

    Ok(next.run(request).await)
}

fn keys_match(provided: &str, expected: &str) -> bool {
    provided.len() == expected.len() && provided.as_bytes().ct_eq(expected.as_bytes()).into()
}
