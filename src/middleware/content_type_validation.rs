//! Content-Type validation for the JSON-RPC surface (spec.md §6: "a request
//! whose body is not `application/json` is rejected with HTTP 415").
//!
//! Unlike the teacher's version, there are no multipart/upload endpoints
//! here — everything is JSON-RPC over a single content type — and a missing
//! header is treated the same as a wrong one, both yielding 415 rather than
//! a 400/415 split.

use axum::{
    extract::Request,
    http::{header, Method, StatusCode},
    middleware::Next,
    response::Response,
};

pub async fn content_type_validation_middleware(
    request: Request,
    next: Next,
) -> Result<Response, (StatusCode, String)> {
    let method = request.method();

    if matches!(method, &Method::GET | &Method::HEAD | &Method::OPTIONS | &Method::DELETE) {
        return Ok(next.run(request).await);
    }

    let content_type = request.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok());

    match content_type {
        Some(ct) if is_json(ct) => Ok(next.run(request).await),
        other => {
            tracing::warn!(
                method = %method,
                path = %request.uri().path(),
                content_type = ?other,
                "rejecting request with invalid Content-Type"
            );
            Err((
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "Content-Type must be application/json".to_string(),
            ))
        }
    }
}

fn is_json(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .eq_ignore_ascii_case("application/json")
}
