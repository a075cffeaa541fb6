//! Request correlation ID: reuses a client-supplied `X-Request-ID` if it's
//! a valid UUID, otherwise generates one, and echoes it on the response so
//! a caller can tie a JSON-RPC error back to the log line that produced it.

use axum::{extract::Request, http::header, middleware::Next, response::Response};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);

    request.extensions_mut().insert(request_id);

    tracing::info!(request_id = %request_id, method = %request.method(), uri = %request.uri(), "incoming request");

    let mut response = next.run(request).await;

    response.headers_mut().insert(
        header::HeaderName::from_static(REQUEST_ID_HEADER),
        request_id.to_string().parse().unwrap(),
    );

    tracing::info!(request_id = %request_id, status = %response.status(), "outgoing response");

    response
}

pub fn get_request_id(extensions: &axum::http::Extensions) -> Option<Uuid> {
    extensions.get::<Uuid>().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request as HttpRequest, routing::get, Router};
    use tower::ServiceExt;

    async fn test_handler() -> &'static str {
        "OK"
    }

    #[tokio::test]
    async fn generates_request_id_when_absent() {
        let app = Router::new()
            .route("/", get(test_handler))
            .layer(axum::middleware::from_fn(request_id_middleware));

        let response =
            app.oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap()).await.unwrap();

        let request_id = response.headers().get(REQUEST_ID_HEADER).unwrap();
        assert!(Uuid::parse_str(request_id.to_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn preserves_client_supplied_request_id() {
        let app = Router::new()
            .route("/", get(test_handler))
            .layer(axum::middleware::from_fn(request_id_middleware));

        let client_request_id = Uuid::new_v4();
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .header(REQUEST_ID_HEADER, client_request_id.to_string())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response_request_id = response.headers().get(REQUEST_ID_HEADER).unwrap();
        assert_eq!(response_request_id.to_str().unwrap(), client_request_id.to_string());
    }

    #[tokio::test]
    async fn replaces_invalid_client_request_id() {
        let app = Router::new()
            .route("/", get(test_handler))
            .layer(axum::middleware::from_fn(request_id_middleware));

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .header(REQUEST_ID_HEADER, "invalid-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let request_id = response.headers().get(REQUEST_ID_HEADER).unwrap();
        assert!(Uuid::parse_str(request_id.to_str().unwrap()).is_ok());
    }
}
