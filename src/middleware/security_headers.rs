//! Security headers for the JSON-RPC API surface. This gateway serves no
//! HTML and renders nothing in a browser, so there is no CSP/clickjacking
//! surface to defend — only the headers a machine-client API actually
//! needs: MIME-sniffing protection, HSTS, referrer trimming, and removal
//! of the server-fingerprinting `X-Powered-By` header.

use axum::{
    extract::Request,
    http::{header, HeaderValue},
    middleware::Next,
    response::Response,
};

pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));

    // No framing surface to defend (no HTML), but a stray browser request
    // to a JSON endpoint still shouldn't be frameable.
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));

    // Forces HTTPS for a year on any client that does speak HTTP headers.
    // IMPORTANT: only meaningful when this gateway is reached over HTTPS.
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );

    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("no-referrer"));

    headers.remove("x-powered-by");

    response
}
