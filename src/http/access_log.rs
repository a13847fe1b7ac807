//! Access log middleware.
//!
//! Emits one event per request on the `http_access` target, which the
//! logging subsystem routes to the `http` sink.

use std::time::Instant;

use axum::{
    extract::Request,
    http::{header, header::AsHeaderName, HeaderMap},
    middleware::Next,
    response::Response,
};

use crate::observability::ACCESS_LOG_TARGET;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";
const X_REQUEST_ID: &str = "x-request-id";

fn header_str<K: AsHeaderName>(headers: &HeaderMap, name: K) -> &str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

pub async fn access_log(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let headers = request.headers();
    let host = header_str(headers, header::HOST).to_string();
    let user_agent = header_str(headers, header::USER_AGENT).to_string();
    let referer = header_str(headers, header::REFERER).to_string();
    let forwarded_for = header_str(headers, X_FORWARDED_FOR).to_string();
    let real_ip = header_str(headers, X_REAL_IP).to_string();
    let request_id = header_str(headers, X_REQUEST_ID).to_string();

    let response = next.run(request).await;

    tracing::info!(
        target: ACCESS_LOG_TARGET,
        method = %method,
        host = %host,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_secs_f64() * 1000.0,
        user_agent = %user_agent,
        referer = %referer,
        forwarded_for = %forwarded_for,
        real_ip = %real_ip,
        request_id = %request_id,
        "request"
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn missing_headers_read_as_empty() {
        let mut headers = HeaderMap::new();
        headers.insert(X_REAL_IP, HeaderValue::from_static("10.0.0.1"));
        assert_eq!(header_str(&headers, X_REAL_IP), "10.0.0.1");
        assert_eq!(header_str(&headers, header::REFERER), "");
    }

    #[tokio::test]
    async fn passes_response_through() {
        use axum::{body::Body, http::StatusCode, middleware, routing::get, Router};
        use tower::ServiceExt;

        let app = Router::new()
            .route("/teapot", get(|| async { StatusCode::IM_A_TEAPOT }))
            .layer(middleware::from_fn(access_log));
        let request = Request::builder()
            .uri("/teapot")
            .header(header::USER_AGENT, "curl/8")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    }
}
