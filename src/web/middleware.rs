//! Request id and access logging
//!
//! Every request gets an `x-request-id` (the caller's, or a fresh uuid),
//! echoed on the response and included in the access log line.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderMap, HeaderName, HeaderValue, Request},
    response::Response,
};
use futures::future::BoxFuture;
use std::{
    net::SocketAddr,
    task::{Context, Poll},
    time::Instant,
};
use tower::{Layer, Service};
use tracing::{info, info_span, warn, Instrument};

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Client address, preferring proxy headers over the socket peer
/// Priority: X-Real-IP > X-Forwarded-For (first IP) > ConnectInfo
fn client_ip(headers: &HeaderMap, fallback_ip: &str) -> String {
    if let Some(ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return ip.to_string();
    }

    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|ips| ips.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return ip.to_string();
    }

    fallback_ip.to_string()
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

#[derive(Clone, Default)]
pub struct RequestLoggingLayer;

impl RequestLoggingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestLoggingLayer {
    type Service = RequestLoggingMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLoggingMiddleware { inner }
    }
}

#[derive(Clone)]
pub struct RequestLoggingMiddleware<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestLoggingMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let started = Instant::now();
            let method = request.method().clone();
            let path = request.uri().path().to_string();

            let fallback_ip = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let ip = client_ip(request.headers(), &fallback_ip);

            let id = request_id(request.headers());

            // Handler logs carry the request id through this span
            let span = info_span!("request", request_id = %id);
            let mut response = inner.call(request).instrument(span).await?;

            match HeaderValue::from_str(&id) {
                Ok(value) => {
                    response.headers_mut().insert(REQUEST_ID_HEADER, value);
                }
                Err(_) => warn!("Dropping unprintable request id {:?}", id),
            }

            info!(
                request_id = %id,
                "{} {} {} {:?} from {}",
                method,
                path,
                response.status().as_u16(),
                started.elapsed(),
                ip
            );

            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_ip_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        assert_eq!(client_ip(&headers, "127.0.0.1"), "10.0.0.1");

        headers.insert("x-real-ip", HeaderValue::from_static(" 192.168.1.5 "));
        assert_eq!(client_ip(&headers, "127.0.0.1"), "192.168.1.5");

        assert_eq!(client_ip(&HeaderMap::new(), "127.0.0.1"), "127.0.0.1");
    }

    #[test]
    fn request_id_is_reused_or_generated() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc-123"));
        assert_eq!(request_id(&headers), "abc-123");

        let generated = request_id(&HeaderMap::new());
        assert!(uuid::Uuid::parse_str(&generated).is_ok());
    }
}
