use axum::http::{HeaderMap, HeaderValue, Request};
use axum::response::Response;
use std::env;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Adds response-hardening headers to every reply. The service only serves
/// JSON, so the default CSP locks everything down.
#[derive(Clone, Debug)]
pub struct SecurityHeadersLayer {
    enabled: bool,
    hsts_enabled: bool,
}

impl SecurityHeadersLayer {
    pub fn new(enabled: bool, hsts_enabled: bool) -> Self {
        Self {
            enabled,
            hsts_enabled,
        }
    }

    pub fn from_env(env_name: &str) -> Self {
        let env_lower = env_name.trim().to_ascii_lowercase();
        let enabled = parse_bool_env("SECURITY_HEADERS_ENABLED", true);
        let hsts_default = matches!(env_lower.as_str(), "prod" | "production" | "staging");
        let hsts_enabled = parse_bool_env("HSTS_ENABLED", hsts_default);
        Self::new(enabled, hsts_enabled)
    }
}

impl<S> Layer<S> for SecurityHeadersLayer {
    type Service = SecurityHeadersService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SecurityHeadersService {
            inner,
            enabled: self.enabled,
            hsts_enabled: self.hsts_enabled,
        }
    }
}

#[derive(Clone)]
pub struct SecurityHeadersService<S> {
    inner: S,
    enabled: bool,
    hsts_enabled: bool,
}

impl<S, B> Service<Request<B>> for SecurityHeadersService<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let enabled = self.enabled;
        let hsts_enabled = self.hsts_enabled;
        let mut inner = self.inner.clone();
        Box::pin(async move {
            let mut resp = inner.call(req).await?;
            if enabled {
                add_security_headers(resp.headers_mut(), hsts_enabled);
            }
            Ok(resp)
        })
    }
}

fn parse_bool_env(key: &str, default: bool) -> bool {
    let raw = env::var(key).unwrap_or_default();
    let v = raw.trim().to_ascii_lowercase();
    if v.is_empty() {
        return default;
    }
    !matches!(v.as_str(), "0" | "false" | "no" | "off")
}

fn add_security_headers(headers: &mut HeaderMap, hsts_enabled: bool) {
    set_if_absent(headers, "x-content-type-options", "nosniff");
    set_if_absent(headers, "x-frame-options", "DENY");
    set_if_absent(headers, "referrer-policy", "no-referrer");
    set_if_absent(headers, "cache-control", "no-store");
    set_if_absent(
        headers,
        "content-security-policy",
        "default-src 'none'; frame-ancestors 'none'",
    );
    if hsts_enabled {
        set_if_absent(
            headers,
            "strict-transport-security",
            "max-age=31536000; includeSubDomains",
        );
    }
}

fn set_if_absent(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if headers.contains_key(name) {
        return;
    }
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(name, v);
    }
}
