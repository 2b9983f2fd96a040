//! Request capture middleware
//!
//! Wraps every route, times the inner service and hands one
//! [`RequestEvent`] per completed request to the analytics queue. The queue
//! never blocks, so a slow or broken analytics backend cannot delay responses.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderMap, Request},
    response::Response,
};
use chrono::Utc;
use futures::future::BoxFuture;
use std::{
    net::SocketAddr,
    task::{Context, Poll},
    time::Instant,
};
use tower::{Layer, Service};

use crate::analytics::capture::EventCapture;
use crate::events::RequestEvent;

/// Client IP, checking proxy headers first.
/// Priority: X-Forwarded-For (first hop) > X-Real-IP > socket peer
pub fn get_real_ip(headers: &HeaderMap, fallback_ip: &str) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(ips) = forwarded.to_str() {
            if let Some(first_ip) = ips.split(',').next() {
                let ip = first_ip.trim();
                if !ip.is_empty() {
                    return ip.to_string();
                }
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(ip) = real_ip.to_str() {
            let ip = ip.trim();
            if !ip.is_empty() {
                return ip.to_string();
            }
        }
    }

    fallback_ip.to_string()
}

#[derive(Clone)]
pub struct RequestCaptureLayer {
    capture: EventCapture,
}

impl RequestCaptureLayer {
    pub fn new(capture: EventCapture) -> Self {
        Self { capture }
    }
}

impl<S> Layer<S> for RequestCaptureLayer {
    type Service = RequestCapture<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestCapture {
            inner,
            capture: self.capture.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RequestCapture<S> {
    inner: S,
    capture: EventCapture,
}

impl<S> Service<Request<Body>> for RequestCapture<S>
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
        let capture = self.capture.clone();
        // Take the service that was driven to readiness, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let method = request.method().to_string();
        let path = request.uri().path().to_string();
        let user_agent = request
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let fallback_ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_default();
        let ip = get_real_ip(request.headers(), &fallback_ip);

        Box::pin(async move {
            let started_at = Utc::now();
            let started = Instant::now();
            let response = inner.call(request).await?;

            let event = RequestEvent::new(ip, method, path, response.status().as_u16())
                .with_timestamp(started_at)
                .with_latency(started.elapsed())
                .with_user_agent(user_agent);
            capture.capture(event);

            Ok(response)
        })
    }
}
