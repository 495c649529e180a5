//! Per-client request throttling for the operator surface.
//!
//! Clients are keyed by their declared agent identity (`x-agent-id`) when
//! present, falling back to the originating IP. Quotas come from
//! configuration: one default quota plus optional per-agent overrides.
//! Excluded paths (health probes, metrics scrapes) bypass throttling.

use crate::config::RateLimitSettings;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock,
    state::{keyed::DefaultKeyedStateStore, InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{collections::HashMap, net::SocketAddr, num::NonZeroU32, sync::Arc, time::Duration};
use tracing::warn;

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct ApiRateLimiter {
    default: KeyedLimiter,
    per_agent: HashMap<String, DirectLimiter>,
    excluded_paths: Vec<String>,
}

impl ApiRateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        let default = RateLimiter::keyed(quota(settings.window_ms, settings.default_per_min));
        let per_agent = settings
            .per_agent
            .iter()
            .map(|(agent, per_min)| {
                (
                    agent.clone(),
                    RateLimiter::direct(quota(settings.window_ms, *per_min)),
                )
            })
            .collect();
        Self {
            default,
            per_agent,
            excluded_paths: settings.excluded_paths.clone(),
        }
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths.iter().any(|p| p == path)
    }

    /// Whether this client may proceed; consumes one cell of its quota.
    pub fn check(&self, key: &str) -> bool {
        match self.per_agent.get(key) {
            Some(limiter) => limiter.check().is_ok(),
            None => self.default.check_key(&key.to_string()).is_ok(),
        }
    }
}

/// `per_min` cells per `window_ms`, replenished evenly across the window.
fn quota(window_ms: u64, per_min: u32) -> Quota {
    let per_min = NonZeroU32::new(per_min.max(1)).unwrap_or(NonZeroU32::MIN);
    let replenish = Duration::from_millis((window_ms / u64::from(per_min.get())).max(1));
    Quota::with_period(replenish)
        .unwrap_or_else(|| Quota::per_minute(per_min))
        .allow_burst(per_min)
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<ApiRateLimiter>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = request.uri().path();
    if limiter.is_excluded(path) {
        return Ok(next.run(request).await);
    }

    let key = client_key(&request, addr);
    if !limiter.check(&key) {
        warn!(client = %key, path = %path, "request rate limited");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    Ok(next.run(request).await)
}

/// Stable identity for quota accounting: declared agent first, then
/// proxy-forwarded address, then the socket peer.
fn client_key(request: &Request, addr: SocketAddr) -> String {
    if let Some(agent) = request.headers().get("x-agent-id") {
        if let Ok(agent) = agent.to_str() {
            return agent.to_string();
        }
    }
    if let Some(forwarded_for) = request.headers().get("x-forwarded-for") {
        if let Ok(ips) = forwarded_for.to_str() {
            if let Some(first) = ips.split(',').next() {
                return first.trim().to_string();
            }
        }
    }
    addr.ip().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(default_per_min: u32) -> RateLimitSettings {
        RateLimitSettings {
            window_ms: 60_000,
            default_per_min,
            per_agent: HashMap::from([("github-copilot".to_string(), 2)]),
            excluded_paths: vec!["/health".to_string()],
        }
    }

    #[test]
    fn excluded_paths_bypass() {
        let limiter = ApiRateLimiter::new(&settings(1));
        assert!(limiter.is_excluded("/health"));
        assert!(!limiter.is_excluded("/api/session/start"));
    }

    #[test]
    fn per_agent_quota_overrides_default() {
        let limiter = ApiRateLimiter::new(&settings(60));
        // Burst of 2 for the executor override
        assert!(limiter.check("github-copilot"));
        assert!(limiter.check("github-copilot"));
        assert!(!limiter.check("github-copilot"));

        // Default quota is independent per key
        assert!(limiter.check("10.0.0.1"));
    }

    #[test]
    fn default_quota_exhausts_per_key() {
        let limiter = ApiRateLimiter::new(&settings(3));
        for _ in 0..3 {
            assert!(limiter.check("10.0.0.9"));
        }
        assert!(!limiter.check("10.0.0.9"));
        // A different client is unaffected
        assert!(limiter.check("10.0.0.10"));
    }
}
