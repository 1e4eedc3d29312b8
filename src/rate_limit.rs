//! Per-client fixed-window rate limiting.
//!
//! Records live in a bounded LRU store. A record expires once its window has
//! passed; expired records at the cold end of the store are dropped on every
//! admission, and the capacity bound drops the least recently seen client
//! when the store is full.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, TimeDelta, Utc};
use lru::LruCache;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// Longest window a limiter will track.
const MAX_WINDOW: TimeDelta = TimeDelta::days(365);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRecord {
    pub count: u32,
    pub window_reset_at: DateTime<Utc>,
}

/// Quota state reported to the client on every gated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow(QuotaSnapshot),
    Deny {
        quota: QuotaSnapshot,
        retry_after_secs: u64,
    },
}

impl Admission {
    pub fn quota(&self) -> &QuotaSnapshot {
        match self {
            Admission::Allow(quota) | Admission::Deny { quota, .. } => quota,
        }
    }
}

pub struct RateLimiter {
    max_requests: u32,
    window: TimeDelta,
    records: Mutex<LruCache<String, RateLimitRecord>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            max_requests: max_requests.max(1),
            window: TimeDelta::from_std(window)
                .unwrap_or(MAX_WINDOW)
                .min(MAX_WINDOW),
            records: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, config.window(), config.capacity)
    }

    pub fn admit(&self, client_key: Option<&str>) -> Admission {
        self.admit_at(client_key, Utc::now())
    }

    /// Admission decision at an explicit instant.
    ///
    /// The store lock is held across the whole read-modify-write, so
    /// concurrent requests from one client are counted exactly.
    pub fn admit_at(&self, client_key: Option<&str>, now: DateTime<Utc>) -> Admission {
        let fresh_reset = now + self.window;

        let Some(key) = client_key.filter(|k| !k.is_empty()) else {
            return Admission::Deny {
                quota: self.snapshot(self.max_requests, fresh_reset),
                retry_after_secs: self.window.num_seconds().max(1) as u64,
            };
        };

        let mut records = match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::evict_expired(&mut records, now);

        let record = match records.get_mut(key) {
            None => {
                let record = RateLimitRecord {
                    count: 1,
                    window_reset_at: fresh_reset,
                };
                records.put(key.to_string(), record);
                record
            }
            Some(existing) if now > existing.window_reset_at => {
                *existing = RateLimitRecord {
                    count: 1,
                    window_reset_at: fresh_reset,
                };
                *existing
            }
            Some(existing) if existing.count < self.max_requests => {
                existing.count += 1;
                *existing
            }
            Some(existing) => {
                let wait_ms = (existing.window_reset_at - now).num_milliseconds().max(0) as u64;
                return Admission::Deny {
                    quota: self.snapshot(existing.count, existing.window_reset_at),
                    retry_after_secs: wait_ms.div_ceil(1000).max(1),
                };
            }
        };

        Admission::Allow(self.snapshot(record.count, record.window_reset_at))
    }

    pub fn tracked_keys(&self) -> usize {
        self.tracked_keys_at(Utc::now())
    }

    /// Live record count at `now`. Expired records anywhere in the store
    /// are dropped first, not just those at the cold end.
    pub fn tracked_keys_at(&self, now: DateTime<Utc>) -> usize {
        let mut records = match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::purge_expired(&mut records, now);
        records.len()
    }

    pub fn limit(&self) -> u32 {
        self.max_requests
    }

    fn snapshot(&self, count: u32, reset_at: DateTime<Utc>) -> QuotaSnapshot {
        QuotaSnapshot {
            limit: self.max_requests,
            remaining: self.max_requests.saturating_sub(count),
            reset_at,
        }
    }

    fn evict_expired(records: &mut LruCache<String, RateLimitRecord>, now: DateTime<Utc>) {
        while let Some((_, record)) = records.peek_lru() {
            if now <= record.window_reset_at {
                break;
            }
            if let Some((key, _)) = records.pop_lru() {
                debug!(client = %key, "Rate limit record expired");
            }
        }
    }

    fn purge_expired(records: &mut LruCache<String, RateLimitRecord>, now: DateTime<Utc>) {
        let expired: Vec<String> = records
            .iter()
            .filter(|(_, record)| now > record.window_reset_at)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            records.pop(&key);
            debug!(client = %key, "Rate limit record expired");
        }
    }
}

/// First address in `X-Forwarded-For`, then `X-Real-IP`, then the peer.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let header_ip = |name: &str| -> Option<IpAddr> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse().ok())
    };

    header_ip("x-forwarded-for")
        .or_else(|| header_ip("x-real-ip"))
        .or_else(|| peer.map(|addr| addr.ip()))
        .map(|ip| ip.to_string())
}

fn set_quota_headers(headers: &mut HeaderMap, quota: &QuotaSnapshot) {
    let pairs = [
        ("x-ratelimit-limit", quota.limit.to_string()),
        ("x-ratelimit-remaining", quota.remaining.to_string()),
        ("x-ratelimit-reset", quota.reset_at.timestamp().to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

/// Gate a route behind the limiter.
///
/// Runs before the handler. Allowed requests get quota headers on their
/// response, denied ones get a 429 with `Retry-After`.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = client_key(request.headers(), peer);

    let admission = limiter.admit(key.as_deref());
    let mut response = match admission {
        Admission::Allow(_) => next.run(request).await,
        Admission::Deny {
            retry_after_secs, ..
        } => {
            warn!(
                client = key.as_deref().unwrap_or("<unidentified>"),
                path = %request.uri().path(),
                retry_after_secs,
                "Rate limit exceeded"
            );
            let body = Json(json!({
                "error": "Too many requests, please try again later.",
                "retryAfter": retry_after_secs,
            }));
            let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
            response.headers_mut().insert(
                axum::http::header::RETRY_AFTER,
                HeaderValue::from(retry_after_secs),
            );
            response
        }
    };
    set_quota_headers(response.headers_mut(), admission.quota());
    response
}
