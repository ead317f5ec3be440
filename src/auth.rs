use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::{request_id_from_headers, AppError};
use crate::state::{AppState, User};

pub const USER_ID_HEADER: &str = "x-user-id";

/// Fixed-window counter per key.
pub struct RateLimiter {
    config: RateLimitConfig,
    hits: DashMap<String, (u32, Instant)>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            hits: DashMap::new(),
        }
    }

    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entry = self.hits.entry(key.to_string()).or_insert((0, now));
        if now.duration_since(entry.1) > self.config.window {
            *entry = (1, now);
            true
        } else if entry.0 >= self.config.max_requests {
            false
        } else {
            entry.0 += 1;
            true
        }
    }

    /// Drops counters whose window has passed. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.hits.len();
        let window = self.config.window;
        self.hits.retain(|_, (_, started)| started.elapsed() <= window);
        before.saturating_sub(self.hits.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.hits.len()
    }
}

pub fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "local".to_string())
}

fn rate_limited(request_id: String) -> AppError {
    AppError::new(
        StatusCode::TOO_MANY_REQUESTS,
        "RATE_LIMITED",
        "Too many requests from this IP, please try again later.",
        request_id,
    )
}

/// Applies the limiter to a request; used directly by generation routes.
pub fn enforce(limiter: &RateLimiter, scope: &str, headers: &HeaderMap) -> Result<(), AppError> {
    let ip = client_ip(headers);
    if limiter.check(&format!("{scope}:{ip}")) {
        Ok(())
    } else {
        warn!(scope, %ip, "rate limit exceeded");
        Err(rate_limited(request_id_from_headers(headers)))
    }
}

pub async fn api_rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    match enforce(&state.api_limiter, "api", request.headers()) {
        Ok(()) => next.run(request).await,
        Err(err) => err.into_response(),
    }
}

/// Caller identity. The external id in `x-user-id` is verified upstream;
/// here it only has to name a known user.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
    pub is_admin: bool,
    pub request_id: String,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let request_id = request_id_from_headers(&parts.headers);
        let Some(external_id) = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            return Err(AppError::unauthorized("User not authenticated.", request_id));
        };

        let Some(user) = state.db.find_user(external_id).await else {
            debug!(%external_id, "request from unknown user");
            return Err(AppError::not_found("User not found in our system.", request_id));
        };

        Ok(Self {
            is_admin: state.config.is_admin(&user.external_id),
            user,
            request_id,
        })
    }
}

pub struct AdminUser(pub AuthUser);

#[axum::async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let caller = AuthUser::from_request_parts(parts, state).await?;
        if !caller.is_admin {
            return Err(AppError::forbidden(
                "You do not have permission to perform this action.",
                caller.request_id,
            ));
        }
        Ok(Self(caller))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn limiter_blocks_after_quota() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 2,
            window: Duration::from_secs(60),
        });
        assert!(limiter.check("api:1.2.3.4"));
        assert!(limiter.check("api:1.2.3.4"));
        assert!(!limiter.check("api:1.2.3.4"));
        assert!(limiter.check("api:5.6.7.8"));
    }

    #[test]
    fn limiter_resets_after_window() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 1,
            window: Duration::ZERO,
        });
        assert!(limiter.check("k"));
        std::thread::sleep(Duration::from_millis(2));
        assert!(limiter.check("k"));
    }

    #[test]
    fn prune_drops_expired_windows_only() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 5,
            window: Duration::from_millis(20),
        });
        for i in 0..50 {
            assert!(limiter.check(&format!("api:10.0.0.{i}")));
        }
        assert_eq!(limiter.tracked_keys(), 50);
        assert_eq!(limiter.prune(), 0);

        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.check("api:10.0.0.200"));
        assert_eq!(limiter.prune(), 50);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn concurrent_checks_count_every_request() {
        let limiter = std::sync::Arc::new(RateLimiter::new(RateLimitConfig {
            max_requests: 1000,
            window: Duration::from_secs(60),
        }));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        limiter.check("api:shared");
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let allowed_after = (0..1000).filter(|_| limiter.check("api:shared")).count();
        assert_eq!(allowed_after, 1000 - 400);
    }

    #[test]
    fn client_ip_takes_first_forwarded_entry() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), "local");
        headers.insert("x-forwarded-for", "10.0.0.1, 172.16.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers), "10.0.0.1");
    }
}
