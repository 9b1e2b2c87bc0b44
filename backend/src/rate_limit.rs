//! Per-client request limits for the HTTP API, keyed on remote address.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::ConfigError;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// An hourly and a daily allowance per client IP. A request must fit both.
pub struct ClientRateLimiter {
    hourly: DefaultKeyedRateLimiter<IpAddr>,
    daily: DefaultKeyedRateLimiter<IpAddr>,
}

impl ClientRateLimiter {
    pub fn new(per_hour: u32, per_day: u32) -> Result<Self, ConfigError> {
        let per_hour = NonZeroU32::new(per_hour)
            .ok_or_else(|| ConfigError::invalid("RATE_LIMIT_PER_HOUR", "Must be greater than 0"))?;
        let per_day = NonZeroU32::new(per_day)
            .ok_or_else(|| ConfigError::invalid("RATE_LIMIT_PER_DAY", "Must be greater than 0"))?;

        // Replenish one request every day/N, bursting up to N
        let daily = Quota::with_period(DAY / per_day.get())
            .ok_or_else(|| ConfigError::invalid("RATE_LIMIT_PER_DAY", "Too large"))?
            .allow_burst(per_day);

        Ok(Self {
            hourly: RateLimiter::keyed(Quota::per_hour(per_hour)),
            daily: RateLimiter::keyed(daily),
        })
    }

    /// Take one request from the client's allowance.
    pub fn check(&self, client: IpAddr) -> bool {
        self.hourly.check_key(&client).is_ok() && self.daily.check_key(&client).is_ok()
    }

    /// Forget clients whose allowance has fully refilled.
    pub fn retain_recent(&self) {
        self.hourly.retain_recent();
        self.daily.retain_recent();
    }

    pub fn tracked_clients(&self) -> usize {
        self.daily.len()
    }
}

/// Router middleware; needs the server to provide `ConnectInfo<SocketAddr>`.
pub async fn enforce(
    State(limiter): State<Arc<ClientRateLimiter>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if limiter.check(addr.ip()) {
        next.run(request).await
    } else {
        warn!(client = %addr.ip(), path = %request.uri().path(), "Rate limit exceeded");
        (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response()
    }
}
