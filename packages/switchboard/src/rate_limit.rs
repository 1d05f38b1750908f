//! Per-IP rate limits for unauthenticated endpoints.
//!
//! Keys come from [`SmartIpKeyExtractor`]: `x-forwarded-for`, `x-real-ip` and
//! `forwarded` are checked before the peer address, so the server must be run
//! with connect info (`into_make_service_with_connect_info`) when it is not
//! behind a proxy.

use std::sync::Arc;

use governor::{clock::QuantaInstant, middleware::NoOpMiddleware};
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};

pub type Limit = GovernorLayer<SmartIpKeyExtractor, NoOpMiddleware<QuantaInstant>, axum::body::Body>;

/// Limit for starting device authorizations.
///
/// Each request creates a session row, so keep it tight: one every 6 seconds
/// with bursts of 10.
pub fn device_code() -> Limit {
    let config = GovernorConfigBuilder::default()
        .per_second(6)
        .burst_size(10)
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .expect("valid governor config");

    GovernorLayer::new(Arc::new(config))
}

/// Limit for token polling, refresh and revocation.
///
/// Clients poll every few seconds; a shared NAT can host many of them.
pub fn device_token() -> Limit {
    let config = GovernorConfigBuilder::default()
        .per_millisecond(100)
        .burst_size(20)
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .expect("valid governor config");

    GovernorLayer::new(Arc::new(config))
}
