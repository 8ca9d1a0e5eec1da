//! Request middleware: JWT claim verification, rate limiting, request
//! tracking, resilience, local governor limiting, route matching, and
//! security headers.

#[cfg(feature = "jwt")]
pub mod jwt;

pub mod rate_limit;
pub mod request_tracking;
pub mod route_matcher;
pub mod security_headers;

#[cfg(feature = "resilience")]
pub mod resilience;

#[cfg(feature = "governor")]
pub mod governor;

#[cfg(feature = "jwt")]
pub use jwt::{Audience, Claims, JwtAuth, ADMIN_FULL_SCOPE};

#[cfg(all(feature = "jwt", feature = "cache"))]
pub use jwt::{JwtRevocation, RedisJwtRevocation};

pub use rate_limit::{RateLimit, RateLimitConfig};
pub use request_tracking::{
    request_id_layer, request_id_propagation_layer, sensitive_headers_layer, RequestTrackingConfig,
    PROPAGATE_HEADERS, SENSITIVE_HEADERS,
};
pub use route_matcher::{normalize_path, CompiledRoutePatterns};
pub use security_headers::apply_security_headers;

#[cfg(feature = "resilience")]
pub use resilience::{CircuitBreaker, ResilienceConfig};

#[cfg(feature = "governor")]
pub use governor::{GovernorConfig, GovernorRateLimit, RateLimitExceeded, RouteRateLimitConfig};
