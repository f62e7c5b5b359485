use http::StatusCode;
use std::fmt;

/// Failure kinds recorded by pipeline stages.
///
/// Stages never abort the request task; they push one of these onto the
/// request context and the pipeline turns the first one into a response via
/// [`GatewayError::status_code`].
#[derive(Debug)]
pub enum GatewayError {
    RouteNotFound,
    MethodNotAllowed { allowed: Vec<String> },
    BadRequest(String),
    PayloadTooLarge(u64),
    RateLimited { message: String, status: u16 },
    AuthenticationFailed(String),
    Unauthorised(String),
    NoServiceAvailable(String),
    DownstreamTimeout,
    DownstreamTransport(String),
    CircuitOpen(String),
    CacheUnavailable(String),
    Discovery(String),
    Http(reqwest::Error),
    Config(String),
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::RateLimited { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::TOO_MANY_REQUESTS)
            }
            GatewayError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Unauthorised(_) => StatusCode::FORBIDDEN,
            GatewayError::NoServiceAvailable(_)
            | GatewayError::DownstreamTimeout
            | GatewayError::CircuitOpen(_)
            | GatewayError::Discovery(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::DownstreamTransport(_) => StatusCode::BAD_GATEWAY,
            GatewayError::CacheUnavailable(_)
            | GatewayError::Http(_)
            | GatewayError::Config(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for metrics and access logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::RouteNotFound => "route_not_found",
            GatewayError::MethodNotAllowed { .. } => "method_not_allowed",
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::PayloadTooLarge(_) => "payload_too_large",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::AuthenticationFailed(_) => "authentication_failed",
            GatewayError::Unauthorised(_) => "unauthorised",
            GatewayError::NoServiceAvailable(_) => "no_service_available",
            GatewayError::DownstreamTimeout => "downstream_timeout",
            GatewayError::DownstreamTransport(_) => "downstream_transport",
            GatewayError::CircuitOpen(_) => "circuit_open",
            GatewayError::CacheUnavailable(_) => "cache_unavailable",
            GatewayError::Discovery(_) => "discovery",
            GatewayError::Http(_) => "http",
            GatewayError::Config(_) => "config",
            GatewayError::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::RouteNotFound => write!(f, "no route found"),
            GatewayError::MethodNotAllowed { allowed } => {
                write!(f, "method not allowed, allowed={}", allowed.join(","))
            }
            GatewayError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            GatewayError::PayloadTooLarge(limit) => {
                write!(f, "request body exceeds {} bytes", limit)
            }
            GatewayError::RateLimited { message, .. } => write!(f, "{}", message),
            GatewayError::AuthenticationFailed(msg) => {
                write!(f, "authentication failed: {}", msg)
            }
            GatewayError::Unauthorised(msg) => write!(f, "unauthorised: {}", msg),
            GatewayError::NoServiceAvailable(msg) => write!(f, "no services available: {}", msg),
            GatewayError::DownstreamTimeout => write!(f, "downstream timeout"),
            GatewayError::DownstreamTransport(msg) => {
                write!(f, "downstream transport error: {}", msg)
            }
            GatewayError::CircuitOpen(scope) => write!(f, "circuit open: {}", scope),
            GatewayError::CacheUnavailable(msg) => write!(f, "cache unavailable: {}", msg),
            GatewayError::Discovery(msg) => write!(f, "service discovery error: {}", msg),
            GatewayError::Http(e) => write!(f, "http error: {}", e),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_route_not_found() {
        assert_eq!(GatewayError::RouteNotFound.to_string(), "no route found");
    }

    #[test]
    fn display_method_not_allowed() {
        let err = GatewayError::MethodNotAllowed {
            allowed: vec!["GET".into(), "HEAD".into()],
        };
        assert_eq!(err.to_string(), "method not allowed, allowed=GET,HEAD");
    }

    #[test]
    fn display_rate_limited_uses_message() {
        let err = GatewayError::RateLimited {
            message: "quota exceeded".into(),
            status: 429,
        };
        assert_eq!(err.to_string(), "quota exceeded");
    }

    #[test]
    fn display_downstream_transport() {
        assert_eq!(
            GatewayError::DownstreamTransport("conn refused".to_string()).to_string(),
            "downstream transport error: conn refused"
        );
    }

    #[test]
    fn display_circuit_open() {
        assert_eq!(
            GatewayError::CircuitOpen("GET|/api".to_string()).to_string(),
            "circuit open: GET|/api"
        );
    }

    #[test]
    fn display_config() {
        assert_eq!(
            GatewayError::Config("bad toml".to_string()).to_string(),
            "config error: bad toml"
        );
    }

    #[test]
    fn display_payload_too_large() {
        let err = GatewayError::PayloadTooLarge(1024);
        assert_eq!(err.to_string(), "request body exceeds 1024 bytes");
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(GatewayError::RouteNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayError::MethodNotAllowed { allowed: vec![] }.status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            GatewayError::AuthenticationFailed("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::Unauthorised("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::NoServiceAvailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::DownstreamTimeout.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::CircuitOpen("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::DownstreamTransport("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn rate_limited_uses_policy_status() {
        let err = GatewayError::RateLimited {
            message: "slow down".into(),
            status: 503,
        };
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let bogus = GatewayError::RateLimited {
            message: "slow down".into(),
            status: 42,
        };
        assert_eq!(bogus.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }
}
