use crate::auth::Claims;
use crate::error::GatewayError;
use crate::routing::DownstreamRoute;
use crate::upstream::Lease;
use bytes::Bytes;
use http::header::{ALLOW, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use tokio::time::Instant;

/// Per-request state shared by the pipeline stages.
///
/// Each field is written by one stage and read by later ones. The context
/// lives for exactly one inbound request; dropping it releases any lease
/// still held.
pub struct PipelineContext {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub peer_addr: SocketAddr,
    pub client_ip: IpAddr,
    pub request_id: String,
    pub start: Instant,

    pub downstream_route: Option<DownstreamRoute>,
    /// Rate-limit advisory headers echoed on the response, allowed or not.
    pub rate_limit_headers: HeaderMap,
    pub claims: Option<Claims>,
    pub cache_key: Option<String>,
    pub downstream_request: Option<Request<Bytes>>,
    pub lease: Option<Lease>,
    pub downstream_response: Option<Response<Bytes>>,
    pub response: Option<Response<Bytes>>,
    pub served_from_cache: bool,
    errors: Vec<GatewayError>,
}

impl PipelineContext {
    pub fn new(request: Request<Bytes>, peer_addr: SocketAddr) -> Self {
        let (parts, body) = request.into_parts();

        // Trust the left-most X-Forwarded-For entry when present (a trusted
        // proxy is assumed in front), otherwise the TCP peer.
        let client_ip = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|s| s.trim().parse::<IpAddr>().ok())
            .unwrap_or_else(|| peer_addr.ip());

        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
            peer_addr,
            client_ip,
            request_id: generate_request_id(),
            start: Instant::now(),
            downstream_route: None,
            rate_limit_headers: HeaderMap::new(),
            claims: None,
            cache_key: None,
            downstream_request: None,
            lease: None,
            downstream_response: None,
            response: None,
            served_from_cache: false,
            errors: Vec::new(),
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// The resolved route. Stages after route resolution rely on it.
    pub fn route(&self) -> Result<&DownstreamRoute, GatewayError> {
        self.downstream_route
            .as_ref()
            .ok_or_else(|| GatewayError::Internal("no downstream route in context".to_string()))
    }

    /// Route key for logs and metric labels; empty before resolution.
    pub fn route_key(&self) -> &str {
        self.downstream_route
            .as_ref()
            .map(|r| r.route.key.as_str())
            .unwrap_or("")
    }

    pub fn add_error(&mut self, error: GatewayError) {
        self.errors.push(error);
    }

    pub fn errors(&self) -> &[GatewayError] {
        &self.errors
    }

    pub fn is_error(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Release the lease, if any. Called once the downstream call finished.
    pub fn release_lease(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
    }
}

/// 16 random bytes, hex encoded.
fn generate_request_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// The single place errors become responses. The first recorded error wins.
///
/// Bodies are `{"error": "<message>"}` JSON, except rate-limit rejections
/// which carry the quota message as plain text.
pub fn error_response(errors: &[GatewayError]) -> Response<Bytes> {
    let Some(error) = errors.first() else {
        return plain_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "application/json",
            Bytes::from_static(br#"{"error":"internal error"}"#),
        );
    };

    let mut response = match error {
        GatewayError::RateLimited { message, .. } => plain_response(
            error.status_code(),
            "text/plain; charset=utf-8",
            Bytes::from(message.clone()),
        ),
        _ => {
            let body = serde_json::json!({ "error": error.to_string() }).to_string();
            plain_response(error.status_code(), "application/json", Bytes::from(body))
        }
    };

    if let GatewayError::MethodNotAllowed { allowed } = error {
        if let Ok(v) = HeaderValue::from_str(&allowed.join(", ")) {
            response.headers_mut().insert(ALLOW, v);
        }
    }
    response
}

fn plain_response(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Bytes> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
