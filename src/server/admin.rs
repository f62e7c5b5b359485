use super::GatewayState;
use bytes::Bytes;
use http::header::{ALLOW, CONTENT_TYPE};
use http::{HeaderValue, Method, Response, StatusCode};

const OUTPUT_CACHE_PREFIX: &str = "/outputcache/";

fn json(status: StatusCode, body: impl Into<Bytes>) -> Response<Bytes> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub fn handle_admin(method: &Method, path: &str, state: &GatewayState) -> Response<Bytes> {
    match path {
        "/health" | "/healthz" => json(StatusCode::OK, r#"{"status":"ok"}"#),

        "/ready" | "/readyz" => json(
            StatusCode::OK,
            serde_json::json!({
                "status": "ready",
                "routes": state.route_count(),
            })
            .to_string(),
        ),

        "/metrics" => {
            let body = state.metrics.as_ref().map(|m| m.render()).unwrap_or_default();
            let mut response = Response::new(Bytes::from(body));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            response
        }

        "/configuration" => {
            let mut cfg = (**state.config.load()).clone();
            if let Some(sd) = cfg.global.service_discovery.as_mut() {
                if sd.token.is_some() {
                    sd.token = Some("***".to_string());
                }
            }
            let body = serde_json::to_string_pretty(&cfg).unwrap_or_default();
            json(StatusCode::OK, body)
        }

        _ => match path.strip_prefix(OUTPUT_CACHE_PREFIX) {
            Some(region) if !region.is_empty() => {
                if *method != Method::DELETE {
                    let mut response = json(
                        StatusCode::METHOD_NOT_ALLOWED,
                        r#"{"error":"method not allowed"}"#,
                    );
                    response
                        .headers_mut()
                        .insert(ALLOW, HeaderValue::from_static("DELETE"));
                    return response;
                }
                let removed = state.cache.clear_region(region);
                json(
                    StatusCode::OK,
                    serde_json::json!({ "region": region, "removed": removed }).to_string(),
                )
            }
            _ => json(StatusCode::NOT_FOUND, r#"{"error":"not found"}"#),
        },
    }
}
