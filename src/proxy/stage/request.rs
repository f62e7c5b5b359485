use crate::auth::Claims;
use crate::error::GatewayError;
use crate::proxy::context::PipelineContext;
use bytes::Bytes;
use http::header::{CONNECTION, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Request};
use std::net::SocketAddr;

static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
static XRI: HeaderName = HeaderName::from_static("x-real-ip");

/// Downstream path plus query: the inbound query with claim-derived
/// parameters replacing any of the same name.
pub(crate) fn downstream_path_and_query(ctx: &PipelineContext) -> Result<String, GatewayError> {
    let dr = ctx.route()?;
    let route = &dr.route;
    let empty = Claims::new();
    let claims = ctx.claims.as_ref().unwrap_or(&empty);

    let mut pieces: Vec<String> = ctx
        .query()
        .unwrap_or("")
        .split('&')
        .filter(|p| !p.is_empty())
        .filter(|p| {
            let name = p.split_once('=').map_or(*p, |(n, _)| n);
            !route.queries_from_claims.iter().any(|t| t.key == name)
        })
        .map(str::to_string)
        .collect();
    for t in &route.queries_from_claims {
        let value = t.extract(claims)?;
        pieces.push(format!(
            "{}={}",
            urlencoding::encode(&t.key),
            urlencoding::encode(&value)
        ));
    }

    let mut pq = String::with_capacity(dr.downstream_path.len() + 1 + pieces.len() * 16);
    pq.push_str(&dr.downstream_path);
    if !pieces.is_empty() {
        pq.push('?');
        pq.push_str(&pieces.join("&"));
    }
    Ok(pq)
}

/// Build the downstream request from the inbound one. The URI is relative;
/// the lease stage points it at the chosen backend.
pub(crate) fn build_downstream_request(
    ctx: &PipelineContext,
) -> Result<Request<Bytes>, GatewayError> {
    let route = &ctx.route()?.route;
    let empty = Claims::new();
    let claims = ctx.claims.as_ref().unwrap_or(&empty);

    let method = route
        .downstream_method
        .clone()
        .unwrap_or_else(|| ctx.method.clone());
    let path_and_query = downstream_path_and_query(ctx)?;

    let mut headers = ctx.headers.clone();
    let original_host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    remove_hop_headers(&mut headers);
    headers.remove(HOST);
    inject_forwarded_headers(&mut headers, ctx.peer_addr, &original_host);

    for t in &route.headers_from_claims {
        let value = t.extract(claims)?;
        let name = HeaderName::from_bytes(t.key.as_bytes())
            .map_err(|e| GatewayError::Internal(format!("header '{}': {}", t.key, e)))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|e| GatewayError::Internal(format!("header '{}': {}", t.key, e)))?;
        headers.insert(name, value);
    }

    if let Some(ref key) = route.request_id_key {
        if !headers.contains_key(key) {
            if let Ok(v) = HeaderValue::from_str(&ctx.request_id) {
                headers.insert(key.clone(), v);
            }
        }
    }

    let mut request = Request::builder()
        .method(method)
        .uri(path_and_query.as_str())
        .body(ctx.body.clone())
        .map_err(|e| {
            GatewayError::Internal(format!("downstream uri '{}': {}", path_and_query, e))
        })?;
    *request.headers_mut() = headers;
    Ok(request)
}

/// Strip connection-scoped headers. Applied to both directions.
pub(crate) fn remove_hop_headers(headers: &mut HeaderMap) {
    let hop_headers: [HeaderName; 8] = [
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];
    for h in &hop_headers {
        headers.remove(h);
    }
}

/// `X-Forwarded-For` gets the peer appended, `X-Forwarded-Proto` defaults to
/// `http`, `X-Forwarded-Host` carries the inbound `Host` and `X-Real-IP` is
/// always the immediate peer.
fn inject_forwarded_headers(headers: &mut HeaderMap, peer_addr: SocketAddr, original_host: &str) {
    let peer_ip = peer_addr.ip().to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let mut combined = String::with_capacity(existing.len() + 2 + peer_ip.len());
        combined.push_str(existing);
        combined.push_str(", ");
        combined.push_str(&peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if !original_host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(XFH.clone(), v);
        }
    }

    if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XRI.clone(), v);
    }
}
