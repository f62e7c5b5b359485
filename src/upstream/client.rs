use crate::config::DownstreamClientConfig;
use crate::error::GatewayError;
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;

/// Sends a fully built request to a backend and returns the buffered response.
#[async_trait]
pub trait DownstreamClient: Send + Sync {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, GatewayError>;
}

/// Accepts any server certificate. Only installed when
/// `danger_accept_invalid_certs` is set.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Pooled hyper client for `http` and `https` backends.
///
/// HTTP/2 is negotiated through ALPN on TLS connections; plain connections
/// stay on HTTP/1.1.
pub struct HttpDownstreamClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HttpDownstreamClient {
    pub fn new(cfg: &DownstreamClientConfig) -> Self {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.set_keepalive(Some(Duration::from_secs(cfg.pool_idle_timeout_secs)));
        http.set_connect_timeout(Some(Duration::from_secs(cfg.connect_timeout_secs)));
        http.enforce_http(false);

        let https = if cfg.danger_accept_invalid_certs {
            let tls_config = rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
                .with_no_client_auth();
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_tls_config(tls_config)
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .wrap_connector(http)
        } else {
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_webpki_roots()
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .wrap_connector(http)
        };

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(cfg.pool_idle_timeout_secs))
            .pool_max_idle_per_host(cfg.pool_max_idle_per_host)
            .build(https);
        Self { client }
    }
}

#[async_trait]
impl DownstreamClient for HttpDownstreamClient {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, GatewayError> {
        let uri = request.uri().clone();
        let response = self
            .client
            .request(request.map(Full::new))
            .await
            .map_err(|e| {
                tracing::warn!("downstream: request failed, uri={}, error={}", uri, e);
                GatewayError::DownstreamTransport(e.to_string())
            })?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| {
                tracing::warn!("downstream: reading body failed, uri={}, error={}", uri, e);
                GatewayError::DownstreamTransport(e.to_string())
            })?
            .to_bytes();
        Ok(Response::from_parts(parts, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_send_buffers_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/products/7"))
            .and(header("x-trace", "abc"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("x-backend", "one")
                    .set_body_string("created"),
            )
            .mount(&server)
            .await;

        let client = HttpDownstreamClient::new(&DownstreamClientConfig::default());
        let request = Request::builder()
            .method("POST")
            .uri(format!("{}/products/7", server.uri()))
            .header("x-trace", "abc")
            .body(Bytes::from_static(b"{}"))
            .unwrap();

        let response = client.send(request).await.unwrap();
        assert_eq!(response.status(), 201);
        assert_eq!(response.headers()["x-backend"], "one");
        assert_eq!(response.body().as_ref(), b"created");
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpDownstreamClient::new(&DownstreamClientConfig::default());
        let request = Request::builder()
            .uri(format!("http://{}/", addr))
            .body(Bytes::new())
            .unwrap();
        assert!(matches!(
            client.send(request).await,
            Err(GatewayError::DownstreamTransport(_))
        ));
    }
}
