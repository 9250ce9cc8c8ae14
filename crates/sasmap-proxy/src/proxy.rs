use async_trait::async_trait;
use bytes::Bytes;
use pingora::http::StatusCode;
use pingora::Error;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_core::Result;
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{FailToProxy, ProxyHttp, Session as PingoraSession};
use sasmap_core::ProxySettings;
use sasmap_sas::SasToken;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

pub const SERVER_NAME: &[u8; 6] = b"Sasmap";

/// Proxy context for tracking request state
pub struct ProxyContext {
    pub request_id: String,
    pub start_time: Instant,
    pub method: String,
    pub path: String,
    pub host: String,
}

/// The rewriting proxy itself.
///
/// Holds the settings and the token provisioned before the listener bound;
/// both are read-only for the process lifetime, so request handling shares
/// no mutable state.
pub struct SourceMapProxy {
    mount_prefix: String,
    upstream_host: String,
    upstream_addr: OnceLock<SocketAddr>,
    sas: SasToken,
}

impl SourceMapProxy {
    pub fn new(settings: Arc<ProxySettings>, sas: SasToken) -> Self {
        Self {
            mount_prefix: settings.mount_prefix(),
            upstream_host: settings.upstream_host(),
            upstream_addr: OnceLock::new(),
            sas,
        }
    }

    /// Segment-aware mount check: `/{container}` and `/{container}/...`
    /// are in scope, `/{container}extra` is not.
    fn is_mounted(&self, path: &str) -> bool {
        match path.strip_prefix(self.mount_prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Upstream path: the inbound path with the SAS fragment appended
    /// verbatim. A client-supplied query string is dropped rather than
    /// merged; this mirrors the original product behavior and is a known
    /// defect (see DESIGN.md).
    fn rewrite_path(&self, path: &str) -> String {
        format!("{}?{}", path, self.sas.as_str())
    }

    /// Point the outgoing request at the storage origin: rewritten path
    /// plus token, and a Host header matching the upstream virtual host.
    fn rewrite_upstream_request(
        &self,
        upstream_request: &mut RequestHeader,
        path: &str,
    ) -> Result<()> {
        let rewritten = self.rewrite_path(path);
        info!("rewriting to {}", rewritten);

        let uri = rewritten
            .parse::<http::Uri>()
            .map_err(|_| Error::new_str("Invalid rewritten upstream URI"))?;
        upstream_request.set_uri(uri);

        // Origin-changing proxy: the upstream must see its own host, not
        // the inbound virtual host.
        upstream_request.insert_header("Host", &self.upstream_host)?;

        Ok(())
    }

    /// Resolve the storage origin, caching the first successful lookup
    /// for the process lifetime. The host is fixed, so there is no point
    /// paying a lookup per request.
    fn upstream_addr(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.upstream_addr.get() {
            return Ok(*addr);
        }

        let addr = (self.upstream_host.as_str(), 443)
            .to_socket_addrs()
            .map_err(|e| {
                Error::because(
                    pingora::ErrorType::ConnectError,
                    format!("failed to resolve upstream host {}", self.upstream_host),
                    e,
                )
            })?
            .next()
            .ok_or_else(|| Error::new_str("No address found for upstream host"))?;

        Ok(*self.upstream_addr.get_or_init(|| addr))
    }

    fn get_host_header(&self, session: &PingoraSession) -> Result<String> {
        let host_with_port = if let Some(host) = session.req_header().headers.get("host") {
            host.to_str()
                .map_err(|_| Error::new_str("Invalid host header encoding"))?
                .to_string()
        } else if let Some(host) = session.req_header().uri.host() {
            // :authority pseudo-header for HTTP/2
            host.to_string()
        } else {
            return Err(Error::new_str("Missing Host or :authority header"));
        };

        let host = host_with_port.split(':').next().unwrap_or(&host_with_port);
        Ok(host.to_string())
    }

    async fn respond_not_found(
        &self,
        session: &mut PingoraSession,
        ctx: &ProxyContext,
    ) -> Result<()> {
        let body = Bytes::from_static(b"Not Found");
        let mut resp = ResponseHeader::build(StatusCode::NOT_FOUND, None)?;
        resp.insert_header("Content-Type", "text/plain")?;
        resp.insert_header("Content-Length", body.len().to_string())?;
        resp.insert_header("X-Request-ID", &ctx.request_id)?;

        session.write_response_header(Box::new(resp), false).await?;
        session.write_response_body(Some(body), true).await?;
        Ok(())
    }
}

#[async_trait]
impl ProxyHttp for SourceMapProxy {
    type CTX = ProxyContext;

    fn new_ctx(&self) -> Self::CTX {
        ProxyContext {
            request_id: Uuid::new_v4().to_string(),
            start_time: Instant::now(),
            method: String::new(),
            path: String::new(),
            host: String::new(),
        }
    }

    async fn request_filter(
        &self,
        session: &mut PingoraSession,
        ctx: &mut Self::CTX,
    ) -> Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        ctx.start_time = Instant::now();
        ctx.host = self.get_host_header(session)?;
        ctx.method = session.req_header().method.to_string();
        ctx.path = session.req_header().uri.path().to_string();

        session
            .req_header_mut()
            .insert_header("X-Request-ID", &ctx.request_id)?;

        debug!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            host = %ctx.host,
            path = %ctx.path,
            "Incoming request"
        );

        // Only the container mount prefix is proxied; everything else gets
        // the server default.
        if !self.is_mounted(&ctx.path) {
            debug!("Path {} outside mount prefix {}", ctx.path, self.mount_prefix);
            self.respond_not_found(session, ctx).await?;
            return Ok(true);
        }

        Ok(false)
    }

    async fn upstream_peer(
        &self,
        _session: &mut PingoraSession,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        // Fixed origin: the storage account's public blob endpoint, TLS
        // with SNI matching the Host header we send.
        let addr = self.upstream_addr()?;
        let peer = Box::new(HttpPeer::new(addr, true, self.upstream_host.clone()));
        Ok(peer)
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut PingoraSession,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()>
    where
        Self::CTX: Send + Sync,
    {
        self.rewrite_upstream_request(upstream_request, &ctx.path)
    }

    async fn response_filter(
        &self,
        _session: &mut PingoraSession,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()>
    where
        Self::CTX: Send + Sync,
    {
        upstream_response.insert_header("X-Request-ID", &ctx.request_id)?;

        let duration = ctx.start_time.elapsed();
        info!(
            "[{}] {} {} {} - {}ms",
            ctx.method,
            ctx.host,
            ctx.path,
            upstream_response.status.as_u16(),
            duration.as_millis()
        );
        upstream_response
            .insert_header("X-Response-Time", format!("{}ms", duration.as_millis()))?;

        Ok(())
    }

    fn fail_to_connect(
        &self,
        _session: &mut PingoraSession,
        _peer: &HttpPeer,
        _ctx: &mut Self::CTX,
        e: Box<Error>,
    ) -> Box<Error> {
        error!("Failed to connect to upstream {}: {:?}", self.upstream_host, e);
        e
    }

    async fn fail_to_proxy(
        &self,
        session: &mut PingoraSession,
        e: &Error,
        ctx: &mut Self::CTX,
    ) -> FailToProxy
    where
        Self::CTX: Send + Sync,
    {
        error!(
            "Failed to proxy: {:?} | request_id={} host={} method={} path={}",
            e, ctx.request_id, ctx.host, ctx.method, ctx.path
        );

        let error_code = 502;
        let can_reuse_downstream = false;

        let mut header = match ResponseHeader::build(StatusCode::BAD_GATEWAY, None) {
            Ok(header) => header,
            Err(e) => {
                error!("Failed to build response header: {:?}", e);
                return FailToProxy {
                    error_code,
                    can_reuse_downstream,
                };
            }
        };

        if let Err(e) = header.insert_header("Server", &SERVER_NAME[..]) {
            error!("Failed to insert Server header: {:?}", e);
        }
        if let Err(e) = header.insert_header("Cache-Control", "private, no-store") {
            error!("Failed to insert Cache-Control header: {:?}", e);
        }

        if let Err(e) = session.write_response_header(Box::new(header), false).await {
            error!("Failed to write response header: {:?}", e);
            return FailToProxy {
                error_code,
                can_reuse_downstream,
            };
        }

        if let Err(e) = session
            .write_response_body(Some(Bytes::from("Bad Gateway")), true)
            .await
        {
            error!("Failed to write response body: {:?}", e);
        }

        FailToProxy {
            error_code,
            can_reuse_downstream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sasmap_core::settings::{
        ENV_BLOB_CONTAINER, ENV_SSL_CERT, ENV_SSL_HOST, ENV_SSL_KEY, ENV_SSL_PASSPHRASE,
        ENV_STORAGE_ACCOUNT,
    };
    use std::collections::HashMap;

    fn test_settings() -> Arc<ProxySettings> {
        let env: HashMap<&str, &str> = [
            (ENV_STORAGE_ACCOUNT, "mapsaccount"),
            (ENV_BLOB_CONTAINER, "sourcemaps"),
            (ENV_SSL_KEY, "/tmp/proxy.key"),
            (ENV_SSL_CERT, "/tmp/proxy.crt"),
            (ENV_SSL_PASSPHRASE, "hunter2"),
            (ENV_SSL_HOST, "local.teams.office.com"),
        ]
        .into_iter()
        .collect();
        Arc::new(ProxySettings::load(|name| env.get(name).map(|v| v.to_string())).unwrap())
    }

    fn test_proxy(token: &str) -> SourceMapProxy {
        SourceMapProxy::new(test_settings(), SasToken::new(token))
    }

    #[test]
    fn test_mount_prefix_matching() {
        let proxy = test_proxy("sv=1&sig=abc");

        assert!(proxy.is_mounted("/sourcemaps"));
        assert!(proxy.is_mounted("/sourcemaps/"));
        assert!(proxy.is_mounted("/sourcemaps/foo/bar.map"));

        assert!(!proxy.is_mounted("/"));
        assert!(!proxy.is_mounted("/other"));
        assert!(!proxy.is_mounted("/sourcemapsextra"));
        assert!(!proxy.is_mounted("/sourcemapsextra/foo.map"));
    }

    #[test]
    fn test_rewrite_appends_token_verbatim() {
        let proxy = test_proxy("sv=2023-11-03&sp=r&sig=abc%2Fdef");

        assert_eq!(
            proxy.rewrite_path("/sourcemaps/foo/bar.map"),
            "/sourcemaps/foo/bar.map?sv=2023-11-03&sp=r&sig=abc%2Fdef"
        );
    }

    #[test]
    fn test_rewrite_is_idempotent_across_requests() {
        let proxy = test_proxy("sv=1&sig=abc");

        let first = proxy.rewrite_path("/sourcemaps/app.js.map");
        let second = proxy.rewrite_path("/sourcemaps/app.js.map");
        assert_eq!(first, second);
    }

    #[test]
    fn test_rewrite_does_not_merge_client_query() {
        // Known defect preserved on purpose: an inbound query string is
        // not merged, the token is appended to the path portion only. The
        // path recorded in ctx never includes the query, so the rewrite
        // drops it.
        let proxy = test_proxy("sig=abc");

        assert_eq!(
            proxy.rewrite_path("/sourcemaps/a.map"),
            "/sourcemaps/a.map?sig=abc"
        );
    }

    #[test]
    fn test_upstream_host_is_storage_origin() {
        let proxy = test_proxy("sig=abc");
        assert_eq!(proxy.upstream_host, "mapsaccount.blob.core.windows.net");
    }

    #[test]
    fn test_upstream_request_gets_host_and_rewritten_uri() {
        let proxy = test_proxy("sv=2023-11-03&sp=r&sig=abc%2Fdef");
        let mut req = RequestHeader::build("GET", b"/sourcemaps/foo/bar.map", None).unwrap();

        proxy
            .rewrite_upstream_request(&mut req, "/sourcemaps/foo/bar.map")
            .unwrap();

        assert_eq!(req.uri.path(), "/sourcemaps/foo/bar.map");
        assert_eq!(req.uri.query(), Some("sv=2023-11-03&sp=r&sig=abc%2Fdef"));
        assert_eq!(
            req.headers.get("host").unwrap().to_str().unwrap(),
            "mapsaccount.blob.core.windows.net"
        );
    }

    #[test]
    fn test_upstream_request_host_replaces_inbound_host() {
        let proxy = test_proxy("sig=abc");
        let mut req = RequestHeader::build("GET", b"/sourcemaps/a.map", None).unwrap();
        req.insert_header("Host", "local.teams.office.com").unwrap();

        proxy
            .rewrite_upstream_request(&mut req, "/sourcemaps/a.map")
            .unwrap();

        assert_eq!(
            req.headers.get("host").unwrap().to_str().unwrap(),
            "mapsaccount.blob.core.windows.net"
        );
    }

    #[test]
    fn test_upstream_addr_resolved_once() {
        let proxy = test_proxy("sig=abc");
        let seeded: SocketAddr = "203.0.113.9:443".parse().unwrap();
        proxy.upstream_addr.set(seeded).unwrap();

        // The storage host does not resolve here, so getting the seeded
        // address back proves the cached value is reused.
        assert_eq!(proxy.upstream_addr().unwrap(), seeded);
        assert_eq!(proxy.upstream_addr().unwrap(), seeded);
    }

    #[test]
    fn test_rewritten_path_parses_as_uri() {
        let proxy = test_proxy("sv=2023-11-03&st=2026-08-30T10%3A00%3A00Z&sig=abc");
        let uri = proxy
            .rewrite_path("/sourcemaps/foo.map")
            .parse::<http::Uri>()
            .expect("rewritten path must be a valid URI");

        assert_eq!(uri.path(), "/sourcemaps/foo.map");
        assert_eq!(
            uri.query(),
            Some("sv=2023-11-03&st=2026-08-30T10%3A00%3A00Z&sig=abc")
        );
    }
}
