use std::collections::BTreeSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::{Host, Url};

use super::address::{AddressClass, AddressPolicy, HostAllowlist};
use super::http::{FetchRequest, FetchResponse};
use super::resolve::{Resolve, SystemResolver};
use crate::config::ConfigError;

/// `[network]` config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub connect_timeout_ms: u64,
    /// Whole-request bound, further limited by the call's remaining time
    pub request_timeout_ms: u64,
    pub max_response_bytes: usize,
    /// CIDR ranges re-permitted for trusted local targets. Only private,
    /// shared, unique-local and benchmarking space is accepted.
    pub allow_private_ranges: Vec<String>,
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3_000,
            request_timeout_ms: 10_000,
            max_response_bytes: 1024 * 1024,
            allow_private_ranges: Vec::new(),
            user_agent: concat!("toolcell/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Why a destination was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Scheme,
    Credentials,
    HostHeader,
    HostNotAllowed,
    Address(AddressClass),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheme => write!(f, "only http and https URLs are allowed"),
            Self::Credentials => write!(f, "URLs with embedded credentials are not allowed"),
            Self::HostHeader => write!(f, "the Host header cannot be set"),
            Self::HostNotAllowed => write!(f, "host is not in the allowed host list"),
            Self::Address(class) => write!(f, "resolved address is {class}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("destination rejected: {0}")]
    Rejected(RejectReason),

    #[error("could not resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("request timed out")]
    Timeout,

    #[error("open handle limit reached")]
    HandlesExhausted,

    #[error("request failed: {0}")]
    Request(String),
}

impl NetError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

#[cfg(unix)]
fn is_handle_exhaustion(e: &io::Error) -> bool {
    use nix::errno::Errno;
    matches!(
        e.raw_os_error().map(Errno::from_raw),
        Some(Errno::EMFILE | Errno::ENFILE)
    )
}

#[cfg(not(unix))]
fn is_handle_exhaustion(_e: &io::Error) -> bool {
    false
}

fn map_reqwest_error(e: reqwest::Error) -> NetError {
    if e.is_timeout() {
        return NetError::Timeout;
    }
    let mut source = std::error::Error::source(&e);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<io::Error>() {
            if is_handle_exhaustion(io) {
                return NetError::HandlesExhausted;
            }
        }
        source = err.source();
    }
    NetError::Request(e.to_string())
}

// ============================================================================
// Factory
// ============================================================================

/// Shared, read-only inputs for building per-call clients
#[derive(Debug, Clone)]
pub struct NetworkClientFactory {
    config: Arc<NetworkConfig>,
    policy: Arc<AddressPolicy>,
    resolver: Arc<dyn Resolve>,
}

impl NetworkClientFactory {
    pub fn new(config: NetworkConfig) -> Result<Self, ConfigError> {
        let policy = AddressPolicy::from_config(&config.allow_private_ranges)?;
        Ok(Self {
            config: Arc::new(config),
            policy: Arc::new(policy),
            resolver: Arc::new(SystemResolver),
        })
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Client for one call. `None` permits no host at all.
    pub fn open_client(&self, allowed_hosts: Option<&BTreeSet<String>>) -> OutboundClient {
        let hosts = match allowed_hosts {
            Some(hosts) => HostAllowlist::new(hosts),
            None => HostAllowlist::deny_all(),
        };
        OutboundClient {
            hosts,
            config: self.config.clone(),
            policy: self.policy.clone(),
            resolver: self.resolver.clone(),
        }
    }
}

// ============================================================================
// Per-call client
// ============================================================================

/// A destination that passed every check, pinned to one address
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Pinned {
    pub url: Url,
    pub host: String,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct OutboundClient {
    hosts: HostAllowlist,
    config: Arc<NetworkConfig>,
    policy: Arc<AddressPolicy>,
    resolver: Arc<dyn Resolve>,
}

impl OutboundClient {
    pub fn allowlist(&self) -> &HostAllowlist {
        &self.hosts
    }

    /// Validate the destination, then send to the pinned address. Redirects
    /// come back as data.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, NetError> {
        let pinned = self.prepare(&request).await?;
        send_pinned(&self.config, pinned, request).await
    }

    /// Every check that runs before a connection is attempted. Resolution
    /// happens on every call; nothing about a host name is remembered.
    pub(crate) async fn prepare(&self, request: &FetchRequest) -> Result<Pinned, NetError> {
        let url = Url::parse(&request.url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(NetError::Rejected(RejectReason::Scheme));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(NetError::Rejected(RejectReason::Credentials));
        }
        if request
            .headers
            .iter()
            .any(|(name, _)| name.trim().eq_ignore_ascii_case("host"))
        {
            return Err(NetError::Rejected(RejectReason::HostHeader));
        }

        let (host, literal): (String, Option<IpAddr>) = match url.host() {
            Some(Host::Domain(domain)) => (domain.to_string(), None),
            Some(Host::Ipv4(ip)) => (ip.to_string(), Some(IpAddr::V4(ip))),
            Some(Host::Ipv6(ip)) => (ip.to_string(), Some(IpAddr::V6(ip))),
            None => return Err(NetError::InvalidUrl("URL has no host".to_string())),
        };

        if !self.hosts.permits(&host) {
            debug!(host = %host, "outbound host not in allowlist");
            return Err(NetError::Rejected(RejectReason::HostNotAllowed));
        }

        let port = url.port_or_known_default().unwrap_or(80);
        let addrs = match literal {
            Some(ip) => vec![ip],
            None => self.resolver.resolve(&host, port).await.map_err(|source| {
                if is_handle_exhaustion(&source) {
                    NetError::HandlesExhausted
                } else {
                    NetError::Resolve {
                        host: host.clone(),
                        source,
                    }
                }
            })?,
        };

        let Some(first) = addrs.first().copied() else {
            return Err(NetError::Resolve {
                host,
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
            });
        };
        for ip in &addrs {
            if let Err(class) = self.policy.check(*ip) {
                debug!(host = %host, address = %ip, class = %class, "outbound address rejected");
                return Err(NetError::Rejected(RejectReason::Address(class)));
            }
        }

        debug!(host = %host, address = %first, "outbound destination pinned");
        Ok(Pinned {
            url,
            host,
            addr: SocketAddr::new(first, port),
        })
    }
}

/// Send to an already-validated address. The client is built for this one
/// request with DNS overridden for its host, so nothing is re-resolved.
pub(crate) async fn send_pinned(
    config: &NetworkConfig,
    pinned: Pinned,
    request: FetchRequest,
) -> Result<FetchResponse, NetError> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .resolve(&pinned.host, pinned.addr)
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .timeout(Duration::from_millis(config.request_timeout_ms))
        .user_agent(config.user_agent.as_str())
        .build()
        .map_err(map_reqwest_error)?;

    let mut builder = client.request(request.method.to_reqwest(), pinned.url.clone());
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request.body.into_bytes() {
        builder = builder.body(body);
    }

    let mut response = builder.send().await.map_err(map_reqwest_error)?;
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect();
    let redirect = if response.status().is_redirection() {
        response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    } else {
        None
    };

    let max = config.max_response_bytes;
    let mut body = BytesMut::new();
    let mut truncated = false;
    while let Some(chunk) = response.chunk().await.map_err(map_reqwest_error)? {
        let room = max - body.len();
        if chunk.len() > room {
            body.extend_from_slice(&chunk[..room]);
            truncated = true;
            break;
        }
        body.extend_from_slice(&chunk);
    }

    Ok(FetchResponse {
        status,
        headers,
        body: body.freeze(),
        truncated,
        redirect,
        url: pinned.url.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::http::HttpMethod;
    use crate::net::resolve::{ResolveFuture, StaticResolver};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn factory(resolver: impl Resolve + 'static) -> NetworkClientFactory {
        NetworkClientFactory::new(NetworkConfig::default())
            .unwrap()
            .with_resolver(Arc::new(resolver))
    }

    fn hosts(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn get(url: &str) -> FetchRequest {
        FetchRequest::new(HttpMethod::Get, url)
    }

    #[tokio::test]
    async fn rejects_before_resolution() {
        let client = factory(StaticResolver::new()).open_client(Some(&hosts(&["api.example.com"])));

        let err = client.prepare(&get("ftp://api.example.com/")).await.unwrap_err();
        assert!(matches!(err, NetError::Rejected(RejectReason::Scheme)));

        let err = client
            .prepare(&get("https://user:pw@api.example.com/"))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Rejected(RejectReason::Credentials)));

        let err = client
            .prepare(&get("https://api.example.com/").with_header("Host", "internal"))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Rejected(RejectReason::HostHeader)));

        // Would fail to resolve if it got that far.
        let err = client.prepare(&get("https://other.example.com/")).await.unwrap_err();
        assert!(matches!(err, NetError::Rejected(RejectReason::HostNotAllowed)));
    }

    #[tokio::test]
    async fn no_allowlist_means_no_network() {
        let resolver = StaticResolver::new().with_host("example.com", ["93.184.216.34".parse().unwrap()]);
        let client = factory(resolver).open_client(None);
        let err = client.prepare(&get("https://example.com/")).await.unwrap_err();
        assert!(matches!(err, NetError::Rejected(RejectReason::HostNotAllowed)));
    }

    #[tokio::test]
    async fn blocked_addresses_are_rejected() {
        let resolver = StaticResolver::new()
            .with_host("meta.test", ["169.254.169.254".parse().unwrap()])
            .with_host("mixed.test", ["93.184.216.34".parse().unwrap(), "10.0.0.1".parse().unwrap()])
            .with_host("ok.test", ["93.184.216.34".parse().unwrap()]);
        let client = factory(resolver).open_client(Some(&hosts(&["*"])));

        let err = client.prepare(&get("http://meta.test/latest")).await.unwrap_err();
        assert!(matches!(
            err,
            NetError::Rejected(RejectReason::Address(AddressClass::Metadata))
        ));
        let err = client.prepare(&get("http://mixed.test/")).await.unwrap_err();
        assert!(matches!(
            err,
            NetError::Rejected(RejectReason::Address(AddressClass::Private))
        ));
        let err = client.prepare(&get("http://[::1]:8080/")).await.unwrap_err();
        assert!(matches!(
            err,
            NetError::Rejected(RejectReason::Address(AddressClass::Loopback))
        ));

        let pinned = client.prepare(&get("https://ok.test/x")).await.unwrap();
        assert_eq!(pinned.addr, "93.184.216.34:443".parse().unwrap());
        assert_eq!(pinned.host, "ok.test");
    }

    /// Answers with a public address once, then with loopback.
    #[derive(Debug, Default)]
    struct Rebinding {
        calls: AtomicUsize,
    }

    impl Resolve for Rebinding {
        fn resolve(&self, _host: &str, _port: u16) -> ResolveFuture<'_> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let ip = if n == 0 { "93.184.216.34" } else { "127.0.0.1" };
                Ok(vec![ip.parse().unwrap()])
            })
        }
    }

    #[tokio::test]
    async fn every_request_resolves_again() {
        let client = factory(Rebinding::default()).open_client(Some(&hosts(&["rebind.test"])));
        assert!(client.prepare(&get("http://rebind.test/")).await.is_ok());
        let err = client.prepare(&get("http://rebind.test/")).await.unwrap_err();
        assert!(matches!(
            err,
            NetError::Rejected(RejectReason::Address(AddressClass::Loopback))
        ));
    }

    async fn serve_once(response: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        addr
    }

    #[tokio::test]
    async fn redirects_are_returned_not_followed() {
        for status in ["301 Moved Permanently", "302 Found", "307 Temporary Redirect"] {
            let response: &'static str = Box::leak(
                format!(
                    "HTTP/1.1 {status}\r\nLocation: http://169.254.169.254/latest\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                )
                .into_boxed_str(),
            );
            let addr = serve_once(response).await;
            let pinned = Pinned {
                url: Url::parse(&format!("http://redirect.test:{}/start", addr.port())).unwrap(),
                host: "redirect.test".to_string(),
                addr,
            };
            let resp = send_pinned(&NetworkConfig::default(), pinned, get("unused"))
                .await
                .unwrap();
            assert!(resp.is_redirect());
            assert_eq!(resp.redirect.as_deref(), Some("http://169.254.169.254/latest"));
            assert!(resp.body.is_empty());
        }
    }

    #[tokio::test]
    async fn response_body_is_capped() {
        let addr = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 10\r\nConnection: close\r\n\r\n0123456789",
        )
        .await;
        let config = NetworkConfig {
            max_response_bytes: 4,
            ..NetworkConfig::default()
        };
        let pinned = Pinned {
            url: Url::parse(&format!("http://body.test:{}/", addr.port())).unwrap(),
            host: "body.test".to_string(),
            addr,
        };
        let resp = send_pinned(&config, pinned, get("unused")).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(&resp.body[..], b"0123");
        assert!(resp.truncated);
    }
}
