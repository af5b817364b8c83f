//! Name resolution seam for the network client.
//!
//! The client resolves once per request and pins the answer, so the
//! resolver is only ever asked for addresses, never for connections.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;

/// Future type alias for resolver results
pub type ResolveFuture<'a> = Pin<Box<dyn Future<Output = io::Result<Vec<IpAddr>>> + Send + 'a>>;

/// Turns a host name into the addresses a request may connect to.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug)]
/// struct Fixed;
///
/// impl Resolve for Fixed {
///     fn resolve(&self, _host: &str, _port: u16) -> ResolveFuture<'_> {
///         Box::pin(async { Ok(vec!["93.184.216.34".parse().unwrap()]) })
///     }
/// }
/// ```
pub trait Resolve: Send + Sync + std::fmt::Debug {
    fn resolve(&self, host: &str, port: u16) -> ResolveFuture<'_>;
}

/// Resolver backed by the operating system (`getaddrinfo` via tokio)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> ResolveFuture<'_> {
        let host = host.to_string();
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host.as_str(), port)).await?;
            let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
            ips.dedup();
            Ok(ips)
        })
    }
}

/// Fixed host table. Unknown names fail to resolve.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the answer for `host`.
    pub fn with_host(mut self, host: &str, addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        self.hosts
            .insert(host.to_ascii_lowercase(), addrs.into_iter().collect());
        self
    }
}

impl Resolve for StaticResolver {
    fn resolve(&self, host: &str, _port: u16) -> ResolveFuture<'_> {
        let answer = self.hosts.get(&host.to_ascii_lowercase()).cloned();
        let host = host.to_string();
        Box::pin(async move {
            match answer {
                Some(addrs) if !addrs.is_empty() => Ok(addrs),
                _ => Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address for {host}"),
                )),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_resolver_is_case_insensitive() {
        let resolver =
            StaticResolver::new().with_host("API.example.com", ["93.184.216.34".parse().unwrap()]);
        let addrs = resolver.resolve("api.EXAMPLE.com", 443).await.unwrap();
        assert_eq!(addrs, vec!["93.184.216.34".parse::<IpAddr>().unwrap()]);
        assert!(resolver.resolve("other.example.com", 443).await.is_err());
    }

    #[tokio::test]
    async fn system_resolver_handles_literals() {
        let addrs = SystemResolver.resolve("127.0.0.1", 80).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }
}
