//! Outbound network access for running scripts.
//!
//! A destination is checked in order: scheme and URL shape, host allowlist
//! (before any lookup), resolution, then every resolved address against the
//! address policy. The first address is pinned for the request and redirects
//! are never followed.

mod address;
mod client;
mod http;
mod resolve;

pub use address::{AddressClass, AddressPolicy, HostAllowlist, canonical, classify};
pub use client::{NetError, NetworkClientFactory, NetworkConfig, OutboundClient, RejectReason};
pub use http::{FetchRequest, FetchResponse, HttpMethod, RequestBody};
pub use resolve::{Resolve, ResolveFuture, StaticResolver, SystemResolver};
