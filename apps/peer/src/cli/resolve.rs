use std::net::Ipv4Addr;

use eyre::{eyre, WrapErr};
use trust_dns_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};

/// Turn a hostname-or-dotted-quad argument into an IPv4 address.
pub async fn resolve(name: &str) -> eyre::Result<Ipv4Addr> {
    if let Ok(ip) = name.parse::<Ipv4Addr>() {
        return Ok(ip);
    }

    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
    let lookup = resolver
        .lookup_ip(name)
        .await
        .wrap_err_with(|| format!("failed to resolve {name:?}"))?;

    lookup
        .iter()
        .find_map(|ip| match ip {
            std::net::IpAddr::V4(v4) => Some(v4),
            std::net::IpAddr::V6(_) => None,
        })
        .ok_or_else(|| eyre!("{name:?} has no IPv4 address"))
}
