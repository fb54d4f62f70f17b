//! Resolving a service into the set of servers to talk to.
//!
//! Each I/O thread asks its [`ServiceDiscovery`] for the current servers once
//! per rebalance period. Servers that appear get a new session, servers that
//! disappear stop receiving new requests.

use crate::error::Error;
use std::{
    fmt, io,
    net::{SocketAddr, ToSocketAddrs},
};

/// A source of server addresses for a service.
pub trait ServiceDiscovery: Send + Sync + 'static {
    /// Get the addresses of the servers currently providing the service.
    fn discover(&self) -> io::Result<Vec<SocketAddr>>;
}

impl<F> ServiceDiscovery for F
where
    F: Fn() -> io::Result<Vec<SocketAddr>> + Send + Sync + 'static,
{
    fn discover(&self) -> io::Result<Vec<SocketAddr>> {
        (self)()
    }
}

/// A fixed set of servers.
#[derive(Clone, Debug)]
pub struct StaticServers(Vec<SocketAddr>);

impl StaticServers {
    pub fn new(servers: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self(servers.into_iter().collect())
    }
}

impl ServiceDiscovery for StaticServers {
    fn discover(&self) -> io::Result<Vec<SocketAddr>> {
        Ok(self.0.clone())
    }
}

/// A comma separated list of `host:port` entries, resolved anew on every
/// discovery so that DNS changes are picked up.
///
/// Only the first address a host name resolves to is used.
#[derive(Clone)]
pub struct ServiceList {
    entries: Vec<(String, u16)>,
}

impl ServiceList {
    /// Parse a service list such as `"psg1:2180,psg2:2180"`.
    pub fn parse(list: &str) -> Result<Self, Error> {
        let mut entries = Vec::new();

        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let parsed = entry
                .rsplit_once(':')
                .and_then(|(host, port)| Some((host, port.parse::<u16>().ok()?)))
                .filter(|(host, _)| !host.is_empty());

            match parsed {
                Some((host, port)) => {
                    let host = host.trim_start_matches('[').trim_end_matches(']');
                    entries.push((host.to_owned(), port));
                }
                None => {
                    return Err(Error::Discovery(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid server address '{}'", entry),
                    )))
                }
            }
        }

        if entries.is_empty() {
            return Err(Error::Discovery(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no servers in service '{}'", list),
            )));
        }

        Ok(Self { entries })
    }
}

impl ServiceDiscovery for ServiceList {
    fn discover(&self) -> io::Result<Vec<SocketAddr>> {
        let mut servers = Vec::with_capacity(self.entries.len());

        for (host, port) in &self.entries {
            match (host.as_str(), *port).to_socket_addrs() {
                Ok(mut addresses) => match addresses.next() {
                    Some(address) => servers.push(address),
                    None => tracing::warn!("'{}' did not resolve to any address", host),
                },
                Err(e) => tracing::warn!("failed to resolve '{}': {}", host, e),
            }
        }

        Ok(servers)
    }
}

impl fmt::Debug for ServiceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(host, port)| format!("{}:{}", host, port)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    static_assertions::assert_impl_all!(StaticServers: ServiceDiscovery);
    static_assertions::assert_impl_all!(ServiceList: ServiceDiscovery);

    #[test]
    fn service_list_resolves_every_entry() {
        let list = ServiceList::parse("127.0.0.1:2180, 127.0.0.1:2181,[::1]:2182").unwrap();

        assert_eq!(
            list.discover().unwrap(),
            vec![
                "127.0.0.1:2180".parse::<SocketAddr>().unwrap(),
                "127.0.0.1:2181".parse().unwrap(),
                "[::1]:2182".parse().unwrap(),
            ]
        );
    }

    #[test_case("" ; "empty")]
    #[test_case("psg" ; "missing port")]
    #[test_case("psg:http" ; "bad port")]
    #[test_case(":2180" ; "missing host")]
    #[test_case("psg:2180,psg" ; "one bad entry")]
    fn invalid_service_lists(list: &str) {
        assert!(matches!(ServiceList::parse(list), Err(Error::Discovery(_))));
    }

    #[test]
    fn closures_are_discovery() {
        let discovery = || -> io::Result<Vec<SocketAddr>> { Ok(vec!["10.0.0.1:80".parse().unwrap()]) };

        assert_eq!(discovery.discover().unwrap().len(), 1);
    }
}
