//! Kernel networking state as seen by the plugin.
//!
//! `Netlink` is the set of operations available inside one network
//! namespace; `Namespaces` hands out the host handle and runs closures
//! inside a container namespace. The production backend drives iproute2
//! (`iproute2` module); tests use an in-memory kernel.

use ipnetwork::Ipv4Network;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::{NetlinkError, NetnsError};

pub mod iproute2;

#[cfg(test)]
pub(crate) mod fake;

pub use iproute2::{HostNetwork, IpRoute2};

pub const MAIN_TABLE: u32 = 254;
pub const LOCAL_TABLE: u32 = 255;
pub const DEFAULT_TABLE: u32 = 253;

/// A network link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mac: Option<String>,
    pub mtu: Option<u32>,
}

impl Link {
    /// Case-insensitive comparison of the link's hardware address
    pub fn has_mac(&self, mac: &str) -> bool {
        self.mac
            .as_deref()
            .map(|m| m.eq_ignore_ascii_case(mac))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteScope {
    Universe,
    Link,
    Host,
}

impl RouteScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteScope::Universe => "global",
            RouteScope::Link => "link",
            RouteScope::Host => "host",
        }
    }
}

/// An IPv4 route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub dst: Ipv4Network,
    pub dev: Option<String>,
    pub gateway: Option<Ipv4Addr>,
    pub src: Option<Ipv4Addr>,
    pub table: u32,
    pub scope: RouteScope,
}

impl Route {
    /// Link-scoped route for `dst` out of `dev` in `table`
    pub fn scoped(dev: &str, dst: Ipv4Network, table: u32) -> Self {
        Self {
            dst,
            dev: Some(dev.to_string()),
            gateway: None,
            src: None,
            table,
            scope: RouteScope::Link,
        }
    }

    /// Default route through `gateway`
    pub fn default_via(dev: &str, gateway: Ipv4Addr, src: Option<Ipv4Addr>) -> Self {
        Self {
            dst: default_network(),
            dev: Some(dev.to_string()),
            gateway: Some(gateway),
            src,
            table: MAIN_TABLE,
            scope: RouteScope::Universe,
        }
    }

    pub fn is_default(&self) -> bool {
        self.dst.prefix() == 0
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dst)?;
        if let Some(gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        if let Some(dev) = &self.dev {
            write!(f, " dev {}", dev)?;
        }
        write!(f, " table {} scope {}", self.table, self.scope.as_str())
    }
}

/// A routing policy rule selecting `table` for traffic from `src` or to `dst`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyRule {
    pub priority: u32,
    pub table: u32,
    pub src: Option<Ipv4Network>,
    pub dst: Option<Ipv4Network>,
}

impl PolicyRule {
    /// Rule sending traffic destined to `dst` to `table`
    pub fn to_table(dst: Ipv4Network, table: u32, priority: u32) -> Self {
        Self {
            priority,
            table,
            src: None,
            dst: Some(dst),
        }
    }

    /// Rule sending traffic sourced from `src` to `table`
    pub fn from_table(src: Ipv4Network, table: u32, priority: u32) -> Self {
        Self {
            priority,
            table,
            src: Some(src),
            dst: None,
        }
    }

    /// Whether this rule matches on `prefix` as either source or destination
    pub fn matches_prefix(&self, prefix: &Ipv4Network) -> bool {
        self.src.as_ref() == Some(prefix) || self.dst.as_ref() == Some(prefix)
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.priority)?;
        if let Some(src) = self.src {
            write!(f, " from {}", src)?;
        }
        if let Some(dst) = self.dst {
            write!(f, " to {}", dst)?;
        }
        write!(f, " lookup {}", self.table)
    }
}

/// Host route for a single address
pub fn host_network(addr: Ipv4Addr) -> Ipv4Network {
    Ipv4Network::from(addr)
}

pub fn default_network() -> Ipv4Network {
    Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).expect("prefix 0 is always valid")
}

/// Kernel operations scoped to a single network namespace
pub trait Netlink {
    fn links(&self) -> Result<Vec<Link>, NetlinkError>;

    fn link_by_name(&self, name: &str) -> Result<Option<Link>, NetlinkError> {
        Ok(self.links()?.into_iter().find(|l| l.name == name))
    }

    /// Create a veth pair whose peer end is placed in `peer_netns`
    fn add_veth(
        &self,
        name: &str,
        peer: &str,
        mtu: u32,
        peer_netns: &Path,
    ) -> Result<(), NetlinkError>;

    fn set_link_up(&self, name: &str) -> Result<(), NetlinkError>;

    fn del_link(&self, name: &str) -> Result<(), NetlinkError>;

    fn addresses(&self, link: &str) -> Result<Vec<Ipv4Network>, NetlinkError>;

    fn add_address(&self, link: &str, addr: Ipv4Network) -> Result<(), NetlinkError>;

    /// Routes in `table`, optionally restricted to one scope
    fn routes(&self, table: u32, scope: Option<RouteScope>) -> Result<Vec<Route>, NetlinkError>;

    fn add_route(&self, route: &Route) -> Result<(), NetlinkError>;

    fn del_route(&self, route: &Route) -> Result<(), NetlinkError>;

    fn rules(&self) -> Result<Vec<PolicyRule>, NetlinkError>;

    fn add_rule(&self, rule: &PolicyRule) -> Result<(), NetlinkError>;

    fn del_rule(&self, rule: &PolicyRule) -> Result<(), NetlinkError>;

    /// Add a permanent neighbor entry
    fn add_neighbor(&self, link: &str, ip: Ipv4Addr, mac: &str) -> Result<(), NetlinkError>;
}

/// Access to the host namespace and scoped entry into other namespaces
pub trait Namespaces {
    type Handle: Netlink;

    /// Handle operating on the host namespace
    fn host(&self) -> &Self::Handle;

    /// Path under which the host namespace can be opened while inside another
    fn host_netns(&self) -> &Path;

    /// Run `f` inside `netns`, restoring the host namespace afterwards
    fn with_netns<T, E, F>(&self, netns: &Path, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self::Handle) -> Result<T, E>,
        E: From<NetnsError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_prefix_match() {
        let pod = host_network(Ipv4Addr::new(10, 0, 0, 5));
        let other = host_network(Ipv4Addr::new(10, 0, 0, 6));

        let to = PolicyRule::to_table(pod, 1003, 2047);
        let from = PolicyRule::from_table(pod, 1003, 2048);
        assert!(to.matches_prefix(&pod));
        assert!(from.matches_prefix(&pod));
        assert!(!to.matches_prefix(&other));
    }

    #[test]
    fn test_default_network() {
        let route = Route::default_via("eth0", Ipv4Addr::new(10, 0, 0, 1), None);
        assert!(route.is_default());
        assert_eq!(default_network().to_string(), "0.0.0.0/0");
    }

    #[test]
    fn test_link_mac_case_insensitive() {
        let link = Link {
            index: 4,
            name: "eth3".into(),
            mac: Some("AA:BB:CC:DD:EE:01".into()),
            mtu: Some(9001),
        };
        assert!(link.has_mac("aa:bb:cc:dd:ee:01"));
        assert!(!link.has_mac("aa:bb:cc:dd:ee:02"));
    }
}
