//! iproute2 backend.
//!
//! Listings use `ip -j` and are decoded with serde; mutations are plain
//! `ip ... add/del` invocations. The child process inherits the network
//! namespace of the calling thread.

use ipnetwork::Ipv4Network;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs::File;
use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use super::{
    Link, Namespaces, Netlink, PolicyRule, Route, RouteScope, DEFAULT_TABLE, LOCAL_TABLE,
    MAIN_TABLE,
};
use crate::error::{NetlinkError, NetnsError};
use crate::netns;

/// Runs `ip` in the namespace of the calling thread
#[derive(Debug, Clone)]
pub struct IpRoute2 {
    bin: PathBuf,
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self::new()
    }
}

impl IpRoute2 {
    pub fn new() -> Self {
        Self {
            bin: PathBuf::from("ip"),
        }
    }

    fn run(&self, args: &[String]) -> Result<Vec<u8>, NetlinkError> {
        let cmd = args.join(" ");
        debug!(cmd = %cmd, "Running ip");

        let output = Command::new(&self.bin)
            .args(args)
            .output()
            .map_err(|source| NetlinkError::Spawn {
                cmd: cmd.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(NetlinkError::Command {
                cmd,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output.stdout)
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn decode<T: DeserializeOwned>(cmd: &str, stdout: &[u8]) -> Result<Vec<T>, NetlinkError> {
    // Some iproute2 versions print nothing at all for an empty listing.
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(stdout).map_err(|source| NetlinkError::Decode {
        cmd: cmd.to_string(),
        source,
    })
}

#[derive(Debug, Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    mtu: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct IpAddrEntry {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    family: String,
    #[serde(default)]
    local: Option<String>,
    #[serde(default)]
    prefixlen: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct IpRoute {
    dst: String,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    dev: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    prefsrc: Option<String>,
    #[serde(default)]
    table: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpRule {
    priority: u32,
    #[serde(default)]
    src: Option<String>,
    #[serde(default)]
    srclen: Option<u8>,
    #[serde(default)]
    dst: Option<String>,
    #[serde(default)]
    dstlen: Option<u8>,
    #[serde(default)]
    table: Option<String>,
}

/// Numeric id of a table as printed by ip.
///
/// Names from `/etc/iproute2/rt_tables` other than the reserved ones have no
/// id in the output and yield `None`; ENI tables are always printed as numbers.
fn parse_table(table: &str) -> Option<u32> {
    match table {
        "main" => Some(MAIN_TABLE),
        "local" => Some(LOCAL_TABLE),
        "default" => Some(DEFAULT_TABLE),
        n => n.parse().ok(),
    }
}

fn parse_addr(addr: &str) -> Result<Ipv4Addr, NetlinkError> {
    addr.parse()
        .map_err(|_| NetlinkError::Parse(format!("IPv4 address {:?}", addr)))
}

fn parse_network(addr: &str, prefix: u8) -> Result<Ipv4Network, NetlinkError> {
    Ipv4Network::new(parse_addr(addr)?, prefix)
        .map_err(|_| NetlinkError::Parse(format!("network {}/{}", addr, prefix)))
}

/// Route destinations are printed as `default`, a bare host address or a CIDR
fn parse_route_dst(dst: &str) -> Result<Ipv4Network, NetlinkError> {
    match dst {
        "default" => Ok(super::default_network()),
        d => match d.split_once('/') {
            Some((addr, prefix)) => {
                let prefix = prefix
                    .parse()
                    .map_err(|_| NetlinkError::Parse(format!("route destination {:?}", d)))?;
                parse_network(addr, prefix)
            }
            None => parse_network(d, 32),
        },
    }
}

fn parse_scope(scope: Option<&str>) -> RouteScope {
    match scope {
        Some("link") => RouteScope::Link,
        Some("host") => RouteScope::Host,
        _ => RouteScope::Universe,
    }
}

/// `src`/`dst` of a rule; `all` means no selector and a missing length means a host prefix
fn parse_selector(addr: Option<&str>, len: Option<u8>) -> Result<Option<Ipv4Network>, NetlinkError> {
    match addr {
        None | Some("all") => Ok(None),
        Some(a) => parse_network(a, len.unwrap_or(32)).map(Some),
    }
}

pub(crate) fn parse_links(stdout: &[u8]) -> Result<Vec<Link>, NetlinkError> {
    let links: Vec<IpLink> = decode("link show", stdout)?;
    Ok(links
        .into_iter()
        .map(|l| Link {
            index: l.ifindex,
            name: l.ifname,
            mac: l.address,
            mtu: l.mtu,
        })
        .collect())
}

pub(crate) fn parse_addresses(stdout: &[u8]) -> Result<Vec<Ipv4Network>, NetlinkError> {
    let entries: Vec<IpAddrEntry> = decode("addr show", stdout)?;
    let mut addrs = Vec::new();
    for info in entries.into_iter().flat_map(|e| e.addr_info) {
        if info.family != "inet" {
            continue;
        }
        if let Some(local) = info.local {
            addrs.push(parse_network(&local, info.prefixlen.unwrap_or(32))?);
        }
    }
    Ok(addrs)
}

pub(crate) fn parse_routes(stdout: &[u8], table: u32) -> Result<Vec<Route>, NetlinkError> {
    let routes: Vec<IpRoute> = decode("route show", stdout)?;
    routes
        .into_iter()
        .map(|r| {
            Ok(Route {
                dst: parse_route_dst(&r.dst)?,
                dev: r.dev,
                gateway: r.gateway.as_deref().map(parse_addr).transpose()?,
                src: r.prefsrc.as_deref().map(parse_addr).transpose()?,
                // The listing is filtered by `table`, so a named table is that one
                table: r.table.as_deref().and_then(parse_table).unwrap_or(table),
                scope: parse_scope(r.scope.as_deref()),
            })
        })
        .collect()
}

pub(crate) fn parse_rules(stdout: &[u8]) -> Result<Vec<PolicyRule>, NetlinkError> {
    let rules: Vec<IpRule> = decode("rule show", stdout)?;
    let mut parsed = Vec::new();
    for r in rules {
        // goto/nop rules have no table to match on
        let Some(table) = r.table.as_deref() else {
            continue;
        };
        let Some(id) = parse_table(table) else {
            debug!(table, priority = r.priority, "Skipping rule for named table");
            continue;
        };
        parsed.push(PolicyRule {
            priority: r.priority,
            table: id,
            src: parse_selector(r.src.as_deref(), r.srclen)?,
            dst: parse_selector(r.dst.as_deref(), r.dstlen)?,
        });
    }
    Ok(parsed)
}

fn route_args(verb: &str, route: &Route) -> Vec<String> {
    let mut a = args(&["-4", "route", verb, &route.dst.to_string()]);
    if let Some(gw) = route.gateway {
        a.extend(args(&["via", &gw.to_string()]));
    }
    if let Some(dev) = &route.dev {
        a.extend(args(&["dev", dev]));
    }
    if let Some(src) = route.src {
        a.extend(args(&["src", &src.to_string()]));
    }
    a.extend(args(&[
        "scope",
        route.scope.as_str(),
        "table",
        &route.table.to_string(),
    ]));
    a
}

fn rule_args(verb: &str, rule: &PolicyRule) -> Vec<String> {
    let mut a = args(&["-4", "rule", verb]);
    if let Some(src) = rule.src {
        a.extend(args(&["from", &src.to_string()]));
    }
    if let Some(dst) = rule.dst {
        a.extend(args(&["to", &dst.to_string()]));
    }
    a.extend(args(&[
        "table",
        &rule.table.to_string(),
        "priority",
        &rule.priority.to_string(),
    ]));
    a
}

impl Netlink for IpRoute2 {
    fn links(&self) -> Result<Vec<Link>, NetlinkError> {
        let stdout = self.run(&args(&["-j", "link", "show"]))?;
        parse_links(&stdout)
    }

    fn add_veth(
        &self,
        name: &str,
        peer: &str,
        mtu: u32,
        peer_netns: &Path,
    ) -> Result<(), NetlinkError> {
        let mtu = mtu.to_string();
        let netns = peer_netns.to_string_lossy();
        self.run(&args(&[
            "link", "add", name, "mtu", &mtu, "type", "veth", "peer", "name", peer, "mtu", &mtu,
            "netns", &netns,
        ]))?;
        Ok(())
    }

    fn set_link_up(&self, name: &str) -> Result<(), NetlinkError> {
        self.run(&args(&["link", "set", "dev", name, "up"]))?;
        Ok(())
    }

    fn del_link(&self, name: &str) -> Result<(), NetlinkError> {
        self.run(&args(&["link", "del", "dev", name]))?;
        Ok(())
    }

    fn addresses(&self, link: &str) -> Result<Vec<Ipv4Network>, NetlinkError> {
        let stdout = self.run(&args(&["-j", "-4", "addr", "show", "dev", link]))?;
        parse_addresses(&stdout)
    }

    fn add_address(&self, link: &str, addr: Ipv4Network) -> Result<(), NetlinkError> {
        self.run(&args(&["-4", "addr", "add", &addr.to_string(), "dev", link]))?;
        Ok(())
    }

    fn routes(&self, table: u32, scope: Option<RouteScope>) -> Result<Vec<Route>, NetlinkError> {
        let mut a = args(&["-j", "-4", "route", "show", "table", &table.to_string()]);
        if let Some(scope) = scope {
            a.extend(args(&["scope", scope.as_str()]));
        }
        let stdout = self.run(&a)?;
        let mut routes = parse_routes(&stdout, table)?;
        // ip leaves the scope out of the output when it was used as the filter
        if let Some(scope) = scope {
            routes.iter_mut().for_each(|r| r.scope = scope);
        }
        Ok(routes)
    }

    fn add_route(&self, route: &Route) -> Result<(), NetlinkError> {
        self.run(&route_args("add", route))?;
        Ok(())
    }

    fn del_route(&self, route: &Route) -> Result<(), NetlinkError> {
        self.run(&route_args("del", route))?;
        Ok(())
    }

    fn rules(&self) -> Result<Vec<PolicyRule>, NetlinkError> {
        let stdout = self.run(&args(&["-j", "-4", "rule", "show"]))?;
        parse_rules(&stdout)
    }

    fn add_rule(&self, rule: &PolicyRule) -> Result<(), NetlinkError> {
        self.run(&rule_args("add", rule))?;
        Ok(())
    }

    fn del_rule(&self, rule: &PolicyRule) -> Result<(), NetlinkError> {
        self.run(&rule_args("del", rule))?;
        Ok(())
    }

    fn add_neighbor(&self, link: &str, ip: Ipv4Addr, mac: &str) -> Result<(), NetlinkError> {
        self.run(&args(&[
            "-4",
            "neigh",
            "add",
            &ip.to_string(),
            "lladdr",
            mac,
            "dev",
            link,
            "nud",
            "permanent",
        ]))?;
        Ok(())
    }
}

/// The host network namespace of this process
pub struct HostNetwork {
    ip: IpRoute2,
    // Held open so `host_ns_path` stays valid while inside other namespaces.
    _host_ns: File,
    host_ns_path: PathBuf,
}

impl HostNetwork {
    /// Capture the namespace the calling thread currently lives in
    pub fn new() -> Result<Self, NetnsError> {
        let host_ns = netns::open_netns(Path::new("/proc/thread-self/ns/net"))?;
        let host_ns_path = PathBuf::from(format!(
            "/proc/{}/fd/{}",
            std::process::id(),
            host_ns.as_raw_fd()
        ));

        Ok(Self {
            ip: IpRoute2::new(),
            _host_ns: host_ns,
            host_ns_path,
        })
    }
}

impl Namespaces for HostNetwork {
    type Handle = IpRoute2;

    fn host(&self) -> &IpRoute2 {
        &self.ip
    }

    fn host_netns(&self) -> &Path {
        &self.host_ns_path
    }

    fn with_netns<T, E, F>(&self, netns: &Path, f: F) -> Result<T, E>
    where
        F: FnOnce(&IpRoute2) -> Result<T, E>,
        E: From<NetnsError>,
    {
        netns::in_netns(netns, || f(&self.ip))
    }
}
