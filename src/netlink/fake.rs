//! In-memory kernel used by unit tests.
//!
//! Mirrors the kernel behaviour the plugin depends on: adding a duplicate
//! route fails, duplicate rules are accepted, deleting either end of a veth
//! pair removes both ends and the routes through them.

use ipnetwork::Ipv4Network;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use super::{Link, Namespaces, Netlink, PolicyRule, Route, RouteScope};
use crate::error::{NetlinkError, NetnsError};

pub const HOST_NS: &str = "/proc/self/ns/net";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub link: String,
    pub ip: Ipv4Addr,
    pub mac: String,
    pub permanent: bool,
}

#[derive(Debug, Default)]
pub struct FakeNs {
    pub links: Vec<Link>,
    pub addrs: BTreeMap<String, Vec<Ipv4Network>>,
    pub routes: Vec<Route>,
    pub rules: Vec<PolicyRule>,
    pub neighbors: Vec<Neighbor>,
    pub up: HashSet<String>,
}

#[derive(Debug, Default)]
struct Kernel {
    namespaces: BTreeMap<PathBuf, FakeNs>,
    /// (ns, link) pairs joined by a veth
    peers: Vec<((PathBuf, String), (PathBuf, String))>,
    next_index: u32,
    fail_rule_deletes: HashSet<PolicyRule>,
    fail_link_deletes: HashSet<String>,
    fail_veth: bool,
    calls: Vec<String>,
}

impl Kernel {
    fn ns_mut(&mut self, ns: &Path) -> &mut FakeNs {
        self.namespaces.entry(ns.to_path_buf()).or_default()
    }

    fn next_mac(&mut self) -> String {
        self.next_index += 1;
        format!("02:00:00:00:00:{:02x}", self.next_index)
    }
}

fn error(cmd: &str, stderr: &str) -> NetlinkError {
    NetlinkError::Command {
        cmd: cmd.to_string(),
        stderr: stderr.to_string(),
    }
}

/// A handle bound to one fake namespace
#[derive(Clone)]
pub struct FakeHandle {
    kernel: Rc<RefCell<Kernel>>,
    ns: PathBuf,
}

/// Fake host plus any number of container namespaces
pub struct FakeNetwork {
    host: FakeHandle,
    host_path: PathBuf,
}

impl FakeNetwork {
    pub fn new() -> Self {
        let kernel = Rc::new(RefCell::new(Kernel {
            next_index: 1,
            ..Default::default()
        }));
        kernel.borrow_mut().ns_mut(Path::new(HOST_NS));

        Self {
            host: FakeHandle {
                kernel,
                ns: PathBuf::from(HOST_NS),
            },
            host_path: PathBuf::from(HOST_NS),
        }
    }

    pub fn add_netns(&self, path: &str) {
        self.host.kernel.borrow_mut().ns_mut(Path::new(path));
    }

    pub fn add_host_link(&self, name: &str, mac: &str) {
        self.add_link(HOST_NS, name, mac);
    }

    pub fn add_link(&self, ns: &str, name: &str, mac: &str) {
        let mut kernel = self.host.kernel.borrow_mut();
        kernel.next_index += 1;
        let index = kernel.next_index;
        kernel.ns_mut(Path::new(ns)).links.push(Link {
            index,
            name: name.to_string(),
            mac: Some(mac.to_string()),
            mtu: Some(1500),
        });
    }

    pub fn add_address(&self, ns: &str, link: &str, addr: &str) {
        let mut kernel = self.host.kernel.borrow_mut();
        kernel
            .ns_mut(Path::new(ns))
            .addrs
            .entry(link.to_string())
            .or_default()
            .push(addr.parse().unwrap());
    }

    pub fn push_route(&self, ns: &str, route: Route) {
        self.host.kernel.borrow_mut().ns_mut(Path::new(ns)).routes.push(route);
    }

    pub fn push_rule(&self, rule: PolicyRule) {
        self.host.kernel.borrow_mut().ns_mut(Path::new(HOST_NS)).rules.push(rule);
    }

    /// Make deleting `rule` fail
    pub fn fail_rule_delete(&self, rule: PolicyRule) {
        self.host.kernel.borrow_mut().fail_rule_deletes.insert(rule);
    }

    /// Make deleting the link called `name` fail in any namespace
    pub fn fail_link_delete(&self, name: &str) {
        self.host.kernel.borrow_mut().fail_link_deletes.insert(name.to_string());
    }

    pub fn fail_veth_creation(&self) {
        self.host.kernel.borrow_mut().fail_veth = true;
    }

    /// Inspect the state of a namespace
    pub fn ns<T>(&self, ns: &str, f: impl FnOnce(&FakeNs) -> T) -> T {
        let kernel = self.host.kernel.borrow();
        let empty = FakeNs::default();
        f(kernel.namespaces.get(Path::new(ns)).unwrap_or(&empty))
    }

    pub fn host_ns<T>(&self, f: impl FnOnce(&FakeNs) -> T) -> T {
        self.ns(HOST_NS, f)
    }

    /// Mutating calls issued so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.host.kernel.borrow().calls.clone()
    }
}

impl Namespaces for FakeNetwork {
    type Handle = FakeHandle;

    fn host(&self) -> &FakeHandle {
        &self.host
    }

    fn host_netns(&self) -> &Path {
        &self.host_path
    }

    fn with_netns<T, E, F>(&self, netns: &Path, f: F) -> Result<T, E>
    where
        F: FnOnce(&FakeHandle) -> Result<T, E>,
        E: From<NetnsError>,
    {
        if !self.host.kernel.borrow().namespaces.contains_key(netns) {
            return Err(NetnsError::NotFound(netns.to_path_buf()).into());
        }
        let handle = FakeHandle {
            kernel: Rc::clone(&self.host.kernel),
            ns: netns.to_path_buf(),
        };
        f(&handle)
    }
}

impl FakeHandle {
    fn record(&self, call: String) {
        self.kernel.borrow_mut().calls.push(call);
    }
}

impl Netlink for FakeHandle {
    fn links(&self) -> Result<Vec<Link>, NetlinkError> {
        let mut kernel = self.kernel.borrow_mut();
        Ok(kernel.ns_mut(&self.ns).links.clone())
    }

    fn add_veth(
        &self,
        name: &str,
        peer: &str,
        mtu: u32,
        peer_netns: &Path,
    ) -> Result<(), NetlinkError> {
        self.record(format!("veth add {} peer {}", name, peer));
        let mut kernel = self.kernel.borrow_mut();
        if kernel.fail_veth {
            return Err(error("link add", "RTNETLINK answers: Operation not permitted"));
        }
        if !kernel.namespaces.contains_key(peer_netns) {
            return Err(error("link add", "Invalid \"netns\" value"));
        }
        let exists = |ns: &FakeNs, n: &str| ns.links.iter().any(|l| l.name == n);
        if exists(kernel.ns_mut(&self.ns), name) || exists(kernel.ns_mut(peer_netns), peer) {
            return Err(error("link add", "RTNETLINK answers: File exists"));
        }

        for (ns, link) in [(self.ns.clone(), name), (peer_netns.to_path_buf(), peer)] {
            let mac = kernel.next_mac();
            let index = kernel.next_index;
            kernel.ns_mut(&ns).links.push(Link {
                index,
                name: link.to_string(),
                mac: Some(mac),
                mtu: Some(mtu),
            });
        }
        kernel.peers.push((
            (self.ns.clone(), name.to_string()),
            (peer_netns.to_path_buf(), peer.to_string()),
        ));
        Ok(())
    }

    fn set_link_up(&self, name: &str) -> Result<(), NetlinkError> {
        let mut kernel = self.kernel.borrow_mut();
        let ns = kernel.ns_mut(&self.ns);
        if !ns.links.iter().any(|l| l.name == name) {
            return Err(error("link set", "Cannot find device"));
        }
        ns.up.insert(name.to_string());
        Ok(())
    }

    fn del_link(&self, name: &str) -> Result<(), NetlinkError> {
        self.record(format!("link del {}", name));
        let mut kernel = self.kernel.borrow_mut();
        let key = (self.ns.clone(), name.to_string());
        if !kernel.ns_mut(&self.ns).links.iter().any(|l| l.name == name) {
            return Err(error("link del", "Cannot find device"));
        }
        if kernel.fail_link_deletes.contains(name) {
            return Err(error("link del", "RTNETLINK answers: Device or resource busy"));
        }

        let mut doomed = vec![key.clone()];
        if let Some(pos) = kernel.peers.iter().position(|(a, b)| *a == key || *b == key) {
            let (a, b) = kernel.peers.remove(pos);
            doomed = vec![a, b];
        }
        for (ns, link) in doomed {
            let ns = kernel.ns_mut(&ns);
            ns.links.retain(|l| l.name != link);
            ns.addrs.remove(&link);
            ns.routes.retain(|r| r.dev.as_deref() != Some(link.as_str()));
            ns.neighbors.retain(|n| n.link != link);
            ns.up.remove(&link);
        }
        Ok(())
    }

    fn addresses(&self, link: &str) -> Result<Vec<Ipv4Network>, NetlinkError> {
        let mut kernel = self.kernel.borrow_mut();
        let ns = kernel.ns_mut(&self.ns);
        if !ns.links.iter().any(|l| l.name == link) {
            return Err(error("addr show", "Device does not exist"));
        }
        Ok(ns.addrs.get(link).cloned().unwrap_or_default())
    }

    fn add_address(&self, link: &str, addr: Ipv4Network) -> Result<(), NetlinkError> {
        self.record(format!("addr add {} dev {}", addr, link));
        let mut kernel = self.kernel.borrow_mut();
        let ns = kernel.ns_mut(&self.ns);
        let addrs = ns.addrs.entry(link.to_string()).or_default();
        if addrs.contains(&addr) {
            return Err(error("addr add", "RTNETLINK answers: File exists"));
        }
        addrs.push(addr);
        Ok(())
    }

    fn routes(&self, table: u32, scope: Option<RouteScope>) -> Result<Vec<Route>, NetlinkError> {
        let mut kernel = self.kernel.borrow_mut();
        Ok(kernel
            .ns_mut(&self.ns)
            .routes
            .iter()
            .filter(|r| r.table == table && scope.map_or(true, |s| r.scope == s))
            .cloned()
            .collect())
    }

    fn add_route(&self, route: &Route) -> Result<(), NetlinkError> {
        self.record(format!("route add {}", route));
        let mut kernel = self.kernel.borrow_mut();
        let ns = kernel.ns_mut(&self.ns);
        if ns
            .routes
            .iter()
            .any(|r| r.table == route.table && r.dst == route.dst)
        {
            return Err(error("route add", "RTNETLINK answers: File exists"));
        }
        ns.routes.push(route.clone());
        Ok(())
    }

    fn del_route(&self, route: &Route) -> Result<(), NetlinkError> {
        self.record(format!("route del {}", route));
        let mut kernel = self.kernel.borrow_mut();
        let ns = kernel.ns_mut(&self.ns);
        let before = ns.routes.len();
        ns.routes.retain(|r| r != route);
        if ns.routes.len() == before {
            return Err(error("route del", "RTNETLINK answers: No such process"));
        }
        Ok(())
    }

    fn rules(&self) -> Result<Vec<PolicyRule>, NetlinkError> {
        let mut kernel = self.kernel.borrow_mut();
        Ok(kernel.ns_mut(&self.ns).rules.clone())
    }

    fn add_rule(&self, rule: &PolicyRule) -> Result<(), NetlinkError> {
        self.record(format!("rule add {}", rule));
        let mut kernel = self.kernel.borrow_mut();
        kernel.ns_mut(&self.ns).rules.push(rule.clone());
        Ok(())
    }

    fn del_rule(&self, rule: &PolicyRule) -> Result<(), NetlinkError> {
        self.record(format!("rule del {}", rule));
        let mut kernel = self.kernel.borrow_mut();
        if kernel.fail_rule_deletes.contains(rule) {
            return Err(error("rule del", "RTNETLINK answers: Operation not permitted"));
        }
        let rules = &mut kernel.ns_mut(&self.ns).rules;
        match rules.iter().position(|r| r == rule) {
            Some(pos) => {
                rules.remove(pos);
                Ok(())
            }
            None => Err(error("rule del", "RTNETLINK answers: No such file or directory")),
        }
    }

    fn add_neighbor(&self, link: &str, ip: Ipv4Addr, mac: &str) -> Result<(), NetlinkError> {
        self.record(format!("neigh add {} lladdr {} dev {}", ip, mac, link));
        let mut kernel = self.kernel.borrow_mut();
        kernel.ns_mut(&self.ns).neighbors.push(Neighbor {
            link: link.to_string(),
            ip,
            mac: mac.to_string(),
            permanent: true,
        });
        Ok(())
    }
}
