//! Host side routing for a pod address.
//!
//! Every pod on an ENI shares that ENI's table and the global rule list with
//! concurrent invocations, so each step checks kernel state before writing
//! and never touches entries for other addresses.

use ipnetwork::Ipv4Network;
use tracing::{debug, info, warn};

use crate::config::ROUTE_TABLE_START;
use crate::error::KernelError;
use crate::netlink::{Netlink, PolicyRule, Route, RouteScope};

/// What the host configurator needs to know about one pod
#[derive(Debug, Clone)]
pub struct HostRouting<'a> {
    pub host_ifname: &'a str,
    pub pod_network: Ipv4Network,
    pub table: u32,
    /// Priority of the "from" rule; the "to" rule sits one below it
    pub priority: u32,
}

impl HostRouting<'_> {
    pub fn to_rule(&self) -> PolicyRule {
        PolicyRule::to_table(self.pod_network, self.table, self.priority - 1)
    }

    pub fn from_rule(&self) -> PolicyRule {
        PolicyRule::from_table(self.pod_network, self.table, self.priority)
    }
}

/// Install the scoped route and the to/from rules for the pod
pub fn configure_host<N: Netlink>(netlink: &N, routing: &HostRouting<'_>) -> Result<(), KernelError> {
    netlink.set_link_up(routing.host_ifname)?;

    install_scoped_route(netlink, routing)?;
    install_rules(netlink, routing)?;

    info!(
        address = %routing.pod_network,
        link = %routing.host_ifname,
        table = routing.table,
        "Host routing configured"
    );
    Ok(())
}

fn install_scoped_route<N: Netlink>(netlink: &N, routing: &HostRouting<'_>) -> Result<(), KernelError> {
    let stale = netlink
        .routes(routing.table, Some(RouteScope::Link))?
        .into_iter()
        .filter(|r| r.dst == routing.pod_network);

    for route in stale {
        debug!(route = %route, "Removing stale route");
        netlink.del_route(&route)?;
    }

    netlink.add_route(&Route::scoped(
        routing.host_ifname,
        routing.pod_network,
        routing.table,
    ))?;
    Ok(())
}

fn install_rules<N: Netlink>(netlink: &N, routing: &HostRouting<'_>) -> Result<(), KernelError> {
    let rules = netlink.rules()?;
    let has = |pick: fn(&PolicyRule) -> Option<Ipv4Network>| {
        rules
            .iter()
            .any(|r| r.table == routing.table && pick(r) == Some(routing.pod_network))
    };

    if has(|r| r.dst) {
        debug!(address = %routing.pod_network, table = routing.table, "To rule already present");
    } else {
        netlink.add_rule(&routing.to_rule())?;
    }

    if has(|r| r.src) {
        debug!(address = %routing.pod_network, table = routing.table, "From rule already present");
    } else {
        netlink.add_rule(&routing.from_rule())?;
    }
    Ok(())
}

/// Delete every rule matching one of `addresses`, continuing past failures.
///
/// Returns the first error encountered.
pub fn remove_rules<N: Netlink>(netlink: &N, addresses: &[Ipv4Network]) -> Result<(), KernelError> {
    let mut first_err = None;

    for rule in netlink.rules()? {
        if !addresses.iter().any(|a| rule.matches_prefix(a)) {
            continue;
        }
        match netlink.del_rule(&rule) {
            Ok(()) => info!(rule = %rule, "Deleted rule"),
            Err(e) => {
                warn!(rule = %rule, error = %e, "Failed to delete rule");
                if first_err.is_none() {
                    first_err = Some(KernelError::from(e));
                }
            }
        }
    }

    first_err.map_or(Ok(()), Err)
}

/// Verify the pod's rules and scoped route, returning the ENI table they use.
///
/// The table is taken from the "from" rule; the "to" rule and the route
/// through `host_ifname` must agree with it.
pub fn check_host<N: Netlink>(
    netlink: &N,
    host_ifname: &str,
    address: Ipv4Network,
    priority: u32,
) -> Result<u32, KernelError> {
    let rules = netlink.rules()?;
    let from = rules
        .iter()
        .find(|r| r.src == Some(address) && r.dst.is_none() && r.priority == priority)
        .ok_or_else(|| KernelError::Mismatch(format!("no rule from {}", address)))?;

    let routing = HostRouting {
        host_ifname,
        pod_network: address,
        table: from.table,
        priority,
    };
    if routing.table < ROUTE_TABLE_START {
        return Err(KernelError::Mismatch(format!(
            "rule from {} points at table {}",
            address, routing.table
        )));
    }
    if !rules.contains(&routing.to_rule()) {
        return Err(KernelError::Mismatch(format!(
            "no rule to {} in table {}",
            address, routing.table
        )));
    }

    let routed = netlink
        .routes(routing.table, Some(RouteScope::Link))?
        .iter()
        .any(|r| r.dst == address && r.dev.as_deref() == Some(host_ifname));
    if !routed {
        return Err(KernelError::Mismatch(format!(
            "no route to {} via {} in table {}",
            address, host_ifname, routing.table
        )));
    }
    Ok(routing.table)
}
