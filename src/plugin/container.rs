//! Pod side of the veth pair.
//!
//! The pod gets a /32 and reaches everything through the gateway, which is
//! pinned to the host veth's MAC so no ARP leaves the pod.

use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{info, warn};

use crate::error::KernelError;
use crate::netlink::{host_network, Namespaces, Netlink, Route, MAIN_TABLE};

/// Addressing applied inside the container namespace
#[derive(Debug, Clone)]
pub struct ContainerAddressing<'a> {
    pub ifname: &'a str,
    pub address: Ipv4Addr,
    pub gateway: Ipv4Addr,
    /// MAC of the host end, answered for the gateway
    pub host_mac: &'a str,
}

pub fn configure_container<N: Namespaces>(
    network: &N,
    netns: &Path,
    addressing: &ContainerAddressing<'_>,
) -> Result<(), KernelError> {
    let ifname = addressing.ifname;
    let gateway = addressing.gateway;

    network.with_netns(netns, |nl| -> Result<(), KernelError> {
        nl.set_link_up(ifname)?;
        nl.add_address(ifname, host_network(addressing.address))?;
        nl.add_route(&Route::scoped(ifname, host_network(gateway), MAIN_TABLE))?;
        nl.add_route(&Route::default_via(ifname, gateway, Some(addressing.address)))?;
        nl.add_neighbor(ifname, gateway, addressing.host_mac)?;
        Ok(())
    })?;

    info!(
        address = %addressing.address,
        gateway = %gateway,
        link = %ifname,
        netns = %netns.display(),
        "Container network configured"
    );
    Ok(())
}

/// What tearing down the container interface left behind
#[derive(Debug, Default)]
pub struct ContainerTeardown {
    /// Addresses the interface carried, read before the delete
    pub addresses: Vec<Ipv4Network>,
    /// Set when the interface was found but could not be deleted
    pub delete_error: Option<KernelError>,
}

/// Delete the container interface, returning the addresses it carried.
///
/// A missing interface is not an error; there is nothing left to remove.
/// A failed delete is reported alongside the addresses so the host rules
/// for them can still be removed.
pub fn teardown_container<N: Namespaces>(
    network: &N,
    netns: &Path,
    ifname: &str,
) -> Result<ContainerTeardown, KernelError> {
    network.with_netns(netns, |nl| -> Result<ContainerTeardown, KernelError> {
        if nl.link_by_name(ifname)?.is_none() {
            warn!(link = %ifname, netns = %netns.display(), "Container interface already gone");
            return Ok(ContainerTeardown::default());
        }

        let addresses = nl.addresses(ifname)?;
        let delete_error = match nl.del_link(ifname) {
            Ok(()) => {
                info!(link = %ifname, netns = %netns.display(), "Deleted container interface");
                None
            }
            Err(e) => Some(KernelError::from(e)),
        };
        Ok(ContainerTeardown {
            addresses,
            delete_error,
        })
    })
}

/// Verify the container interface exists and still carries `address`
pub fn check_container<N: Namespaces>(
    network: &N,
    netns: &Path,
    ifname: &str,
    address: Ipv4Network,
) -> Result<(), KernelError> {
    network.with_netns(netns, |nl| -> Result<(), KernelError> {
        if nl.link_by_name(ifname)?.is_none() {
            return Err(KernelError::LinkNotFound(ifname.to_string()));
        }
        if !nl.addresses(ifname)?.contains(&address) {
            return Err(KernelError::Mismatch(format!(
                "{} does not carry {}",
                ifname, address
            )));
        }
        Ok(())
    })
}
