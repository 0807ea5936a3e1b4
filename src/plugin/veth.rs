//! Veth pair linking the pod to the host.
//!
//! The pair is created from inside the pod namespace with the peer placed in
//! the host namespace, under a host name derived from the container.

use ring::digest;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{info, warn};

use crate::error::KernelError;
use crate::netlink::{Namespaces, Netlink};

/// One end of the pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethEnd {
    pub name: String,
    pub mac: String,
}

/// Host and container ends of a veth pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    pub host: VethEnd,
    pub container: VethEnd,
}

/// Host-side name derived from the container, so retries reuse the same name
pub fn host_veth_name(container_id: &str, ifname: &str) -> String {
    let hash = digest::digest(&digest::SHA256, format!("{}{}", container_id, ifname).as_bytes());
    let mut name = String::from("veth");
    for byte in hash.as_ref().iter().take(6) {
        let _ = write!(name, "{:02x}", byte);
    }
    name.truncate(15);
    name
}

/// Create the pair from inside `netns` with the peer placed in the host namespace
pub fn setup_veth<N: Namespaces>(
    network: &N,
    netns: &Path,
    ifname: &str,
    host_ifname: &str,
    mtu: u32,
) -> Result<VethPair, KernelError> {
    // A previous ADD for this container may have died after creating the pair.
    if network.host().link_by_name(host_ifname)?.is_some() {
        warn!(link = %host_ifname, "Removing stale host veth");
        network.host().del_link(host_ifname)?;
    }

    let host_netns = network.host_netns().to_path_buf();
    let container = network.with_netns(netns, |nl| -> Result<VethEnd, KernelError> {
        if nl.link_by_name(ifname)?.is_some() {
            return Err(KernelError::LinkExists(ifname.to_string()));
        }

        nl.add_veth(ifname, host_ifname, mtu, &host_netns)?;

        let link = nl
            .link_by_name(ifname)?
            .ok_or_else(|| KernelError::LinkNotFound(ifname.to_string()))?;
        Ok(VethEnd {
            name: link.name,
            mac: link.mac.unwrap_or_default(),
        })
    })?;

    let host = network
        .host()
        .link_by_name(host_ifname)?
        .ok_or_else(|| KernelError::LinkNotFound(host_ifname.to_string()))?;

    info!(
        container_if = %container.name,
        host_if = %host.name,
        netns = %netns.display(),
        mtu,
        "Created veth pair"
    );

    Ok(VethPair {
        host: VethEnd {
            name: host.name,
            mac: host.mac.unwrap_or_default(),
        },
        container,
    })
}
