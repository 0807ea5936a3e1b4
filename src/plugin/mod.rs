//! ADD/DEL/CHECK orchestration for a pod on an ENI.
//!
//! ADD runs allocation, route table resolution, veth creation and the
//! container and host configuration in order and stops at the first
//! failure without unwinding. DEL attempts every cleanup step and reports
//! the first hard failure.

use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::config::{CniArgs, NetConf};
use crate::error::{CniError, ConfigError, KernelError, NetnsError, ResolutionError};
use crate::ipam::{AllocateRequest, Allocator, Lease, PodIdentity, ReleaseRequest};
use crate::netlink::{host_network, Namespaces, Netlink, MAIN_TABLE};
use crate::types::{CmdArgs, IPConfig, Interface, Result as CniResult, Route as CniRoute};

pub mod container;
pub mod host;
pub mod ipam_only;
pub mod route_table;
pub mod veth;

use container::ContainerAddressing;
use host::HostRouting;

/// Host address reported to the allocator: `ipam.host`, or the first IPv4
/// address of the master interface
pub fn host_address<L: Netlink>(netlink: &L, config: &NetConf) -> Result<Ipv4Addr, KernelError> {
    if let Some(host) = config.ipam.host {
        return Ok(host);
    }
    let master = &config.master_interface;
    netlink
        .addresses(master)?
        .first()
        .map(|net| net.ip())
        .ok_or_else(|| KernelError::NoAddress(master.clone()))
}

/// Host gateway reported to the allocator: `ipam.hostGateway`, or the
/// gateway of the main table's default route
pub fn host_gateway<L: Netlink>(netlink: &L, config: &NetConf) -> Result<Ipv4Addr, KernelError> {
    if let Some(gateway) = config.ipam.host_gateway {
        return Ok(gateway);
    }
    netlink
        .routes(MAIN_TABLE, None)?
        .into_iter()
        .find(|r| r.is_default())
        .and_then(|r| r.gateway)
        .ok_or(KernelError::NoDefaultRoute)
}

/// ENI plugin implementation
pub struct EniPlugin<'a, N: Namespaces, A: Allocator> {
    /// Network configuration
    config: NetConf,
    /// Command arguments
    args: CmdArgs,
    cni_args: CniArgs,
    network: &'a N,
    allocator: &'a A,
}

impl<'a, N: Namespaces, A: Allocator> EniPlugin<'a, N, A> {
    pub fn new(
        config: NetConf,
        args: CmdArgs,
        network: &'a N,
        allocator: &'a A,
    ) -> Result<Self, CniError> {
        let cni_args = CniArgs::parse(&args.args)?;
        Ok(Self {
            config,
            args,
            cni_args,
            network,
            allocator,
        })
    }

    fn pod(&self) -> PodIdentity {
        PodIdentity {
            name: self.cni_args.pod_name().to_string(),
            namespace: self.cni_args.pod_namespace().to_string(),
        }
    }

    fn netns(&self) -> PathBuf {
        PathBuf::from(&self.args.netns)
    }

    fn allocate(&self) -> Result<Lease, CniError> {
        let host = host_address(self.network.host(), &self.config).map_err(CniError::HostConfig)?;
        let gateway = host_gateway(self.network.host(), &self.config).map_err(CniError::HostConfig)?;

        let request = AllocateRequest::new(&self.pod(), &self.args.container_id, host, gateway);
        let mut lease = self.allocator.allocate(&request)?;

        if let Some(ip) = self.cni_args.ip {
            debug!(address = %ip, "Address overridden by CNI_ARGS");
            lease.address = ip;
        }
        if let Some(gateway) = self.cni_args.gateway {
            debug!(gateway = %gateway, "Gateway overridden by CNI_ARGS");
            lease.gateway = gateway;
        }
        Ok(lease)
    }

    /// Add the pod to the network
    pub fn add_network(&self) -> Result<CniResult, CniError> {
        let netns = self.netns();
        let ifname = self.args.ifname.as_str();

        let lease = self.allocate()?;
        info!(
            container_id = %self.args.container_id,
            infra_container_id = self.cni_args.infra_container_id.as_deref().unwrap_or_default(),
            address = %lease.address,
            gateway = %lease.gateway,
            "Allocated"
        );

        let mac = lease.mac.as_deref().ok_or(ResolutionError::MissingMac)?;
        let table =
            route_table::resolve_route_table(self.network.host(), mac, &self.config.eni_prefix)?;

        let host_ifname = veth::host_veth_name(&self.args.container_id, ifname);
        let pair = veth::setup_veth(self.network, &netns, ifname, &host_ifname, self.config.mtu)
            .map_err(CniError::VethCreation)?;
        info!(host_if = %pair.host.name, table, "Veth created");

        container::configure_container(
            self.network,
            &netns,
            &ContainerAddressing {
                ifname,
                address: lease.address,
                gateway: lease.gateway,
                host_mac: &pair.host.mac,
            },
        )
        .map_err(CniError::ContainerConfig)?;

        let pod_network = host_network(lease.address);
        host::configure_host(
            self.network.host(),
            &HostRouting {
                host_ifname: &pair.host.name,
                pod_network,
                table,
                priority: self.config.from_rule_priority(),
            },
        )
        .map_err(CniError::HostConfig)?;

        let mut result = CniResult::new(&self.config.cni_version);
        result.add_interface(Interface {
            name: pair.host.name.clone(),
            mac: Some(pair.host.mac.clone()),
            sandbox: None,
        });
        let index = result.add_interface(Interface {
            name: pair.container.name.clone(),
            mac: Some(pair.container.mac.clone()),
            sandbox: Some(self.args.netns.clone()),
        });
        result.add_ip(IPConfig {
            version: None,
            interface: Some(index),
            address: pod_network.to_string(),
            gateway: Some(lease.gateway.to_string()),
        });
        result.add_route(CniRoute {
            dst: crate::netlink::default_network().to_string(),
            gw: Some(lease.gateway.to_string()),
        });

        info!(container_id = %self.args.container_id, address = %pod_network, "ADD complete");
        Ok(result)
    }

    /// Remove the pod from the network
    pub fn del_network(&self) -> Result<(), CniError> {
        let mut first_err: Option<CniError> = None;
        let mut record = |err: CniError| {
            warn!(container_id = %self.args.container_id, error = %err, "DEL step failed");
            if first_err.is_none() {
                first_err = Some(err);
            }
        };

        match host_address(self.network.host(), &self.config) {
            Ok(host) => {
                let request = ReleaseRequest::new(&self.pod(), &self.args.container_id, host);
                if let Err(e) = self.allocator.release(&request) {
                    record(e.into());
                }
            }
            Err(e) => record(CniError::HostConfig(e)),
        }

        if self.args.netns.is_empty() {
            info!(container_id = %self.args.container_id, "No network namespace, nothing to tear down");
            return first_err.map_or(Ok(()), Err);
        }

        let netns = self.netns();
        let teardown = match container::teardown_container(self.network, &netns, &self.args.ifname) {
            Ok(teardown) => teardown,
            Err(KernelError::Netns(NetnsError::NotFound(path))) => {
                info!(netns = %path.display(), "Network namespace already gone");
                return first_err.map_or(Ok(()), Err);
            }
            Err(e) => {
                record(CniError::ContainerConfig(e));
                return first_err.map_or(Ok(()), Err);
            }
        };
        if let Some(e) = teardown.delete_error {
            record(CniError::ContainerConfig(e));
        }
        let addresses = teardown.addresses;

        if let Err(e) = host::remove_rules(self.network.host(), &addresses) {
            record(CniError::HostConfig(e));
        }

        info!(container_id = %self.args.container_id, addresses = ?addresses, "DEL complete");
        first_err.map_or(Ok(()), Err)
    }

    /// Verify the state left by a previous ADD
    pub fn check_network(&self) -> Result<(), CniError> {
        let prev = self
            .config
            .prev_result
            .as_ref()
            .ok_or_else(|| ConfigError::Invalid("prevResult is required for CHECK".to_string()))?;

        let sandbox = Some(self.args.netns.as_str());
        let index = prev.interface_index(&self.args.ifname, sandbox);

        let addresses = prev
            .ips
            .iter()
            .flatten()
            .filter(|ip| index.is_none() || ip.interface == index)
            .map(|ip| {
                ip.address
                    .parse::<Ipv4Network>()
                    .map_err(|_| ConfigError::Invalid(format!("invalid address {:?} in prevResult", ip.address)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let netns = self.netns();
        let host_ifname = veth::host_veth_name(&self.args.container_id, &self.args.ifname);
        for address in addresses {
            container::check_container(self.network, &netns, &self.args.ifname, address)
                .map_err(CniError::ContainerConfig)?;
            let table = host::check_host(
                self.network.host(),
                &host_ifname,
                address,
                self.config.from_rule_priority(),
            )
            .map_err(CniError::HostConfig)?;
            debug!(address = %address, table, "Host routing verified");
        }
        Ok(())
    }
}
