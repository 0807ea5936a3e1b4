//! Address-only variant used when another plugin owns the interface.
//!
//! ADD returns the lease as a CNI IPAM result and touches no kernel state.
//! Static `IP`/`GATEWAY` arguments bypass the backend entirely.

use ipnetwork::Ipv4Network;
use tracing::info;

use super::{host_address, host_gateway};
use crate::config::{CniArgs, NetConf};
use crate::error::{CniError, ConfigError};
use crate::ipam::{AllocateRequest, Allocator, Lease, PodIdentity, ReleaseRequest};
use crate::netlink::{default_network, Netlink};
use crate::types::{CmdArgs, IPConfig, Result as CniResult, Route as CniRoute};

pub struct IpamPlugin<'a, L: Netlink, A: Allocator> {
    config: NetConf,
    args: CmdArgs,
    cni_args: CniArgs,
    netlink: &'a L,
    allocator: &'a A,
}

impl<'a, L: Netlink, A: Allocator> IpamPlugin<'a, L, A> {
    pub fn new(
        config: NetConf,
        args: CmdArgs,
        netlink: &'a L,
        allocator: &'a A,
    ) -> Result<Self, CniError> {
        let cni_args = CniArgs::parse(&args.args)?;
        Ok(Self {
            config,
            args,
            cni_args,
            netlink,
            allocator,
        })
    }

    fn pod(&self) -> PodIdentity {
        PodIdentity {
            name: self.cni_args.pod_name().to_string(),
            namespace: self.cni_args.pod_namespace().to_string(),
        }
    }

    fn static_lease(&self) -> Result<Option<Lease>, ConfigError> {
        match (self.cni_args.ip, self.cni_args.gateway) {
            (None, _) => Ok(None),
            (Some(address), Some(gateway)) => Ok(Some(Lease {
                address,
                prefix_len: 32,
                gateway,
                mac: None,
            })),
            (Some(_), None) => Err(ConfigError::Invalid(
                "CNI_ARGS IP requires GATEWAY".to_string(),
            )),
        }
    }

    pub fn add(&self) -> Result<CniResult, CniError> {
        let lease = match self.static_lease()? {
            Some(lease) => {
                info!(address = %lease.address, "Using static address from CNI_ARGS");
                lease
            }
            None => {
                let host = host_address(self.netlink, &self.config).map_err(CniError::HostConfig)?;
                let gateway =
                    host_gateway(self.netlink, &self.config).map_err(CniError::HostConfig)?;
                let request =
                    AllocateRequest::new(&self.pod(), &self.args.container_id, host, gateway);
                self.allocator.allocate(&request)?
            }
        };

        let address = Ipv4Network::new(lease.address, lease.prefix_len)
            .map_err(|e| ConfigError::Invalid(format!("invalid lease prefix: {}", e)))?;

        let mut result = CniResult::new(&self.config.cni_version);
        result.add_ip(IPConfig {
            version: None,
            interface: None,
            address: address.to_string(),
            gateway: Some(lease.gateway.to_string()),
        });
        result.add_route(CniRoute {
            dst: default_network().to_string(),
            gw: Some(lease.gateway.to_string()),
        });
        Ok(result)
    }

    pub fn del(&self) -> Result<(), CniError> {
        if self.cni_args.ip.is_some() {
            info!(container_id = %self.args.container_id, "Static address, nothing to release");
            return Ok(());
        }
        let host = host_address(self.netlink, &self.config).map_err(CniError::HostConfig)?;
        let request = ReleaseRequest::new(&self.pod(), &self.args.container_id, host);
        self.allocator.release(&request)?;
        Ok(())
    }
}
