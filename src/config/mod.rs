use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::types::Result as CniResult;

pub const MIN_MTU: u32 = 68;
pub const MAX_MTU: u32 = 65535;
pub const DEFAULT_MTU: u32 = 1500;

/// Rules below this priority collide with the kernel's own rule range.
pub const MIN_ROUTE_RULE_PRIORITY: u32 = 256;
pub const DEFAULT_ROUTE_RULE_PRIORITY: u32 = 2048;

/// ENI route tables are numbered from here, above the reserved 253-255.
pub const ROUTE_TABLE_START: u32 = 1000;

pub const DEFAULT_ENI_PREFIX: &str = "eth";
pub const DEFAULT_MASTER_INTERFACE: &str = "eth0";
pub const DEFAULT_LOG_DIR: &str = "/var/log/eni-cni";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_LOG_MAX_SIZE_MB: u64 = 20;
pub const DEFAULT_LOG_MAX_BACKUPS: usize = 5;
pub const DEFAULT_ALLOCATOR_PATH: &str = "/api/v1/ip/allocator";
pub const DEFAULT_ALLOCATOR_TIMEOUT_SECS: u64 = 10;

/// Network configuration for the ENI CNI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    /// CNI specification version
    pub cni_version: String,
    /// Name of the network
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    /// Name prefix of the host links backing ENIs
    #[serde(default = "default_eni_prefix")]
    pub eni_prefix: String,
    /// Host link used to discover the host address and gateway
    #[serde(default = "default_master_interface")]
    pub master_interface: String,
    /// Base priority of the per-pod policy rules (0 selects the default)
    #[serde(default)]
    pub route_rule_priority: u32,
    /// Directory for plugin log files
    #[serde(default)]
    pub log_dir: String,
    /// Log filter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Rotate the log file once it reaches this size
    #[serde(default = "default_log_max_size_mb")]
    pub log_max_size_mb: u64,
    /// Number of rotated log files kept
    #[serde(default = "default_log_max_backups")]
    pub log_max_backups: usize,
    /// IPAM (allocation backend) configuration
    pub ipam: IpamConf,
    /// Result of a previous ADD, supplied by the runtime for CHECK
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_result: Option<CniResult>,
}

/// Allocation backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamConf {
    /// Type of IPAM plugin
    #[serde(rename = "type", default)]
    pub ipam_type: String,
    /// Base URL of the allocation service
    pub endpoint: String,
    /// Path of the allocator resource on the service
    #[serde(default = "default_allocator_path")]
    pub allocator_path: String,
    /// HTTP timeout for a single allocator call
    #[serde(default = "default_allocator_timeout")]
    pub timeout_seconds: u64,
    /// Host address reported to the allocator, discovered when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Ipv4Addr>,
    /// Host gateway reported to the allocator, discovered when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_gateway: Option<Ipv4Addr>,
}

fn default_mtu() -> u32 {
    DEFAULT_MTU
}

fn default_eni_prefix() -> String {
    DEFAULT_ENI_PREFIX.to_string()
}

fn default_master_interface() -> String {
    DEFAULT_MASTER_INTERFACE.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_log_max_size_mb() -> u64 {
    DEFAULT_LOG_MAX_SIZE_MB
}

fn default_log_max_backups() -> usize {
    DEFAULT_LOG_MAX_BACKUPS
}

fn default_allocator_path() -> String {
    DEFAULT_ALLOCATOR_PATH.to_string()
}

fn default_allocator_timeout() -> u64 {
    DEFAULT_ALLOCATOR_TIMEOUT_SECS
}

impl NetConf {
    /// Parse NetConf from bytes, validating it and filling in defaults
    pub fn parse(bytes: &[u8]) -> Result<Self, ConfigError> {
        let mut conf: NetConf = serde_json::from_slice(bytes)?;

        if !(MIN_MTU..=MAX_MTU).contains(&conf.mtu) {
            return Err(ConfigError::Mtu(conf.mtu));
        }

        match conf.route_rule_priority {
            0 => conf.route_rule_priority = DEFAULT_ROUTE_RULE_PRIORITY,
            p if p < MIN_ROUTE_RULE_PRIORITY => return Err(ConfigError::RulePriority(p)),
            _ => {}
        }

        if conf.log_dir.trim().is_empty() {
            conf.log_dir = DEFAULT_LOG_DIR.to_string();
        }

        if conf.log_max_size_mb == 0 {
            return Err(ConfigError::LogMaxSize(conf.log_max_size_mb));
        }

        if conf.eni_prefix.is_empty() {
            return Err(ConfigError::Empty("eniPrefix"));
        }

        if conf.ipam.endpoint.trim().is_empty() {
            return Err(ConfigError::Empty("ipam.endpoint"));
        }

        Ok(conf)
    }

    /// Priority of the rule matching traffic *from* the pod address; the
    /// rule matching traffic *to* it sits one below
    pub fn from_rule_priority(&self) -> u32 {
        self.route_rule_priority
    }

    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(&self.log_dir)
    }
}

/// Per-invocation arguments passed in CNI_ARGS
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CniArgs {
    /// Explicit pod address
    pub ip: Option<Ipv4Addr>,
    /// Explicit gateway address
    pub gateway: Option<Ipv4Addr>,
    pub pod_name: Option<String>,
    pub pod_namespace: Option<String>,
    pub infra_container_id: Option<String>,
    /// Accept keys this plugin does not know
    pub ignore_unknown: bool,
    /// Keys this plugin does not interpret, kept verbatim
    pub extra: HashMap<String, String>,
}

impl CniArgs {
    /// Parse a `KEY=VALUE;KEY=VALUE` string.
    ///
    /// Unknown keys are rejected unless `IgnoreUnknown` is set anywhere in
    /// the string.
    pub fn parse(args_str: &str) -> Result<Self, ConfigError> {
        let mut args = CniArgs::default();

        for pair in args_str.split(';').filter(|p| !p.trim().is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::ArgSegment(pair.to_string()))?;

            match key {
                "IP" => args.ip = Some(parse_ipv4(key, value)?),
                "GATEWAY" => args.gateway = Some(parse_ipv4(key, value)?),
                "K8S_POD_NAME" => args.pod_name = Some(value.to_string()),
                "K8S_POD_NAMESPACE" => args.pod_namespace = Some(value.to_string()),
                "K8S_POD_INFRA_CONTAINER_ID" => args.infra_container_id = Some(value.to_string()),
                "IgnoreUnknown" => {
                    args.ignore_unknown = matches!(value.to_ascii_lowercase().as_str(), "1" | "true")
                }
                _ => {
                    args.extra.insert(key.to_string(), value.to_string());
                }
            }
        }

        if !args.ignore_unknown {
            if let Some(key) = args.extra.keys().min() {
                return Err(ConfigError::ArgUnknown(key.clone()));
            }
        }

        Ok(args)
    }

    pub fn pod_name(&self) -> &str {
        self.pod_name.as_deref().unwrap_or_default()
    }

    pub fn pod_namespace(&self) -> &str {
        self.pod_namespace.as_deref().unwrap_or_default()
    }
}

fn parse_ipv4(key: &str, value: &str) -> Result<Ipv4Addr, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::ArgValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Validate a kernel interface name
pub fn validate_ifname(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name.len() < libc::IFNAMSIZ
        && name != "."
        && name != ".."
        && !name.contains(|c: char| c == '/' || c == ':' || c.is_whitespace());

    if valid {
        Ok(())
    } else {
        Err(ConfigError::InterfaceName(name.to_string()))
    }
}
