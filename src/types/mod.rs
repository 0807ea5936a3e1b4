use serde::{Deserialize, Serialize};
use std::io::Write;

/// CNI versions this plugin can produce results for
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// CNI command arguments
#[derive(Debug, Clone)]
pub struct CmdArgs {
    /// Container ID
    pub container_id: String,
    /// Network namespace path
    pub netns: String,
    /// Interface name
    pub ifname: String,
    /// Raw CNI_ARGS string
    pub args: String,
    /// Path
    pub path: String,
    /// Standard input data
    pub stdin_data: Vec<u8>,
}

/// Current result format (CNI 1.0.0, with 0.x compatibility)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Result {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Interfaces created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,
    /// IP configurations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<IPConfig>>,
    /// Routes to configure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<Route>>,
    /// DNS configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DNS>,
}

/// Interface information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name
    pub name: String,
    /// MAC address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Sandbox path (network namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// IP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IPConfig {
    /// Address family, only present in 0.x results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Interface index this IP is assigned to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    /// IP address with prefix length
    pub address: String,
    /// Gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// DNS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DNS {
    /// DNS nameservers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<Vec<String>>,
    /// DNS search domains
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<Vec<String>>,
    /// DNS options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR
    pub dst: String,
    /// Gateway for this route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

impl Result {
    /// Create a new empty result
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            interfaces: None,
            ips: None,
            routes: None,
            dns: None,
        }
    }

    /// Add an interface to the result, returning its index
    pub fn add_interface(&mut self, interface: Interface) -> usize {
        let interfaces = self.interfaces.get_or_insert_with(Vec::new);
        interfaces.push(interface);
        interfaces.len() - 1
    }

    /// Add an IPv4 configuration to the result
    pub fn add_ip(&mut self, mut ip: IPConfig) {
        if self.cni_version.starts_with("0.") {
            ip.version.get_or_insert_with(|| "4".to_string());
        }
        self.ips.get_or_insert_with(Vec::new).push(ip);
    }

    /// Add a route to the result
    pub fn add_route(&mut self, route: Route) {
        self.routes.get_or_insert_with(Vec::new).push(route);
    }

    /// Index of the interface with the given name and sandbox
    pub fn interface_index(&self, name: &str, sandbox: Option<&str>) -> Option<usize> {
        self.interfaces
            .as_ref()?
            .iter()
            .position(|i| i.name == name && i.sandbox.as_deref() == sandbox)
    }

    /// Print result as JSON
    pub fn print(&self) -> anyhow::Result<()> {
        print_json(self)
    }
}

/// Error document written to stdout when a command fails
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl ErrorResult {
    pub fn print(&self) -> anyhow::Result<()> {
        print_json(self)
    }
}

/// Answer to the VERSION command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(rename = "supportedVersions")]
    pub supported_versions: Vec<String>,
}

impl VersionResult {
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn print(&self) -> anyhow::Result<()> {
        print_json(self)
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", json)?;
    stdout.flush()?;
    Ok(())
}
