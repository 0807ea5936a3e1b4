use std::env;
use std::fmt;
use std::io::{self, Read};

use crate::config::{validate_ifname, NetConf};
use crate::error::{CniError, KernelError};
use crate::ipam::AllocatorClient;
use crate::logging;
use crate::netlink::{HostNetwork, IpRoute2};
use crate::plugin::ipam_only::IpamPlugin;
use crate::plugin::EniPlugin;
use crate::types::{CmdArgs, ErrorResult, VersionResult, SUPPORTED_VERSIONS};

/// Version used for documents written before the network configuration is known
pub const DEFAULT_CNI_VERSION: &str = "1.0.0";

/// A failed invocation and the version its error document is written in
#[derive(Debug)]
pub struct Failure {
    pub cni_version: String,
    pub error: CniError,
}

impl Failure {
    pub fn error_result(&self) -> ErrorResult {
        let details = std::error::Error::source(&self.error)
            .map(|s| s.to_string())
            .unwrap_or_default();
        ErrorResult {
            cni_version: self.cni_version.clone(),
            code: self.error.code(),
            msg: self.error.to_string(),
            details,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl From<CniError> for Failure {
    fn from(error: CniError) -> Self {
        Self {
            cni_version: DEFAULT_CNI_VERSION.to_string(),
            error,
        }
    }
}

/// Parse command arguments from the environment and stdin
pub fn parse_args(command: &str) -> Result<CmdArgs, CniError> {
    parse_args_from(command, |key| env::var(key).ok(), io::stdin())
}

/// Parse command arguments using `lookup` for environment variables
pub fn parse_args_from<F, R>(command: &str, lookup: F, mut stdin: R) -> Result<CmdArgs, CniError>
where
    F: Fn(&str) -> Option<String>,
    R: Read,
{
    let required = |key: &str| {
        lookup(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| CniError::Environment(format!("{} not found in environment", key)))
    };

    let container_id = required("CNI_CONTAINERID")?;
    let ifname = required("CNI_IFNAME")?;
    let path = required("CNI_PATH")?;

    // The runtime may omit the namespace on DEL once it is gone.
    let netns = match command {
        "DEL" => lookup("CNI_NETNS").unwrap_or_default(),
        _ => required("CNI_NETNS")?,
    };

    validate_ifname(&ifname)?;

    let mut stdin_data = Vec::new();
    stdin.read_to_end(&mut stdin_data)?;

    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args: lookup("CNI_ARGS").unwrap_or_default(),
        path,
        stdin_data,
    })
}

/// Parse the network configuration and reject versions we cannot answer in
pub fn load_conf(args: &CmdArgs) -> Result<NetConf, CniError> {
    let conf = NetConf::parse(&args.stdin_data)?;
    if !SUPPORTED_VERSIONS.contains(&conf.cni_version.as_str()) {
        return Err(CniError::IncompatibleVersion(conf.cni_version));
    }
    Ok(conf)
}

fn printed(result: anyhow::Result<()>) -> Result<(), CniError> {
    result.map_err(|e| CniError::Io(io::Error::new(io::ErrorKind::Other, format!("{:#}", e))))
}

fn host_network() -> Result<HostNetwork, CniError> {
    HostNetwork::new().map_err(|e| CniError::HostConfig(KernelError::from(e)))
}

/// Execute the add command
pub fn cmd_add(conf: NetConf, args: CmdArgs) -> Result<(), CniError> {
    let network = host_network()?;
    let allocator = AllocatorClient::new(&conf.ipam)?;
    let plugin = EniPlugin::new(conf, args, &network, &allocator)?;

    let result = plugin.add_network()?;
    printed(result.print())
}

/// Execute the delete command
pub fn cmd_del(conf: NetConf, args: CmdArgs) -> Result<(), CniError> {
    let network = host_network()?;
    let allocator = AllocatorClient::new(&conf.ipam)?;
    let plugin = EniPlugin::new(conf, args, &network, &allocator)?;

    plugin.del_network()
}

/// Execute the check command
pub fn cmd_check(conf: NetConf, args: CmdArgs) -> Result<(), CniError> {
    let network = host_network()?;
    let allocator = AllocatorClient::new(&conf.ipam)?;
    let plugin = EniPlugin::new(conf, args, &network, &allocator)?;

    plugin.check_network()
}

fn version() -> Result<(), Failure> {
    Ok(printed(VersionResult::new(DEFAULT_CNI_VERSION).print())?)
}

/// Read the invocation, set up logging and hand the command to `dispatch`
fn run<D>(dispatch: D) -> Result<(), Failure>
where
    D: FnOnce(&str, NetConf, CmdArgs) -> Result<(), CniError>,
{
    let command = env::var("CNI_COMMAND")
        .map_err(|_| CniError::Environment("CNI_COMMAND not found in environment".to_string()))?;

    if command == "VERSION" {
        return version();
    }

    let args = parse_args(&command)?;
    let conf = load_conf(&args)?;
    let cni_version = conf.cni_version.clone();

    logging::init(&conf);
    tracing::info!(
        command = %command,
        container_id = %args.container_id,
        netns = %args.netns,
        ifname = %args.ifname,
        "Invoked"
    );

    dispatch(&command, conf, args).map_err(|error| {
        tracing::error!(command = %command, code = error.code(), error = %error, "Command failed");
        Failure { cni_version, error }
    })
}

fn unknown(command: &str) -> CniError {
    CniError::Environment(format!("unknown CNI command {}", command))
}

/// Main entry point for the ENI plugin
pub fn run_cni() -> Result<(), Failure> {
    run(|command, conf, args| match command {
        "ADD" => cmd_add(conf, args),
        "DEL" => cmd_del(conf, args),
        "CHECK" => cmd_check(conf, args),
        other => Err(unknown(other)),
    })
}

/// Main entry point for the address-only plugin
pub fn run_ipam() -> Result<(), Failure> {
    run(|command, conf, args| {
        let netlink = IpRoute2::new();
        let allocator = AllocatorClient::new(&conf.ipam)?;
        let plugin = IpamPlugin::new(conf, args, &netlink, &allocator)?;

        match command {
            "ADD" => printed(plugin.add()?.print()),
            "DEL" => plugin.del(),
            "CHECK" => Ok(()),
            other => Err(unknown(other)),
        }
    })
}
