//! Error types for the ENI plugin.
//!
//! Each stage of ADD/DEL has its own error type so the orchestrator can
//! decide per stage whether a failure is fatal (ADD) or only logged (DEL
//! cleanup). `CniError` is what the binaries turn into a CNI error document.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Invalid network configuration or invocation arguments. Never retryable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse network configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid MTU {0} (must be between 68 and 65535)")]
    Mtu(u32),

    #[error("invalid route rule priority {0} (must be 0 or at least 256)")]
    RulePriority(u32),

    #[error("invalid log max size {0}MB (must be at least 1)")]
    LogMaxSize(u64),

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("invalid CNI_ARGS segment {0:?} (expected KEY=VALUE)")]
    ArgSegment(String),

    #[error("invalid value {value:?} for CNI_ARGS key {key}")]
    ArgValue { key: String, value: String },

    #[error("unknown CNI_ARGS key {0} (set IgnoreUnknown=1 to allow it)")]
    ArgUnknown(String),

    #[error("invalid interface name {0:?}")]
    InterfaceName(String),

    #[error("{0}")]
    Invalid(String),
}

/// The allocation backend was unreachable, answered with an error status or
/// explicitly refused the request.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("allocator request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("allocator returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("allocator refused request {request_id} (code {code}): {message}")]
    Refused {
        code: i64,
        request_id: String,
        message: String,
    },

    #[error("allocator response could not be decoded: {0}")]
    Decode(String),

    #[error("allocator returned an invalid lease: {0}")]
    InvalidLease(String),

    #[error("failed to set up allocator client: {0}")]
    Client(String),
}

/// The ENI hardware address could not be mapped to a route table.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("lease carries no ENI hardware address")]
    MissingMac,

    #[error("no host link with hardware address {0}")]
    NoMatchingLink(String),

    #[error("link {name} does not start with ENI prefix {prefix:?}")]
    UnexpectedName { name: String, prefix: String },

    #[error("link {name} has no valid ENI index after prefix {prefix:?}")]
    InvalidIndex { name: String, prefix: String },

    #[error("failed to list host links: {0}")]
    Netlink(#[from] NetlinkError),
}

/// A kernel operation issued through iproute2 failed.
#[derive(Debug, Error)]
pub enum NetlinkError {
    #[error("failed to run `ip {cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: io::Error,
    },

    #[error("`ip {cmd}` failed: {stderr}")]
    Command { cmd: String, stderr: String },

    #[error("failed to decode output of `ip {cmd}`: {source}")]
    Decode {
        cmd: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unexpected value in `ip` output: {0}")]
    Parse(String),
}

/// Entering or leaving a network namespace failed.
#[derive(Debug, Error)]
pub enum NetnsError {
    #[error("network namespace {0} does not exist")]
    NotFound(PathBuf),

    #[error("failed to open network namespace {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to enter network namespace {path}: {source}")]
    Enter {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to restore original network namespace: {0}")]
    Restore(#[source] nix::Error),
}

/// Failure of a single step that manipulates kernel state.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Netns(#[from] NetnsError),

    #[error(transparent)]
    Netlink(#[from] NetlinkError),

    #[error("link {0} not found")]
    LinkNotFound(String),

    #[error("link {0} already exists")]
    LinkExists(String),

    #[error("{0} has no IPv4 address")]
    NoAddress(String),

    #[error("no default route in the main table")]
    NoDefaultRoute,

    #[error("{0}")]
    Mismatch(String),
}

/// Top level plugin error.
#[derive(Debug, Error)]
pub enum CniError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IP allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    #[error("route table resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("veth creation failed: {0}")]
    VethCreation(#[source] KernelError),

    #[error("container network configuration failed: {0}")]
    ContainerConfig(#[source] KernelError),

    #[error("host network configuration failed: {0}")]
    HostConfig(#[source] KernelError),

    #[error("invalid CNI environment: {0}")]
    Environment(String),

    #[error("incompatible CNI version {0}")]
    IncompatibleVersion(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CniError {
    /// CNI error code reported to the runtime.
    pub fn code(&self) -> u32 {
        match self {
            CniError::IncompatibleVersion(_) => 1,
            CniError::Environment(_) => 4,
            CniError::Io(_) => 5,
            CniError::Config(ConfigError::Parse(_)) => 6,
            CniError::Config(_) => 7,
            CniError::Allocation(_) => 11,
            CniError::Resolution(_) => 100,
            CniError::VethCreation(_) => 101,
            CniError::ContainerConfig(_) => 102,
            CniError::HostConfig(_) => 103,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(CniError::Config(ConfigError::Mtu(67)).code(), 7);
        assert_eq!(CniError::Environment("CNI_NETNS".into()).code(), 4);
        assert_eq!(
            CniError::Resolution(ResolutionError::MissingMac).code(),
            100
        );
        assert_eq!(
            CniError::HostConfig(KernelError::LinkNotFound("veth0".into())).code(),
            103
        );
    }

    #[test]
    fn test_config_error_messages() {
        assert_eq!(
            ConfigError::Mtu(65536).to_string(),
            "invalid MTU 65536 (must be between 68 and 65535)"
        );
        assert_eq!(
            ConfigError::RulePriority(255).to_string(),
            "invalid route rule priority 255 (must be 0 or at least 256)"
        );
    }
}
