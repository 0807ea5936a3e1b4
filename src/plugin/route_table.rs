//! Maps an ENI's hardware address to its route table.
//!
//! ENIs show up on the host as `<prefix><index>` (e.g. `eth3`); each one owns
//! table `index + ROUTE_TABLE_START`.

use tracing::debug;

use crate::config::ROUTE_TABLE_START;
use crate::error::ResolutionError;
use crate::netlink::{Link, Netlink};

/// Parse the ENI index out of a link name. The suffix must be all digits.
pub fn parse_eni_index(name: &str, prefix: &str) -> Result<u32, ResolutionError> {
    let suffix = name
        .strip_prefix(prefix)
        .ok_or_else(|| ResolutionError::UnexpectedName {
            name: name.to_string(),
            prefix: prefix.to_string(),
        })?;

    let invalid = || ResolutionError::InvalidIndex {
        name: name.to_string(),
        prefix: prefix.to_string(),
    };

    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    suffix.parse().map_err(|_| invalid())
}

/// Route table for the ENI link `link`
pub fn table_for_link(link: &Link, prefix: &str) -> Result<u32, ResolutionError> {
    let index = parse_eni_index(&link.name, prefix)?;
    index
        .checked_add(ROUTE_TABLE_START)
        .ok_or_else(|| ResolutionError::InvalidIndex {
            name: link.name.clone(),
            prefix: prefix.to_string(),
        })
}

/// Find the host link carrying `mac` and return its route table
pub fn resolve_route_table<N: Netlink>(
    netlink: &N,
    mac: &str,
    prefix: &str,
) -> Result<u32, ResolutionError> {
    let links = netlink.links()?;
    let link = links
        .iter()
        .find(|l| l.has_mac(mac))
        .ok_or_else(|| ResolutionError::NoMatchingLink(mac.to_string()))?;

    let table = table_for_link(link, prefix)?;
    debug!(mac = %mac, link = %link.name, table, "Resolved ENI route table");
    Ok(table)
}
