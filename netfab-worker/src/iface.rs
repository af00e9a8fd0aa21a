//! Live interface discovery shared by every controller.
//!
//! Physical interfaces are discovered here, never created or destroyed. All
//! lookups go to the kernel; the registry is only consulted by callers that
//! need bookkeeping the kernel cannot answer (backend choice, ownership).

use std::collections::HashMap;

use ipnetwork::IpNetwork;

use crate::error::{Error, Result};
use crate::exec::Executor;
use crate::parse::ip_link::{self, DetailKind, LinkLine};
use crate::types::{Interface, InterfaceKind};

/// Look up one link in the default namespace. `None` means the kernel does
/// not know the name.
pub async fn link(exec: &Executor, name: &str) -> Result<Option<LinkLine>> {
    let output = exec
        .run("ip", &["-d", "-o", "link", "show", "dev", name])
        .await?;
    if !output.success {
        return Ok(None);
    }
    Ok(ip_link::parse_links(&output.stdout).into_iter().next())
}

/// Look up one link inside a named network namespace.
pub async fn link_in_ns(exec: &Executor, ns: &str, name: &str) -> Result<Option<LinkLine>> {
    let output = exec
        .run("ip", &["-n", ns, "-d", "-o", "link", "show", "dev", name])
        .await?;
    if !output.success {
        return Ok(None);
    }
    Ok(ip_link::parse_links(&output.stdout).into_iter().next())
}

/// Enumerate links, optionally filtered by kernel link type
/// (`bridge`, `veth`, `vlan`).
pub async fn links(exec: &Executor, type_filter: Option<&str>) -> Result<Vec<LinkLine>> {
    let output = match type_filter {
        Some(t) => {
            exec.run_checked("list links", "ip", &["-d", "-o", "link", "show", "type", t])
                .await?
        }
        None => {
            exec.run_checked("list links", "ip", &["-d", "-o", "link", "show"])
                .await?
        }
    };
    Ok(ip_link::parse_links(&output.stdout))
}

/// Interfaces enslaved to a bridge.
pub async fn links_with_master(exec: &Executor, master: &str) -> Result<Vec<LinkLine>> {
    let output = exec
        .run("ip", &["-o", "link", "show", "master", master])
        .await?;
    if !output.success {
        // A bridge with no ports (or a vanished bridge) is an empty set.
        return Ok(Vec::new());
    }
    Ok(ip_link::parse_links(&output.stdout))
}

pub async fn set_link_up(exec: &Executor, name: &str) -> Result<()> {
    exec.run_checked(
        &format!("bring up {name}"),
        "ip",
        &["link", "set", name, "up"],
    )
    .await?;
    Ok(())
}

pub async fn set_link_up_in_ns(exec: &Executor, ns: &str, name: &str) -> Result<()> {
    exec.run_checked(
        &format!("bring up {name} in namespace {ns}"),
        "ip",
        &["-n", ns, "link", "set", name, "up"],
    )
    .await?;
    Ok(())
}

/// Addresses assigned to one interface.
pub async fn addresses(exec: &Executor, name: &str) -> Result<Vec<IpNetwork>> {
    let output = exec.run("ip", &["-o", "addr", "show", "dev", name]).await?;
    if !output.success {
        return Ok(Vec::new());
    }
    Ok(ip_link::parse_addrs(&output.stdout))
}

/// Classify a link. The `ip -d` detail section is authoritative; name
/// prefixes are the fallback for detail-less records.
pub fn classify(link: &LinkLine) -> InterfaceKind {
    match link.kind {
        Some(DetailKind::Bridge) => return InterfaceKind::Bridge,
        Some(DetailKind::Veth) => return InterfaceKind::Veth,
        Some(DetailKind::Vlan) => return InterfaceKind::Vlan,
        Some(DetailKind::Tun) => {
            return match link.tun_kind.as_deref() {
                Some("tap") => InterfaceKind::Tap,
                _ => InterfaceKind::Tun,
            };
        }
        None => {}
    }

    let name = link.name.as_str();
    if name == "lo" || name.starts_with("docker") || name.starts_with("bond") {
        InterfaceKind::Other
    } else if name.starts_with("br-") || name.starts_with("virbr") {
        InterfaceKind::Bridge
    } else if name.starts_with("veth") {
        InterfaceKind::Veth
    } else if name.starts_with("tun") {
        InterfaceKind::Tun
    } else if name.starts_with("tap") || name.starts_with("vnet") {
        InterfaceKind::Tap
    } else if name
        .rsplit_once('.')
        .is_some_and(|(_, id)| id.chars().all(|c| c.is_ascii_digit()))
    {
        InterfaceKind::Vlan
    } else {
        InterfaceKind::Physical
    }
}

fn to_interface(link: &LinkLine, addresses: Vec<IpNetwork>) -> Interface {
    Interface {
        name: link.name.clone(),
        kind: classify(link),
        status: link.status(),
        mtu: link.mtu,
        mac: link.mac.clone(),
        addresses,
        bridge: link.master.clone(),
    }
}

/// Enumerate every live interface with its addresses.
pub async fn list_interfaces(exec: &Executor) -> Result<Vec<Interface>> {
    let links = links(exec, None).await?;

    let addr_output = exec
        .run_checked("list addresses", "ip", &["-o", "addr", "show"])
        .await?;
    let mut by_name: HashMap<String, Vec<IpNetwork>> = HashMap::new();
    for (name, addr) in ip_link::parse_addr_entries(&addr_output.stdout) {
        by_name.entry(name).or_default().push(addr);
    }

    Ok(links
        .iter()
        .map(|l| to_interface(l, by_name.remove(&l.name).unwrap_or_default()))
        .collect())
}

/// Detailed view of one interface.
pub async fn get_interface(exec: &Executor, name: &str) -> Result<Interface> {
    let Some(link) = link(exec, name).await? else {
        return Err(Error::not_found(format!("interface {name}")));
    };
    let addrs = addresses(exec, name).await?;
    Ok(to_interface(&link, addrs))
}
