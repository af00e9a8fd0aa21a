//! Veth pair controller.
//!
//! Each endpoint lands in a namespace XOR on a bridge XOR stays in the
//! default namespace; the kernel collapses the pair when either end is
//! deleted. Lookups fall back to scanning known namespaces because an
//! endpoint inside a namespace is invisible to default-namespace
//! enumeration.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::bridge::{attach_port, detach_port};
use crate::error::{Error, Result};
use crate::exec::Executor;
use crate::iface;
use crate::parse::ip_link::LinkLine;
use crate::registry::TopologyRegistry;
use crate::types::{
    validate_ifname, veth_pair_key, InterfaceStatus, VethEndpoint, VethPairRecord,
};

/// Requested placement for one end of a new pair.
#[derive(Debug, Clone, Default)]
pub struct VethEndpointSpec {
    pub name: String,
    pub bridge: Option<String>,
    pub namespace: Option<String>,
}

impl VethEndpointSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bridge: None,
            namespace: None,
        }
    }
}

/// Namespace names are not interface names: same charset, no kernel length
/// cap worth enforcing here.
fn validate_netns_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("namespace", "name must not be empty"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(Error::validation(
            "namespace",
            format!("'{name}' contains characters outside [a-zA-Z0-9._-]"),
        ));
    }
    Ok(())
}

/// Create the namespace if absent. Idempotent.
async fn ensure_netns(exec: &Executor, ns: &str) -> Result<()> {
    let output = exec.run("ip", &["netns", "add", ns]).await?;
    if output.success || output.stderr.contains("File exists") {
        Ok(())
    } else {
        Err(Error::system(
            format!("create namespace {ns}"),
            output.diagnostic(),
        ))
    }
}

/// Known namespaces; an absent netns setup reads as the empty set.
async fn netns_list(exec: &Executor) -> Result<Vec<String>> {
    let output = exec.run("ip", &["netns", "list"]).await?;
    if !output.success {
        return Ok(Vec::new());
    }
    Ok(output
        .stdout
        .lines()
        .filter_map(|l| l.split_whitespace().next())
        .map(String::from)
        .collect())
}

fn endpoint_from_link(link: &LinkLine, namespace: Option<&str>) -> VethEndpoint {
    VethEndpoint {
        name: link.name.clone(),
        bridge: link.master.clone(),
        namespace: namespace.map(String::from),
        status: link.status(),
    }
}

pub struct VethController {
    exec: Executor,
    registry: Arc<TopologyRegistry>,
}

impl VethController {
    pub fn new(exec: Executor, registry: Arc<TopologyRegistry>) -> Self {
        Self { exec, registry }
    }

    /// Create a veth pair and place both endpoints. When a spec names both a
    /// namespace and a bridge for the same endpoint, the namespace wins and
    /// the bridge attach is skipped with a warning, never silently both.
    pub async fn create_pair(
        &self,
        first: VethEndpointSpec,
        second: VethEndpointSpec,
    ) -> Result<VethPairRecord> {
        validate_ifname("name1", &first.name)?;
        validate_ifname("name2", &second.name)?;
        if first.name == second.name {
            return Err(Error::validation(
                "name2",
                "veth endpoint names must differ",
            ));
        }
        for spec in [&first, &second] {
            if let Some(ns) = &spec.namespace {
                validate_netns_name(ns)?;
            }
            if let Some(bridge) = &spec.bridge {
                validate_ifname("bridge", bridge)?;
            }
        }

        // Lock both endpoint names, in sorted order so concurrent creates
        // touching the same names cannot deadlock.
        let (lo, hi) = if first.name <= second.name {
            (&first.name, &second.name)
        } else {
            (&second.name, &first.name)
        };
        let _guard_lo = self.registry.lock_key(&format!("if:{lo}")).await;
        let _guard_hi = self.registry.lock_key(&format!("if:{hi}")).await;

        for name in [&first.name, &second.name] {
            if iface::link(&self.exec, name).await?.is_some() {
                return Err(Error::conflict(format!("interface {name} already exists")));
            }
        }

        self.exec
            .run_checked(
                &format!("create veth pair {} <-> {}", first.name, second.name),
                "ip",
                &[
                    "link", "add", &first.name, "type", "veth", "peer", "name", &second.name,
                ],
            )
            .await?;

        let mut completed = vec!["create".to_string()];
        let mut record = VethPairRecord {
            first: VethEndpoint::new(&first.name),
            second: VethEndpoint::new(&second.name),
        };

        for (spec, slot) in [(&first, 0usize), (&second, 1usize)] {
            match self.place_endpoint(spec).await {
                Ok(endpoint) => {
                    completed.push(format!("place {}", spec.name));
                    if slot == 0 {
                        record.first = endpoint;
                    } else {
                        record.second = endpoint;
                    }
                }
                Err(e) => {
                    // The pair exists in the kernel; record it so it stays
                    // addressable, then surface what completed.
                    self.registry.upsert_veth(record).await;
                    return Err(Error::partial(
                        format!("create veth pair {} <-> {}", first.name, second.name),
                        e.to_string(),
                        completed,
                    ));
                }
            }
        }

        self.registry.upsert_veth(record.clone()).await;
        info!("created veth pair {} <-> {}", first.name, second.name);
        Ok(record)
    }

    async fn place_endpoint(&self, spec: &VethEndpointSpec) -> Result<VethEndpoint> {
        let mut endpoint = VethEndpoint::new(&spec.name);
        let mut bridge = spec.bridge.as_deref();

        if let Some(ns) = &spec.namespace {
            if bridge.is_some() {
                warn!(
                    "endpoint {}: namespace and bridge both requested; namespace wins",
                    spec.name
                );
                bridge = None;
            }
            ensure_netns(&self.exec, ns).await?;
            self.exec
                .run_checked(
                    &format!("move {} to namespace {ns}", spec.name),
                    "ip",
                    &["link", "set", &spec.name, "netns", ns],
                )
                .await?;
            if let Err(e) = iface::set_link_up_in_ns(&self.exec, ns, &spec.name).await {
                warn!("could not bring up {} in namespace {ns}: {e}", spec.name);
            }
            endpoint.namespace = Some(ns.clone());
            endpoint.status = InterfaceStatus::Up;
            return Ok(endpoint);
        }

        if let Some(bridge) = bridge {
            // Attach failures leave the endpoint placed but unbridged, as a
            // warning; the pair itself is already live.
            match attach_port(&self.exec, &self.registry, bridge, &spec.name, None).await {
                Ok(()) => endpoint.bridge = Some(bridge.to_string()),
                Err(e) => warn!("could not attach {} to bridge {bridge}: {e}", spec.name),
            }
        } else if let Err(e) = iface::set_link_up(&self.exec, &spec.name).await {
            warn!("could not bring up {}: {e}", spec.name);
        }
        endpoint.status = InterfaceStatus::Up;
        Ok(endpoint)
    }

    /// Delete a pair by either endpoint name. The kernel removes both ends.
    pub async fn delete_pair(&self, endpoint: &str) -> Result<()> {
        validate_ifname("name", endpoint)?;
        let _guard = self.registry.lock_key(&format!("if:{endpoint}")).await;

        let located = self.locate(endpoint).await?;
        match located {
            Some((_, None)) => {
                self.exec
                    .run_checked(
                        &format!("delete veth {endpoint}"),
                        "ip",
                        &["link", "delete", endpoint],
                    )
                    .await?;
            }
            Some((_, Some(ns))) => {
                self.exec
                    .run_checked(
                        &format!("delete veth {endpoint} in namespace {ns}"),
                        "ip",
                        &["-n", &ns, "link", "delete", endpoint],
                    )
                    .await?;
            }
            None => {
                if self.registry.remove_veth(endpoint).await.is_some() {
                    info!("veth {endpoint} already gone from the kernel; dropped stale record");
                }
                return Err(Error::not_found(format!("veth pair {endpoint}")));
            }
        }

        self.registry.remove_veth(endpoint).await;
        info!("deleted veth pair via endpoint {endpoint}");
        Ok(())
    }

    /// Re-home an endpoint onto a bridge. If it currently sits on another
    /// bridge it is detached first, never double-attached.
    pub async fn move_to_bridge(&self, name: &str, bridge: &str) -> Result<()> {
        validate_ifname("name", name)?;
        validate_ifname("bridge", bridge)?;
        let _guard = self.registry.lock_key(&format!("if:{name}")).await;

        let Some(link) = iface::link(&self.exec, name).await? else {
            return Err(Error::not_found(format!("veth {name}")));
        };

        if let Some(current) = &link.master {
            if current != bridge {
                detach_port(&self.exec, &self.registry, current, name).await?;
            }
        }
        attach_port(&self.exec, &self.registry, bridge, name, None).await?;

        self.registry
            .update_veth_endpoint(name, |ep| {
                ep.bridge = Some(bridge.to_string());
                ep.namespace = None;
            })
            .await;
        Ok(())
    }

    /// Move an endpoint into a namespace, creating it if missing, and bring
    /// the interface up inside it.
    pub async fn move_to_namespace(&self, name: &str, ns: &str) -> Result<()> {
        validate_ifname("name", name)?;
        validate_netns_name(ns)?;
        let _guard = self.registry.lock_key(&format!("if:{name}")).await;

        if iface::link(&self.exec, name).await?.is_none() {
            return Err(Error::not_found(format!("veth {name}")));
        }

        ensure_netns(&self.exec, ns).await?;
        self.exec
            .run_checked(
                &format!("move {name} to namespace {ns}"),
                "ip",
                &["link", "set", name, "netns", ns],
            )
            .await?;
        if let Err(e) = iface::set_link_up_in_ns(&self.exec, ns, name).await {
            warn!("could not bring up {name} in namespace {ns}: {e}");
        }

        self.registry
            .update_veth_endpoint(name, |ep| {
                // Moving namespaces clears any bridge enslavement.
                ep.namespace = Some(ns.to_string());
                ep.bridge = None;
            })
            .await;
        info!("moved veth {name} to namespace {ns}");
        Ok(())
    }

    /// Enumerate pairs visible in the default namespace, augmented with
    /// registry records whose endpoints live inside namespaces.
    pub async fn list(&self) -> Result<Vec<VethPairRecord>> {
        let links = iface::links(&self.exec, Some("veth")).await?;
        let mut seen: HashSet<String> = HashSet::new();
        let mut pairs = Vec::new();

        for link in &links {
            let Some(peer) = &link.peer else { continue };
            let key = veth_pair_key(&link.name, peer);
            if !seen.insert(key) {
                continue;
            }

            let first = endpoint_from_link(link, None);
            let second = match links.iter().find(|l| &l.name == peer) {
                Some(peer_link) => endpoint_from_link(peer_link, None),
                None => {
                    // Cross-namespace peers surface as `ifN`; the registry
                    // remembers where the other end went.
                    self.registry
                        .veth_pair(&link.name)
                        .await
                        .and_then(|p| p.peer_of(&link.name).cloned())
                        .unwrap_or_else(|| VethEndpoint::new(peer.clone()))
                }
            };
            pairs.push(VethPairRecord { first, second });
        }

        for record in self.registry.veth_pairs().await {
            if !pairs.iter().any(|p| p.key() == record.key()) {
                pairs.push(record);
            }
        }

        Ok(pairs)
    }

    /// Describe the pair containing an endpoint. A plain lookup miss falls
    /// back to scanning every known namespace.
    pub async fn get(&self, endpoint: &str) -> Result<VethPairRecord> {
        validate_ifname("name", endpoint)?;

        let Some((link, namespace)) = self.locate(endpoint).await? else {
            return Err(Error::not_found(format!("veth pair {endpoint}")));
        };

        let first = endpoint_from_link(&link, namespace.as_deref());
        let registry_pair = self.registry.veth_pair(endpoint).await;

        let Some(peer) = &link.peer else {
            return Err(Error::system(
                format!("describe veth {endpoint}"),
                "interface has no veth peer",
            ));
        };

        let second = match iface::link(&self.exec, peer).await? {
            Some(peer_link) => endpoint_from_link(&peer_link, None),
            // A cross-namespace peer surfaces only as `ifN`; the registry
            // remembers the real name and placement.
            None => registry_pair
                .as_ref()
                .and_then(|p| p.peer_of(endpoint).cloned())
                .unwrap_or_else(|| VethEndpoint::new(peer.clone())),
        };

        Ok(VethPairRecord { first, second })
    }

    /// Find an endpoint in the default namespace or any known namespace.
    async fn locate(&self, endpoint: &str) -> Result<Option<(LinkLine, Option<String>)>> {
        if let Some(link) = iface::link(&self.exec, endpoint).await? {
            return Ok(Some((link, None)));
        }
        for ns in netns_list(&self.exec).await? {
            if let Some(link) = iface::link_in_ns(&self.exec, &ns, endpoint).await? {
                return Ok(Some((link, Some(ns))));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> VethController {
        VethController::new(
            Executor::default(),
            Arc::new(TopologyRegistry::in_memory().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_identical_endpoint_names_rejected() {
        let ctl = controller();
        let err = ctl
            .create_pair(VethEndpointSpec::new("veth-a"), VethEndpointSpec::new("veth-a"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_bad_namespace_name_rejected_before_any_command() {
        let ctl = controller();
        let mut second = VethEndpointSpec::new("veth-b");
        second.namespace = Some("bad ns".to_string());
        let err = ctl
            .create_pair(VethEndpointSpec::new("veth-a"), second)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    #[ignore] // Requires root privileges
    async fn test_deleting_either_endpoint_removes_both() {
        let ctl = controller();
        ctl.create_pair(
            VethEndpointSpec::new("nf-veth-a"),
            VethEndpointSpec::new("nf-veth-b"),
        )
        .await
        .expect("create pair");

        ctl.delete_pair("nf-veth-a").await.expect("delete by first endpoint");

        let err = ctl.get("nf-veth-b").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
