//! Bridge controller: kernel bridges and Open vSwitch bridges behind one
//! contract.
//!
//! A bridge's backend is fixed at creation and decides which command family
//! every later port/VLAN operation uses. List/get re-derive state from the
//! live backends on every call because bridges come and go outside this
//! process.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::exec::Executor;
use crate::iface;
use crate::parse::ovs;
use crate::registry::TopologyRegistry;
use crate::types::{
    validate_ifname, validate_vlan_id, BridgeBackend, BridgeRecord, InterfaceStatus,
};

impl BridgeBackend {
    async fn create_bridge(self, exec: &Executor, name: &str, stp: bool) -> Result<()> {
        match self {
            Self::Kernel => {
                exec.run_checked(
                    &format!("create bridge {name}"),
                    "ip",
                    &["link", "add", "name", name, "type", "bridge"],
                )
                .await?;
                if stp {
                    exec.run_checked(
                        &format!("enable stp on {name}"),
                        "ip",
                        &["link", "set", name, "type", "bridge", "stp_state", "1"],
                    )
                    .await?;
                }
            }
            Self::Switch => {
                exec.run_checked(
                    &format!("create bridge {name}"),
                    "ovs-vsctl",
                    &["add-br", name],
                )
                .await?;
                if stp {
                    exec.run_checked(
                        &format!("enable stp on {name}"),
                        "ovs-vsctl",
                        &["set", "bridge", name, "stp_enable=true"],
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn delete_bridge(self, exec: &Executor, name: &str) -> Result<()> {
        match self {
            Self::Kernel => {
                // Bring it down first; failure here is not fatal for delete.
                let down = exec.run("ip", &["link", "set", name, "down"]).await?;
                if !down.success {
                    debug!("bringing down bridge {name} failed: {}", down.diagnostic());
                }
                exec.run_checked(
                    &format!("delete bridge {name}"),
                    "ip",
                    &["link", "delete", name, "type", "bridge"],
                )
                .await?;
            }
            Self::Switch => {
                exec.run_checked(
                    &format!("delete bridge {name}"),
                    "ovs-vsctl",
                    &["del-br", name],
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn attach(
        self,
        exec: &Executor,
        bridge: &str,
        port: &str,
        vlan: Option<u16>,
    ) -> Result<()> {
        match self {
            Self::Kernel => {
                exec.run_checked(
                    &format!("attach {port} to {bridge}"),
                    "ip",
                    &["link", "set", port, "master", bridge],
                )
                .await?;
            }
            Self::Switch => {
                let tag;
                let mut args = vec!["add-port", bridge, port];
                if let Some(vlan) = vlan {
                    tag = format!("tag={vlan}");
                    args.push(&tag);
                }
                exec.run_checked(&format!("attach {port} to {bridge}"), "ovs-vsctl", &args)
                    .await?;
            }
        }
        Ok(())
    }

    async fn detach(self, exec: &Executor, bridge: &str, port: &str) -> Result<()> {
        match self {
            Self::Kernel => {
                exec.run_checked(
                    &format!("detach {port} from {bridge}"),
                    "ip",
                    &["link", "set", port, "nomaster"],
                )
                .await?;
            }
            Self::Switch => {
                exec.run_checked(
                    &format!("detach {port} from {bridge}"),
                    "ovs-vsctl",
                    &["del-port", bridge, port],
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn describe_ports(self, exec: &Executor, bridge: &str) -> Result<Vec<String>> {
        match self {
            Self::Kernel => Ok(iface::links_with_master(exec, bridge)
                .await?
                .into_iter()
                .map(|l| l.name)
                .collect()),
            Self::Switch => {
                let output = exec
                    .run_checked(
                        &format!("list ports of {bridge}"),
                        "ovs-vsctl",
                        &["list-ports", bridge],
                    )
                    .await?;
                Ok(ovs::parse_name_list(&output.stdout))
            }
        }
    }
}

/// Enumerate switch bridges. `None` means the switch backend is not present
/// on this host, which only narrows enumeration, not an error.
async fn switch_bridges(exec: &Executor) -> Result<Option<Vec<String>>> {
    match exec.run("ovs-vsctl", &["list-br"]).await {
        Ok(output) if output.success => Ok(Some(ovs::parse_name_list(&output.stdout))),
        Ok(output) => {
            warn!("ovs-vsctl list-br failed: {}", output.diagnostic());
            Ok(None)
        }
        Err(Error::BackendUnavailable { .. }) => {
            debug!("ovs-vsctl not installed, skipping switch bridges");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Resolve which backend owns a bridge name: the registry remembers what we
/// created; for bridges created outside this process, a live switch bridge
/// wins over a live kernel link of the same name.
pub(crate) async fn resolve_backend(
    exec: &Executor,
    registry: &TopologyRegistry,
    name: &str,
) -> Result<Option<BridgeBackend>> {
    if let Some(record) = registry.bridge(name).await {
        return Ok(Some(record.backend));
    }
    if let Some(bridges) = switch_bridges(exec).await? {
        if bridges.iter().any(|b| b == name) {
            return Ok(Some(BridgeBackend::Switch));
        }
    }
    match iface::link(exec, name).await? {
        Some(link) if iface::classify(&link) == crate::types::InterfaceKind::Bridge => {
            Ok(Some(BridgeBackend::Kernel))
        }
        _ => Ok(None),
    }
}

/// Attach a port to a bridge of whatever backend, bringing the port up.
/// Shared with the veth/VLAN/TUN-TAP controllers.
pub(crate) async fn attach_port(
    exec: &Executor,
    registry: &TopologyRegistry,
    bridge: &str,
    port: &str,
    vlan: Option<u16>,
) -> Result<()> {
    let Some(backend) = resolve_backend(exec, registry, bridge).await? else {
        return Err(Error::not_found(format!("bridge {bridge}")));
    };
    backend.attach(exec, bridge, port, vlan).await?;

    if let Err(e) = iface::set_link_up(exec, port).await {
        warn!("attached {port} to {bridge} but could not bring it up: {e}");
    }

    if let Some(mut record) = registry.bridge(bridge).await {
        record.ports.insert(port.to_string());
        if let Some(vlan) = vlan {
            record.vlans.insert(vlan);
        }
        registry.upsert_bridge(record).await;
    }
    info!("attached port {port} to bridge {bridge}");
    Ok(())
}

/// Detach a port from a bridge of whatever backend.
pub(crate) async fn detach_port(
    exec: &Executor,
    registry: &TopologyRegistry,
    bridge: &str,
    port: &str,
) -> Result<()> {
    let Some(backend) = resolve_backend(exec, registry, bridge).await? else {
        return Err(Error::not_found(format!("bridge {bridge}")));
    };
    backend.detach(exec, bridge, port).await?;

    if let Some(mut record) = registry.bridge(bridge).await {
        record.ports.remove(port);
        registry.upsert_bridge(record).await;
    }
    info!("detached port {port} from bridge {bridge}");
    Ok(())
}

pub struct BridgeController {
    exec: Executor,
    registry: Arc<TopologyRegistry>,
}

impl BridgeController {
    pub fn new(exec: Executor, registry: Arc<TopologyRegistry>) -> Self {
        Self { exec, registry }
    }

    /// Create a bridge and bring it administratively up.
    pub async fn create(
        &self,
        name: &str,
        backend: BridgeBackend,
        stp: bool,
    ) -> Result<BridgeRecord> {
        validate_ifname("bridge_name", name)?;
        let _guard = self.registry.lock_key(&format!("if:{name}")).await;

        if self.registry.bridge(name).await.is_some()
            || iface::link(&self.exec, name).await?.is_some()
        {
            return Err(Error::conflict(format!("interface {name} already exists")));
        }

        backend.create_bridge(&self.exec, name, stp).await?;

        if let Err(e) = iface::set_link_up(&self.exec, name).await {
            warn!("created bridge {name} but could not bring it up: {e}");
        }

        let mut record = BridgeRecord::new(name, backend, stp);
        record.status = InterfaceStatus::Up;
        self.registry.upsert_bridge(record.clone()).await;

        info!("created {backend} bridge {name} (stp: {stp})");
        Ok(record)
    }

    /// Delete a bridge. Without `force` this fails while ports are attached;
    /// with `force` every known port is detached best-effort first and the
    /// delete is attempted regardless of individual detach failures.
    pub async fn delete(&self, name: &str, force: bool) -> Result<()> {
        let _guard = self.registry.lock_key(&format!("if:{name}")).await;

        let Some(backend) = resolve_backend(&self.exec, &self.registry, name).await? else {
            return Err(Error::not_found(format!("bridge {name}")));
        };

        // A recorded kernel bridge with no live link is drift: drop the
        // stale record instead of issuing a delete that cannot succeed.
        if backend == BridgeBackend::Kernel && iface::link(&self.exec, name).await?.is_none() {
            if self.registry.remove_bridge(name).await.is_some() {
                info!("bridge {name} already gone from the kernel; dropped stale record");
            }
            return Err(Error::not_found(format!("bridge {name}")));
        }

        let ports = match backend.describe_ports(&self.exec, name).await {
            Ok(ports) => ports,
            Err(e) => {
                warn!("could not enumerate ports of {name}: {e}");
                Vec::new()
            }
        };

        if !ports.is_empty() {
            if !force {
                return Err(Error::conflict(format!(
                    "bridge {name} has {} attached port(s); detach them or pass force",
                    ports.len()
                )));
            }
            for port in &ports {
                if let Err(e) = backend.detach(&self.exec, name, port).await {
                    warn!("force-delete of {name}: failed to detach {port}: {e}");
                }
            }
        }

        backend.delete_bridge(&self.exec, name).await?;
        self.registry.remove_bridge(name).await;

        info!("deleted {backend} bridge {name}");
        Ok(())
    }

    /// Attach a port. For switch bridges an optional VLAN tags the port at
    /// attach time; kernel bridges tag per-port VLANs through the VLAN
    /// controller instead.
    pub async fn add_port(&self, bridge: &str, port: &str, vlan: Option<u16>) -> Result<()> {
        validate_ifname("bridge_name", bridge)?;
        validate_ifname("port_name", port)?;
        if let Some(vlan) = vlan {
            validate_vlan_id(vlan)?;
        }
        let _guard = self.registry.lock_key(&format!("if:{port}")).await;

        let Some(backend) = resolve_backend(&self.exec, &self.registry, bridge).await? else {
            return Err(Error::not_found(format!("bridge {bridge}")));
        };
        if backend == BridgeBackend::Kernel && vlan.is_some() {
            return Err(Error::validation(
                "vlan",
                "kernel bridges tag per-port VLANs through the VLAN controller",
            ));
        }
        if iface::link(&self.exec, port).await?.is_none() {
            return Err(Error::not_found(format!("interface {port}")));
        }

        attach_port(&self.exec, &self.registry, bridge, port, vlan).await
    }

    pub async fn remove_port(&self, bridge: &str, port: &str) -> Result<()> {
        validate_ifname("bridge_name", bridge)?;
        validate_ifname("port_name", port)?;
        let _guard = self.registry.lock_key(&format!("if:{port}")).await;

        if resolve_backend(&self.exec, &self.registry, bridge).await?.is_none() {
            return Err(Error::not_found(format!("bridge {bridge}")));
        }
        detach_port(&self.exec, &self.registry, bridge, port).await
    }

    /// Enumerate live bridges across both backends, reconciling the
    /// registry: external creations are adopted, vanished bridges dropped.
    pub async fn list(&self) -> Result<Vec<BridgeRecord>> {
        let mut records = Vec::new();
        let mut live_names = Vec::new();

        for link in iface::links(&self.exec, Some("bridge")).await? {
            let record = self
                .build_record(&link.name, BridgeBackend::Kernel, link.status())
                .await?;
            live_names.push(link.name);
            records.push(record);
        }

        if let Some(switch) = switch_bridges(&self.exec).await? {
            for name in switch {
                if live_names.contains(&name) {
                    // An OVS bridge also surfaces as a kernel link; the
                    // switch backend owns it.
                    if let Some(existing) = records.iter_mut().find(|r| r.name == name) {
                        existing.backend = BridgeBackend::Switch;
                    }
                    continue;
                }
                let record = self
                    .build_record(&name, BridgeBackend::Switch, InterfaceStatus::Up)
                    .await?;
                live_names.push(name);
                records.push(record);
            }
        }

        // Reconcile: adopt what exists, drop what vanished.
        for record in &records {
            self.registry.upsert_bridge(record.clone()).await;
        }
        for stale in self.registry.bridges().await {
            if !live_names.contains(&stale.name) {
                info!("bridge {} vanished outside this process", stale.name);
                self.registry.remove_bridge(&stale.name).await;
            }
        }

        Ok(records)
    }

    /// Describe one bridge, re-derived from the live backend.
    pub async fn get(&self, name: &str) -> Result<BridgeRecord> {
        let Some(backend) = resolve_backend(&self.exec, &self.registry, name).await? else {
            return Err(Error::not_found(format!("bridge {name}")));
        };

        let status = match iface::link(&self.exec, name).await? {
            Some(link) => link.status(),
            None if backend == BridgeBackend::Switch => InterfaceStatus::Up,
            None => return Err(Error::not_found(format!("bridge {name}"))),
        };

        let record = self.build_record(name, backend, status).await?;
        self.registry.upsert_bridge(record.clone()).await;
        Ok(record)
    }

    async fn build_record(
        &self,
        name: &str,
        backend: BridgeBackend,
        status: InterfaceStatus,
    ) -> Result<BridgeRecord> {
        let known = self.registry.bridge(name).await;
        let mut record = BridgeRecord::new(
            name,
            known.as_ref().map_or(backend, |r| r.backend),
            known.as_ref().is_some_and(|r| r.stp),
        );
        record.status = status;
        record.vlans = known.map(|r| r.vlans).unwrap_or_default();
        record.ports = record
            .backend
            .describe_ports(&self.exec, name)
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> BridgeController {
        BridgeController::new(
            Executor::default(),
            Arc::new(TopologyRegistry::in_memory().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_create_rejects_bad_names() {
        let ctl = controller();
        let err = ctl
            .create("", BridgeBackend::Kernel, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);

        let err = ctl
            .create("a-bridge-name-far-too-long", BridgeBackend::Kernel, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);

        let err = ctl
            .create("bad name", BridgeBackend::Kernel, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_add_port_rejects_vlan_on_kernel_backend() {
        let ctl = controller();
        ctl.registry
            .upsert_bridge(BridgeRecord::new("br0", BridgeBackend::Kernel, false))
            .await;

        let err = ctl.add_port("br0", "eth0", Some(100)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_add_port_validates_vlan_range() {
        let ctl = controller();
        let err = ctl.add_port("br0", "eth0", Some(4095)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    #[ignore] // Requires root privileges
    async fn test_create_add_remove_delete_round_trip() {
        let ctl = controller();
        ctl.create("nf-br-test", BridgeBackend::Kernel, false)
            .await
            .expect("create bridge");

        let record = ctl.get("nf-br-test").await.expect("get bridge");
        assert_eq!(record.backend, BridgeBackend::Kernel);
        assert!(record.ports.is_empty());

        ctl.delete("nf-br-test", false).await.expect("delete bridge");
        assert!(ctl.get("nf-br-test").await.is_err());
    }
}
