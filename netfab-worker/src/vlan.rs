//! VLAN controller: tagged sub-interfaces on a parent interface, plus VLAN
//! bindings on bridge ports.
//!
//! On a switch-backend bridge a binding is a port attribute (`tag` for
//! access, `trunks` for trunk membership) with no derived interface. Kernel
//! bridges have no per-port VLAN filtering in this design, so a binding
//! there synthesizes a VLAN sub-interface on the port and attaches it to the
//! bridge as a new port.

use std::sync::Arc;

use tracing::{info, warn};

use crate::bridge::{attach_port, detach_port, resolve_backend};
use crate::error::{Error, ErrorKind, Result};
use crate::exec::Executor;
use crate::iface;
use crate::parse::ovs;
use crate::registry::TopologyRegistry;
use crate::types::{
    validate_ifname, validate_vlan_id, BridgeBackend, BridgeVlanBinding, InterfaceStatus,
    VlanProtocol, VlanRecord,
};

async fn port_trunks(exec: &Executor, port: &str) -> Result<Vec<u16>> {
    let output = exec
        .run_checked(
            &format!("read trunks of {port}"),
            "ovs-vsctl",
            &["get", "port", port, "trunks"],
        )
        .await?;
    Ok(ovs::parse_id_set(&output.stdout))
}

async fn port_tag(exec: &Executor, port: &str) -> Result<Option<u16>> {
    let output = exec
        .run_checked(
            &format!("read tag of {port}"),
            "ovs-vsctl",
            &["get", "port", port, "tag"],
        )
        .await?;
    Ok(ovs::parse_optional_id(&output.stdout))
}

pub struct VlanController {
    exec: Executor,
    registry: Arc<TopologyRegistry>,
}

impl VlanController {
    pub fn new(exec: Executor, registry: Arc<TopologyRegistry>) -> Self {
        Self { exec, registry }
    }

    /// Create a tagged sub-interface on `parent`. The derived name defaults
    /// to `parent.vlan_id`.
    pub async fn create(
        &self,
        parent: &str,
        vlan_id: u16,
        name: Option<&str>,
        protocol: VlanProtocol,
    ) -> Result<VlanRecord> {
        // Range check comes first: no backend command ever runs for an
        // invalid id.
        validate_vlan_id(vlan_id)?;
        validate_ifname("parent_interface", parent)?;
        let ifname = name.map_or_else(|| format!("{parent}.{vlan_id}"), String::from);
        validate_ifname("vlan_name", &ifname)?;

        let _guard = self.registry.lock_key(&format!("if:{ifname}")).await;

        if iface::link(&self.exec, parent).await?.is_none() {
            return Err(Error::not_found(format!("parent interface {parent}")));
        }
        if iface::link(&self.exec, &ifname).await?.is_some() {
            return Err(Error::conflict(format!("interface {ifname} already exists")));
        }

        let id = vlan_id.to_string();
        let mut args = vec![
            "link",
            "add",
            "link",
            parent,
            "name",
            ifname.as_str(),
            "type",
            "vlan",
            "id",
            id.as_str(),
        ];
        if protocol == VlanProtocol::Ieee8021Ad {
            args.extend(["protocol", "802.1ad"]);
        }
        self.exec
            .run_checked(&format!("create vlan {ifname}"), "ip", &args)
            .await?;

        if let Err(e) = iface::set_link_up(&self.exec, &ifname).await {
            warn!("created vlan {ifname} but could not bring it up: {e}");
        }

        let record = VlanRecord {
            parent: parent.to_string(),
            vlan_id,
            ifname: ifname.clone(),
            protocol,
            status: InterfaceStatus::Up,
            mtu: None,
        };
        self.registry.upsert_vlan(record.clone()).await;

        info!("created vlan {vlan_id} on {parent} as {ifname} ({protocol})");
        Ok(record)
    }

    /// Delete the sub-interface carrying `vlan_id` on `parent`.
    pub async fn delete(&self, parent: &str, vlan_id: u16) -> Result<()> {
        validate_vlan_id(vlan_id)?;
        validate_ifname("parent_interface", parent)?;

        let Some(ifname) = self.find_ifname(parent, vlan_id).await? else {
            return Err(Error::not_found(format!("vlan {vlan_id} on {parent}")));
        };
        let _guard = self.registry.lock_key(&format!("if:{ifname}")).await;

        self.exec
            .run_checked(
                &format!("delete vlan {ifname}"),
                "ip",
                &["link", "delete", &ifname],
            )
            .await?;
        self.registry.remove_vlan(&ifname).await;

        info!("deleted vlan {vlan_id} on {parent} ({ifname})");
        Ok(())
    }

    /// Bind a VLAN to a bridge port: access (`tagged = false`) sets the port
    /// tag, trunk (`tagged = true`) adds to the trunk set.
    pub async fn bind_to_bridge_port(
        &self,
        bridge: &str,
        port: &str,
        vlan_id: u16,
        tagged: bool,
    ) -> Result<()> {
        validate_vlan_id(vlan_id)?;
        validate_ifname("bridge_name", bridge)?;
        validate_ifname("port_name", port)?;
        let _guard = self.registry.lock_key(&format!("if:{port}")).await;

        let Some(backend) = resolve_backend(&self.exec, &self.registry, bridge).await? else {
            return Err(Error::not_found(format!("bridge {bridge}")));
        };

        match backend {
            BridgeBackend::Switch => {
                if tagged {
                    let mut trunks = port_trunks(&self.exec, port).await?;
                    if !trunks.contains(&vlan_id) {
                        trunks.push(vlan_id);
                        trunks.sort_unstable();
                    }
                    let value = format!(
                        "trunks={}",
                        trunks
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(",")
                    );
                    self.exec
                        .run_checked(
                            &format!("trunk vlan {vlan_id} on {port}"),
                            "ovs-vsctl",
                            &["set", "port", port, &value],
                        )
                        .await?;
                } else {
                    let value = format!("tag={vlan_id}");
                    self.exec
                        .run_checked(
                            &format!("tag vlan {vlan_id} on {port}"),
                            "ovs-vsctl",
                            &["set", "port", port, &value],
                        )
                        .await?;
                }
            }
            BridgeBackend::Kernel => {
                // Synthesize a sub-interface on the port and attach it as a
                // new bridge port. Reuse one that already exists.
                let subif = match self.create(port, vlan_id, None, VlanProtocol::Ieee8021Q).await {
                    Ok(record) => record.ifname,
                    Err(e) if e.kind() == ErrorKind::Conflict => format!("{port}.{vlan_id}"),
                    Err(e) => return Err(e),
                };
                attach_port(&self.exec, &self.registry, bridge, &subif, None).await?;
            }
        }

        self.registry
            .upsert_vlan_binding(BridgeVlanBinding {
                bridge: bridge.to_string(),
                port: port.to_string(),
                vlan_id,
                tagged,
            })
            .await;
        if let Some(mut record) = self.registry.bridge(bridge).await {
            record.vlans.insert(vlan_id);
            self.registry.upsert_bridge(record).await;
        }

        info!(
            "bound vlan {vlan_id} ({}) to port {port} on bridge {bridge}",
            if tagged { "trunk" } else { "access" }
        );
        Ok(())
    }

    /// Mirror of bind. Removing the last trunk entry clears the trunk
    /// attribute entirely rather than leaving an empty set behind.
    pub async fn unbind_from_bridge_port(
        &self,
        bridge: &str,
        port: &str,
        vlan_id: u16,
    ) -> Result<()> {
        validate_vlan_id(vlan_id)?;
        validate_ifname("bridge_name", bridge)?;
        validate_ifname("port_name", port)?;
        let _guard = self.registry.lock_key(&format!("if:{port}")).await;

        let Some(backend) = resolve_backend(&self.exec, &self.registry, bridge).await? else {
            return Err(Error::not_found(format!("bridge {bridge}")));
        };

        match backend {
            BridgeBackend::Switch => {
                let trunks = port_trunks(&self.exec, port).await?;
                if trunks.contains(&vlan_id) {
                    let remaining: Vec<String> = trunks
                        .iter()
                        .filter(|id| **id != vlan_id)
                        .map(ToString::to_string)
                        .collect();
                    if remaining.is_empty() {
                        self.exec
                            .run_checked(
                                &format!("clear trunks of {port}"),
                                "ovs-vsctl",
                                &["clear", "port", port, "trunks"],
                            )
                            .await?;
                    } else {
                        let value = format!("trunks={}", remaining.join(","));
                        self.exec
                            .run_checked(
                                &format!("untrunk vlan {vlan_id} on {port}"),
                                "ovs-vsctl",
                                &["set", "port", port, &value],
                            )
                            .await?;
                    }
                } else if port_tag(&self.exec, port).await? == Some(vlan_id) {
                    self.exec
                        .run_checked(
                            &format!("clear tag of {port}"),
                            "ovs-vsctl",
                            &["clear", "port", port, "tag"],
                        )
                        .await?;
                } else {
                    return Err(Error::not_found(format!(
                        "vlan {vlan_id} on port {port} of bridge {bridge}"
                    )));
                }
            }
            BridgeBackend::Kernel => {
                let subif = self
                    .find_ifname(port, vlan_id)
                    .await?
                    .ok_or_else(|| {
                        Error::not_found(format!("vlan {vlan_id} on port {port} of bridge {bridge}"))
                    })?;
                if let Err(e) = detach_port(&self.exec, &self.registry, bridge, &subif).await {
                    warn!("could not detach {subif} from {bridge} before delete: {e}");
                }
                self.delete(port, vlan_id).await?;
            }
        }

        self.registry.remove_vlan_binding(bridge, port, vlan_id).await;
        if let Some(mut record) = self.registry.bridge(bridge).await {
            record.vlans.remove(&vlan_id);
            self.registry.upsert_bridge(record).await;
        }

        info!("unbound vlan {vlan_id} from port {port} on bridge {bridge}");
        Ok(())
    }

    /// Enumerate live VLAN sub-interfaces, reconciling the registry.
    pub async fn list(&self) -> Result<Vec<VlanRecord>> {
        let mut records = Vec::new();
        for link in iface::links(&self.exec, Some("vlan")).await? {
            let (Some(vlan_id), Some(parent)) = (link.vlan_id, link.peer.clone()) else {
                continue;
            };
            let protocol = match link.vlan_protocol.as_deref() {
                Some("802.1ad") => VlanProtocol::Ieee8021Ad,
                _ => VlanProtocol::Ieee8021Q,
            };
            let record = VlanRecord {
                parent,
                vlan_id,
                ifname: link.name.clone(),
                protocol,
                status: link.status(),
                mtu: link.mtu,
            };
            self.registry.upsert_vlan(record.clone()).await;
            records.push(record);
        }

        for stale in self.registry.vlans().await {
            if !records.iter().any(|r| r.ifname == stale.ifname) {
                info!("vlan {} vanished outside this process", stale.ifname);
                self.registry.remove_vlan(&stale.ifname).await;
            }
        }

        Ok(records)
    }

    /// VLAN bindings on bridge ports: live switch state plus the registry's
    /// kernel-side synthesized bindings.
    pub async fn list_bridge_vlans(&self) -> Result<Vec<BridgeVlanBinding>> {
        let mut bindings = Vec::new();

        for record in self.registry.bridges().await {
            if record.backend != BridgeBackend::Switch {
                continue;
            }
            let ports = match self
                .exec
                .run_checked(
                    &format!("list ports of {}", record.name),
                    "ovs-vsctl",
                    &["list-ports", &record.name],
                )
                .await
            {
                Ok(output) => ovs::parse_name_list(&output.stdout),
                Err(e) => {
                    warn!("could not list ports of {}: {e}", record.name);
                    continue;
                }
            };
            for port in ports {
                if let Some(tag) = port_tag(&self.exec, &port).await? {
                    bindings.push(BridgeVlanBinding {
                        bridge: record.name.clone(),
                        port: port.clone(),
                        vlan_id: tag,
                        tagged: false,
                    });
                }
                for vlan_id in port_trunks(&self.exec, &port).await? {
                    bindings.push(BridgeVlanBinding {
                        bridge: record.name.clone(),
                        port: port.clone(),
                        vlan_id,
                        tagged: true,
                    });
                }
            }
        }

        for binding in self.registry.vlan_bindings().await {
            if !bindings.contains(&binding) {
                bindings.push(binding);
            }
        }

        Ok(bindings)
    }

    /// Describe one VLAN, re-derived from the live interface.
    pub async fn get(&self, parent: &str, vlan_id: u16) -> Result<VlanRecord> {
        validate_vlan_id(vlan_id)?;
        let Some(ifname) = self.find_ifname(parent, vlan_id).await? else {
            return Err(Error::not_found(format!("vlan {vlan_id} on {parent}")));
        };
        let Some(link) = iface::link(&self.exec, &ifname).await? else {
            return Err(Error::not_found(format!("vlan {vlan_id} on {parent}")));
        };
        let protocol = match link.vlan_protocol.as_deref() {
            Some("802.1ad") => VlanProtocol::Ieee8021Ad,
            _ => VlanProtocol::Ieee8021Q,
        };
        Ok(VlanRecord {
            parent: parent.to_string(),
            vlan_id,
            ifname,
            protocol,
            status: link.status(),
            mtu: link.mtu,
        })
    }

    /// Resolve the derived interface name for (parent, vlan_id): the
    /// registry remembers custom names; otherwise the conventional
    /// candidates are probed live.
    async fn find_ifname(&self, parent: &str, vlan_id: u16) -> Result<Option<String>> {
        if let Some(record) = self.registry.vlan_by_parent(parent, vlan_id).await {
            return Ok(Some(record.ifname));
        }
        for candidate in [
            format!("{parent}.{vlan_id}"),
            format!("vlan{vlan_id}"),
            format!("{parent}_{vlan_id}"),
        ] {
            if let Some(link) = iface::link(&self.exec, &candidate).await? {
                if link.vlan_id == Some(vlan_id) || link.kind.is_none() {
                    return Ok(Some(candidate));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> VlanController {
        VlanController::new(
            Executor::default(),
            Arc::new(TopologyRegistry::in_memory().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_vlan_id_range_rejected_before_any_command() {
        let ctl = controller();
        for bad in [0u16, 4095] {
            let err = ctl
                .create("eth0", bad, None, VlanProtocol::Ieee8021Q)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);

            let err = ctl.delete("eth0", bad).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);

            let err = ctl
                .bind_to_bridge_port("br0", "eth0", bad, true)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
    }

    #[tokio::test]
    async fn test_derived_name_must_fit_ifname_limit() {
        let ctl = controller();
        // parent.vlan_id would be 16 chars: rejected before any command.
        let err = ctl
            .create("enp0s31f6x", 4094, None, VlanProtocol::Ieee8021Q)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    #[ignore] // Requires root privileges
    async fn test_create_and_delete_vlan() {
        let ctl = controller();
        let record = ctl
            .create("lo", 100, Some("nf-vlan100"), VlanProtocol::Ieee8021Q)
            .await
            .expect("create vlan");
        assert_eq!(record.ifname, "nf-vlan100");

        ctl.delete("lo", 100).await.expect("delete vlan");
    }
}
