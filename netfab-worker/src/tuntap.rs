//! TUN/TAP device controller.
//!
//! Owner and group must resolve to existing system identities before the
//! device is created. Only TAP devices may be bridged (a TUN device has no
//! L2 frame to bridge), and that invariant is enforced before any command
//! runs.

use std::sync::Arc;

use ipnetwork::IpNetwork;
use tracing::{info, warn};

use crate::bridge::{attach_port, detach_port};
use crate::error::{Error, Result};
use crate::exec::Executor;
use crate::iface;
use crate::registry::TopologyRegistry;
use crate::types::{validate_ifname, InterfaceStatus, TunTapKind, TunTapMode, TunTapRecord};

/// Creation request for a TUN/TAP device.
#[derive(Debug, Clone)]
pub struct TunTapSpec {
    pub name: String,
    pub kind: TunTapKind,
    pub mode: TunTapMode,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub bridge: Option<String>,
    pub persistent: bool,
}

impl TunTapSpec {
    pub fn new(name: impl Into<String>, kind: TunTapKind) -> Self {
        Self {
            name: name.into(),
            kind,
            mode: TunTapMode::default(),
            owner: None,
            group: None,
            bridge: None,
            persistent: false,
        }
    }
}

fn resolve_owner(owner: &str) -> Result<()> {
    match nix::unistd::User::from_name(owner) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(Error::validation(
            "owner",
            format!("user '{owner}' does not exist"),
        )),
        Err(e) => Err(Error::system("resolve owner", e.to_string())),
    }
}

fn resolve_group(group: &str) -> Result<()> {
    match nix::unistd::Group::from_name(group) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(Error::validation(
            "group",
            format!("group '{group}' does not exist"),
        )),
        Err(e) => Err(Error::system("resolve group", e.to_string())),
    }
}

pub struct TunTapController {
    exec: Executor,
    registry: Arc<TopologyRegistry>,
}

impl TunTapController {
    pub fn new(exec: Executor, registry: Arc<TopologyRegistry>) -> Self {
        Self { exec, registry }
    }

    pub async fn create(&self, spec: TunTapSpec) -> Result<TunTapRecord> {
        validate_ifname("name", &spec.name)?;
        if spec.bridge.is_some() && spec.kind == TunTapKind::Tun {
            return Err(Error::validation(
                "bridge",
                "TUN devices carry no L2 frames and cannot be bridged",
            ));
        }
        if let Some(bridge) = &spec.bridge {
            validate_ifname("bridge", bridge)?;
        }
        if let Some(owner) = &spec.owner {
            resolve_owner(owner)?;
        }
        if let Some(group) = &spec.group {
            resolve_group(group)?;
        }

        let _guard = self.registry.lock_key(&format!("if:{}", spec.name)).await;

        if iface::link(&self.exec, &spec.name).await?.is_some() {
            return Err(Error::conflict(format!(
                "interface {} already exists",
                spec.name
            )));
        }

        let mut args = vec![
            "tuntap",
            "add",
            "dev",
            spec.name.as_str(),
            "mode",
            spec.kind.as_str(),
        ];
        if let Some(owner) = &spec.owner {
            args.extend(["user", owner.as_str()]);
        }
        if let Some(group) = &spec.group {
            args.extend(["group", group.as_str()]);
        }
        self.exec
            .run_checked(&format!("create {} {}", spec.kind, spec.name), "ip", &args)
            .await?;

        if let Err(e) = iface::set_link_up(&self.exec, &spec.name).await {
            warn!("created {} but could not bring it up: {e}", spec.name);
        }

        let mut record = TunTapRecord {
            name: spec.name.clone(),
            kind: spec.kind,
            mode: spec.mode,
            owner: spec.owner.clone(),
            group: spec.group.clone(),
            bridge: None,
            persistent: spec.persistent,
            status: InterfaceStatus::Up,
        };

        if let Some(bridge) = &spec.bridge {
            if let Err(e) = attach_port(&self.exec, &self.registry, bridge, &spec.name, None).await
            {
                // The device exists; record it so it stays addressable.
                self.registry.upsert_tuntap(record).await;
                return Err(Error::partial(
                    format!("create {} {}", spec.kind, spec.name),
                    format!("bridge attach failed: {e}"),
                    vec!["create".to_string()],
                ));
            }
            record.bridge = Some(bridge.clone());
        }

        self.registry.upsert_tuntap(record.clone()).await;
        info!("created {} device {}", spec.kind, spec.name);
        Ok(record)
    }

    /// Delete a device, detaching it from its bridge first if needed.
    pub async fn delete(&self, name: &str) -> Result<()> {
        validate_ifname("name", name)?;
        let _guard = self.registry.lock_key(&format!("if:{name}")).await;

        let record = self.registry.tuntap(name).await;
        let live = iface::link(&self.exec, name).await?;
        if live.is_none() && record.is_none() {
            return Err(Error::not_found(format!("tun/tap device {name}")));
        }

        let kind = match (&live, &record) {
            (Some(link), _) if link.tun_kind.as_deref() == Some("tun") => TunTapKind::Tun,
            (Some(link), _) if link.tun_kind.as_deref() == Some("tap") => TunTapKind::Tap,
            (_, Some(record)) => record.kind,
            _ => return Err(Error::not_found(format!("tun/tap device {name}"))),
        };

        let attached = live
            .as_ref()
            .and_then(|l| l.master.clone())
            .or_else(|| record.as_ref().and_then(|r| r.bridge.clone()));
        if let Some(bridge) = attached {
            if let Err(e) = detach_port(&self.exec, &self.registry, &bridge, name).await {
                warn!("could not detach {name} from {bridge} before delete: {e}");
            }
        }

        self.exec
            .run_checked(
                &format!("delete {kind} {name}"),
                "ip",
                &["tuntap", "del", "dev", name, "mode", kind.as_str()],
            )
            .await?;
        self.registry.remove_tuntap(name).await;

        info!("deleted {kind} device {name}");
        Ok(())
    }

    /// Attach a TAP device to a bridge; an existing attachment elsewhere is
    /// released first.
    pub async fn attach_to_bridge(&self, name: &str, bridge: &str) -> Result<()> {
        validate_ifname("name", name)?;
        validate_ifname("bridge", bridge)?;
        let _guard = self.registry.lock_key(&format!("if:{name}")).await;

        let Some(link) = iface::link(&self.exec, name).await? else {
            return Err(Error::not_found(format!("tun/tap device {name}")));
        };
        let is_tap = link.tun_kind.as_deref() == Some("tap")
            || self
                .registry
                .tuntap(name)
                .await
                .is_some_and(|r| r.kind == TunTapKind::Tap);
        if !is_tap {
            return Err(Error::validation(
                "name",
                format!("{name} is not a TAP device; only TAP devices attach to bridges"),
            ));
        }

        if let Some(current) = &link.master {
            if current != bridge {
                detach_port(&self.exec, &self.registry, current, name).await?;
            }
        }
        attach_port(&self.exec, &self.registry, bridge, name, None).await?;

        if let Some(mut record) = self.registry.tuntap(name).await {
            record.bridge = Some(bridge.to_string());
            self.registry.upsert_tuntap(record).await;
        }
        Ok(())
    }

    pub async fn detach_from_bridge(&self, name: &str) -> Result<()> {
        validate_ifname("name", name)?;
        let _guard = self.registry.lock_key(&format!("if:{name}")).await;

        let Some(link) = iface::link(&self.exec, name).await? else {
            return Err(Error::not_found(format!("tun/tap device {name}")));
        };
        let Some(bridge) = link.master else {
            return Err(Error::not_found(format!(
                "bridge attachment of {name}"
            )));
        };

        detach_port(&self.exec, &self.registry, &bridge, name).await?;

        if let Some(mut record) = self.registry.tuntap(name).await {
            record.bridge = None;
            self.registry.upsert_tuntap(record).await;
        }
        Ok(())
    }

    /// Assign an address to a device.
    pub async fn set_ip(&self, name: &str, address: IpNetwork) -> Result<()> {
        validate_ifname("name", name)?;
        if iface::link(&self.exec, name).await?.is_none() {
            return Err(Error::not_found(format!("interface {name}")));
        }

        let addr = address.to_string();
        let output = self
            .exec
            .run("ip", &["addr", "add", &addr, "dev", name])
            .await?;
        if !output.success {
            if output.stderr.contains("File exists") {
                return Err(Error::conflict(format!(
                    "address {addr} is already assigned to {name}"
                )));
            }
            return Err(Error::system(
                format!("assign {addr} to {name}"),
                output.diagnostic(),
            ));
        }
        info!("assigned {addr} to {name}");
        Ok(())
    }

    pub async fn remove_ip(&self, name: &str, address: IpNetwork) -> Result<()> {
        validate_ifname("name", name)?;
        if iface::link(&self.exec, name).await?.is_none() {
            return Err(Error::not_found(format!("interface {name}")));
        }

        let addr = address.to_string();
        let output = self
            .exec
            .run("ip", &["addr", "del", &addr, "dev", name])
            .await?;
        if !output.success {
            if output.stderr.contains("Cannot assign") {
                return Err(Error::not_found(format!("address {addr} on {name}")));
            }
            return Err(Error::system(
                format!("remove {addr} from {name}"),
                output.diagnostic(),
            ));
        }
        info!("removed {addr} from {name}");
        Ok(())
    }

    /// Enumerate live TUN/TAP devices, merged with registry bookkeeping the
    /// kernel cannot report (mode, persistence intent).
    pub async fn list(&self) -> Result<Vec<TunTapRecord>> {
        let mut records = Vec::new();
        for link in iface::links(&self.exec, None).await? {
            let kind = match link.tun_kind.as_deref() {
                Some("tun") => TunTapKind::Tun,
                Some("tap") => TunTapKind::Tap,
                _ => continue,
            };
            let known = self.registry.tuntap(&link.name).await;
            records.push(TunTapRecord {
                name: link.name.clone(),
                kind,
                mode: known.as_ref().map_or_else(TunTapMode::default, |r| r.mode),
                owner: known.as_ref().and_then(|r| r.owner.clone()),
                group: known.as_ref().and_then(|r| r.group.clone()),
                bridge: link.master.clone(),
                persistent: known.is_some_and(|r| r.persistent),
                status: link.status(),
            });
        }

        for stale in self.registry.tuntaps().await {
            if !records.iter().any(|r| r.name == stale.name) {
                info!("tun/tap {} vanished outside this process", stale.name);
                self.registry.remove_tuntap(&stale.name).await;
            }
        }

        Ok(records)
    }

    pub async fn get(&self, name: &str) -> Result<TunTapRecord> {
        validate_ifname("name", name)?;
        let Some(link) = iface::link(&self.exec, name).await? else {
            return Err(Error::not_found(format!("tun/tap device {name}")));
        };
        let kind = match link.tun_kind.as_deref() {
            Some("tun") => TunTapKind::Tun,
            Some("tap") => TunTapKind::Tap,
            _ => return Err(Error::not_found(format!("tun/tap device {name}"))),
        };
        let known = self.registry.tuntap(name).await;
        Ok(TunTapRecord {
            name: name.to_string(),
            kind,
            mode: known.as_ref().map_or_else(TunTapMode::default, |r| r.mode),
            owner: known.as_ref().and_then(|r| r.owner.clone()),
            group: known.as_ref().and_then(|r| r.group.clone()),
            bridge: link.master.clone(),
            persistent: known.is_some_and(|r| r.persistent),
            status: link.status(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> TunTapController {
        TunTapController::new(
            Executor::default(),
            Arc::new(TopologyRegistry::in_memory().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_tun_with_bridge_rejected_before_any_command() {
        let ctl = controller();
        let mut spec = TunTapSpec::new("tun0", TunTapKind::Tun);
        spec.bridge = Some("br-test".to_string());

        let err = ctl.create(spec).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        assert!(err.to_string().contains("cannot be bridged"));
    }

    #[tokio::test]
    async fn test_unknown_owner_rejected() {
        let ctl = controller();
        let mut spec = TunTapSpec::new("tap0", TunTapKind::Tap);
        spec.owner = Some("netfab-no-such-user".to_string());

        let err = ctl.create(spec).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_unknown_group_rejected() {
        let ctl = controller();
        let mut spec = TunTapSpec::new("tap0", TunTapKind::Tap);
        spec.group = Some("netfab-no-such-group".to_string());

        let err = ctl.create(spec).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    #[ignore] // Requires root privileges
    async fn test_create_and_delete_tap() {
        let ctl = controller();
        let record = ctl
            .create(TunTapSpec::new("nf-tap-test", TunTapKind::Tap))
            .await
            .expect("create tap");
        assert_eq!(record.kind, TunTapKind::Tap);

        ctl.delete("nf-tap-test").await.expect("delete tap");
    }
}
