//! Worker-side controller for virtual network fabrics.
//!
//! Materializes bridges, veth pairs, VLAN sub-interfaces, and TUN/TAP
//! devices, plus a tagged NAT/firewall rule set, by driving the host
//! kernel's networking stack (ip(8), iptables) and an optional Open vSwitch
//! backend. All bookkeeping lives in a [`registry::TopologyRegistry`] that
//! is persisted durably but treated as a cache: the kernel is ground truth,
//! and list/read paths reconcile against live enumeration.
//!
//! The embedding API layer validates requests upstream; every controller
//! still re-validates its own invariants and returns the typed error
//! taxonomy in [`error::Error`].

pub mod bridge;
pub mod config;
pub mod diag;
pub mod error;
pub mod exec;
pub mod iface;
pub mod nat;
pub mod parse;
pub mod registry;
pub mod telemetry;
pub mod tuntap;
pub mod types;
pub mod veth;
pub mod vlan;

pub use config::FabricConfig;
pub use error::{Error, ErrorKind, Result};

use std::sync::Arc;

use bridge::BridgeController;
use diag::{PingReport, TracerouteReport};
use exec::Executor;
use nat::NatController;
use registry::TopologyRegistry;
use tuntap::TunTapController;
use types::Interface;
use veth::VethController;
use vlan::VlanController;

/// The assembled fabric: one registry, one executor, every controller
/// constructed over them. This is what the API layer holds.
pub struct Fabric {
    pub bridges: BridgeController,
    pub veths: VethController,
    pub vlans: VlanController,
    pub tuntaps: TunTapController,
    pub nat: NatController,
    registry: Arc<TopologyRegistry>,
    exec: Executor,
    config: FabricConfig,
}

impl Fabric {
    /// Open the durable registry at the configured path and build the
    /// controllers.
    pub fn open(config: FabricConfig) -> Result<Self> {
        let registry = Arc::new(TopologyRegistry::open(&config.state_db)?);
        Ok(Self::assemble(registry, config))
    }

    /// A fabric with no durable state, for tests and ephemeral workers.
    pub fn ephemeral() -> Result<Self> {
        let registry = Arc::new(TopologyRegistry::in_memory()?);
        Ok(Self::assemble(registry, FabricConfig::default()))
    }

    fn assemble(registry: Arc<TopologyRegistry>, config: FabricConfig) -> Self {
        let exec = Executor::new(config.command_timeout);
        Self {
            bridges: BridgeController::new(exec.clone(), registry.clone()),
            veths: VethController::new(exec.clone(), registry.clone()),
            vlans: VlanController::new(exec.clone(), registry.clone()),
            tuntaps: TunTapController::new(exec.clone(), registry.clone()),
            nat: NatController::new(registry.clone()),
            registry,
            exec,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<TopologyRegistry> {
        &self.registry
    }

    /// Enumerate live interfaces. Physical interfaces only ever appear
    /// here; they are discovered, never created or destroyed.
    pub async fn list_interfaces(&self) -> Result<Vec<Interface>> {
        iface::list_interfaces(&self.exec).await
    }

    pub async fn get_interface(&self, name: &str) -> Result<Interface> {
        iface::get_interface(&self.exec, name).await
    }

    pub async fn ping(&self, target: &str, count: u32) -> Result<PingReport> {
        diag::ping(&self.exec, target, count).await
    }

    pub async fn traceroute(&self, target: &str) -> Result<TracerouteReport> {
        diag::traceroute(&self.exec, target, self.config.trace_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ephemeral_fabric_assembles() {
        let fabric = Fabric::ephemeral().unwrap();
        assert!(fabric.registry().bridges().await.is_empty());
    }
}
