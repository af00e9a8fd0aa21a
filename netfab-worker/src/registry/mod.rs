//! Topology registry: the single bookkeeping source the controllers consult
//! before mutating kernel state.
//!
//! The registry exclusively owns the in-memory records and persists each
//! mutation to the durable record store. It is still only a cache: the
//! kernel/switch backend decides whether something actually exists, and
//! every list/read path reconciles against live enumeration. Per-key
//! operation locks serialize the lookup → kernel-mutate → update sequence
//! for a given interface name or (external port, protocol) key.

mod store;

pub use store::RecordStore;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{info, warn};

use crate::error::Result;
use crate::types::{
    BridgeRecord, BridgeVlanBinding, NatRuleRecord, Protocol, RuleState, TunTapRecord,
    VethEndpoint, VethPairRecord, VlanRecord,
};

const KIND_BRIDGE: &str = "bridge";
const KIND_VETH: &str = "veth";
const KIND_VLAN: &str = "vlan";
const KIND_VLAN_BINDING: &str = "vlan_binding";
const KIND_TUNTAP: &str = "tuntap";
const KIND_NAT_RULE: &str = "nat_rule";

#[derive(Default)]
struct RegistryState {
    bridges: HashMap<String, BridgeRecord>,
    veths: HashMap<String, VethPairRecord>,
    vlans: HashMap<String, VlanRecord>,
    vlan_bindings: HashMap<String, BridgeVlanBinding>,
    tuntaps: HashMap<String, TunTapRecord>,
    nat_rules: HashMap<String, NatRuleRecord>,
}

/// Hands out one mutex per operation key so unrelated operations never
/// serialize on each other.
#[derive(Default)]
struct KeyLocks {
    inner: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self
                .inner
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

pub struct TopologyRegistry {
    state: RwLock<RegistryState>,
    locks: KeyLocks,
    store: RecordStore,
}

impl TopologyRegistry {
    /// Open the durable store and reload all records into memory.
    pub fn open(path: &Path) -> Result<Self> {
        let store = RecordStore::open(path)?;
        Self::load(store)
    }

    /// Registry backed by an in-memory store (tests, ephemeral workers).
    pub fn in_memory() -> Result<Self> {
        Self::load(RecordStore::open_in_memory()?)
    }

    fn load(store: RecordStore) -> Result<Self> {
        let mut state = RegistryState::default();

        for bridge in store.load_kind::<BridgeRecord>(KIND_BRIDGE)? {
            state.bridges.insert(bridge.name.clone(), bridge);
        }
        for pair in store.load_kind::<VethPairRecord>(KIND_VETH)? {
            state.veths.insert(pair.key(), pair);
        }
        for vlan in store.load_kind::<VlanRecord>(KIND_VLAN)? {
            state.vlans.insert(vlan.ifname.clone(), vlan);
        }
        for binding in store.load_kind::<BridgeVlanBinding>(KIND_VLAN_BINDING)? {
            state.vlan_bindings.insert(binding.key(), binding);
        }
        for dev in store.load_kind::<TunTapRecord>(KIND_TUNTAP)? {
            state.tuntaps.insert(dev.name.clone(), dev);
        }
        for rule in store.load_kind::<NatRuleRecord>(KIND_NAT_RULE)? {
            state.nat_rules.insert(rule.id.clone(), rule);
        }

        info!(
            "registry loaded: {} bridges, {} veth pairs, {} vlans, {} tuntaps, {} nat rules",
            state.bridges.len(),
            state.veths.len(),
            state.vlans.len(),
            state.tuntaps.len(),
            state.nat_rules.len()
        );

        Ok(Self {
            state: RwLock::new(state),
            locks: KeyLocks::default(),
            store,
        })
    }

    /// Serialize an operation on one key. Keys in use: `if:<name>` for
    /// interface-identity operations, `pf:<port>/<proto>` for port-forward
    /// uniqueness.
    pub async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        self.locks.acquire(key).await
    }

    fn persist<T: serde::Serialize>(&self, kind: &str, id: &str, record: &T) {
        if let Err(e) = self.store.upsert(kind, id, record) {
            warn!("failed to persist {kind} record {id}: {e}");
        }
    }

    fn unpersist(&self, kind: &str, id: &str) {
        if let Err(e) = self.store.delete(kind, id) {
            warn!("failed to delete {kind} record {id}: {e}");
        }
    }

    // -----------------------------------------------------------------------
    // Bridges
    // -----------------------------------------------------------------------

    pub async fn bridge(&self, name: &str) -> Option<BridgeRecord> {
        self.state.read().await.bridges.get(name).cloned()
    }

    pub async fn bridges(&self) -> Vec<BridgeRecord> {
        self.state.read().await.bridges.values().cloned().collect()
    }

    pub async fn upsert_bridge(&self, record: BridgeRecord) {
        self.persist(KIND_BRIDGE, &record.name, &record);
        self.state
            .write()
            .await
            .bridges
            .insert(record.name.clone(), record);
    }

    pub async fn remove_bridge(&self, name: &str) -> Option<BridgeRecord> {
        let removed = self.state.write().await.bridges.remove(name);
        if removed.is_some() {
            self.unpersist(KIND_BRIDGE, name);
        }
        removed
    }

    // -----------------------------------------------------------------------
    // Veth pairs
    // -----------------------------------------------------------------------

    pub async fn veth_pair(&self, endpoint: &str) -> Option<VethPairRecord> {
        self.state
            .read()
            .await
            .veths
            .values()
            .find(|p| p.contains(endpoint))
            .cloned()
    }

    pub async fn veth_pairs(&self) -> Vec<VethPairRecord> {
        self.state.read().await.veths.values().cloned().collect()
    }

    pub async fn upsert_veth(&self, record: VethPairRecord) {
        self.persist(KIND_VETH, &record.key(), &record);
        self.state.write().await.veths.insert(record.key(), record);
    }

    pub async fn remove_veth(&self, endpoint: &str) -> Option<VethPairRecord> {
        let mut state = self.state.write().await;
        let key = state
            .veths
            .values()
            .find(|p| p.contains(endpoint))
            .map(VethPairRecord::key)?;
        let removed = state.veths.remove(&key);
        drop(state);
        self.unpersist(KIND_VETH, &key);
        removed
    }

    /// Apply a mutation to one veth endpoint, returning false when the
    /// endpoint is unknown.
    pub async fn update_veth_endpoint<F>(&self, endpoint: &str, f: F) -> bool
    where
        F: FnOnce(&mut VethEndpoint),
    {
        let mut state = self.state.write().await;
        let Some(pair) = state.veths.values_mut().find(|p| p.contains(endpoint)) else {
            return false;
        };
        if let Some(ep) = pair.endpoint_mut(endpoint) {
            f(ep);
        }
        let (key, snapshot) = (pair.key(), pair.clone());
        drop(state);
        self.persist(KIND_VETH, &key, &snapshot);
        true
    }

    // -----------------------------------------------------------------------
    // VLANs
    // -----------------------------------------------------------------------

    pub async fn vlan(&self, ifname: &str) -> Option<VlanRecord> {
        self.state.read().await.vlans.get(ifname).cloned()
    }

    pub async fn vlan_by_parent(&self, parent: &str, vlan_id: u16) -> Option<VlanRecord> {
        self.state
            .read()
            .await
            .vlans
            .values()
            .find(|v| v.parent == parent && v.vlan_id == vlan_id)
            .cloned()
    }

    pub async fn vlans(&self) -> Vec<VlanRecord> {
        self.state.read().await.vlans.values().cloned().collect()
    }

    pub async fn upsert_vlan(&self, record: VlanRecord) {
        self.persist(KIND_VLAN, &record.ifname, &record);
        self.state
            .write()
            .await
            .vlans
            .insert(record.ifname.clone(), record);
    }

    pub async fn remove_vlan(&self, ifname: &str) -> Option<VlanRecord> {
        let removed = self.state.write().await.vlans.remove(ifname);
        if removed.is_some() {
            self.unpersist(KIND_VLAN, ifname);
        }
        removed
    }

    pub async fn vlan_bindings(&self) -> Vec<BridgeVlanBinding> {
        self.state
            .read()
            .await
            .vlan_bindings
            .values()
            .cloned()
            .collect()
    }

    pub async fn upsert_vlan_binding(&self, binding: BridgeVlanBinding) {
        self.persist(KIND_VLAN_BINDING, &binding.key(), &binding);
        self.state
            .write()
            .await
            .vlan_bindings
            .insert(binding.key(), binding);
    }

    pub async fn remove_vlan_binding(
        &self,
        bridge: &str,
        port: &str,
        vlan_id: u16,
    ) -> Option<BridgeVlanBinding> {
        let key = format!("{bridge}/{port}/{vlan_id}");
        let removed = self.state.write().await.vlan_bindings.remove(&key);
        if removed.is_some() {
            self.unpersist(KIND_VLAN_BINDING, &key);
        }
        removed
    }

    // -----------------------------------------------------------------------
    // TUN/TAP
    // -----------------------------------------------------------------------

    pub async fn tuntap(&self, name: &str) -> Option<TunTapRecord> {
        self.state.read().await.tuntaps.get(name).cloned()
    }

    pub async fn tuntaps(&self) -> Vec<TunTapRecord> {
        self.state.read().await.tuntaps.values().cloned().collect()
    }

    pub async fn upsert_tuntap(&self, record: TunTapRecord) {
        self.persist(KIND_TUNTAP, &record.name, &record);
        self.state
            .write()
            .await
            .tuntaps
            .insert(record.name.clone(), record);
    }

    pub async fn remove_tuntap(&self, name: &str) -> Option<TunTapRecord> {
        let removed = self.state.write().await.tuntaps.remove(name);
        if removed.is_some() {
            self.unpersist(KIND_TUNTAP, name);
        }
        removed
    }

    // -----------------------------------------------------------------------
    // NAT rules
    // -----------------------------------------------------------------------

    pub async fn nat_rule(&self, id: &str) -> Option<NatRuleRecord> {
        self.state.read().await.nat_rules.get(id).cloned()
    }

    pub async fn nat_rules(&self) -> Vec<NatRuleRecord> {
        self.state.read().await.nat_rules.values().cloned().collect()
    }

    pub async fn contains_rule_id(&self, id: &str) -> bool {
        self.state.read().await.nat_rules.contains_key(id)
    }

    pub async fn upsert_nat_rule(&self, record: NatRuleRecord) {
        self.persist(KIND_NAT_RULE, &record.id, &record);
        self.state
            .write()
            .await
            .nat_rules
            .insert(record.id.clone(), record);
    }

    /// Flip a rule's lifecycle state, persisting the change. Returns false
    /// for unknown ids.
    pub async fn set_rule_state(&self, id: &str, state: RuleState) -> bool {
        let mut guard = self.state.write().await;
        let Some(rule) = guard.nat_rules.get_mut(id) else {
            return false;
        };
        rule.state = state;
        let snapshot = rule.clone();
        drop(guard);
        self.persist(KIND_NAT_RULE, id, &snapshot);
        true
    }

    /// The Active DNAT rule claiming (external port, protocol), if any.
    /// This is the uniqueness invariant checked before any backend command.
    pub async fn active_dnat_for(&self, external_port: u16, protocol: Protocol) -> Option<NatRuleRecord> {
        self.state
            .read()
            .await
            .nat_rules
            .values()
            .find(|r| {
                matches!(r.kind, crate::types::NatRuleKind::Dnat)
                    && matches!(r.state, RuleState::Active | RuleState::Installed)
                    && r.port == Some(external_port)
                    && r.protocol == protocol
            })
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NatRuleKind, VethEndpoint};

    #[tokio::test]
    async fn test_bridge_round_trip() {
        let registry = TopologyRegistry::in_memory().unwrap();
        let record = BridgeRecord::new("br-test", crate::types::BridgeBackend::Kernel, false);
        registry.upsert_bridge(record).await;

        assert!(registry.bridge("br-test").await.is_some());
        assert_eq!(registry.bridges().await.len(), 1);

        registry.remove_bridge("br-test").await;
        assert!(registry.bridge("br-test").await.is_none());
    }

    #[tokio::test]
    async fn test_veth_lookup_by_either_endpoint() {
        let registry = TopologyRegistry::in_memory().unwrap();
        registry
            .upsert_veth(VethPairRecord {
                first: VethEndpoint::new("veth-a"),
                second: VethEndpoint::new("veth-b"),
            })
            .await;

        assert!(registry.veth_pair("veth-a").await.is_some());
        assert!(registry.veth_pair("veth-b").await.is_some());
        assert!(registry.veth_pair("veth-c").await.is_none());

        // Removing by either endpoint removes the pair.
        registry.remove_veth("veth-b").await.unwrap();
        assert!(registry.veth_pair("veth-a").await.is_none());
    }

    #[tokio::test]
    async fn test_dnat_uniqueness_lookup() {
        let registry = TopologyRegistry::in_memory().unwrap();

        let mut rule = NatRuleRecord::new("ab12cd34", NatRuleKind::Dnat, Protocol::Tcp);
        rule.port = Some(8080);
        rule.state = RuleState::Active;
        registry.upsert_nat_rule(rule).await;

        assert!(registry.active_dnat_for(8080, Protocol::Tcp).await.is_some());
        // Same port, different protocol is free.
        assert!(registry.active_dnat_for(8080, Protocol::Udp).await.is_none());

        // A removed rule releases the key.
        registry.set_rule_state("ab12cd34", RuleState::Removed).await;
        assert!(registry.active_dnat_for(8080, Protocol::Tcp).await.is_none());
    }

    #[tokio::test]
    async fn test_reload_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");

        {
            let registry = TopologyRegistry::open(&path).unwrap();
            let mut rule = NatRuleRecord::new("77fe10aa", NatRuleKind::Masquerade, Protocol::All);
            rule.state = RuleState::Active;
            registry.upsert_nat_rule(rule).await;
            registry
                .upsert_bridge(BridgeRecord::new(
                    "br0",
                    crate::types::BridgeBackend::Switch,
                    true,
                ))
                .await;
        }

        let registry = TopologyRegistry::open(&path).unwrap();
        assert!(registry.nat_rule("77fe10aa").await.is_some());
        let bridge = registry.bridge("br0").await.unwrap();
        assert_eq!(bridge.backend, crate::types::BridgeBackend::Switch);
        assert!(bridge.stp);
    }

    #[tokio::test]
    async fn test_key_locks_serialize() {
        let registry = Arc::new(TopologyRegistry::in_memory().unwrap());

        let guard = registry.lock_key("pf:8080/tcp").await;
        let second = registry.clone();
        let contended = tokio::spawn(async move {
            let _guard = second.lock_key("pf:8080/tcp").await;
        });

        // The second acquisition cannot complete while the first is held.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contended.is_finished());

        drop(guard);
        contended.await.unwrap();
    }
}
