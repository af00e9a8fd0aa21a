//! NAT/firewall rule controller.
//!
//! Every rule this system installs carries a synthetic id embedded as an
//! iptables comment (`nf-<id8>:<slot>`), which makes rules individually
//! addressable: deletion enumerates the live rule set in append (`-S`) form,
//! locates the line whose comment slot carries the target tag, and re-issues
//! that exact line as a delete. Never by line number: line numbers shift
//! under any concurrent mutation.
//!
//! A port forward installs two coupled rules sharing one tag: the DNAT
//! rewrite in nat/PREROUTING (slot `dnat`) and a forwarding-accept for the
//! destination in filter/FORWARD (slot `fwd`). They are always removed
//! together; if one side fails the other is not rolled back (the kernel
//! cannot be) and partial success is reported instead.

use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::parse::ipt::{self, AppendLine, RuleTag};
use crate::registry::TopologyRegistry;
use crate::types::{
    validate_ifname, validate_port, FirewallAction, FirewallChain, FlushReport, NatRuleKind,
    NatRuleRecord, NatRuleSet, Protocol, RemovalReport, RuleState,
};

const SLOT_DNAT: &str = "dnat";
const SLOT_FORWARD: &str = "fwd";
const SLOT_MASQUERADE: &str = "masq";
const SLOT_FIREWALL: &str = "fw";

const NAT: &str = "nat";
const FILTER: &str = "filter";

/// Every (table, chain) where this system installs tagged rules.
const RULE_LOCATIONS: &[(&str, &str)] = &[
    (NAT, "PREROUTING"),
    (NAT, "POSTROUTING"),
    (FILTER, "INPUT"),
    (FILTER, "FORWARD"),
    (FILTER, "OUTPUT"),
];

fn ipt_handle() -> Result<iptables::IPTables> {
    iptables::new(false).map_err(|e| Error::backend_unavailable("iptables", e.to_string()))
}

fn ipt_append(ipt: &iptables::IPTables, table: &str, chain: &str, rule: &str) -> Result<()> {
    ipt.append(table, chain, rule)
        .map_err(|e| Error::system(format!("iptables -t {table} -A {chain}"), e.to_string()))
}

fn ipt_list(ipt: &iptables::IPTables, table: &str, chain: &str) -> Result<Vec<String>> {
    ipt.list(table, chain)
        .map_err(|e| Error::system(format!("iptables -t {table} -S {chain}"), e.to_string()))
}

fn ipt_delete(ipt: &iptables::IPTables, table: &str, chain: &str, rule: &str) -> Result<()> {
    ipt.delete(table, chain, rule)
        .map_err(|e| Error::system(format!("iptables -t {table} -D {chain}"), e.to_string()))
}

/// Enable system-wide IP forwarding. Best-effort: masquerading without it is
/// inert but the rule itself is fine, so failures are logged, not fatal.
fn enable_ip_forwarding() {
    match std::fs::write("/proc/sys/net/ipv4/ip_forward", "1") {
        Ok(()) => info!("enabled IP forwarding"),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            match std::fs::read_to_string("/proc/sys/net/ipv4/ip_forward") {
                Ok(current) if current.trim() == "1" => {
                    debug!("IP forwarding already enabled");
                }
                _ => warn!("IP forwarding is disabled and cannot be enabled: {e}"),
            }
        }
        Err(e) => warn!("could not enable IP forwarding: {e}"),
    }
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// Request for a DNAT port forward.
#[derive(Debug, Clone)]
pub struct PortForwardSpec {
    pub external_port: u16,
    pub internal_ip: IpAddr,
    pub internal_port: u16,
    pub protocol: Protocol,
    pub interface: Option<String>,
    pub description: Option<String>,
}

/// How to find port forwards to remove: an explicit rule id wins; otherwise
/// the full (external port, internal ip, internal port) tuple is matched
/// against Active rules.
#[derive(Debug, Clone, Default)]
pub struct PortForwardSelector {
    pub rule_id: Option<String>,
    pub external_port: Option<u16>,
    pub internal_ip: Option<IpAddr>,
    pub internal_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub enum MasqueradeSelector {
    ById(String),
    ByMatch {
        source_network: IpNetwork,
        output_interface: String,
    },
}

/// Request for a single tagged filter rule.
#[derive(Debug, Clone)]
pub struct FirewallRuleSpec {
    pub chain: FirewallChain,
    pub action: FirewallAction,
    pub protocol: Protocol,
    pub source: Option<IpNetwork>,
    pub destination: Option<IpNetwork>,
    pub port: Option<u16>,
    pub interface: Option<String>,
}

// ---------------------------------------------------------------------------
// Rule text builders
// ---------------------------------------------------------------------------

fn dnat_rule_text(id: &str, spec: &PortForwardSpec) -> String {
    let mut parts = Vec::new();
    if let Some(interface) = &spec.interface {
        parts.push(format!("-i {interface}"));
    }
    parts.push(format!("-p {}", spec.protocol.as_str()));
    parts.push(format!("--dport {}", spec.external_port));
    parts.push(format!(
        "-j DNAT --to-destination {}:{}",
        spec.internal_ip, spec.internal_port
    ));
    parts.push(format!(
        "-m comment --comment {}",
        RuleTag::new(id, SLOT_DNAT)
    ));
    parts.join(" ")
}

fn forward_accept_rule_text(id: &str, spec: &PortForwardSpec) -> String {
    format!(
        "-d {} -p {} --dport {} -j ACCEPT -m comment --comment {}",
        spec.internal_ip,
        spec.protocol.as_str(),
        spec.internal_port,
        RuleTag::new(id, SLOT_FORWARD)
    )
}

fn masquerade_rule_text(id: &str, source_network: IpNetwork, output_interface: &str) -> String {
    format!(
        "-s {source_network} -o {output_interface} -j MASQUERADE -m comment --comment {}",
        RuleTag::new(id, SLOT_MASQUERADE)
    )
}

fn firewall_rule_text(id: &str, spec: &FirewallRuleSpec) -> String {
    let mut parts = Vec::new();
    if let Some(interface) = &spec.interface {
        // OUTPUT matches on the egress interface, the other chains on
        // ingress.
        match spec.chain {
            FirewallChain::Output => parts.push(format!("-o {interface}")),
            _ => parts.push(format!("-i {interface}")),
        }
    }
    if spec.protocol != Protocol::All {
        parts.push(format!("-p {}", spec.protocol.as_str()));
    }
    if let Some(source) = &spec.source {
        parts.push(format!("-s {source}"));
    }
    if let Some(destination) = &spec.destination {
        parts.push(format!("-d {destination}"));
    }
    if let Some(port) = spec.port {
        parts.push(format!("--dport {port}"));
    }
    parts.push(format!("-j {}", spec.action.as_str()));
    parts.push(format!(
        "-m comment --comment {}",
        RuleTag::new(id, SLOT_FIREWALL)
    ));
    parts.join(" ")
}

/// Rebuild a rule record from one live tagged line. Companion `fwd` lines
/// carry no record of their own.
fn record_from_live(tag: &RuleTag, chain: &str, line: &AppendLine) -> Option<NatRuleRecord> {
    let fields = ipt::parse_rule_fields(line);
    let protocol = fields
        .protocol
        .as_deref()
        .and_then(|p| p.parse::<Protocol>().ok())
        .unwrap_or(Protocol::All);

    let mut record = match tag.slot.as_str() {
        SLOT_DNAT => {
            let mut record = NatRuleRecord::new(&tag.id, NatRuleKind::Dnat, protocol);
            record.port = fields.dport;
            record.interface = fields.in_interface;
            if let Some((ip, port)) = fields.to_destination {
                record.target_ip = Some(ip);
                record.target_port = port;
            }
            record
        }
        SLOT_MASQUERADE => {
            let mut record = NatRuleRecord::new(&tag.id, NatRuleKind::Masquerade, protocol);
            record.source = fields.source.as_deref().and_then(|s| s.parse().ok());
            record.interface = fields.out_interface;
            record
        }
        SLOT_FIREWALL => {
            let mut record = NatRuleRecord::new(&tag.id, NatRuleKind::Acl, protocol);
            record.chain = chain.parse().ok();
            record.action = fields.jump.as_deref().and_then(|j| j.parse().ok());
            record.source = fields.source.as_deref().and_then(|s| s.parse().ok());
            record.destination = fields.destination.as_deref().and_then(|d| d.parse().ok());
            record.port = fields.dport;
            record.interface = fields.in_interface.or(fields.out_interface);
            record
        }
        _ => return None,
    };
    record.state = RuleState::Active;
    Some(record)
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct NatController {
    registry: Arc<TopologyRegistry>,
}

impl NatController {
    pub fn new(registry: Arc<TopologyRegistry>) -> Self {
        Self { registry }
    }

    /// Generate a rule id: short random token, collision-checked against
    /// every id this process knows.
    async fn generate_id(&self) -> String {
        loop {
            let id = Uuid::new_v4().simple().to_string()[..8].to_string();
            if !self.registry.contains_rule_id(&id).await {
                return id;
            }
        }
    }

    /// Install a DNAT port forward plus its forwarding-accept companion.
    /// Returns the shared rule id.
    pub async fn add_port_forward(&self, spec: PortForwardSpec) -> Result<String> {
        validate_port("external_port", spec.external_port)?;
        validate_port("internal_port", spec.internal_port)?;
        if !matches!(spec.protocol, Protocol::Tcp | Protocol::Udp) {
            return Err(Error::validation(
                "protocol",
                "port forwards require tcp or udp (a port match is undefined otherwise)",
            ));
        }
        if let Some(interface) = &spec.interface {
            validate_ifname("interface", interface)?;
        }

        // The lookup-then-mutate sequence for one (port, protocol) key must
        // be serialized or two concurrent adds both pass the check below.
        let key = format!("pf:{}/{}", spec.external_port, spec.protocol);
        let _guard = self.registry.lock_key(&key).await;

        if let Some(existing) = self
            .registry
            .active_dnat_for(spec.external_port, spec.protocol)
            .await
        {
            return Err(Error::conflict(format!(
                "external port {}/{} is already forwarded by rule {}",
                spec.external_port, spec.protocol, existing.id
            )));
        }

        let ipt = ipt_handle()?;
        let id = self.generate_id().await;

        let mut record = NatRuleRecord::new(&id, NatRuleKind::Dnat, spec.protocol);
        record.port = Some(spec.external_port);
        record.interface = spec.interface.clone();
        record.target_ip = Some(spec.internal_ip);
        record.target_port = Some(spec.internal_port);
        record.description = spec.description.clone();

        ipt_append(&ipt, NAT, "PREROUTING", &dnat_rule_text(&id, &spec))?;
        record.state = RuleState::Installed;

        if let Err(e) = ipt_append(&ipt, FILTER, "FORWARD", &forward_accept_rule_text(&id, &spec))
        {
            // The DNAT half is live and cannot be rolled back; keep the
            // record so the orphan stays addressable by id.
            self.registry.upsert_nat_rule(record).await;
            return Err(Error::partial(
                "add_port_forward",
                e.to_string(),
                vec![SLOT_DNAT.to_string()],
            ));
        }

        record.state = RuleState::Active;
        self.registry.upsert_nat_rule(record).await;

        info!(
            "port forward {}: {}/{} -> {}:{}",
            id, spec.external_port, spec.protocol, spec.internal_ip, spec.internal_port
        );
        Ok(id)
    }

    /// Remove port forwards by id or by match tuple. Both companion rules
    /// sharing the tag are removed; one-sided failure is reported as partial
    /// success, never rolled back.
    pub async fn remove_port_forward(&self, selector: PortForwardSelector) -> Result<RemovalReport> {
        let ids = if let Some(id) = &selector.rule_id {
            vec![id.clone()]
        } else {
            let (Some(port), Some(ip), Some(internal_port)) = (
                selector.external_port,
                selector.internal_ip,
                selector.internal_port,
            ) else {
                return Err(Error::validation(
                    "selector",
                    "rule_id or the full (external_port, internal_ip, internal_port) tuple is required",
                ));
            };
            self.registry
                .nat_rules()
                .await
                .into_iter()
                .filter(|r| {
                    r.kind == NatRuleKind::Dnat
                        && matches!(r.state, RuleState::Active | RuleState::Installed)
                        && r.port == Some(port)
                        && r.target_ip == Some(ip)
                        && r.target_port == Some(internal_port)
                })
                .map(|r| r.id)
                .collect()
        };

        if ids.is_empty() {
            return Err(Error::not_found("matching port forward rule"));
        }

        let ipt = ipt_handle()?;
        let mut report = RemovalReport::default();

        for id in &ids {
            // Serialize against adds for the same key while the rule's port
            // is being released.
            let guard = match self.registry.nat_rule(id).await {
                Some(record) => {
                    let key = format!(
                        "pf:{}/{}",
                        record.port.unwrap_or_default(),
                        record.protocol
                    );
                    Some(self.registry.lock_key(&key).await)
                }
                None => None,
            };

            let (removed, failed) = remove_tagged(
                &ipt,
                &[(NAT, "PREROUTING"), (FILTER, "FORWARD")],
                |tag| &tag.id == id,
            );

            if !removed.is_empty() && failed.is_empty() {
                self.registry.set_rule_state(id, RuleState::Removed).await;
            }
            report.removed.extend(removed);
            report.failed.extend(failed);
            drop(guard);
        }

        if report.removed.is_empty() && report.failed.is_empty() {
            // Recorded but absent from the kernel: drift.
            for id in &ids {
                if self.registry.set_rule_state(id, RuleState::Lost).await {
                    warn!("port forward {id} was recorded but not present in the kernel");
                }
            }
            return Err(Error::not_found("matching port forward rule"));
        }

        if report.is_partial() {
            warn!(
                "port forward removal partial: removed {:?}, failed {:?}",
                report.removed, report.failed
            );
        } else {
            info!("removed port forward rule(s): {:?}", report.removed);
        }
        Ok(report)
    }

    /// Install a tagged masquerade rule and best-effort enable IP
    /// forwarding system-wide.
    pub async fn add_masquerade(
        &self,
        source_network: IpNetwork,
        output_interface: &str,
    ) -> Result<String> {
        validate_ifname("output_interface", output_interface)?;

        let key = format!("masq:{source_network}/{output_interface}");
        let _guard = self.registry.lock_key(&key).await;

        let ipt = ipt_handle()?;
        let id = self.generate_id().await;

        ipt_append(
            &ipt,
            NAT,
            "POSTROUTING",
            &masquerade_rule_text(&id, source_network, output_interface),
        )?;

        enable_ip_forwarding();

        let mut record = NatRuleRecord::new(&id, NatRuleKind::Masquerade, Protocol::All);
        record.source = Some(source_network);
        record.interface = Some(output_interface.to_string());
        record.state = RuleState::Active;
        self.registry.upsert_nat_rule(record).await;

        info!("masquerade {id}: {source_network} -> {output_interface}");
        Ok(id)
    }

    pub async fn remove_masquerade(&self, selector: MasqueradeSelector) -> Result<RemovalReport> {
        let ipt = ipt_handle()?;

        let ids: Vec<String> = match &selector {
            MasqueradeSelector::ById(id) => vec![id.clone()],
            MasqueradeSelector::ByMatch {
                source_network,
                output_interface,
            } => {
                let mut ids: Vec<String> = self
                    .registry
                    .nat_rules()
                    .await
                    .into_iter()
                    .filter(|r| {
                        r.kind == NatRuleKind::Masquerade
                            && matches!(r.state, RuleState::Active | RuleState::Installed)
                            && r.source == Some(*source_network)
                            && r.interface.as_deref() == Some(output_interface.as_str())
                    })
                    .map(|r| r.id)
                    .collect();

                if ids.is_empty() {
                    // Rules installed before a restart may only exist live.
                    let want_source = source_network.to_string();
                    ids = live_tagged_lines(&ipt, NAT, "POSTROUTING")
                        .into_iter()
                        .filter_map(|line| {
                            let fields = ipt::parse_rule_fields(&line);
                            let tag = line.tag?;
                            (tag.slot == SLOT_MASQUERADE
                                && fields.source.as_deref() == Some(want_source.as_str())
                                && fields.out_interface.as_deref()
                                    == Some(output_interface.as_str()))
                            .then(|| tag.id)
                        })
                        .collect();
                }
                ids
            }
        };

        if ids.is_empty() {
            return Err(Error::not_found("matching masquerade rule"));
        }

        let mut report = RemovalReport::default();
        for id in &ids {
            let (removed, failed) =
                remove_tagged(&ipt, &[(NAT, "POSTROUTING")], |tag| &tag.id == id);
            if !removed.is_empty() && failed.is_empty() {
                self.registry.set_rule_state(id, RuleState::Removed).await;
            }
            report.removed.extend(removed);
            report.failed.extend(failed);
        }

        if report.removed.is_empty() && report.failed.is_empty() {
            for id in &ids {
                if self.registry.set_rule_state(id, RuleState::Lost).await {
                    warn!("masquerade {id} was recorded but not present in the kernel");
                }
            }
            return Err(Error::not_found("matching masquerade rule"));
        }

        info!("removed masquerade rule(s): {:?}", report.removed);
        Ok(report)
    }

    /// Install one tagged filter rule. Chain and action come in through the
    /// fixed allow-list types; nothing else reaches the backend.
    pub async fn add_firewall_rule(&self, spec: FirewallRuleSpec) -> Result<String> {
        if let Some(port) = spec.port {
            validate_port("port", port)?;
            if !matches!(spec.protocol, Protocol::Tcp | Protocol::Udp) {
                return Err(Error::validation(
                    "port",
                    "a port match requires protocol tcp or udp",
                ));
            }
        }
        if let Some(interface) = &spec.interface {
            validate_ifname("interface", interface)?;
        }

        let ipt = ipt_handle()?;
        let id = self.generate_id().await;

        ipt_append(
            &ipt,
            FILTER,
            spec.chain.as_str(),
            &firewall_rule_text(&id, &spec),
        )?;

        let mut record = NatRuleRecord::new(&id, NatRuleKind::Acl, spec.protocol);
        record.chain = Some(spec.chain);
        record.action = Some(spec.action);
        record.source = spec.source;
        record.destination = spec.destination;
        record.port = spec.port;
        record.interface = spec.interface.clone();
        record.state = RuleState::Active;
        self.registry.upsert_nat_rule(record).await;

        info!(
            "firewall rule {id}: {} {} {}",
            spec.chain.as_str(),
            spec.action.as_str(),
            spec.protocol
        );
        Ok(id)
    }

    pub async fn remove_firewall_rule(&self, rule_id: &str) -> Result<RemovalReport> {
        let ipt = ipt_handle()?;

        let (removed, failed) = remove_tagged(
            &ipt,
            &[(FILTER, "INPUT"), (FILTER, "FORWARD"), (FILTER, "OUTPUT")],
            |tag| tag.id == rule_id && tag.slot == SLOT_FIREWALL,
        );

        if removed.is_empty() && failed.is_empty() {
            if self.registry.set_rule_state(rule_id, RuleState::Lost).await {
                warn!("firewall rule {rule_id} was recorded but not present in the kernel");
            }
            return Err(Error::not_found(format!("firewall rule {rule_id}")));
        }
        if failed.is_empty() {
            self.registry
                .set_rule_state(rule_id, RuleState::Removed)
                .await;
        }

        Ok(RemovalReport { removed, failed })
    }

    /// Snapshot all tagged rules by re-enumerating the live backend. The
    /// registry is never the list source: rules come and go outside this
    /// process. Recorded rules missing from the kernel flip to Lost; live
    /// tagged rules unknown to the registry (a previous process run) are
    /// adopted.
    pub async fn list_nat_rules(&self) -> Result<NatRuleSet> {
        let ipt = ipt_handle()?;
        let mut set = NatRuleSet::default();
        let mut live_ids: Vec<String> = Vec::new();

        for (table, chain) in RULE_LOCATIONS {
            let lines = ipt_list(&ipt, table, chain)?;
            for line in ipt::parse_listing(&lines) {
                let Some(tag) = line.tag.clone() else { continue };
                live_ids.push(tag.id.clone());

                let Some(mut record) = record_from_live(&tag, chain, &line) else {
                    continue;
                };

                if let Some(known) = self.registry.nat_rule(&tag.id).await {
                    record.description = known.description;
                    if known.state != RuleState::Active {
                        self.registry.set_rule_state(&tag.id, RuleState::Active).await;
                    }
                } else {
                    info!("adopting tagged rule {} found live in {table}/{chain}", tag.id);
                    self.registry.upsert_nat_rule(record.clone()).await;
                }

                match record.kind {
                    NatRuleKind::Dnat => set.port_forwards.push(record),
                    NatRuleKind::Masquerade => set.masquerade_rules.push(record),
                    NatRuleKind::Acl => set.firewall_rules.push(record),
                }
            }
        }

        // Drift: recorded Active, absent live. Logged, never auto-recreated.
        for record in self.registry.nat_rules().await {
            if matches!(record.state, RuleState::Active | RuleState::Installed)
                && !live_ids.contains(&record.id)
            {
                warn!(
                    "rule {} recorded {:?} but absent from the kernel; marking Lost",
                    record.id, record.state
                );
                self.registry.set_rule_state(&record.id, RuleState::Lost).await;
            }
        }

        Ok(set)
    }

    /// Delete every tagged rule in the nat table (and the forwarding-accept
    /// companions that belong to port forwards). A failing line never aborts
    /// the loop; the enumeration completing is what "success" means here.
    pub async fn flush_nat_rules(&self) -> Result<FlushReport> {
        let ipt = ipt_handle()?;
        let (removed, failed) = remove_tagged(
            &ipt,
            &[(NAT, "PREROUTING"), (NAT, "POSTROUTING"), (FILTER, "FORWARD")],
            |tag| tag.slot != SLOT_FIREWALL,
        );
        self.mark_flushed(&removed).await;

        let report = FlushReport {
            deleted: removed.len(),
            failed: failed.len(),
        };
        info!(
            "flushed nat rules: {} deleted, {} failed",
            report.deleted, report.failed
        );
        Ok(report)
    }

    /// Delete every tagged ACL rule in the filter table. Same best-effort
    /// contract as `flush_nat_rules`.
    pub async fn flush_firewall_rules(&self) -> Result<FlushReport> {
        let ipt = ipt_handle()?;
        let (removed, failed) = remove_tagged(
            &ipt,
            &[(FILTER, "INPUT"), (FILTER, "FORWARD"), (FILTER, "OUTPUT")],
            |tag| tag.slot == SLOT_FIREWALL,
        );
        self.mark_flushed(&removed).await;

        let report = FlushReport {
            deleted: removed.len(),
            failed: failed.len(),
        };
        info!(
            "flushed firewall rules: {} deleted, {} failed",
            report.deleted, report.failed
        );
        Ok(report)
    }

    async fn mark_flushed(&self, removed: &[String]) {
        for descriptor in removed {
            // Descriptors are `table:chain:nf-<id>:<slot>`.
            if let Some(tag) = descriptor
                .splitn(3, ':')
                .nth(2)
                .and_then(RuleTag::parse)
            {
                self.registry.set_rule_state(&tag.id, RuleState::Removed).await;
            }
        }
    }
}

/// Enumerate a chain and return its tagged append lines.
fn live_tagged_lines(ipt: &iptables::IPTables, table: &str, chain: &str) -> Vec<AppendLine> {
    match ipt_list(ipt, table, chain) {
        Ok(lines) => ipt::parse_listing(&lines)
            .into_iter()
            .filter(|l| l.tag.is_some())
            .collect(),
        Err(e) => {
            warn!("could not enumerate {table}/{chain}: {e}");
            Vec::new()
        }
    }
}

/// Delete every rule whose comment-slot tag satisfies the predicate, by
/// rewriting its enumerated append line into a delete. Failures on
/// individual lines are collected, never fatal to the loop.
fn remove_tagged(
    ipt: &iptables::IPTables,
    locations: &[(&str, &str)],
    matches: impl Fn(&RuleTag) -> bool,
) -> (Vec<String>, Vec<String>) {
    let mut removed = Vec::new();
    let mut failed = Vec::new();

    for (table, chain) in locations {
        let lines = match ipt_list(ipt, table, chain) {
            Ok(lines) => lines,
            Err(e) => {
                warn!("could not enumerate {table}/{chain}: {e}");
                continue;
            }
        };
        for line in ipt::parse_listing(&lines) {
            let Some(tag) = &line.tag else { continue };
            if !matches(tag) {
                continue;
            }
            let descriptor = format!("{table}:{chain}:{tag}");
            match ipt_delete(ipt, table, chain, &line.delete_spec()) {
                Ok(()) => removed.push(descriptor),
                Err(e) => {
                    warn!("could not delete {descriptor}: {e}");
                    failed.push(descriptor);
                }
            }
        }
    }

    (removed, failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn controller() -> NatController {
        NatController::new(Arc::new(TopologyRegistry::in_memory().unwrap()))
    }

    fn forward_spec() -> PortForwardSpec {
        PortForwardSpec {
            external_port: 8080,
            internal_ip: "10.0.0.5".parse().unwrap(),
            internal_port: 80,
            protocol: Protocol::Tcp,
            interface: None,
            description: None,
        }
    }

    #[test]
    fn test_dnat_rule_text() {
        let mut spec = forward_spec();
        assert_eq!(
            dnat_rule_text("ab12cd34", &spec),
            "-p tcp --dport 8080 -j DNAT --to-destination 10.0.0.5:80 -m comment --comment nf-ab12cd34:dnat"
        );

        spec.interface = Some("eth0".to_string());
        assert_eq!(
            dnat_rule_text("ab12cd34", &spec),
            "-i eth0 -p tcp --dport 8080 -j DNAT --to-destination 10.0.0.5:80 -m comment --comment nf-ab12cd34:dnat"
        );
    }

    #[test]
    fn test_forward_accept_rule_text() {
        assert_eq!(
            forward_accept_rule_text("ab12cd34", &forward_spec()),
            "-d 10.0.0.5 -p tcp --dport 80 -j ACCEPT -m comment --comment nf-ab12cd34:fwd"
        );
    }

    #[test]
    fn test_masquerade_rule_text() {
        assert_eq!(
            masquerade_rule_text("77fe10aa", "192.168.100.0/24".parse().unwrap(), "eth0"),
            "-s 192.168.100.0/24 -o eth0 -j MASQUERADE -m comment --comment nf-77fe10aa:masq"
        );
    }

    #[test]
    fn test_firewall_rule_text() {
        let spec = FirewallRuleSpec {
            chain: FirewallChain::Input,
            action: FirewallAction::Drop,
            protocol: Protocol::Tcp,
            source: Some("10.1.0.0/16".parse().unwrap()),
            destination: None,
            port: Some(22),
            interface: Some("eth1".to_string()),
        };
        assert_eq!(
            firewall_rule_text("deadbe1f", &spec),
            "-i eth1 -p tcp -s 10.1.0.0/16 --dport 22 -j DROP -m comment --comment nf-deadbe1f:fw"
        );

        let spec = FirewallRuleSpec {
            chain: FirewallChain::Output,
            action: FirewallAction::Accept,
            protocol: Protocol::All,
            source: None,
            destination: None,
            port: None,
            interface: Some("eth1".to_string()),
        };
        assert_eq!(
            firewall_rule_text("deadbe1f", &spec),
            "-o eth1 -j ACCEPT -m comment --comment nf-deadbe1f:fw"
        );
    }

    #[test]
    fn test_record_from_live_dnat() {
        let line = ipt::parse_append_line(
            r#"-A PREROUTING -i eth0 -p tcp -m tcp --dport 8080 -m comment --comment "nf-ab12cd34:dnat" -j DNAT --to-destination 10.0.0.5:80"#,
        )
        .unwrap();
        let tag = line.tag.clone().unwrap();
        let record = record_from_live(&tag, "PREROUTING", &line).unwrap();
        assert_eq!(record.kind, NatRuleKind::Dnat);
        assert_eq!(record.port, Some(8080));
        assert_eq!(record.target_ip.unwrap().to_string(), "10.0.0.5");
        assert_eq!(record.target_port, Some(80));
        assert_eq!(record.state, RuleState::Active);
    }

    #[test]
    fn test_record_from_live_skips_companion_slot() {
        let line = ipt::parse_append_line(
            r#"-A FORWARD -d 10.0.0.5/32 -p tcp -m tcp --dport 80 -m comment --comment "nf-ab12cd34:fwd" -j ACCEPT"#,
        )
        .unwrap();
        let tag = line.tag.clone().unwrap();
        assert!(record_from_live(&tag, "FORWARD", &line).is_none());
    }

    #[test]
    fn test_record_from_live_firewall() {
        let line = ipt::parse_append_line(
            r#"-A INPUT -s 10.1.0.0/16 -i eth1 -p tcp -m tcp --dport 22 -m comment --comment "nf-deadbe1f:fw" -j DROP"#,
        )
        .unwrap();
        let tag = line.tag.clone().unwrap();
        let record = record_from_live(&tag, "INPUT", &line).unwrap();
        assert_eq!(record.kind, NatRuleKind::Acl);
        assert_eq!(record.chain, Some(FirewallChain::Input));
        assert_eq!(record.action, Some(FirewallAction::Drop));
        assert_eq!(record.port, Some(22));
    }

    #[tokio::test]
    async fn test_port_forward_validation_precedes_backend() {
        let ctl = controller();

        let mut spec = forward_spec();
        spec.external_port = 0;
        let err = ctl.add_port_forward(spec).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let mut spec = forward_spec();
        spec.protocol = Protocol::Icmp;
        let err = ctl.add_port_forward(spec).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let mut spec = forward_spec();
        spec.interface = Some("bad name".to_string());
        let err = ctl.add_port_forward(spec).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_duplicate_port_forward_conflicts_before_backend() {
        let ctl = controller();

        // Seed an Active claim on 8080/tcp, as if a forward were installed.
        let mut existing = NatRuleRecord::new("ab12cd34", NatRuleKind::Dnat, Protocol::Tcp);
        existing.port = Some(8080);
        existing.state = RuleState::Active;
        ctl.registry.upsert_nat_rule(existing).await;

        let err = ctl.add_port_forward(forward_spec()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("ab12cd34"));

        // Same port, other protocol: the conflict check must not fire. The
        // attempt then proceeds to the backend, which this test environment
        // may not provide, so only the error kind is asserted.
        let mut spec = forward_spec();
        spec.protocol = Protocol::Udp;
        if let Err(err) = ctl.add_port_forward(spec).await {
            assert_ne!(err.kind(), ErrorKind::Conflict);
        }

        // Releasing the first claim frees the key.
        ctl.registry
            .set_rule_state("ab12cd34", RuleState::Removed)
            .await;
        assert!(ctl
            .registry
            .active_dnat_for(8080, Protocol::Tcp)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_remove_selector_requires_id_or_full_tuple() {
        let ctl = controller();
        let err = ctl
            .remove_port_forward(PortForwardSelector::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let selector = PortForwardSelector {
            external_port: Some(8080),
            ..Default::default()
        };
        let err = ctl.remove_port_forward(selector).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_remove_by_tuple_with_no_match_is_not_found() {
        let ctl = controller();
        let selector = PortForwardSelector {
            external_port: Some(8080),
            internal_ip: Some("10.0.0.5".parse().unwrap()),
            internal_port: Some(80),
            ..Default::default()
        };
        let err = ctl.remove_port_forward(selector).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_firewall_port_requires_tcp_or_udp() {
        let ctl = controller();
        let spec = FirewallRuleSpec {
            chain: FirewallChain::Input,
            action: FirewallAction::Accept,
            protocol: Protocol::Icmp,
            source: None,
            destination: None,
            port: Some(22),
            interface: None,
        };
        let err = ctl.add_firewall_rule(spec).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    #[ignore] // Requires root privileges and iptables
    async fn test_port_forward_lifecycle() {
        let ctl = controller();

        let id = ctl
            .add_port_forward(forward_spec())
            .await
            .expect("add port forward");

        let rules = ctl.list_nat_rules().await.expect("list rules");
        assert!(rules
            .port_forwards
            .iter()
            .any(|r| r.id == id && r.port == Some(8080)));

        let report = ctl
            .remove_port_forward(PortForwardSelector {
                rule_id: Some(id.clone()),
                ..Default::default()
            })
            .await
            .expect("remove port forward");
        // Both the DNAT and the forward-accept companion must come out.
        assert_eq!(report.removed.len(), 2);
        assert!(report.failed.is_empty());

        let rules = ctl.list_nat_rules().await.expect("list rules");
        assert!(!rules.port_forwards.iter().any(|r| r.id == id));
    }

    #[tokio::test]
    #[ignore] // Requires root privileges and iptables
    async fn test_flush_is_best_effort() {
        let ctl = controller();
        for port in [18080u16, 18081, 18082] {
            let mut spec = forward_spec();
            spec.external_port = port;
            ctl.add_port_forward(spec).await.expect("add");
        }

        let report = ctl.flush_nat_rules().await.expect("flush");
        assert_eq!(report.failed, 0);
        // Three DNAT rules and three companions.
        assert_eq!(report.deleted, 6);
    }
}
