use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kernel limit on interface name length (IFNAMSIZ minus the NUL).
pub const IFNAME_MAX: usize = 15;

/// Validate an interface/bridge/namespace name against the kernel rules this
/// system enforces: non-empty, at most 15 characters, alphanumeric plus dash
/// and underscore (dots are additionally allowed for VLAN sub-interfaces).
pub fn validate_ifname(field: &'static str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation(field, "name must not be empty"));
    }
    if name.len() > IFNAME_MAX {
        return Err(Error::validation(
            field,
            format!("'{name}' exceeds {IFNAME_MAX} characters"),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(Error::validation(
            field,
            format!("'{name}' contains characters outside [a-zA-Z0-9._-]"),
        ));
    }
    Ok(())
}

/// Valid VLAN id range (0 and 4095 are reserved).
pub fn validate_vlan_id(vlan_id: u16) -> Result<()> {
    if !(1..=4094).contains(&vlan_id) {
        return Err(Error::validation(
            "vlan_id",
            format!("{vlan_id} is outside 1-4094"),
        ));
    }
    Ok(())
}

/// Ports are 1-65535; zero is never a valid match or target port.
pub fn validate_port(field: &'static str, port: u16) -> Result<()> {
    if port == 0 {
        return Err(Error::validation(field, "port must be 1-65535"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Interfaces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Physical,
    Bridge,
    Veth,
    Vlan,
    Tun,
    Tap,
    /// Discovered kinds this system never manages (bond, dummy, loopback, ...).
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceStatus {
    Up,
    Down,
    Unknown,
}

impl fmt::Display for InterfaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A live network interface as discovered from the kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub kind: InterfaceKind,
    pub status: InterfaceStatus,
    pub mtu: Option<u32>,
    pub mac: Option<String>,
    #[serde(default)]
    pub addresses: Vec<IpNetwork>,
    /// Bridge this interface is enslaved to, if any. A lookup relation,
    /// not ownership.
    pub bridge: Option<String>,
}

// ---------------------------------------------------------------------------
// Bridges
// ---------------------------------------------------------------------------

/// Which command family manages a bridge. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeBackend {
    /// Native kernel bridge driven by ip(8).
    Kernel,
    /// Open vSwitch bridge driven by ovs-vsctl.
    Switch,
}

impl fmt::Display for BridgeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel => write!(f, "kernel"),
            Self::Switch => write!(f, "switch"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeRecord {
    pub name: String,
    pub backend: BridgeBackend,
    pub stp: bool,
    #[serde(default)]
    pub ports: BTreeSet<String>,
    #[serde(default)]
    pub vlans: BTreeSet<u16>,
    pub status: InterfaceStatus,
}

impl BridgeRecord {
    pub fn new(name: impl Into<String>, backend: BridgeBackend, stp: bool) -> Self {
        Self {
            name: name.into(),
            backend,
            stp,
            ports: BTreeSet::new(),
            vlans: BTreeSet::new(),
            status: InterfaceStatus::Unknown,
        }
    }
}

// ---------------------------------------------------------------------------
// Veth pairs
// ---------------------------------------------------------------------------

/// One end of a veth pair. At most one of `bridge`/`namespace` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VethEndpoint {
    pub name: String,
    pub bridge: Option<String>,
    pub namespace: Option<String>,
    pub status: InterfaceStatus,
}

impl VethEndpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bridge: None,
            namespace: None,
            status: InterfaceStatus::Unknown,
        }
    }
}

/// A veth pair. The kernel collapses the pair atomically: deleting either
/// endpoint destroys both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VethPairRecord {
    pub first: VethEndpoint,
    pub second: VethEndpoint,
}

impl VethPairRecord {
    /// Canonical registry key, independent of endpoint order.
    pub fn key(&self) -> String {
        veth_pair_key(&self.first.name, &self.second.name)
    }

    pub fn contains(&self, endpoint: &str) -> bool {
        self.first.name == endpoint || self.second.name == endpoint
    }

    pub fn peer_of(&self, endpoint: &str) -> Option<&VethEndpoint> {
        if self.first.name == endpoint {
            Some(&self.second)
        } else if self.second.name == endpoint {
            Some(&self.first)
        } else {
            None
        }
    }

    pub fn endpoint_mut(&mut self, endpoint: &str) -> Option<&mut VethEndpoint> {
        if self.first.name == endpoint {
            Some(&mut self.first)
        } else if self.second.name == endpoint {
            Some(&mut self.second)
        } else {
            None
        }
    }
}

pub fn veth_pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

// ---------------------------------------------------------------------------
// VLANs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VlanProtocol {
    #[serde(rename = "802.1Q")]
    Ieee8021Q,
    #[serde(rename = "802.1ad")]
    Ieee8021Ad,
}

impl VlanProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ieee8021Q => "802.1Q",
            Self::Ieee8021Ad => "802.1ad",
        }
    }
}

impl fmt::Display for VlanProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for VlanProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "802.1Q" | "802.1q" => Ok(Self::Ieee8021Q),
            "802.1ad" | "802.1AD" => Ok(Self::Ieee8021Ad),
            other => Err(Error::validation(
                "protocol",
                format!("'{other}' is not 802.1Q or 802.1ad"),
            )),
        }
    }
}

/// A tagged sub-interface on a parent interface (kernel VLAN).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlanRecord {
    pub parent: String,
    pub vlan_id: u16,
    /// Derived interface name, `parent.vlan_id` unless overridden.
    pub ifname: String,
    pub protocol: VlanProtocol,
    pub status: InterfaceStatus,
    pub mtu: Option<u32>,
}

/// A VLAN tag bound to a port of a switch-backend bridge. No derived
/// interface exists for these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeVlanBinding {
    pub bridge: String,
    pub port: String,
    pub vlan_id: u16,
    pub tagged: bool,
}

impl BridgeVlanBinding {
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.bridge, self.port, self.vlan_id)
    }
}

// ---------------------------------------------------------------------------
// TUN/TAP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunTapKind {
    Tun,
    Tap,
}

impl TunTapKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tun => "tun",
            Self::Tap => "tap",
        }
    }
}

impl fmt::Display for TunTapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunTapMode {
    #[default]
    Root,
    User,
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunTapRecord {
    pub name: String,
    pub kind: TunTapKind,
    pub mode: TunTapMode,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub bridge: Option<String>,
    pub persistent: bool,
    pub status: InterfaceStatus,
}

// ---------------------------------------------------------------------------
// NAT / firewall rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
            Self::All => "all",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            "all" => Ok(Self::All),
            other => Err(Error::validation(
                "protocol",
                format!("'{other}' is not one of tcp, udp, icmp, all"),
            )),
        }
    }
}

/// Chains this system is willing to touch. The fixed allow-list per design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FirewallChain {
    Input,
    Output,
    Forward,
}

impl FirewallChain {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "INPUT",
            Self::Output => "OUTPUT",
            Self::Forward => "FORWARD",
        }
    }
}

impl FromStr for FirewallChain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INPUT" => Ok(Self::Input),
            "OUTPUT" => Ok(Self::Output),
            "FORWARD" => Ok(Self::Forward),
            other => Err(Error::validation(
                "chain",
                format!("'{other}' is not one of INPUT, OUTPUT, FORWARD"),
            )),
        }
    }
}

/// Targets this system is willing to emit. The fixed allow-list per design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FirewallAction {
    Accept,
    Drop,
    Reject,
}

impl FirewallAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Drop => "DROP",
            Self::Reject => "REJECT",
        }
    }
}

impl FromStr for FirewallAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ACCEPT" => Ok(Self::Accept),
            "DROP" => Ok(Self::Drop),
            "REJECT" => Ok(Self::Reject),
            other => Err(Error::validation(
                "action",
                format!("'{other}' is not one of ACCEPT, DROP, REJECT"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatRuleKind {
    Dnat,
    Masquerade,
    Acl,
}

/// Lifecycle of a tagged rule.
///
/// Requested: validated but not yet issued. Installed: backend command
/// succeeded. Active: listed in the registry. Removed: deleted on request.
/// Lost: a reconciliation pass found it absent from the kernel despite being
/// recorded Active. Logged, never auto-recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleState {
    Requested,
    Installed,
    Active,
    Removed,
    Lost,
}

/// A NAT or firewall rule addressable by its synthetic id.
///
/// The id is embedded in the kernel rule as an opaque comment tag so the
/// rule can be found and deleted later; the description never leaves the
/// registry record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatRuleRecord {
    pub id: String,
    pub kind: NatRuleKind,
    pub protocol: Protocol,
    /// Match: source network (masquerade source, ACL source).
    pub source: Option<IpNetwork>,
    /// Match: destination network (ACL destination).
    pub destination: Option<IpNetwork>,
    /// Match: destination port (DNAT external port, ACL port).
    pub port: Option<u16>,
    /// Match: in-interface (DNAT/ACL input) or out-interface (masquerade,
    /// ACL output).
    pub interface: Option<String>,
    /// DNAT rewrite target.
    pub target_ip: Option<IpAddr>,
    pub target_port: Option<u16>,
    /// ACL only.
    pub chain: Option<FirewallChain>,
    pub action: Option<FirewallAction>,
    pub enabled: bool,
    pub state: RuleState,
    pub description: Option<String>,
}

impl NatRuleRecord {
    pub fn new(id: impl Into<String>, kind: NatRuleKind, protocol: Protocol) -> Self {
        Self {
            id: id.into(),
            kind,
            protocol,
            source: None,
            destination: None,
            port: None,
            interface: None,
            target_ip: None,
            target_port: None,
            chain: None,
            action: None,
            enabled: true,
            state: RuleState::Requested,
            description: None,
        }
    }
}

/// Snapshot of all tagged rules, derived from live backend enumeration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NatRuleSet {
    pub port_forwards: Vec<NatRuleRecord>,
    pub masquerade_rules: Vec<NatRuleRecord>,
    pub firewall_rules: Vec<NatRuleRecord>,
}

/// Outcome of a targeted rule removal. `removed`/`failed` carry
/// `table:chain:tag` descriptors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemovalReport {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

impl RemovalReport {
    /// True when some but not all companion rules came out.
    pub fn is_partial(&self) -> bool {
        !self.removed.is_empty() && !self.failed.is_empty()
    }
}

/// Outcome of a best-effort flush. Individual line failures are counted,
/// never surfaced as overall failure.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FlushReport {
    pub deleted: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifname_rules() {
        assert!(validate_ifname("name", "br0").is_ok());
        assert!(validate_ifname("name", "veth-a_1").is_ok());
        assert!(validate_ifname("name", "eth0.100").is_ok());
        assert!(validate_ifname("name", "").is_err());
        assert!(validate_ifname("name", "a-name-that-is-too-long").is_err());
        assert!(validate_ifname("name", "bad name").is_err());
        assert!(validate_ifname("name", "bad/name").is_err());
    }

    #[test]
    fn test_vlan_id_range() {
        assert!(validate_vlan_id(1).is_ok());
        assert!(validate_vlan_id(4094).is_ok());
        assert!(validate_vlan_id(0).is_err());
        assert!(validate_vlan_id(4095).is_err());
    }

    #[test]
    fn test_veth_pair_key_is_order_independent() {
        assert_eq!(veth_pair_key("a", "b"), veth_pair_key("b", "a"));
        let pair = VethPairRecord {
            first: VethEndpoint::new("vb"),
            second: VethEndpoint::new("va"),
        };
        assert_eq!(pair.key(), "va:vb");
        assert!(pair.contains("va"));
        assert_eq!(pair.peer_of("va").unwrap().name, "vb");
        assert!(pair.peer_of("vc").is_none());
    }

    #[test]
    fn test_allow_list_parsing() {
        assert_eq!("forward".parse::<FirewallChain>().unwrap(), FirewallChain::Forward);
        assert!("PREROUTING".parse::<FirewallChain>().is_err());
        assert_eq!("drop".parse::<FirewallAction>().unwrap(), FirewallAction::Drop);
        assert!("MASQUERADE".parse::<FirewallAction>().is_err());
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert!("sctp".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_rule_record_serde_round_trip() {
        let mut rule = NatRuleRecord::new("ab12cd34", NatRuleKind::Dnat, Protocol::Tcp);
        rule.port = Some(8080);
        rule.target_ip = Some("10.0.0.5".parse().unwrap());
        rule.target_port = Some(80);
        rule.state = RuleState::Active;

        let json = serde_json::to_string(&rule).unwrap();
        let back: NatRuleRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "ab12cd34");
        assert_eq!(back.kind, NatRuleKind::Dnat);
        assert_eq!(back.port, Some(8080));
        assert_eq!(back.state, RuleState::Active);
    }
}
