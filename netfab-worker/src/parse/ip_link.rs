//! Parsers for `ip -o link show` / `ip -o addr show` output.
//!
//! One-line (`-o`) records have the shape
//!
//! ```text
//! <idx>: <name>[@<peer>]: <FLAG,FLAG,...> mtu <n> ... [master <br>] state <S> ...\
//!     link/<type> [<mac>] ... [\    <kind> <kind-details> ...]
//! ```
//!
//! where the trailing kind section only appears with `-d`. The kind token is
//! one of `bridge`, `veth`, `vlan`, `tun`; a `vlan` section carries
//! `protocol <p> id <n>` and a `tun` section carries `type tun|tap`.
//! Enslaved interfaces additionally carry a `bridge_slave` section, which is
//! deliberately not a kind token here.
//!
//! `ip -o addr show` records have the shape
//!
//! ```text
//! <idx>: <name>    inet[6] <addr>/<prefix> [brd <addr>] scope ...
//! ```

use ipnetwork::IpNetwork;

use crate::types::InterfaceStatus;

/// Interface kind as reported in the `ip -d` detail section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailKind {
    Bridge,
    Veth,
    Vlan,
    Tun,
}

/// One parsed `ip -o link show` record.
#[derive(Debug, Clone)]
pub struct LinkLine {
    pub index: u32,
    pub name: String,
    /// Peer interface for `name@peer` records (veth peers, VLAN parents).
    /// Cross-namespace peers appear as `if<idx>`.
    pub peer: Option<String>,
    pub up_flag: bool,
    pub state: Option<String>,
    pub mtu: Option<u32>,
    pub master: Option<String>,
    pub mac: Option<String>,
    pub kind: Option<DetailKind>,
    pub vlan_id: Option<u16>,
    pub vlan_protocol: Option<String>,
    /// `tun` or `tap`, from the `tun type <t>` detail.
    pub tun_kind: Option<String>,
}

impl LinkLine {
    /// Administrative status. `state UNKNOWN` (loopback, tun) falls back to
    /// the UP flag.
    pub fn status(&self) -> InterfaceStatus {
        match self.state.as_deref() {
            Some("UP") => InterfaceStatus::Up,
            Some("DOWN") => {
                if self.up_flag {
                    // Administratively up, no carrier.
                    InterfaceStatus::Up
                } else {
                    InterfaceStatus::Down
                }
            }
            _ => {
                if self.up_flag {
                    InterfaceStatus::Up
                } else {
                    InterfaceStatus::Unknown
                }
            }
        }
    }
}

/// Parse every record in a block of `ip -o link show` output.
pub fn parse_links(output: &str) -> Vec<LinkLine> {
    output.lines().filter_map(parse_link_line).collect()
}

/// Parse a single `ip -o link show` record, `None` on anything malformed.
pub fn parse_link_line(line: &str) -> Option<LinkLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let mut parts = line.splitn(3, ':');
    let index: u32 = parts.next()?.trim().parse().ok()?;
    let name_field = parts.next()?.trim();
    let rest = parts.next()?.trim();

    let (name, peer) = match name_field.split_once('@') {
        Some((n, p)) => (n.to_string(), Some(p.to_string())),
        None => (name_field.to_string(), None),
    };

    let tokens: Vec<&str> = rest.split_whitespace().collect();
    let mut link = LinkLine {
        index,
        name,
        peer,
        up_flag: false,
        state: None,
        mtu: None,
        master: None,
        mac: None,
        kind: None,
        vlan_id: None,
        vlan_protocol: None,
        tun_kind: None,
    };

    if let Some(flags) = tokens.first().filter(|t| t.starts_with('<')) {
        let flags = flags.trim_start_matches('<').trim_end_matches('>');
        link.up_flag = flags.split(',').any(|f| f == "UP");
    }

    let mut i = 0;
    while i < tokens.len() {
        match tokens[i] {
            "mtu" => {
                link.mtu = tokens.get(i + 1).and_then(|t| t.parse().ok());
                i += 2;
            }
            "state" => {
                link.state = tokens.get(i + 1).map(|t| (*t).to_string());
                i += 2;
            }
            "master" => {
                link.master = tokens.get(i + 1).map(|t| (*t).to_string());
                i += 2;
            }
            "link/ether" => {
                link.mac = tokens.get(i + 1).map(|t| (*t).to_string());
                i += 2;
            }
            "bridge" if link.kind.is_none() => {
                link.kind = Some(DetailKind::Bridge);
                i += 1;
            }
            "veth" if link.kind.is_none() => {
                link.kind = Some(DetailKind::Veth);
                i += 1;
            }
            "vlan" if link.kind.is_none() => {
                link.kind = Some(DetailKind::Vlan);
                i += 1;
            }
            "tun" if link.kind.is_none() => {
                link.kind = Some(DetailKind::Tun);
                i += 1;
            }
            "protocol" if link.kind == Some(DetailKind::Vlan) && link.vlan_protocol.is_none() => {
                link.vlan_protocol = tokens.get(i + 1).map(|t| (*t).to_string());
                i += 2;
            }
            "id" if link.kind == Some(DetailKind::Vlan) && link.vlan_id.is_none() => {
                link.vlan_id = tokens.get(i + 1).and_then(|t| t.parse().ok());
                i += 2;
            }
            "type" if link.kind == Some(DetailKind::Tun) && link.tun_kind.is_none() => {
                link.tun_kind = tokens.get(i + 1).map(|t| (*t).to_string());
                i += 2;
            }
            _ => i += 1,
        }
    }

    Some(link)
}

/// Parse every address in a block of `ip -o addr show` output.
pub fn parse_addrs(output: &str) -> Vec<IpNetwork> {
    parse_addr_entries(output)
        .into_iter()
        .map(|(_, addr)| addr)
        .collect()
}

/// Parse `(interface, address)` pairs from `ip -o addr show` output covering
/// multiple interfaces.
pub fn parse_addr_entries(output: &str) -> Vec<(String, IpNetwork)> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(name) = tokens.get(1) else { continue };
        let mut i = 2;
        while i < tokens.len() {
            if tokens[i] == "inet" || tokens[i] == "inet6" {
                if let Some(addr) = tokens.get(i + 1).and_then(|t| t.parse::<IpNetwork>().ok()) {
                    entries.push(((*name).to_string(), addr));
                }
                i += 2;
            } else {
                i += 1;
            }
        }
    }
    entries
}
