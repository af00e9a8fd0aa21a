//! Parser for `iptables -S` (append-form) rule listings.
//!
//! `iptables -S <chain>` emits one `-P <chain> <policy>` line followed by one
//! `-A <chain> <spec...>` line per rule, where `<spec...>` is the exact
//! argument vector that would re-create the rule. Deleting a rule is
//! therefore a rewrite of its append line: drop the `-A <chain>` prefix and
//! re-issue the remaining spec as a delete. This module owns that rewrite
//! and the tag extraction that decides *which* line to rewrite.
//!
//! A tag is only ever read from the value of a `--comment` option
//! (`-m comment --comment "nf-<id8>:<slot>"`). A tag-shaped string anywhere
//! else in the line (an address, a port, another rule's description) never
//! matches. This is what keeps deletion from aliasing between rules that
//! reconstruct to similar text.

use std::fmt;
use std::net::IpAddr;

/// Prefix of every comment tag this system installs.
pub const TAG_PREFIX: &str = "nf-";

/// Parsed comment tag: `nf-<id8>:<slot>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTag {
    /// Eight lowercase hex characters, unique per process.
    pub id: String,
    /// Which companion rule this is: `dnat`, `fwd`, `masq`, or `fw`.
    pub slot: String,
}

impl RuleTag {
    pub fn new(id: impl Into<String>, slot: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            slot: slot.into(),
        }
    }

    /// Parse a comment value into a tag. Returns `None` unless the value has
    /// exactly the `nf-<8 hex>:<slot>` shape.
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.strip_prefix(TAG_PREFIX)?;
        let (id, slot) = rest.split_once(':')?;
        if id.len() != 8 || !id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            return None;
        }
        if slot.is_empty() || !slot.chars().all(|c| c.is_ascii_lowercase()) {
            return None;
        }
        Some(Self::new(id, slot))
    }
}

impl fmt::Display for RuleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TAG_PREFIX}{}:{}", self.id, self.slot)
    }
}

/// Split an iptables rule line into tokens, honoring double quotes (comment
/// values are quoted in `-S` output) and stripping them.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut seen_any = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                seen_any = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if seen_any && !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                seen_any = false;
            }
            c => {
                current.push(c);
                seen_any = true;
            }
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// One `-A` line from `iptables -S`, ready for rewrite into a delete.
#[derive(Debug, Clone)]
pub struct AppendLine {
    pub chain: String,
    /// Spec tokens after `-A <chain>`, exactly what a delete re-issues.
    pub spec: Vec<String>,
    /// Tag found in the `--comment` slot, if any.
    pub tag: Option<RuleTag>,
}

impl AppendLine {
    /// The delete spec: the append line minus its `-A <chain>` prefix,
    /// re-joined for the backend. Comment values this system writes contain
    /// no whitespace, so the join is lossless for tagged rules.
    pub fn delete_spec(&self) -> String {
        self.spec.join(" ")
    }
}

/// Parse one `iptables -S` line. Policy (`-P`) and chain-declaration lines
/// yield `None`; only append lines are rules.
pub fn parse_append_line(line: &str) -> Option<AppendLine> {
    let tokens = tokenize(line);
    if tokens.len() < 2 || tokens[0] != "-A" {
        return None;
    }
    let chain = tokens[1].clone();
    let spec: Vec<String> = tokens[2..].to_vec();
    let tag = comment_tag(&spec);
    Some(AppendLine { chain, spec, tag })
}

/// Parse every rule line in an `iptables -S` listing.
pub fn parse_listing(lines: &[String]) -> Vec<AppendLine> {
    lines.iter().filter_map(|l| parse_append_line(l)).collect()
}

/// Extract a tag from the `--comment` option value only.
fn comment_tag(spec: &[String]) -> Option<RuleTag> {
    let mut i = 0;
    while i < spec.len() {
        if spec[i] == "--comment" {
            if let Some(tag) = spec.get(i + 1).and_then(|v| RuleTag::parse(v)) {
                return Some(tag);
            }
            i += 2;
        } else {
            i += 1;
        }
    }
    None
}

/// Match fields recovered from an append line, used to rebuild rule records
/// from live enumeration.
#[derive(Debug, Clone, Default)]
pub struct ParsedRule {
    pub protocol: Option<String>,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub dport: Option<u16>,
    pub jump: Option<String>,
    pub to_destination: Option<(IpAddr, Option<u16>)>,
}

/// Walk an append line's spec tokens into match fields. Negated matches
/// (`!`) are not produced by this system and are skipped over.
pub fn parse_rule_fields(line: &AppendLine) -> ParsedRule {
    let mut rule = ParsedRule::default();
    let spec = &line.spec;
    let mut i = 0;
    while i < spec.len() {
        let value = spec.get(i + 1);
        match spec[i].as_str() {
            "-p" => rule.protocol = value.cloned(),
            "-i" => rule.in_interface = value.cloned(),
            "-o" => rule.out_interface = value.cloned(),
            "-s" => rule.source = value.cloned(),
            "-d" => rule.destination = value.cloned(),
            "--dport" => rule.dport = value.and_then(|v| v.parse().ok()),
            "-j" => rule.jump = value.cloned(),
            "--to-destination" => {
                rule.to_destination = value.and_then(|v| parse_destination(v));
            }
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }
    rule
}

/// Parse a DNAT `--to-destination` value: `ip` or `ip:port`.
fn parse_destination(value: &str) -> Option<(IpAddr, Option<u16>)> {
    if let Some((ip, port)) = value.rsplit_once(':') {
        // Only IPv4 targets carry a `:port` suffix in this form.
        if let (Ok(ip), Ok(port)) = (ip.parse::<IpAddr>(), port.parse::<u16>()) {
            return Some((ip, Some(port)));
        }
    }
    value.parse::<IpAddr>().ok().map(|ip| (ip, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DNAT_LINE: &str = r#"-A PREROUTING -i eth0 -p tcp -m tcp --dport 8080 -m comment --comment "nf-ab12cd34:dnat" -j DNAT --to-destination 10.0.0.5:80"#;
    const FWD_LINE: &str = r#"-A FORWARD -d 10.0.0.5/32 -p tcp -m tcp --dport 80 -m comment --comment "nf-ab12cd34:fwd" -j ACCEPT"#;
    const MASQ_LINE: &str = r#"-A POSTROUTING -s 192.168.100.0/24 -o eth0 -m comment --comment "nf-77fe10aa:masq" -j MASQUERADE"#;
    const POLICY_LINE: &str = "-P PREROUTING ACCEPT";
    const FOREIGN_LINE: &str = "-A PREROUTING -p tcp -m tcp --dport 443 -j REDIRECT --to-ports 10443";

    #[test]
    fn test_tag_round_trip() {
        let tag = RuleTag::new("ab12cd34", "dnat");
        assert_eq!(tag.to_string(), "nf-ab12cd34:dnat");
        assert_eq!(RuleTag::parse("nf-ab12cd34:dnat"), Some(tag));
    }

    #[test]
    fn test_tag_shape_is_strict() {
        assert!(RuleTag::parse("nf-ab12cd34").is_none()); // no slot
        assert!(RuleTag::parse("nf-xyzz1234:fwd").is_none()); // non-hex id
        assert!(RuleTag::parse("nf-AB12CD34:fwd").is_none()); // uppercase id
        assert!(RuleTag::parse("nf-ab12cd3:fwd").is_none()); // short id
        assert!(RuleTag::parse("xx-ab12cd34:fwd").is_none()); // wrong prefix
        assert!(RuleTag::parse("nf-ab12cd34:FWD").is_none()); // bad slot
    }

    #[test]
    fn test_tokenize_strips_quotes() {
        let tokens = tokenize(r#"-m comment --comment "nf-ab12cd34:dnat" -j DNAT"#);
        assert_eq!(tokens, vec!["-m", "comment", "--comment", "nf-ab12cd34:dnat", "-j", "DNAT"]);
    }

    #[test]
    fn test_tokenize_keeps_quoted_spaces() {
        let tokens = tokenize(r#"--comment "two words here" -j ACCEPT"#);
        assert_eq!(tokens[1], "two words here");
    }

    #[test]
    fn test_parse_append_line() {
        let line = parse_append_line(DNAT_LINE).unwrap();
        assert_eq!(line.chain, "PREROUTING");
        let tag = line.tag.as_ref().unwrap();
        assert_eq!(tag.id, "ab12cd34");
        assert_eq!(tag.slot, "dnat");
        assert_eq!(
            line.delete_spec(),
            "-i eth0 -p tcp -m tcp --dport 8080 -m comment --comment nf-ab12cd34:dnat -j DNAT --to-destination 10.0.0.5:80"
        );
    }

    #[test]
    fn test_policy_and_foreign_lines() {
        assert!(parse_append_line(POLICY_LINE).is_none());
        let foreign = parse_append_line(FOREIGN_LINE).unwrap();
        assert!(foreign.tag.is_none());
    }

    #[test]
    fn test_tag_outside_comment_slot_never_matches() {
        // A tag-shaped string smuggled into a u32 match or an address slot
        // must not be treated as this rule's identity.
        let line = parse_append_line(
            r#"-A FORWARD -d 10.0.0.5/32 -m string --string "nf-ab12cd34:fwd" --algo bm -j DROP"#,
        )
        .unwrap();
        assert!(line.tag.is_none());

        // A foreign comment that merely *contains* a tag is not a tag.
        let line = parse_append_line(
            r#"-A FORWARD -d 10.0.0.5/32 -m comment --comment "copy of nf-ab12cd34:fwd" -j DROP"#,
        )
        .unwrap();
        assert!(line.tag.is_none());
    }

    #[test]
    fn test_duplicate_descriptions_do_not_alias() {
        // Two rules sharing every match field still carry distinct tags.
        let a = parse_append_line(
            r#"-A FORWARD -d 10.0.0.5/32 -p tcp -m tcp --dport 80 -m comment --comment "nf-aaaaaaaa:fwd" -j ACCEPT"#,
        )
        .unwrap();
        let b = parse_append_line(
            r#"-A FORWARD -d 10.0.0.5/32 -p tcp -m tcp --dport 80 -m comment --comment "nf-bbbbbbbb:fwd" -j ACCEPT"#,
        )
        .unwrap();
        assert_ne!(a.tag, b.tag);
        assert_ne!(a.delete_spec(), b.delete_spec());
    }

    #[test]
    fn test_parse_rule_fields_dnat() {
        let line = parse_append_line(DNAT_LINE).unwrap();
        let rule = parse_rule_fields(&line);
        assert_eq!(rule.protocol.as_deref(), Some("tcp"));
        assert_eq!(rule.in_interface.as_deref(), Some("eth0"));
        assert_eq!(rule.dport, Some(8080));
        assert_eq!(rule.jump.as_deref(), Some("DNAT"));
        let (ip, port) = rule.to_destination.unwrap();
        assert_eq!(ip.to_string(), "10.0.0.5");
        assert_eq!(port, Some(80));
    }

    #[test]
    fn test_parse_rule_fields_masquerade() {
        let line = parse_append_line(MASQ_LINE).unwrap();
        let rule = parse_rule_fields(&line);
        assert_eq!(rule.source.as_deref(), Some("192.168.100.0/24"));
        assert_eq!(rule.out_interface.as_deref(), Some("eth0"));
        assert_eq!(rule.jump.as_deref(), Some("MASQUERADE"));
    }

    #[test]
    fn test_parse_listing() {
        let lines: Vec<String> = [POLICY_LINE, DNAT_LINE, FOREIGN_LINE, FWD_LINE]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        let rules = parse_listing(&lines);
        assert_eq!(rules.len(), 3);
        let tagged: Vec<_> = rules.iter().filter(|r| r.tag.is_some()).collect();
        assert_eq!(tagged.len(), 2);
    }
}
