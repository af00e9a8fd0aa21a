//! Parsers for `ovs-vsctl` output.
//!
//! `list-br` / `list-ports` emit one name per line. `get port <p> tag`
//! emits `[]` or a bare integer; `get port <p> trunks` emits a set like
//! `[]`, `[100]`, or `[100, 200]`.

/// Parse a one-name-per-line listing (`list-br`, `list-ports`).
pub fn parse_name_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Parse a `trunks` set value into VLAN ids.
pub fn parse_id_set(output: &str) -> Vec<u16> {
    output
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .filter_map(|v| v.trim().parse().ok())
        .collect()
}

/// Parse a `tag` value: `[]` means unset.
pub fn parse_optional_id(output: &str) -> Option<u16> {
    let trimmed = output.trim();
    if trimmed == "[]" || trimmed.is_empty() {
        return None;
    }
    trimmed.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_list() {
        assert_eq!(parse_name_list("br-ovs0\nbr-ovs1\n"), vec!["br-ovs0", "br-ovs1"]);
        assert!(parse_name_list("\n  \n").is_empty());
    }

    #[test]
    fn test_id_set() {
        assert_eq!(parse_id_set("[100, 200]\n"), vec![100, 200]);
        assert_eq!(parse_id_set("[100]\n"), vec![100]);
        assert!(parse_id_set("[]\n").is_empty());
    }

    #[test]
    fn test_optional_id() {
        assert_eq!(parse_optional_id("100\n"), Some(100));
        assert_eq!(parse_optional_id("[]\n"), None);
        assert_eq!(parse_optional_id(""), None);
    }
}
