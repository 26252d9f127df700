//! Persisted keys of opened-ports documents.

use std::sync::OnceLock;

use regex::Regex;

use crate::PortsError;

fn ports_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"^m#(?P<machine>{})#(?P<subnet>.*)$",
            fleet_id::MACHINE_SNIPPET
        ))
        .expect("static ports key pattern")
    })
}

/// Key of the document holding ports opened on `machine_id` in `subnet_id`.
///
/// The subnet may be empty.
pub fn ports_global_key(machine_id: &str, subnet_id: &str) -> String {
    format!("m#{machine_id}#{subnet_id}")
}

/// Split a ports key into `(machine_id, subnet_id)`.
pub fn parse_ports_key(key: &str) -> Result<(String, String), PortsError> {
    let caps = ports_key_re()
        .captures(key)
        .ok_or_else(|| PortsError::InvalidKey(key.to_string()))?;
    Ok((caps["machine"].to_string(), caps["subnet"].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("0", "", "m#0#")]
    #[case("0/lxd/1", "42", "m#0/lxd/1#42")]
    #[case("7", "10.0.0.0/24", "m#7#10.0.0.0/24")]
    fn test_key_roundtrip(#[case] machine: &str, #[case] subnet: &str, #[case] key: &str) {
        assert_eq!(ports_global_key(machine, subnet), key);
        let (m, s) = parse_ports_key(key).unwrap();
        assert_eq!((m.as_str(), s.as_str()), (machine, subnet));
    }

    #[rstest]
    #[case("")]
    #[case("m#")]
    #[case("m#0")]
    #[case("x#0#")]
    #[case("m#01#")]
    #[case("m#web/0#")]
    #[case("prefix-m#0#")]
    fn test_invalid_keys(#[case] key: &str) {
        assert!(matches!(parse_ports_key(key), Err(PortsError::InvalidKey(_))));
    }
}
