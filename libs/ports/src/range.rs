//! Port ranges and the conflict relation between them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::PortsError;

/// Bound used by protocols without port numbers.
pub const NO_PORT: i32 = -1;

/// Lowest valid port.
pub const MIN_PORT: i32 = 1;

/// Highest valid port.
pub const MAX_PORT: i32 = 65535;

/// Transport protocol of a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }

    /// Returns true if ranges of this protocol carry port numbers.
    pub fn has_ports(self) -> bool {
        !matches!(self, Protocol::Icmp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = PortsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            other => Err(PortsError::InvalidRange(format!("invalid protocol {other:?}"))),
        }
    }
}

/// A range of ports opened by one unit.
///
/// Serialized with the persisted field names (`unit-name`, `from-port`,
/// `to-port`, `protocol`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PortRange {
    pub unit_name: String,
    pub from_port: i32,
    pub to_port: i32,
    pub protocol: Protocol,
}

impl PortRange {
    /// Build and validate a range.
    pub fn new(
        unit_name: impl Into<String>,
        from_port: i32,
        to_port: i32,
        protocol: Protocol,
    ) -> Result<Self, PortsError> {
        let range = Self {
            unit_name: unit_name.into(),
            from_port,
            to_port,
            protocol,
        };
        range.validate()?;
        Ok(range)
    }

    /// Build an icmp range for a unit.
    pub fn icmp(unit_name: impl Into<String>) -> Result<Self, PortsError> {
        Self::new(unit_name, NO_PORT, NO_PORT, Protocol::Icmp)
    }

    /// Check the unit name and bounds.
    pub fn validate(&self) -> Result<(), PortsError> {
        if !fleet_id::is_valid_unit(&self.unit_name) {
            return Err(PortsError::InvalidRange(format!(
                "invalid unit {:?}",
                self.unit_name
            )));
        }
        if !self.protocol.has_ports() {
            if self.from_port == NO_PORT && self.to_port == NO_PORT {
                return Ok(());
            }
            return Err(PortsError::InvalidRange(format!(
                "protocol {:?} doesn't support any ports; got \"{}\"",
                self.protocol.as_str(),
                self.from_port
            )));
        }
        if self.from_port > self.to_port {
            return Err(PortsError::InvalidRange(format!(
                "invalid port range {}-{}",
                self.from_port, self.to_port
            )));
        }
        let in_bounds = |p: i32| (MIN_PORT..=MAX_PORT).contains(&p);
        if !in_bounds(self.from_port) || !in_bounds(self.to_port) {
            return Err(PortsError::InvalidRange(format!(
                "port range bounds must be between {MIN_PORT} and {MAX_PORT}, got {}-{}",
                self.from_port, self.to_port
            )));
        }
        Ok(())
    }

    /// Number of ports covered, or 0 if the range is invalid.
    pub fn length(&self) -> u32 {
        if self.validate().is_err() {
            return 0;
        }
        (self.to_port - self.from_port) as u32 + 1
    }

    /// Copy with bounds ordered and clamped into `MIN_PORT..=MAX_PORT`.
    ///
    /// Icmp ranges are returned unchanged.
    #[must_use]
    pub fn sanitize_bounds(&self) -> Self {
        let mut out = self.clone();
        if !self.protocol.has_ports() {
            return out;
        }
        if out.from_port > out.to_port {
            std::mem::swap(&mut out.from_port, &mut out.to_port);
        }
        out.from_port = out.from_port.clamp(MIN_PORT, MAX_PORT);
        out.to_port = out.to_port.clamp(MIN_PORT, MAX_PORT);
        out
    }

    /// Returns true if the two ranges may not coexist in one document.
    ///
    /// Identical ranges (same unit, bounds and protocol) never conflict.
    pub fn conflicts_with(&self, other: &PortRange) -> bool {
        self != other
            && self.protocol == other.protocol
            && self.to_port >= other.from_port
            && other.to_port >= self.from_port
    }

    /// Validate both ranges, then fail if they conflict.
    pub fn check_conflicts(&self, other: &PortRange) -> Result<(), PortsError> {
        self.validate()?;
        other.validate()?;
        if self.conflicts_with(other) {
            return Err(PortsError::Conflict {
                existing: self.clone(),
                requested: other.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.protocol.has_ports() {
            write!(
                f,
                "{}-{}/{} ({:?})",
                self.from_port, self.to_port, self.protocol, self.unit_name
            )
        } else {
            write!(f, "{} ({:?})", self.protocol, self.unit_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn tcp(unit: &str, from: i32, to: i32) -> PortRange {
        PortRange::new(unit, from, to, Protocol::Tcp).unwrap()
    }

    #[rstest]
    #[case("web/0", 80, 80, Protocol::Tcp, true)]
    #[case("web/0", 1, 65535, Protocol::Udp, true)]
    #[case("web/0", -1, -1, Protocol::Icmp, true)]
    #[case("web/0", 0, 80, Protocol::Tcp, false)]
    #[case("web/0", 90, 80, Protocol::Tcp, false)]
    #[case("web/0", 80, 65536, Protocol::Tcp, false)]
    #[case("web/0", 8, 8, Protocol::Icmp, false)]
    #[case("web", 80, 80, Protocol::Tcp, false)]
    #[case("", 80, 80, Protocol::Tcp, false)]
    fn test_validate(
        #[case] unit: &str,
        #[case] from: i32,
        #[case] to: i32,
        #[case] protocol: Protocol,
        #[case] valid: bool,
    ) {
        assert_eq!(PortRange::new(unit, from, to, protocol).is_ok(), valid);
    }

    #[test]
    fn test_protocol_parse_is_case_insensitive() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("Icmp".parse::<Protocol>().unwrap(), Protocol::Icmp);
        assert!("sctp".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(tcp("web/0", 80, 90).to_string(), r#"80-90/tcp ("web/0")"#);
        assert_eq!(
            PortRange::icmp("web/0").unwrap().to_string(),
            r#"icmp ("web/0")"#
        );
    }

    #[test]
    fn test_length() {
        assert_eq!(tcp("web/0", 80, 80).length(), 1);
        assert_eq!(tcp("web/0", 80, 90).length(), 11);
        let invalid = PortRange {
            unit_name: "web/0".into(),
            from_port: 90,
            to_port: 80,
            protocol: Protocol::Tcp,
        };
        assert_eq!(invalid.length(), 0);
    }

    #[test]
    fn test_sanitize_bounds() {
        let raw = PortRange {
            unit_name: "web/0".into(),
            from_port: 70000,
            to_port: -5,
            protocol: Protocol::Tcp,
        };
        let clean = raw.sanitize_bounds();
        assert_eq!((clean.from_port, clean.to_port), (1, 65535));

        let icmp = PortRange::icmp("web/0").unwrap();
        assert_eq!(icmp.sanitize_bounds(), icmp);
    }

    #[rstest]
    #[case(tcp("web/0", 80, 90), tcp("db/0", 85, 100), true)]
    #[case(tcp("web/0", 80, 90), tcp("db/0", 91, 100), false)]
    #[case(tcp("web/0", 80, 90), tcp("web/0", 80, 90), false)]
    #[case(tcp("web/0", 80, 90), tcp("web/0", 80, 91), true)]
    #[case(tcp("web/0", 80, 90), PortRange::new("db/0", 80, 90, Protocol::Udp).unwrap(), false)]
    #[case(PortRange::icmp("web/0").unwrap(), PortRange::icmp("db/0").unwrap(), true)]
    fn test_conflicts(#[case] a: PortRange, #[case] b: PortRange, #[case] conflict: bool) {
        assert_eq!(a.check_conflicts(&b).is_err(), conflict);
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(tcp("web/0", 80, 80)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "unit-name": "web/0",
                "from-port": 80,
                "to-port": 80,
                "protocol": "tcp",
            })
        );
    }

    fn arb_range() -> impl Strategy<Value = PortRange> {
        (
            prop::sample::select(vec!["web/0", "web/1", "db/0"]),
            1i32..200,
            0i32..50,
            prop::sample::select(vec![Protocol::Tcp, Protocol::Udp]),
        )
            .prop_map(|(unit, from, len, protocol)| PortRange {
                unit_name: unit.to_string(),
                from_port: from,
                to_port: from + len,
                protocol,
            })
    }

    proptest! {
        #[test]
        fn prop_conflict_is_symmetric(a in arb_range(), b in arb_range()) {
            prop_assert_eq!(a.conflicts_with(&b), b.conflicts_with(&a));
        }

        #[test]
        fn prop_range_never_conflicts_with_itself(a in arb_range()) {
            prop_assert!(a.check_conflicts(&a).is_ok());
        }
    }
}
