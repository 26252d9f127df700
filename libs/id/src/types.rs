//! Entity kinds, tag definitions and the model identifier.
//!
//! Each tag type has a fixed kind and a per-kind id grammar. The grammars are
//! what the persisted document keys are validated against, so they must not
//! drift.

use std::sync::OnceLock;

use regex::Regex;

use crate::define_tag;
use crate::IdError;

// =============================================================================
// Id Grammars
// =============================================================================

/// Machine ids: `0`, `12`, or containers nested below a host such as `0/lxd/1`.
pub const MACHINE_SNIPPET: &str = r"(?:0|[1-9][0-9]*)(?:/[a-z]+[a-z0-9]*/(?:0|[1-9][0-9]*))*";

/// Application names: lowercase words joined by single hyphens, never ending in
/// a number-only word.
pub const APPLICATION_SNIPPET: &str = r"(?:[a-z][a-z0-9]*(?:-[a-z0-9]*[a-z][a-z0-9]*)*)";

/// Unit names: `<application>/<n>`.
pub const UNIT_SNIPPET: &str =
    r"(?:[a-z][a-z0-9]*(?:-[a-z0-9]*[a-z][a-z0-9]*)*)/(?:0|[1-9][0-9]*)";

fn anchored(cell: &'static OnceLock<Regex>, snippet: &str) -> &'static Regex {
    cell.get_or_init(|| {
        // The snippets are compile-time constants and known to be valid.
        #[allow(clippy::expect_used)]
        Regex::new(&format!("^{snippet}$")).expect("static id grammar")
    })
}

fn machine_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    anchored(&RE, MACHINE_SNIPPET)
}

fn application_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    anchored(&RE, APPLICATION_SNIPPET)
}

fn unit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    anchored(&RE, UNIT_SNIPPET)
}

/// Returns true if `id` is a valid machine (or container) id.
pub fn is_valid_machine(id: &str) -> bool {
    machine_re().is_match(id)
}

/// Returns true if `name` is a valid application name.
pub fn is_valid_application(name: &str) -> bool {
    application_re().is_match(name)
}

/// Returns true if `name` is a valid unit name.
pub fn is_valid_unit(name: &str) -> bool {
    unit_re().is_match(name)
}

// =============================================================================
// Entity Kind
// =============================================================================

/// The kinds of entity a tag can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    Machine,
    Unit,
    Application,
    Subnet,
    Model,
}

impl EntityKind {
    /// All kinds, in tag-prefix lookup order.
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Machine,
        EntityKind::Unit,
        EntityKind::Application,
        EntityKind::Subnet,
        EntityKind::Model,
    ];

    /// The tag prefix for this kind.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Machine => "machine",
            Self::Unit => "unit",
            Self::Application => "application",
            Self::Subnet => "subnet",
            Self::Model => "model",
        }
    }

    /// Looks a kind up by its tag prefix.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.prefix() == prefix)
    }

    /// Validates a raw id against this kind's grammar.
    pub fn validate_id(self, id: &str) -> Result<(), IdError> {
        if id.is_empty() {
            return Err(IdError::Empty);
        }
        let valid = match self {
            Self::Machine => is_valid_machine(id),
            Self::Unit => is_valid_unit(id),
            Self::Application => is_valid_application(id),
            Self::Subnet => !id.chars().any(char::is_whitespace),
            Self::Model => uuid::Uuid::parse_str(id).is_ok(),
        };
        if valid {
            Ok(())
        } else {
            Err(IdError::InvalidId {
                kind: self.prefix(),
                id: id.to_string(),
            })
        }
    }

    /// Encodes a raw id for use in the tag string.
    pub(crate) fn encode_id(self, id: &str) -> String {
        match self {
            Self::Machine | Self::Unit => id.replace('/', "-"),
            Self::Application | Self::Subnet | Self::Model => id.to_string(),
        }
    }

    /// Decodes the id portion of a tag string.
    fn decode_id(self, encoded: &str) -> String {
        match self {
            Self::Machine => encoded.replace('-', "/"),
            Self::Unit => match encoded.rsplit_once('-') {
                Some((app, n)) => format!("{app}/{n}"),
                None => encoded.to_string(),
            },
            Self::Application | Self::Subnet | Self::Model => encoded.to_string(),
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

// =============================================================================
// Entity Tag
// =============================================================================

/// An untyped entity tag: kind plus validated id.
///
/// This is the key the supervision tree tracks reconcilers under.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityTag {
    kind: EntityKind,
    id: String,
}

impl EntityTag {
    /// Creates a tag from a kind and raw id, validating the id.
    pub fn new(kind: EntityKind, id: &str) -> Result<Self, IdError> {
        kind.validate_id(id)?;
        Ok(Self {
            kind,
            id: id.to_string(),
        })
    }

    /// Assembles a tag from an already validated id.
    pub(crate) fn from_parts(kind: EntityKind, id: String) -> Self {
        Self { kind, id }
    }

    /// Parses a tag from its `{kind}-{id}` string form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let Some((prefix, encoded)) = s.split_once('-') else {
            return Err(IdError::MissingSeparator(s.to_string()));
        };
        let kind = EntityKind::from_prefix(prefix).ok_or_else(|| IdError::InvalidKind {
            expected: "machine|unit|application|subnet|model",
            actual: prefix.to_string(),
        })?;
        Self::new(kind, &kind.decode_id(encoded))
    }

    /// The entity kind.
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// The raw id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Display for EntityTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.kind.prefix(), self.kind.encode_id(&self.id))
    }
}

impl std::str::FromStr for EntityTag {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for EntityTag {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for EntityTag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Typed Tags
// =============================================================================

define_tag!(MachineTag, EntityKind::Machine);
define_tag!(UnitTag, EntityKind::Unit);
define_tag!(ApplicationTag, EntityKind::Application);
define_tag!(SubnetTag, EntityKind::Subnet);

impl MachineTag {
    /// Returns true if this machine is a container hosted on another machine.
    #[must_use]
    pub fn is_container(&self) -> bool {
        self.0.contains('/')
    }

    /// Returns the hosting machine of a container, or `None` for a top-level machine.
    #[must_use]
    pub fn parent(&self) -> Option<MachineTag> {
        let (host, _) = self.0.rsplit_once('/')?;
        let (host, _) = host.rsplit_once('/')?;
        Some(MachineTag(host.to_string()))
    }

    /// Returns the container type (`lxd`, `kvm`, ...) of a container.
    #[must_use]
    pub fn container_type(&self) -> Option<&str> {
        let (host, _) = self.0.rsplit_once('/')?;
        host.rsplit_once('/').map(|(_, kind)| kind)
    }
}

impl UnitTag {
    /// Returns the application this unit belongs to.
    #[must_use]
    pub fn application(&self) -> ApplicationTag {
        let app = self.0.split_once('/').map_or(self.0.as_str(), |(app, _)| app);
        ApplicationTag(app.to_string())
    }
}

// =============================================================================
// Model
// =============================================================================

/// Identifier of the model (namespace) that owns a set of documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModelUuid(uuid::Uuid);

impl ModelUuid {
    /// Creates a fresh random model UUID.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// Parses a model UUID.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| IdError::InvalidUuid(e.to_string()))
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn uuid(&self) -> uuid::Uuid {
        self.0
    }

    /// Returns the model as an entity tag.
    #[must_use]
    pub fn tag(&self) -> EntityTag {
        EntityTag::from_parts(EntityKind::Model, self.0.to_string())
    }

    /// Scopes a model-local key into a globally unique document id.
    #[must_use]
    pub fn doc_id(&self, local_id: &str) -> String {
        format!("{}:{}", self.0, local_id)
    }
}

impl Default for ModelUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ModelUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ModelUuid {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for ModelUuid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ModelUuid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("0", true)]
    #[case("42", true)]
    #[case("0/lxd/1", true)]
    #[case("3/kvm/0/lxd/7", true)]
    #[case("01", false)]
    #[case("0/lxd", false)]
    #[case("0/LXD/1", false)]
    #[case("-1", false)]
    #[case("", false)]
    fn test_machine_grammar(#[case] id: &str, #[case] valid: bool) {
        assert_eq!(is_valid_machine(id), valid, "machine id {id:?}");
    }

    #[rstest]
    #[case("web/0", true)]
    #[case("my-app/12", true)]
    #[case("db2/3", true)]
    #[case("web", false)]
    #[case("web/", false)]
    #[case("web/01", false)]
    #[case("Web/0", false)]
    #[case("app-1/0", false)]
    fn test_unit_grammar(#[case] name: &str, #[case] valid: bool) {
        assert_eq!(is_valid_unit(name), valid, "unit name {name:?}");
    }

    #[test]
    fn test_machine_tag_roundtrip() {
        let tag = MachineTag::new("0/lxd/1").unwrap();
        assert_eq!(tag.to_string(), "machine-0-lxd-1");
        let parsed: MachineTag = "machine-0-lxd-1".parse().unwrap();
        assert_eq!(parsed, tag);
        assert_eq!(parsed.id(), "0/lxd/1");
    }

    #[test]
    fn test_machine_container_parts() {
        let tag = MachineTag::new("2/lxd/5").unwrap();
        assert!(tag.is_container());
        assert_eq!(tag.parent(), Some(MachineTag::new("2").unwrap()));
        assert_eq!(tag.container_type(), Some("lxd"));

        let host = MachineTag::new("2").unwrap();
        assert!(!host.is_container());
        assert_eq!(host.parent(), None);
        assert_eq!(host.container_type(), None);
    }

    #[test]
    fn test_unit_tag_roundtrip() {
        let tag = UnitTag::new("my-app/3").unwrap();
        assert_eq!(tag.to_string(), "unit-my-app-3");
        let parsed = UnitTag::parse("unit-my-app-3").unwrap();
        assert_eq!(parsed.id(), "my-app/3");
        assert_eq!(parsed.application().id(), "my-app");
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let err = MachineTag::parse("unit-web-0").unwrap_err();
        assert!(err.is_kind_error());
    }

    #[test]
    fn test_entity_tag_parse() {
        let tag = EntityTag::parse("machine-7").unwrap();
        assert_eq!(tag.kind(), EntityKind::Machine);
        assert_eq!(tag.id(), "7");
        assert_eq!(tag, MachineTag::new("7").unwrap().entity());
    }

    #[test]
    fn test_entity_tag_errors() {
        assert!(EntityTag::parse("").unwrap_err().is_empty());
        assert!(matches!(
            EntityTag::parse("machine0").unwrap_err(),
            IdError::MissingSeparator(_)
        ));
        assert!(matches!(
            EntityTag::parse("volume-0").unwrap_err(),
            IdError::InvalidKind { .. }
        ));
        assert!(matches!(
            EntityTag::parse("machine-0-lxd").unwrap_err(),
            IdError::InvalidId { .. }
        ));
    }

    #[test]
    fn test_tag_json_roundtrip() {
        let tag = UnitTag::new("web/0").unwrap();
        let json = serde_json::to_string(&tag).unwrap();
        assert_eq!(json, "\"unit-web-0\"");
        let parsed: UnitTag = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, tag);
    }

    #[test]
    fn test_model_uuid() {
        let model = ModelUuid::new();
        let parsed: ModelUuid = model.to_string().parse().unwrap();
        assert_eq!(parsed, model);
        assert_eq!(model.doc_id("m#0#"), format!("{model}:m#0#"));
        assert_eq!(model.tag().kind(), EntityKind::Model);
        assert!(matches!(
            ModelUuid::parse("nope").unwrap_err(),
            IdError::InvalidUuid(_)
        ));
    }

    proptest::proptest! {
        #[test]
        fn prop_machine_tag_roundtrip(host in 0u32..10_000, nested in proptest::collection::vec(0u32..100, 0..3)) {
            let mut id = host.to_string();
            for n in nested {
                id.push_str(&format!("/lxd/{n}"));
            }
            let tag = MachineTag::new(&id).unwrap();
            let parsed = MachineTag::parse(&tag.to_string()).unwrap();
            proptest::prop_assert_eq!(parsed, tag);
        }
    }
}
