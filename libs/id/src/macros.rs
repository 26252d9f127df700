//! Macros for defining typed entity tags.

/// Macro to define a typed tag for one entity kind.
///
/// This generates a newtype wrapper around the validated id string with:
/// - A `KIND` constant
/// - `new()` to validate a raw id
/// - `parse()` to parse the `{kind}-{id}` tag form
/// - `Display` (tag form) and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations (tag form)
/// - `Ord`, `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_tag!(MachineTag, EntityKind::Machine);
///
/// let tag = MachineTag::new("0/lxd/1")?;
/// let parsed: MachineTag = "machine-0-lxd-1".parse()?;
/// ```
#[macro_export]
macro_rules! define_tag {
    ($name:ident, $kind:expr) => {
        /// A typed tag for this entity kind.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// The entity kind named by this tag type.
            pub const KIND: $crate::EntityKind = $kind;

            /// Creates a tag from a raw id, validating the id grammar.
            pub fn new(id: &str) -> Result<Self, $crate::IdError> {
                Self::KIND.validate_id(id)?;
                Ok(Self(id.to_string()))
            }

            /// Parses a tag from its `{kind}-{id}` string form.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                let tag = $crate::EntityTag::parse(s)?;
                if tag.kind() != Self::KIND {
                    return Err($crate::IdError::InvalidKind {
                        expected: Self::KIND.prefix(),
                        actual: tag.kind().prefix().to_string(),
                    });
                }
                Ok(Self(tag.id().to_string()))
            }

            /// Returns the raw id.
            #[must_use]
            pub fn id(&self) -> &str {
                &self.0
            }

            /// Returns this tag as an untyped entity tag.
            #[must_use]
            pub fn entity(&self) -> $crate::EntityTag {
                $crate::EntityTag::from_parts(Self::KIND, self.0.clone())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}-{}", Self::KIND.prefix(), Self::KIND.encode_id(&self.0))
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl From<$name> for $crate::EntityTag {
            fn from(tag: $name) -> Self {
                $crate::EntityTag::from_parts($name::KIND, tag.0)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}
