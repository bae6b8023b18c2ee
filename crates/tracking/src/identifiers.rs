//! Type-safe, efficient identifiers for routes, stops and vehicles.
//!
//! All identifiers use Arc<str> for cheap cloning and minimal memory overhead.
//! Vehicle identifiers are cloned into every queued ping and every state
//! snapshot, so the cheap clone matters on the ingestion path.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

macro_rules! impl_identifier {
    ($name:ident) => {
        #[derive(Clone, Debug, PartialOrd, Ord)]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn new(s: impl AsRef<str>) -> Self {
                Self(s.as_ref().into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.0, &other.0) || self.0 == other.0
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.0.hash(state);
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Ok(Self::new(s))
            }
        }
    };
}

impl_identifier!(RouteIdentifier);
impl_identifier!(StopIdentifier);
impl_identifier!(VehicleIdentifier);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vehicle_ids_order_by_text() {
        let mut ids: Vec<VehicleIdentifier> = ["m-12", "m-2", "A7"].into_iter().map(Into::into).collect();
        ids.sort();
        let sorted: Vec<String> = ids.iter().map(ToString::to_string).collect();
        assert_eq!(sorted, ["A7", "m-12", "m-2"]);
    }

    #[test]
    fn test_ids_from_any_source_collide() {
        use std::collections::HashSet;

        let parsed: VehicleIdentifier = serde_json::from_str("\"m-12\"").unwrap();
        let ids: HashSet<VehicleIdentifier> = [parsed, String::from("m-12").into(), "m-12".into()].into_iter().collect();
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_blank_identifier_is_empty() {
        assert!(VehicleIdentifier::new("   ").is_empty());
        assert!(!VehicleIdentifier::new("v1").is_empty());
    }

    #[test]
    fn test_identifier_serde() {
        let id: StopIdentifier = serde_json::from_str("\"tahrir\"").unwrap();
        assert_eq!(id.as_str(), "tahrir");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"tahrir\"");
    }
}
