//! Entity row model
//!
//! Every tracked table (systems, functions, requirements, control-structure
//! elements, ...) shares one column layout: hierarchical identity, baseline
//! tag, tree references, name/description, the fixed critical-attribute set,
//! and a JSON bag of type-specific fields. One `Entity` struct therefore
//! models a row of any kind; [`crate::core::identity::Kind`] selects the
//! table.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::identity::{HierId, Kind};

/// Baseline label of the live, editable dataset
pub const WORKING_BASELINE: &str = "Working";

/// Criticality classification
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Criticality {
    #[default]
    NonCritical,
    MissionCritical,
    SafetyCritical,
    FlightCritical,
    SecurityCritical,
    PrivacyCritical,
}

impl std::fmt::Display for Criticality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Criticality::NonCritical => write!(f, "Non-Critical"),
            Criticality::MissionCritical => write!(f, "Mission Critical"),
            Criticality::SafetyCritical => write!(f, "Safety Critical"),
            Criticality::FlightCritical => write!(f, "Flight Critical"),
            Criticality::SecurityCritical => write!(f, "Security Critical"),
            Criticality::PrivacyCritical => write!(f, "Privacy Critical"),
        }
    }
}

impl std::str::FromStr for Criticality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace([' ', '-', '_'], "").as_str() {
            "noncritical" => Ok(Criticality::NonCritical),
            "missioncritical" => Ok(Criticality::MissionCritical),
            "safetycritical" => Ok(Criticality::SafetyCritical),
            "flightcritical" => Ok(Criticality::FlightCritical),
            "securitycritical" => Ok(Criticality::SecurityCritical),
            "privacycritical" => Ok(Criticality::PrivacyCritical),
            _ => Err(format!("Unknown criticality: {}", s)),
        }
    }
}

/// A boolean security property plus its rationale text
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFlag {
    pub asserted: bool,
    #[serde(default)]
    pub rationale: String,
}

impl SecurityFlag {
    pub fn asserted(rationale: impl Into<String>) -> Self {
        Self {
            asserted: true,
            rationale: rationale.into(),
        }
    }
}

/// The fixed critical-attribute set carried by every entity row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalAttributes {
    pub criticality: Criticality,
    pub confidentiality: SecurityFlag,
    pub integrity: SecurityFlag,
    pub availability: SecurityFlag,
    pub authenticity: SecurityFlag,
}

/// Type-specific fields, keyed deterministically
pub type Props = BTreeMap<String, serde_json::Value>;

/// A persisted entity row
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    /// Storage rowid (primary key within the owning store)
    pub row_id: i64,

    /// Hierarchical identifier, unique within a baseline
    pub hierarchy: HierId,

    /// `"Working"` or an immutable snapshot label
    pub baseline: String,

    /// Same-kind parent rowid (systems and requirements only)
    pub parent_id: Option<i64>,

    /// Owning system rowid (non-system kinds)
    pub system_id: Option<i64>,

    pub name: String,
    pub description: String,
    pub attrs: CriticalAttributes,
    pub props: Props,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// The entity kind, as encoded in the hierarchical identifier
    pub fn kind(&self) -> Kind {
        self.hierarchy.kind()
    }

    /// Derived status: only `"Working"` rows accept mutation
    pub fn editable(&self) -> bool {
        self.baseline == WORKING_BASELINE
    }
}

/// Draft for a row about to be created.
///
/// The store allocates the hierarchical identifier and stamps the baseline;
/// callers supply everything else.
#[derive(Debug, Clone)]
pub struct NewEntity {
    pub kind: Kind,

    /// Same-kind parent rowid (root systems: `None`; requirements: optional)
    pub parent: Option<i64>,

    /// Owning system rowid; required for every kind except `System`
    pub system: Option<i64>,

    pub name: String,
    pub description: String,
    pub attrs: CriticalAttributes,
    pub props: Props,
}

impl NewEntity {
    pub fn new(kind: Kind, name: impl Into<String>) -> Self {
        Self {
            kind,
            parent: None,
            system: None,
            name: name.into(),
            description: String::new(),
            attrs: CriticalAttributes::default(),
            props: Props::new(),
        }
    }

    pub fn parent(mut self, parent_row_id: i64) -> Self {
        self.parent = Some(parent_row_id);
        self
    }

    pub fn system(mut self, system_row_id: i64) -> Self {
        self.system = Some(system_row_id);
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    pub fn attrs(mut self, attrs: CriticalAttributes) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn prop(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.props.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_criticality_display_parse_roundtrip() {
        for c in [
            Criticality::NonCritical,
            Criticality::MissionCritical,
            Criticality::SafetyCritical,
            Criticality::FlightCritical,
            Criticality::SecurityCritical,
            Criticality::PrivacyCritical,
        ] {
            let parsed: Criticality = c.to_string().parse().unwrap();
            assert_eq!(parsed, c);
        }
    }

    #[test]
    fn test_new_entity_builder() {
        let draft = NewEntity::new(Kind::Function, "Navigate")
            .system(4)
            .description("Primary navigation function")
            .prop("short_text_identifier", serde_json::json!("NAV"));

        assert_eq!(draft.kind, Kind::Function);
        assert_eq!(draft.system, Some(4));
        assert_eq!(draft.props["short_text_identifier"], "NAV");
    }
}
