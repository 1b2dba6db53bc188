//! Hierarchical entity identity
//!
//! Every entity carries an identifier of the form `TAG-n(.n)*`, e.g. `S-1`,
//! `S-1.2.1`, `F-1.2.3`. The numeric path encodes the entity's position in
//! the system tree: a child of `S-1.2` is `S-1.2.k`, and a function created
//! under system `S-1.2` is `F-1.2.k`. The path is always derived from the
//! parent chain, never assigned independently.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Entity kind tags
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Kind {
    /// System (recursive tree root kind)
    System,
    /// System function
    Function,
    /// System interface
    Interface,
    /// Asset
    Asset,
    /// Requirement (recursive, plus many-to-many trace links)
    Requirement,
    /// Hazard
    Hazard,
    /// Loss
    Loss,
    /// Control structure
    ControlStructure,
    /// Controller
    Controller,
    /// Control action
    ControlAction,
    /// Feedback signal
    Feedback,
}

impl Kind {
    /// Get the tag used in hierarchical identifiers
    pub fn tag(&self) -> &'static str {
        match self {
            Kind::System => "S",
            Kind::Function => "F",
            Kind::Interface => "I",
            Kind::Asset => "A",
            Kind::Requirement => "R",
            Kind::Hazard => "H",
            Kind::Loss => "L",
            Kind::ControlStructure => "CS",
            Kind::Controller => "CT",
            Kind::ControlAction => "CA",
            Kind::Feedback => "FB",
        }
    }

    /// Get the database table holding rows of this kind
    pub fn table(&self) -> &'static str {
        match self {
            Kind::System => "systems",
            Kind::Function => "functions",
            Kind::Interface => "interfaces",
            Kind::Asset => "assets",
            Kind::Requirement => "requirements",
            Kind::Hazard => "hazards",
            Kind::Loss => "losses",
            Kind::ControlStructure => "control_structures",
            Kind::Controller => "controllers",
            Kind::ControlAction => "control_actions",
            Kind::Feedback => "feedback",
        }
    }

    /// All kinds, in table-creation order
    pub fn all() -> &'static [Kind] {
        &[
            Kind::System,
            Kind::Function,
            Kind::Interface,
            Kind::Asset,
            Kind::Requirement,
            Kind::Hazard,
            Kind::Loss,
            Kind::ControlStructure,
            Kind::Controller,
            Kind::ControlAction,
            Kind::Feedback,
        ]
    }

}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl FromStr for Kind {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "S" => Ok(Kind::System),
            "F" => Ok(Kind::Function),
            "I" => Ok(Kind::Interface),
            "A" => Ok(Kind::Asset),
            "R" => Ok(Kind::Requirement),
            "H" => Ok(Kind::Hazard),
            "L" => Ok(Kind::Loss),
            "CS" => Ok(Kind::ControlStructure),
            "CT" => Ok(Kind::Controller),
            "CA" => Ok(Kind::ControlAction),
            "FB" => Ok(Kind::Feedback),
            _ => Err(IdParseError::UnknownTag(s.to_string())),
        }
    }
}

/// A hierarchical identifier: kind tag plus a non-empty numeric path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HierId {
    kind: Kind,
    path: Vec<u32>,
}

impl HierId {
    /// Build an identifier from a kind and path segments.
    ///
    /// The path must be non-empty and contain no zero segments.
    pub fn new(kind: Kind, path: Vec<u32>) -> Result<Self, IdParseError> {
        if path.is_empty() {
            return Err(IdParseError::EmptyPath);
        }
        if path.contains(&0) {
            return Err(IdParseError::ZeroSequence);
        }
        Ok(Self { kind, path })
    }

    /// The entity kind
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// The numeric path segments
    pub fn path(&self) -> &[u32] {
        &self.path
    }

    /// The last path segment: this entity's sequence number among siblings
    pub fn seq(&self) -> u32 {
        *self.path.last().expect("path is non-empty")
    }

    /// Number of path segments
    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// The numeric part rendered without the kind tag, e.g. `1.2.1`
    pub fn numeric_path(&self) -> String {
        let parts: Vec<String> = self.path.iter().map(u32::to_string).collect();
        parts.join(".")
    }

    /// Identifier of a child with the given sequence number, same kind
    pub fn child(&self, seq: u32) -> Result<Self, IdParseError> {
        let mut path = self.path.clone();
        path.push(seq);
        Self::new(self.kind, path)
    }

    /// Identifier for an entity of `kind` allocated under this path
    pub fn extend(&self, kind: Kind, seq: u32) -> Result<Self, IdParseError> {
        let mut path = self.path.clone();
        path.push(seq);
        Self::new(kind, path)
    }

    /// Parent identifier (same kind), or `None` at the root
    pub fn parent(&self) -> Option<Self> {
        if self.path.len() <= 1 {
            return None;
        }
        Some(Self {
            kind: self.kind,
            path: self.path[..self.path.len() - 1].to_vec(),
        })
    }

    /// Whether this id's path descends from (or equals) the given path.
    ///
    /// Prefix-aware: `1.2` captures `1.2.5` but not `1.20`.
    pub fn descends_from(&self, ancestor_path: &[u32]) -> bool {
        self.path.len() >= ancestor_path.len() && &self.path[..ancestor_path.len()] == ancestor_path
    }

    /// Parse an identifier from its string form
    pub fn parse(s: &str) -> Result<Self, IdParseError> {
        s.parse()
    }
}

impl fmt::Display for HierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind.tag(), self.numeric_path())
    }
}

impl FromStr for HierId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, numbers) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| IdParseError::MissingDelimiter(s.to_string()))?;

        let kind: Kind = tag.parse()?;

        let path = numbers
            .split('.')
            .map(|part| {
                part.parse::<u32>()
                    .map_err(|_| IdParseError::InvalidSequence(part.to_string()))
            })
            .collect::<Result<Vec<u32>, _>>()?;

        Self::new(kind, path)
    }
}

impl Serialize for HierId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HierId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors that can occur when parsing hierarchical identifiers
#[derive(Debug, Error)]
pub enum IdParseError {
    #[error("unknown kind tag: '{0}' (valid: S, F, I, A, R, H, L, CS, CT, CA, FB)")]
    UnknownTag(String),

    #[error("missing '-' delimiter in identifier: '{0}'")]
    MissingDelimiter(String),

    #[error("invalid sequence number: '{0}'")]
    InvalidSequence(String),

    #[error("identifier has an empty path")]
    EmptyPath,

    #[error("sequence numbers start at 1")]
    ZeroSequence,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_root_system() {
        let id = HierId::parse("S-1").unwrap();
        assert_eq!(id.kind(), Kind::System);
        assert_eq!(id.path(), &[1]);
        assert_eq!(id.to_string(), "S-1");
    }

    #[test]
    fn test_parse_nested_roundtrip() {
        for s in ["S-1.2.1", "F-3.1", "CS-2.4.1", "R-1.1.7"] {
            let id = HierId::parse(s).unwrap();
            assert_eq!(id.to_string(), s);
        }
    }

    #[test]
    fn test_parse_rejects_unknown_tag() {
        let err = HierId::parse("X-1").unwrap_err();
        assert!(matches!(err, IdParseError::UnknownTag(_)));
    }

    #[test]
    fn test_parse_rejects_missing_delimiter() {
        let err = HierId::parse("S1.2").unwrap_err();
        assert!(matches!(err, IdParseError::MissingDelimiter(_)));
    }

    #[test]
    fn test_parse_rejects_garbage_sequence() {
        let err = HierId::parse("S-1.x.2").unwrap_err();
        assert!(matches!(err, IdParseError::InvalidSequence(_)));
    }

    #[test]
    fn test_parse_rejects_zero() {
        let err = HierId::parse("S-1.0").unwrap_err();
        assert!(matches!(err, IdParseError::ZeroSequence));
    }

    #[test]
    fn test_child_and_parent() {
        let root = HierId::parse("S-1").unwrap();
        let child = root.child(2).unwrap();
        assert_eq!(child.to_string(), "S-1.2");
        assert_eq!(child.parent().unwrap(), root);
        assert!(root.parent().is_none());
    }

    #[test]
    fn test_extend_changes_kind() {
        let sys = HierId::parse("S-1.2").unwrap();
        let func = sys.extend(Kind::Function, 3).unwrap();
        assert_eq!(func.to_string(), "F-1.2.3");
        assert_eq!(func.seq(), 3);
    }

    #[test]
    fn test_descends_from_is_prefix_aware() {
        let base = HierId::parse("S-1.2").unwrap();
        let inside = HierId::parse("F-1.2.5").unwrap();
        let lookalike = HierId::parse("S-1.20").unwrap();
        assert!(inside.descends_from(base.path()));
        assert!(base.descends_from(base.path()));
        assert!(!lookalike.descends_from(base.path()));
    }

    #[test]
    fn test_all_tags_roundtrip() {
        for kind in Kind::all() {
            let parsed: Kind = kind.tag().parse().unwrap();
            assert_eq!(parsed, *kind);
        }
    }
}
