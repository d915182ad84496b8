//! Value Objects - Immutable pattern primitives with validation
//!
//! Value Objects are:
//! - Immutable
//! - Comparable by value (not identity)
//! - Self-validating

use crate::error::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pattern identifier (Value Object)
///
/// Unique within one catalog. Ordering is the tie-break used when two
/// matches start at the same offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternId(u32);

impl PatternId {
    /// Create from raw value
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get raw value
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl From<u32> for PatternId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Severity weight (Value Object)
///
/// # Invariants
/// - Range: 0 to [`Severity::MAX`]
/// - Zero is valid: the match is still reported but adds nothing to scores
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u8")]
pub struct Severity(u8);

impl Severity {
    /// Largest accepted severity
    pub const MAX: u8 = 100;

    /// Create severity with validation
    pub fn new(value: u8) -> DomainResult<Self> {
        if value > Self::MAX {
            return Err(DomainError::SeverityOutOfRange {
                value: value.into(),
                max: Self::MAX,
            });
        }
        Ok(Self(value))
    }

    /// Create severity, clamping to [`Severity::MAX`]
    pub const fn saturating(value: u8) -> Self {
        if value > Self::MAX {
            Self(Self::MAX)
        } else {
            Self(value)
        }
    }

    /// Get raw weight
    pub const fn value(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u16> for Severity {
    type Error = DomainError;

    fn try_from(value: u16) -> DomainResult<Self> {
        match u8::try_from(value) {
            Ok(v) => Self::new(v),
            Err(_) => Err(DomainError::SeverityOutOfRange {
                value,
                max: Self::MAX,
            }),
        }
    }
}

impl From<Severity> for u8 {
    fn from(severity: Severity) -> Self {
        severity.0
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dark pattern category
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    /// False urgency ("act now", "only today")
    Urgency,
    /// Artificial scarcity ("only 2 left")
    Scarcity,
    /// Guilt-tripping decline options ("no thanks, I hate saving money")
    ConfirmShame,
    /// Costs revealed late ("service fee", "handling charge")
    HiddenCost,
    /// Manufactured popularity ("12 people are viewing this")
    SocialProof,
    /// Attention steering away from the honest option
    Misdirection,
    /// Required actions unrelated to the user's goal
    ForcedAction,
    /// Items or subscriptions added without consent
    Sneaking,
    /// Deliberately hard cancellation or opt-out
    Obstruction,
}

impl Category {
    /// All categories in ordering sequence
    pub const ALL: [Category; 9] = [
        Self::Urgency,
        Self::Scarcity,
        Self::ConfirmShame,
        Self::HiddenCost,
        Self::SocialProof,
        Self::Misdirection,
        Self::ForcedAction,
        Self::Sneaking,
        Self::Obstruction,
    ];

    /// Canonical tag, identical to the serialized form
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Urgency => "URGENCY",
            Self::Scarcity => "SCARCITY",
            Self::ConfirmShame => "CONFIRM_SHAME",
            Self::HiddenCost => "HIDDEN_COST",
            Self::SocialProof => "SOCIAL_PROOF",
            Self::Misdirection => "MISDIRECTION",
            Self::ForcedAction => "FORCED_ACTION",
            Self::Sneaking => "SNEAKING",
            Self::Obstruction => "OBSTRUCTION",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = DomainError;

    /// Accepts the canonical tag in any case, with `-` or `_` separators
    fn from_str(s: &str) -> DomainResult<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| DomainError::UnknownCategory(s.to_string()))
    }
}
