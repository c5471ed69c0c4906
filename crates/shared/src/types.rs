//! Common types used across the starter

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SharedError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Plans
// =============================================================================

/// Subscription plan
///
/// Variants are declared in rank order, so the derived `Ord` is the plan
/// hierarchy: Free → Basic → Premium.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Basic,
    Premium,
}

impl Default for Plan {
    fn default() -> Self {
        Self::Free
    }
}

impl Plan {
    /// Every plan, lowest first
    pub const ALL: [Plan; 3] = [Plan::Free, Plan::Basic, Plan::Premium];

    /// The entry tier. Users on it have no billing subscription.
    pub const fn lowest() -> Self {
        Self::Free
    }

    /// Position in the plan hierarchy (0 = free)
    pub const fn rank(&self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Basic => 1,
            Self::Premium => 2,
        }
    }

    /// Whether this plan is backed by a paid billing subscription
    pub const fn is_paid(&self) -> bool {
        !matches!(self, Self::Free)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Basic => "basic",
            Self::Premium => "premium",
        }
    }

    /// Name shown on pricing cards and receipts
    pub const fn display_name(&self) -> &'static str {
        match self {
            Self::Free => "Free",
            Self::Basic => "Basic",
            Self::Premium => "Premium",
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Plan {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "basic" => Ok(Self::Basic),
            "premium" => Ok(Self::Premium),
            _ => Err(SharedError::InvalidPlan(s.to_string())),
        }
    }
}

// =============================================================================
// Features
// =============================================================================

/// Gated capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureId {
    /// Seats in the account
    TeamMembers,
    /// Active projects
    Projects,
    /// CSV export of account data
    ExportsCsv,
    /// Programmatic API keys
    ApiAccess,
    PrioritySupport,
    CustomDomain,
}

impl FeatureId {
    pub const ALL: [FeatureId; 6] = [
        FeatureId::TeamMembers,
        FeatureId::Projects,
        FeatureId::ExportsCsv,
        FeatureId::ApiAccess,
        FeatureId::PrioritySupport,
        FeatureId::CustomDomain,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TeamMembers => "team_members",
            Self::Projects => "projects",
            Self::ExportsCsv => "exports_csv",
            Self::ApiAccess => "api_access",
            Self::PrioritySupport => "priority_support",
            Self::CustomDomain => "custom_domain",
        }
    }

    /// Label for pricing tables
    pub const fn label(&self) -> &'static str {
        match self {
            Self::TeamMembers => "Team members",
            Self::Projects => "Projects",
            Self::ExportsCsv => "CSV exports",
            Self::ApiAccess => "API access",
            Self::PrioritySupport => "Priority support",
            Self::CustomDomain => "Custom domain",
        }
    }
}

impl std::fmt::Display for FeatureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FeatureId {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|feature| feature.as_str() == s)
            .ok_or_else(|| SharedError::InvalidFeature(s.to_string()))
    }
}

/// Degree to which a plan grants a feature
///
/// Serialized as `"disabled"`, `"enabled"`, `"unlimited"` or a bare integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawFeatureLimit", into = "RawFeatureLimit")]
pub enum FeatureLimit {
    Disabled,
    Enabled,
    Bounded(u32),
    Unlimited,
}

impl FeatureLimit {
    pub const fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Numeric capacity for quantity-limited features.
    /// `Unlimited` maps to `u64::MAX`; on/off entries have no capacity.
    pub const fn capacity(&self) -> Option<u64> {
        match self {
            Self::Bounded(n) => Some(*n as u64),
            Self::Unlimited => Some(u64::MAX),
            Self::Disabled | Self::Enabled => None,
        }
    }

    /// Whether one more unit may be used given `used` units already in use
    pub const fn allows(&self, used: u64) -> bool {
        match self {
            Self::Disabled => false,
            Self::Enabled | Self::Unlimited => true,
            Self::Bounded(n) => used < *n as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawFeatureLimit {
    Bounded(u32),
    Keyword(String),
}

impl TryFrom<RawFeatureLimit> for FeatureLimit {
    type Error = SharedError;

    fn try_from(raw: RawFeatureLimit) -> Result<Self, Self::Error> {
        match raw {
            RawFeatureLimit::Bounded(n) => Ok(Self::Bounded(n)),
            RawFeatureLimit::Keyword(word) => match word.as_str() {
                "disabled" => Ok(Self::Disabled),
                "enabled" => Ok(Self::Enabled),
                "unlimited" => Ok(Self::Unlimited),
                _ => Err(SharedError::InvalidLimit(word)),
            },
        }
    }
}

impl From<FeatureLimit> for RawFeatureLimit {
    fn from(limit: FeatureLimit) -> Self {
        match limit {
            FeatureLimit::Disabled => Self::Keyword("disabled".to_string()),
            FeatureLimit::Enabled => Self::Keyword("enabled".to_string()),
            FeatureLimit::Unlimited => Self::Keyword("unlimited".to_string()),
            FeatureLimit::Bounded(n) => Self::Bounded(n),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
