//! Entitlement Module
//!
//! Answers "what does this plan include?" for UI gating and for server-side
//! authorization checks.
//!
//! ## Design Principles
//!
//! 1. **Total**: every `(Plan, FeatureId)` pair has an entry; a missing one is
//!    rejected when the table is built, never discovered at lookup time
//! 2. **Immutable**: the table is built once at startup and shared by reference
//! 3. **Pure**: lookups do no I/O

use std::collections::BTreeMap;

use starter_shared::{FeatureId, FeatureLimit, Plan};

use crate::error::{BillingError, BillingResult};

const PLAN_COUNT: usize = Plan::ALL.len();
const FEATURE_COUNT: usize = FeatureId::ALL.len();

/// Env var naming a JSON file that overrides the standard table
pub const ENTITLEMENTS_PATH_ENV: &str = "ENTITLEMENTS_PATH";

/// Immutable `(Plan, FeatureId) → FeatureLimit` mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementTable {
    limits: [[FeatureLimit; FEATURE_COUNT]; PLAN_COUNT],
}

impl EntitlementTable {
    pub fn builder() -> EntitlementTableBuilder {
        EntitlementTableBuilder::default()
    }

    /// Built-in entitlements
    ///
    /// | Feature | Free | Basic | Premium |
    /// |---------|------|-------|---------|
    /// | team_members | 1 | 5 | Unlimited |
    /// | projects | 3 | 20 | Unlimited |
    /// | exports_csv | No | Yes | Yes |
    /// | api_access | No | Yes | Yes |
    /// | priority_support | No | No | Yes |
    /// | custom_domain | No | No | Yes |
    pub fn standard() -> Self {
        use FeatureLimit::*;

        let rows = [
            (FeatureId::TeamMembers, [Bounded(1), Bounded(5), Unlimited]),
            (FeatureId::Projects, [Bounded(3), Bounded(20), Unlimited]),
            (FeatureId::ExportsCsv, [Disabled, Enabled, Enabled]),
            (FeatureId::ApiAccess, [Disabled, Enabled, Enabled]),
            (FeatureId::PrioritySupport, [Disabled, Disabled, Enabled]),
            (FeatureId::CustomDomain, [Disabled, Disabled, Enabled]),
        ];

        let mut limits = [[Disabled; FEATURE_COUNT]; PLAN_COUNT];
        for (feature, per_plan) in rows {
            for plan in Plan::ALL {
                limits[plan_index(plan)][feature_index(feature)] = per_plan[plan_index(plan)];
            }
        }
        Self { limits }
    }

    /// Load a table from JSON: `{ "<plan>": { "<feature>": <limit>, ... }, ... }`
    ///
    /// Unknown plan or feature names and missing entries are configuration
    /// errors.
    pub fn from_json(json: &str) -> BillingResult<Self> {
        let raw: BTreeMap<String, BTreeMap<String, FeatureLimit>> = serde_json::from_str(json)
            .map_err(|e| BillingError::Config(format!("Invalid entitlement table: {}", e)))?;

        let mut builder = Self::builder();
        for (plan_name, features) in raw {
            let plan: Plan = plan_name
                .parse()
                .map_err(|e| BillingError::Config(format!("Entitlement table: {}", e)))?;
            for (feature_name, limit) in features {
                let feature: FeatureId = feature_name
                    .parse()
                    .map_err(|e| BillingError::Config(format!("Entitlement table: {}", e)))?;
                builder = builder.set(plan, feature, limit);
            }
        }
        builder.build()
    }

    /// Load the table named by `ENTITLEMENTS_PATH`, or the standard table when
    /// the variable is unset
    pub fn from_env() -> BillingResult<Self> {
        Self::from_path_var(std::env::var(ENTITLEMENTS_PATH_ENV))
    }

    fn from_path_var(var: Result<String, std::env::VarError>) -> BillingResult<Self> {
        match var {
            Ok(path) => {
                let json = std::fs::read_to_string(&path).map_err(|e| {
                    BillingError::Config(format!("Cannot read entitlement table {}: {}", path, e))
                })?;
                let table = Self::from_json(&json)?;
                tracing::info!(path = %path, "Loaded entitlement table");
                Ok(table)
            }
            Err(std::env::VarError::NotPresent) => Ok(Self::standard()),
            Err(e) => Err(BillingError::Config(format!(
                "{} is set but unreadable: {}",
                ENTITLEMENTS_PATH_ENV, e
            ))),
        }
    }

    /// Whether `plan` grants `feature` at all
    pub fn has_feature(&self, plan: Plan, feature: FeatureId) -> bool {
        self.get_feature_limit(plan, feature).is_enabled()
    }

    pub fn get_feature_limit(&self, plan: Plan, feature: FeatureId) -> FeatureLimit {
        self.limits[plan_index(plan)][feature_index(feature)]
    }

    /// Server-side gate: the limit if the feature is included, otherwise
    /// `FeatureNotAvailable`
    pub fn require_feature(&self, plan: Plan, feature: FeatureId) -> BillingResult<FeatureLimit> {
        let limit = self.get_feature_limit(plan, feature);
        if limit.is_enabled() {
            Ok(limit)
        } else {
            Err(BillingError::FeatureNotAvailable { plan, feature })
        }
    }

    /// Whether one more unit of `feature` may be used when `used` are in use
    pub fn can_use(&self, plan: Plan, feature: FeatureId, used: u64) -> bool {
        self.get_feature_limit(plan, feature).allows(used)
    }

    /// Every feature with its limit for one plan, in `FeatureId::ALL` order
    pub fn features_for_plan(&self, plan: Plan) -> impl Iterator<Item = (FeatureId, FeatureLimit)> + '_ {
        FeatureId::ALL
            .into_iter()
            .map(move |feature| (feature, self.get_feature_limit(plan, feature)))
    }
}

/// Render a limit for pricing tables and usage meters
pub fn format_limit_for_display(limit: FeatureLimit) -> String {
    match limit {
        FeatureLimit::Enabled => "Included".to_string(),
        FeatureLimit::Disabled => "Not included".to_string(),
        FeatureLimit::Unlimited => "Unlimited".to_string(),
        FeatureLimit::Bounded(n) => n.to_string(),
    }
}

/// Collects entries and refuses to build an incomplete table or one that
/// sets the same entry twice
#[derive(Debug, Default)]
pub struct EntitlementTableBuilder {
    entries: BTreeMap<(Plan, FeatureId), FeatureLimit>,
    duplicates: Vec<String>,
}

impl EntitlementTableBuilder {
    pub fn set(mut self, plan: Plan, feature: FeatureId, limit: FeatureLimit) -> Self {
        if self.entries.insert((plan, feature), limit).is_some() {
            self.duplicates.push(format!("{}/{}", plan, feature));
        }
        self
    }

    pub fn build(self) -> BillingResult<EntitlementTable> {
        if !self.duplicates.is_empty() {
            return Err(BillingError::Config(format!(
                "Entitlement table sets entries more than once: {}",
                self.duplicates.join(", ")
            )));
        }

        let mut limits = [[FeatureLimit::Disabled; FEATURE_COUNT]; PLAN_COUNT];
        let mut missing = Vec::new();

        for plan in Plan::ALL {
            for feature in FeatureId::ALL {
                match self.entries.get(&(plan, feature)) {
                    Some(limit) => limits[plan_index(plan)][feature_index(feature)] = *limit,
                    None => missing.push(format!("{}/{}", plan, feature)),
                }
            }
        }

        if !missing.is_empty() {
            return Err(BillingError::Config(format!(
                "Entitlement table is missing entries: {}",
                missing.join(", ")
            )));
        }

        Ok(EntitlementTable { limits })
    }
}

fn plan_index(plan: Plan) -> usize {
    plan.rank() as usize
}

fn feature_index(feature: FeatureId) -> usize {
    feature as usize
}
