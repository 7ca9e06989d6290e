use crate::error::{ReportError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

fn default_max_lineage_depth() -> usize {
    64
}

fn default_balance_tolerance() -> f64 {
    0.001
}

fn default_carry_forward_months() -> u32 {
    12
}

/// Tunables for report assembly. Every field has a default, so `{}` is a
/// valid configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EngineConfig {
    #[schemars(
        description = "Maximum number of lineage hops walked when inheriting a reporting category. Walks that hit the bound are reported as traceability gaps."
    )]
    #[serde(default = "default_max_lineage_depth")]
    pub max_lineage_depth: usize,

    #[schemars(
        description = "Absolute proof-gallon tolerance used for balance checks. Balances below -tolerance are invariant violations; balances within it are treated as zero."
    )]
    #[serde(default = "default_balance_tolerance")]
    pub balance_tolerance: f64,

    #[schemars(
        description = "If true, records whose category cannot be traced are aggregated under category 0 ('Unknown') instead of being left out of category rows."
    )]
    #[serde(default)]
    pub include_unknown_category: bool,

    #[schemars(
        description = "If true, the engine writes every successfully built report into the persistent totals ledger."
    )]
    #[serde(default)]
    pub persist_reports: bool,

    #[schemars(
        description = "Months past a recorded transaction's own month for which the incremental path rewrites storage on-hand balances."
    )]
    #[serde(default = "default_carry_forward_months")]
    pub carry_forward_months: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_lineage_depth: default_max_lineage_depth(),
            balance_tolerance: default_balance_tolerance(),
            include_unknown_category: false,
            persist_reports: false,
            carry_forward_months: default_carry_forward_months(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_lineage_depth == 0 {
            return Err(ReportError::InvalidConfig(
                "max_lineage_depth must be at least 1".to_string(),
            ));
        }
        if self.carry_forward_months == 0 {
            return Err(ReportError::InvalidConfig(
                "carry_forward_months must be at least 1".to_string(),
            ));
        }
        if !self.balance_tolerance.is_finite() || self.balance_tolerance < 0.0 {
            return Err(ReportError::InvalidConfig(format!(
                "balance_tolerance {} must be a non-negative number",
                self.balance_tolerance
            )));
        }
        Ok(())
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = schemars::schema_for!(EngineConfig);
        serde_json::to_string_pretty(&schema)
    }
}
