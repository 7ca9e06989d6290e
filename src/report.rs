use crate::aggregator::{CategoryRow, ReportLine};
use crate::config::EngineConfig;
use crate::error::{ReportError, Result};
use crate::lineage::{LineageIndex, LineageResolver, Resolution};
use crate::period::ReportPeriod;
use crate::schema::{CategoryId, CategoryKind, DistillerId, Transaction, TransactionId, UNCATEGORIZED};
use log::warn;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "PascalCase")]
pub enum ReportType {
    Storage,
    Production,
    Processing,
}

impl ReportType {
    /// Identifier used in persisted cell keys.
    pub fn id(&self) -> u32 {
        match self {
            ReportType::Storage => 1,
            ReportType::Production => 2,
            ReportType::Processing => 3,
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReportType::Storage => "storage",
            ReportType::Production => "production",
            ReportType::Processing => "processing",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ReportHeader {
    pub distiller_id: DistillerId,
    pub report_type: ReportType,
    pub period: ReportPeriod,
}

/// One persisted value of a report: `row` is the printed line number and
/// `column` the category (or spirit class) row id, 0 for single-row parts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReportCell {
    pub part: u8,
    pub row: u32,
    pub column: u32,
    pub value: f64,
}

/// A built report that can be written into the totals ledger.
pub trait ReportCells {
    fn header(&self) -> ReportHeader;

    /// Non-zero cells of every category row. Total rows are derived and
    /// never persisted.
    fn cells(&self) -> Vec<ReportCell>;
}

/// Flattens category rows into cells of `part`, skipping zero values.
pub fn row_cells<L: ReportLine>(part: u8, rows: &[CategoryRow<L>]) -> Vec<ReportCell> {
    rows.iter()
        .flat_map(|row| {
            row.cells
                .iter()
                .filter(|(_, value)| **value != 0.0)
                .map(move |(line, value)| ReportCell {
                    part,
                    row: line.number(),
                    column: row.category_id,
                    value: *value,
                })
        })
        .collect()
}

/// A record left out of category rows because no category could be traced.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct TraceabilityGap {
    pub transaction_id: TransactionId,
    pub kind: CategoryKind,
    pub line: String,
    pub depth_exhausted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Diagnostics {
    pub traceability_gaps: Vec<TraceabilityGap>,
    #[schemars(description = "Records whose missing proof measurement was read as zero")]
    pub missing_measurements: Vec<TransactionId>,
    #[schemars(description = "Derived figures that disagree with each other, e.g. storage line 6 vs line 24")]
    pub discrepancies: Vec<String>,
}

impl Diagnostics {
    /// A partial report left at least one record out of its category rows.
    pub fn is_partial(&self) -> bool {
        !self.traceability_gaps.is_empty()
    }

    pub fn flag_discrepancy(&mut self, message: String) {
        warn!("{}", message);
        self.discrepancies.push(message);
    }
}

/// State shared by the passes of one report build.
pub struct AssemblyContext<'a> {
    pub index: &'a LineageIndex,
    pub config: &'a EngineConfig,
    pub resolver: LineageResolver<'a>,
    pub diagnostics: Diagnostics,
    gaps: BTreeSet<TraceabilityGap>,
    missing: BTreeSet<TransactionId>,
}

impl<'a> fmt::Debug for AssemblyContext<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssemblyContext")
            .field("records", &self.index.len())
            .field("diagnostics", &self.diagnostics)
            .finish()
    }
}

impl<'a> AssemblyContext<'a> {
    pub fn new(index: &'a LineageIndex, config: &'a EngineConfig) -> Self {
        Self {
            index,
            config,
            resolver: LineageResolver::new(index, config.max_lineage_depth),
            diagnostics: Diagnostics::default(),
            gaps: BTreeSet::new(),
            missing: BTreeSet::new(),
        }
    }

    /// Row identity for a record on `line`, or `None` when the record is a
    /// traceability gap that the configuration leaves out.
    pub fn category_for(
        &mut self,
        id: TransactionId,
        kind: CategoryKind,
        line: &str,
    ) -> Option<(CategoryId, String)> {
        let resolution = self.resolver.resolve(id, kind);
        self.row_for(id, kind, line, resolution)
    }

    pub fn row_for(
        &mut self,
        id: TransactionId,
        kind: CategoryKind,
        line: &str,
        resolution: Resolution,
    ) -> Option<(CategoryId, String)> {
        if resolution.is_traceable() {
            let category = resolution.category_id();
            return Some((category, self.index.category_name(kind, category)));
        }

        let depth_exhausted = matches!(
            resolution,
            Resolution::Untraceable {
                depth_exhausted: true
            }
        );
        let gap = TraceabilityGap {
            transaction_id: id,
            kind,
            line: line.to_string(),
            depth_exhausted,
        };
        if self.gaps.insert(gap) {
            warn!(
                "No {:?} traceable for transaction {} on {}",
                kind, id, line
            );
        }

        if self.config.include_unknown_category {
            Some((UNCATEGORIZED, self.index.category_name(kind, UNCATEGORIZED)))
        } else {
            None
        }
    }

    /// Resolved category name for error messages; never records a gap.
    pub fn category_label(&mut self, id: TransactionId, kind: CategoryKind) -> String {
        let category = self.resolver.resolve(id, kind).category_id();
        self.index.category_name(kind, category)
    }

    /// Recorded proof gallons; a missing measurement reads as zero.
    pub fn proof_of(&mut self, tx: &Transaction) -> f64 {
        match tx.original.proof {
            Some(proof) => proof,
            None => {
                self.missing.insert(tx.id);
                0.0
            }
        }
    }

    /// Rejects a balance below `-tolerance`; anything within tolerance of
    /// zero is returned as zero.
    #[allow(clippy::too_many_arguments)]
    pub fn ensure_non_negative(
        &self,
        report: ReportType,
        period: ReportPeriod,
        part: u8,
        line: u32,
        category: &str,
        running_in: f64,
        running_out: f64,
    ) -> Result<f64> {
        let balance = running_in - running_out;
        if balance < -self.config.balance_tolerance {
            return Err(ReportError::NegativeBalance {
                report: report.to_string(),
                period,
                part,
                line,
                category: category.to_string(),
                running_in,
                running_out,
            });
        }
        Ok(balance.max(0.0))
    }

    pub fn finish(mut self) -> Diagnostics {
        self.diagnostics.traceability_gaps = self.gaps.into_iter().collect();
        self.diagnostics.missing_measurements = self.missing.into_iter().collect();
        self.diagnostics
    }
}
