//! # Spirits Compliance Reports
//!
//! A library for building the monthly Storage, Production and Processing
//! reports a distilled spirits plant files, from a ledger of purchase and
//! production records and the lineage edges that connect them.
//!
//! ## Core Concepts
//!
//! - **Ledger**: Purchase and production batches with their measurements, plus lineage edges
//!   recording how much of one batch another consumed
//! - **Lineage Resolution**: Batches without a spirit type or material kind inherit one from
//!   the nearest related batch that has it
//! - **Category Rows**: Proof gallons folded into per-category report lines, rounded to 3
//!   decimals after every contribution
//! - **Reconciliation**: A month's closing inventory is next month's opening inventory, and
//!   no account may close below zero
//! - **Totals Ledger**: Persisted report cells, kept either by storing whole reports or by
//!   folding in one transaction at a time
//!
//! ## Example
//!
//! ```rust,ignore
//! use spirits_compliance_reports::*;
//! use chrono::NaiveDate;
//!
//! let mut ledger = InMemoryLedger::new();
//! let received = NaiveDate::from_ymd_opt(2023, 1, 5).unwrap().and_hms_opt(9, 0, 0).unwrap();
//!
//! record_purchase(
//!     &mut ledger,
//!     &PurchaseIntake {
//!         distiller_id: 1,
//!         batch_type: BatchType::Fermented,
//!         received_at: received,
//!         measurements: Measurements {
//!             volume: Some(1000.0),
//!             weight: None,
//!             alcohol: Some(5.0),
//!             proof: None,
//!         },
//!         spirit_type: 3,
//!         material_kind: 7,
//!     },
//! )
//! .unwrap();
//!
//! let request = ReportRequest {
//!     distiller_id: 1,
//!     report_type: ReportType::Storage,
//!     period: ReportPeriod::parse("2023-01").unwrap(),
//! };
//! let report = generate_report(&ledger, &request, &EngineConfig::default()).unwrap();
//! println!("{}", report.to_json().unwrap());
//! ```

pub mod aggregator;
pub mod config;
pub mod engine;
pub mod error;
pub mod ingestion;
pub mod ledger;
pub mod lineage;
pub mod period;
pub mod processing;
pub mod production;
pub mod report;
pub mod schema;
pub mod storage;
pub mod totals;
pub mod utils;

pub use aggregator::{CategoryRow, CategoryTable, ReportLine, SeenSet, TOTAL_ROW_ID};
pub use config::EngineConfig;
pub use engine::ReportEngine;
pub use error::{ReportError, Result};
pub use ingestion::*;
pub use ledger::{BurnDown, BurnDownReason, InMemoryLedger, LedgerStore, TransactionQuery};
pub use lineage::{LineageIndex, LineageResolver, RedistillOrigin, Resolution};
pub use period::ReportPeriod;
pub use processing::{
    build_processing_report, BottledAccount, BulkAccount, ClassLine, ProcessingReport,
};
pub use production::{
    build_production_report, MaterialLine, ProductionLine, ProductionReport, RawMaterialLine,
};
pub use report::{
    Diagnostics, ReportCell, ReportCells, ReportHeader, ReportType, TraceabilityGap,
};
pub use schema::*;
pub use storage::{build_storage_report, StorageLine, StorageReport};
pub use totals::{
    BalanceRow, CellDelta, CellKey, InMemoryTotals, TotalsLedger, TotalsStore, TotalsUpdate,
};
pub use utils::*;

use log::{debug, info};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ReportRequest {
    pub distiller_id: DistillerId,
    pub report_type: ReportType,
    /// Reporting month, written as "YYYY-MM" in JSON
    pub period: ReportPeriod,
}

impl ReportRequest {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "report")]
pub enum Report {
    Storage(StorageReport),
    Production(ProductionReport),
    Processing(ProcessingReport),
}

impl Report {
    pub fn header(&self) -> ReportHeader {
        match self {
            Report::Storage(report) => report.header,
            Report::Production(report) => report.header,
            Report::Processing(report) => report.header,
        }
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        match self {
            Report::Storage(report) => &report.diagnostics,
            Report::Production(report) => &report.diagnostics,
            Report::Processing(report) => &report.diagnostics,
        }
    }

    pub fn is_partial(&self) -> bool {
        self.diagnostics().is_partial()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub struct ComplianceReporter;

impl ComplianceReporter {
    pub fn generate<S: LedgerStore + ?Sized>(
        store: &S,
        request: &ReportRequest,
        config: &EngineConfig,
    ) -> Result<Report> {
        config.validate()?;
        info!(
            "Generating {} report for distiller {} ({})",
            request.report_type, request.distiller_id, request.period
        );

        let index = LineageIndex::load(store, request.distiller_id)?;
        debug!("Lineage index holds {} record(s)", index.len());

        let report = match request.report_type {
            ReportType::Storage => {
                Report::Storage(build_storage_report(&index, config, request.period)?)
            }
            ReportType::Production => {
                Report::Production(build_production_report(&index, config, request.period)?)
            }
            ReportType::Processing => {
                Report::Processing(build_processing_report(&index, config, request.period)?)
            }
        };

        let diagnostics = report.diagnostics();
        for discrepancy in &diagnostics.discrepancies {
            debug!("Reconciliation note: {}", discrepancy);
        }
        if diagnostics.is_partial() {
            info!(
                "{} report for {} is partial: {} record(s) without a traceable category",
                request.report_type,
                request.period,
                diagnostics.traceability_gaps.len()
            );
        }

        Ok(report)
    }

    /// Checks the ledger for over-consumed batches before building.
    pub fn generate_with_verification(
        ledger: &InMemoryLedger,
        request: &ReportRequest,
        config: &EngineConfig,
    ) -> Result<Report> {
        ledger.verify_conservation(config.balance_tolerance)?;
        Self::generate(ledger, request, config)
    }
}

pub fn generate_report<S: LedgerStore + ?Sized>(
    store: &S,
    request: &ReportRequest,
    config: &EngineConfig,
) -> Result<Report> {
    ComplianceReporter::generate(store, request, config)
}

pub fn generate_with_verification(
    ledger: &InMemoryLedger,
    request: &ReportRequest,
    config: &EngineConfig,
) -> Result<Report> {
    ComplianceReporter::generate_with_verification(ledger, request, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_json() {
        let request = ReportRequest::from_json_str(
            r#"{"distiller_id": 4, "report_type": "Processing", "period": "2023-07"}"#,
        )
        .unwrap();
        assert_eq!(request.report_type, ReportType::Processing);
        assert_eq!(request.period, ReportPeriod::new(2023, 7).unwrap());

        for period in [r#""2023-13""#, r#"{"year": 2023, "month": 13}"#] {
            let json = format!(
                r#"{{"distiller_id": 4, "report_type": "Processing", "period": {}}}"#,
                period
            );
            assert!(matches!(
                ReportRequest::from_json_str(&json),
                Err(ReportError::SerializationError(_))
            ));
        }
    }

    #[test]
    fn test_empty_ledger_builds_empty_reports() {
        let ledger = InMemoryLedger::new();
        for report_type in [
            ReportType::Storage,
            ReportType::Production,
            ReportType::Processing,
        ] {
            let request = ReportRequest {
                distiller_id: 1,
                report_type,
                period: ReportPeriod::new(2023, 1).unwrap(),
            };
            let report = generate_report(&ledger, &request, &EngineConfig::default()).unwrap();
            assert_eq!(report.header().report_type, report_type);
            assert!(!report.is_partial());
            assert!(report.to_json().unwrap().contains(&format!("\"{:?}\"", report_type)));
        }
    }

    #[test]
    fn test_report_schemas_are_generated() {
        for schema in [
            StorageReport::json_schema(),
            ProductionReport::json_schema(),
            ProcessingReport::json_schema(),
            EngineConfig::schema_as_json(),
        ] {
            let schema = schema.unwrap();
            assert!(schema.contains("properties"));
        }
    }
}
