use crate::config::EngineConfig;
use crate::error::{ReportError, Result};
use crate::ledger::LedgerStore;
use crate::lineage::LineageIndex;
use crate::period::ReportPeriod;
use crate::processing::{build_processing_report, ProcessingReport};
use crate::production::{build_production_report, ProductionReport};
use crate::report::ReportCells;
use crate::schema::{DistillerId, TransactionId};
use crate::storage::{build_storage_report, StorageReport};
use crate::totals::{InMemoryTotals, TotalsLedger, TotalsStore, TotalsUpdate};
use log::{info, warn};

/// Builds reports from a ledger store and optionally writes them into a
/// totals ledger.
///
/// Every build loads a fresh [`LineageIndex`] for the distiller, so a report
/// always reflects the store as it was when the request arrived.
pub struct ReportEngine<'s, S: LedgerStore + ?Sized, T: TotalsStore = InMemoryTotals> {
    store: &'s S,
    config: EngineConfig,
    totals: Option<&'s TotalsLedger<T>>,
}

impl<'s, S: LedgerStore + ?Sized> ReportEngine<'s, S> {
    pub fn new(store: &'s S, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            totals: None,
        })
    }
}

impl<'s, S: LedgerStore + ?Sized, T: TotalsStore> ReportEngine<'s, S, T> {
    pub fn with_totals<U: TotalsStore>(self, totals: &'s TotalsLedger<U>) -> ReportEngine<'s, S, U> {
        ReportEngine {
            store: self.store,
            config: self.config,
            totals: Some(totals),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn load_index(&self, distiller_id: DistillerId) -> Result<LineageIndex> {
        LineageIndex::load(self.store, distiller_id)
    }

    pub fn storage_report(
        &self,
        distiller_id: DistillerId,
        period: ReportPeriod,
    ) -> Result<StorageReport> {
        let index = self.load_index(distiller_id)?;
        let report = build_storage_report(&index, &self.config, period)?;
        self.persist(&report)?;
        Ok(report)
    }

    pub fn production_report(
        &self,
        distiller_id: DistillerId,
        period: ReportPeriod,
    ) -> Result<ProductionReport> {
        let index = self.load_index(distiller_id)?;
        let report = build_production_report(&index, &self.config, period)?;
        self.persist(&report)?;
        Ok(report)
    }

    pub fn processing_report(
        &self,
        distiller_id: DistillerId,
        period: ReportPeriod,
    ) -> Result<ProcessingReport> {
        let index = self.load_index(distiller_id)?;
        let report = build_processing_report(&index, &self.config, period)?;
        self.persist(&report)?;
        Ok(report)
    }

    /// Incremental path: folds one newly recorded transaction into the
    /// attached totals ledger.
    pub fn record_transaction(
        &self,
        distiller_id: DistillerId,
        id: TransactionId,
    ) -> Result<TotalsUpdate> {
        let totals = self.totals.ok_or_else(|| {
            ReportError::InvalidConfig("no totals ledger attached to the engine".to_string())
        })?;
        let index = self.load_index(distiller_id)?;
        totals.record_transaction(&index, &self.config, id)
    }

    fn persist<R: ReportCells>(&self, report: &R) -> Result<()> {
        if !self.config.persist_reports {
            return Ok(());
        }
        let header = report.header();
        match self.totals {
            Some(totals) => {
                totals.store_report(report)?;
                info!(
                    "Persisted {} report for distiller {} ({})",
                    header.report_type, header.distiller_id, header.period
                );
            }
            None => warn!(
                "persist_reports is set but no totals ledger is attached; {} report for {} not stored",
                header.report_type, header.period
            ),
        }
        Ok(())
    }
}
