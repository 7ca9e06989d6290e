use crate::aggregator::{
    counts_as_deposit, counts_as_destroyed, counts_as_transfer, counts_on_hand, CategoryRow,
    CategoryTable, ReportLine, SeenSet,
};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::lineage::LineageIndex;
use crate::period::ReportPeriod;
use crate::report::{
    row_cells, AssemblyContext, Diagnostics, ReportCell, ReportCells, ReportHeader, ReportType,
};
use crate::schema::{CategoryId, CategoryKind, LineageEdge, RecordKind, Transaction};
use crate::utils::approx_eq;
use chrono::NaiveDateTime;
use log::{debug, info};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const STORAGE_PART: u8 = 1;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum StorageLine {
    OnHandFirstOfMonth,
    DepositedInBulkStorage,
    TotalLines1To5,
    TransferredToProcessing,
    TransferredToProduction,
    Destroyed,
    OnHandEndOfMonth,
    TotalLines7To23,
}

impl ReportLine for StorageLine {
    fn number(&self) -> u32 {
        match self {
            StorageLine::OnHandFirstOfMonth => 1,
            StorageLine::DepositedInBulkStorage => 2,
            StorageLine::TotalLines1To5 => 6,
            StorageLine::TransferredToProcessing => 17,
            StorageLine::TransferredToProduction => 18,
            StorageLine::Destroyed => 20,
            StorageLine::OnHandEndOfMonth => 23,
            StorageLine::TotalLines7To23 => 24,
        }
    }
}

const RECEIPT_LINES: [StorageLine; 2] = [
    StorageLine::OnHandFirstOfMonth,
    StorageLine::DepositedInBulkStorage,
];

const DISPOSITION_LINES: [StorageLine; 4] = [
    StorageLine::TransferredToProcessing,
    StorageLine::TransferredToProduction,
    StorageLine::Destroyed,
    StorageLine::OnHandEndOfMonth,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StorageReport {
    pub header: ReportHeader,
    pub rows: Vec<CategoryRow<StorageLine>>,
    pub total: CategoryRow<StorageLine>,
    pub diagnostics: Diagnostics,
}

impl StorageReport {
    pub fn row(&self, category_id: CategoryId) -> Option<&CategoryRow<StorageLine>> {
        self.rows.iter().find(|row| row.category_id == category_id)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn json_schema() -> std::result::Result<String, serde_json::Error> {
        let schema = schemars::schema_for!(StorageReport);
        serde_json::to_string_pretty(&schema)
    }
}

impl ReportCells for StorageReport {
    fn header(&self) -> ReportHeader {
        self.header
    }

    fn cells(&self) -> Vec<ReportCell> {
        row_cells(STORAGE_PART, &self.rows)
    }
}

pub struct StorageAssembler<'a> {
    ctx: AssemblyContext<'a>,
    period: ReportPeriod,
    table: CategoryTable<StorageLine>,
}

impl<'a> StorageAssembler<'a> {
    pub fn new(index: &'a LineageIndex, config: &'a EngineConfig, period: ReportPeriod) -> Self {
        Self {
            ctx: AssemblyContext::new(index, config),
            period,
            table: CategoryTable::new(),
        }
    }

    pub fn assemble(mut self) -> Result<StorageReport> {
        let distiller_id = self.ctx.index.distiller_id();
        info!(
            "Assembling storage report for distiller {} ({})",
            distiller_id,
            self.period
        );

        self.on_hand_pass(self.period.start(), StorageLine::OnHandFirstOfMonth)?;
        self.deposited_purchases();
        self.deposited_productions();
        self.transfers();
        self.destroyed();
        // Re-queried at the first instant of next month, not balanced.
        self.on_hand_pass(self.period.next().start(), StorageLine::OnHandEndOfMonth)?;

        self.table
            .derive_sum(StorageLine::TotalLines1To5, &RECEIPT_LINES);
        self.table
            .derive_sum(StorageLine::TotalLines7To23, &DISPOSITION_LINES);
        self.flag_unbalanced_rows();

        let total = self.table.total_row("Total");
        let rows = self.table.into_rows();
        let diagnostics = self.ctx.finish();
        info!(
            "Storage report for {}: {} categories, {} gap(s)",
            self.period,
            rows.len(),
            diagnostics.traceability_gaps.len()
        );

        Ok(StorageReport {
            header: ReportHeader {
                distiller_id,
                report_type: ReportType::Storage,
                period: self.period,
            },
            rows,
            total,
            diagnostics,
        })
    }

    fn storage_records(&self) -> impl Iterator<Item = &'a Transaction> {
        let index: &'a LineageIndex = self.ctx.index;
        index.records().filter(|tx| tx.is_storage_record())
    }

    fn contribute(&mut self, tx: &Transaction, line: StorageLine, amount: f64) {
        if amount == 0.0 {
            return;
        }
        let label = format!("storage line {}", line.number());
        if let Some((category, name)) = self.ctx.category_for(tx.id, CategoryKind::SpiritType, &label)
        {
            self.table.contribute(category, &name, line, amount);
        }
    }

    fn on_hand_pass(&mut self, at: NaiveDateTime, line: StorageLine) -> Result<()> {
        let held = on_hand_records(&mut self.ctx, self.period, line, at)?;
        debug!("{:?}: {} record(s) on hand at {}", line, held.len(), at);
        for (tx, amount) in held {
            self.contribute(tx, line, amount);
        }
        Ok(())
    }

    /// Each purchase is joined with its consumers; a purchase that fed
    /// several productions still deposits its proof once.
    fn deposited_purchases(&mut self) {
        let index = self.ctx.index;
        let period = self.period;
        let joined: Vec<(&Transaction, Option<&LineageEdge>)> = self
            .storage_records()
            .filter(|tx| tx.is_purchase() && counts_as_deposit(tx, &period))
            .flat_map(|tx| {
                let consumers = index.consumers_of(tx.id);
                if consumers.is_empty() {
                    vec![(tx, None)]
                } else {
                    consumers.iter().map(|edge| (tx, Some(edge))).collect()
                }
            })
            .collect();

        let mut seen = SeenSet::new();
        for (tx, _consumer) in joined {
            if !seen.first_sighting(tx.id) {
                continue;
            }
            let proof = self.ctx.proof_of(tx);
            self.contribute(tx, StorageLine::DepositedInBulkStorage, proof);
        }
    }

    fn deposited_productions(&mut self) {
        let period = self.period;
        let produced: Vec<&Transaction> = self
            .storage_records()
            .filter(|tx| !tx.is_purchase() && counts_as_deposit(tx, &period))
            .collect();
        debug!("{} production deposit(s) in {}", produced.len(), self.period);
        for tx in produced {
            let proof = self.ctx.proof_of(tx);
            self.contribute(tx, StorageLine::DepositedInBulkStorage, proof);
        }
    }

    fn transfers(&mut self) {
        let index = self.ctx.index;
        let sources: Vec<&Transaction> = self.storage_records().collect();
        for source in sources {
            for edge in index.consumers_of(source.id) {
                let Some(target) = index.record(edge.target_id) else {
                    continue;
                };
                if !counts_as_transfer(source, target, &self.period) {
                    continue;
                }
                let line = if target.batch_type.is_processing_stage() {
                    StorageLine::TransferredToProcessing
                } else if target.batch_type.is_production_stage() {
                    StorageLine::TransferredToProduction
                } else {
                    continue;
                };
                let amount = index.proof_equivalent(edge);
                self.contribute(source, line, amount);
            }
        }
    }

    fn destroyed(&mut self) {
        let index = self.ctx.index;
        let period = self.period;
        let destroyed: Vec<(&Transaction, f64)> = self
            .storage_records()
            .filter_map(|tx| {
                let record = index.destruction_of(tx.id)?;
                counts_as_destroyed(tx, record, &period).then_some((tx, record.proof_gallons))
            })
            .collect();
        for (tx, proof) in destroyed {
            self.contribute(tx, StorageLine::Destroyed, proof);
        }
    }

    fn flag_unbalanced_rows(&mut self) {
        let tolerance = self.ctx.config.balance_tolerance;
        let mismatches: Vec<String> = self
            .table
            .rows()
            .filter_map(|row| {
                let receipts = row.get(StorageLine::TotalLines1To5);
                let dispositions = row.get(StorageLine::TotalLines7To23);
                (!approx_eq(receipts, dispositions, tolerance)).then(|| {
                    format!(
                        "Storage {} '{}': line 6 is {:.3} but line 24 is {:.3}",
                        self.period, row.category_name, receipts, dispositions
                    )
                })
            })
            .collect();
        for message in mismatches {
            self.ctx.diagnostics.flag_discrepancy(message);
        }
    }
}

/// Storage records holding proof at `at` with the amount each holds,
/// purchased records first, then produced ones.
pub fn on_hand_records<'a>(
    ctx: &mut AssemblyContext<'a>,
    period: ReportPeriod,
    line: StorageLine,
    at: NaiveDateTime,
) -> Result<Vec<(&'a Transaction, f64)>> {
    let index: &'a LineageIndex = ctx.index;
    let mut held = Vec::new();
    for kind in [RecordKind::Purchase, RecordKind::Production] {
        for tx in index
            .records()
            .filter(|tx| tx.is_storage_record() && tx.kind() == kind)
        {
            if !counts_on_hand(tx, index.destruction_of(tx.id), at) {
                continue;
            }
            let original = tx.original.proof_or_zero();
            let on_hand = index.proof_on_hand_at(tx.id, at);
            let category = ctx.category_label(tx.id, CategoryKind::SpiritType);
            let amount = ctx.ensure_non_negative(
                ReportType::Storage,
                period,
                STORAGE_PART,
                line.number(),
                &category,
                original,
                original - on_hand,
            )?;
            if amount > 0.0 {
                held.push((tx, amount));
            }
        }
    }
    Ok(held)
}

pub fn build_storage_report(
    index: &LineageIndex,
    config: &EngineConfig,
    period: ReportPeriod,
) -> Result<StorageReport> {
    StorageAssembler::new(index, config, period).assemble()
}
