use crate::aggregator::{counts_as_deposit, counts_as_transfer, ReportLine};
use crate::config::EngineConfig;
use crate::error::{ReportError, Result};
use crate::lineage::LineageIndex;
use crate::period::ReportPeriod;
use crate::production::{account_split, MaterialLine, ProductionLine};
use crate::report::{AssemblyContext, ReportCells, ReportType};
use crate::schema::{BatchType, CategoryId, CategoryKind, DistillerId, Transaction, TransactionId};
use crate::storage::{on_hand_records, StorageLine, STORAGE_PART};
use crate::utils::round3;
use log::{debug, info};
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct CellKey {
    pub distiller_id: DistillerId,
    pub report: ReportType,
    pub part: u8,
    pub row: u32,
    pub column: u32,
    pub year: i32,
    pub month: u32,
}

impl CellKey {
    pub fn new(
        distiller_id: DistillerId,
        report: ReportType,
        part: u8,
        row: u32,
        column: u32,
        period: ReportPeriod,
    ) -> Self {
        Self {
            distiller_id,
            report,
            part,
            row,
            column,
            year: period.year,
            month: period.month,
        }
    }

    pub fn period(&self) -> ReportPeriod {
        ReportPeriod {
            year: self.year,
            month: self.month,
        }
    }

    /// On-hand-first-of-month rows also feed next month's identical cell.
    pub fn is_carry_forward(&self) -> bool {
        matches!(
            (self.report, self.part, self.row),
            (ReportType::Storage, 1, 1)
                | (ReportType::Processing, 1, 1)
                | (ReportType::Processing, 2, 26)
        )
    }

    pub fn in_period(&self, period: ReportPeriod) -> Self {
        Self {
            year: period.year,
            month: period.month,
            ..*self
        }
    }

    fn same_report_period(
        &self,
        distiller_id: DistillerId,
        report: ReportType,
        period: ReportPeriod,
    ) -> bool {
        self.distiller_id == distiller_id
            && self.report == report
            && self.year == period.year
            && self.month == period.month
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellDelta {
    pub key: CellKey,
    pub delta: f64,
}

/// Every column of one row in one period. Writing it replaces the row, so a
/// column missing from `columns` reads as zero afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRow {
    pub distiller_id: DistillerId,
    pub report: ReportType,
    pub part: u8,
    pub row: u32,
    pub period: ReportPeriod,
    pub columns: BTreeMap<CategoryId, f64>,
}

impl BalanceRow {
    fn holds(&self, key: &CellKey) -> bool {
        key.same_report_period(self.distiller_id, self.report, self.period)
            && key.part == self.part
            && key.row == self.row
    }

    fn cells(&self) -> impl Iterator<Item = (CellKey, f64)> + '_ {
        self.columns
            .iter()
            .filter(|(_, value)| **value != 0.0)
            .map(|(column, value)| {
                (
                    CellKey::new(
                        self.distiller_id,
                        self.report,
                        self.part,
                        self.row,
                        *column,
                        self.period,
                    ),
                    *value,
                )
            })
    }
}

/// One transaction's contribution: additive deltas for the lines it moves,
/// plus recomputed balance rows for every month it changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TotalsUpdate {
    pub deltas: Vec<CellDelta>,
    pub balances: Vec<BalanceRow>,
}

impl TotalsUpdate {
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty() && self.balances.is_empty()
    }
}

pub trait TotalsStore: Send + Sync {
    /// Applies the deltas and then the balance rows, or nothing at all.
    fn apply_update(&self, update: &TotalsUpdate) -> Result<()>;

    /// Adds every delta, creating missing cells, or applies none of them.
    fn apply(&self, deltas: &[CellDelta]) -> Result<()> {
        self.apply_update(&TotalsUpdate {
            deltas: deltas.to_vec(),
            balances: Vec::new(),
        })
    }

    /// Latest month holding any cell of this report.
    fn latest_period(
        &self,
        distiller_id: DistillerId,
        report: ReportType,
    ) -> Result<Option<ReportPeriod>>;

    /// Swaps all cells of one report period for `cells` in one step.
    fn replace_period(
        &self,
        distiller_id: DistillerId,
        report: ReportType,
        period: ReportPeriod,
        cells: &[(CellKey, f64)],
    ) -> Result<()>;

    fn get(&self, key: &CellKey) -> Result<Option<f64>>;

    fn period_cells(
        &self,
        distiller_id: DistillerId,
        report: ReportType,
        period: ReportPeriod,
    ) -> Result<Vec<(CellKey, f64)>>;
}

#[derive(Debug, Default)]
pub struct InMemoryTotals {
    cells: Mutex<BTreeMap<CellKey, f64>>,
}

impl InMemoryTotals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cells.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.lock().is_empty()
    }
}

fn check_finite(key: &CellKey, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ReportError::Persistence(format!(
            "refusing to write {} into {:?}",
            value, key
        )))
    }
}

impl TotalsStore for InMemoryTotals {
    fn apply_update(&self, update: &TotalsUpdate) -> Result<()> {
        for delta in &update.deltas {
            check_finite(&delta.key, delta.delta)?;
        }
        for balance in &update.balances {
            for (key, value) in balance.cells() {
                check_finite(&key, value)?;
            }
        }
        let mut cells = self.cells.lock();
        for delta in &update.deltas {
            let cell = cells.entry(delta.key).or_insert(0.0);
            *cell = round3(*cell + delta.delta);
        }
        for balance in &update.balances {
            cells.retain(|key, _| !balance.holds(key));
            for (key, value) in balance.cells() {
                cells.insert(key, round3(value));
            }
        }
        Ok(())
    }

    fn latest_period(
        &self,
        distiller_id: DistillerId,
        report: ReportType,
    ) -> Result<Option<ReportPeriod>> {
        Ok(self
            .cells
            .lock()
            .keys()
            .filter(|key| key.distiller_id == distiller_id && key.report == report)
            .map(CellKey::period)
            .max())
    }

    fn replace_period(
        &self,
        distiller_id: DistillerId,
        report: ReportType,
        period: ReportPeriod,
        replacement: &[(CellKey, f64)],
    ) -> Result<()> {
        for (key, value) in replacement {
            check_finite(key, *value)?;
            if !key.same_report_period(distiller_id, report, period) {
                return Err(ReportError::Persistence(format!(
                    "cell {:?} does not belong to {} report {}",
                    key, report, period
                )));
            }
        }
        let mut cells = self.cells.lock();
        cells.retain(|key, _| !key.same_report_period(distiller_id, report, period));
        for (key, value) in replacement {
            cells.insert(*key, round3(*value));
        }
        Ok(())
    }

    fn get(&self, key: &CellKey) -> Result<Option<f64>> {
        Ok(self.cells.lock().get(key).copied())
    }

    fn period_cells(
        &self,
        distiller_id: DistillerId,
        report: ReportType,
        period: ReportPeriod,
    ) -> Result<Vec<(CellKey, f64)>> {
        Ok(self
            .cells
            .lock()
            .iter()
            .filter(|(key, _)| key.same_report_period(distiller_id, report, period))
            .map(|(key, value)| (*key, *value))
            .collect())
    }
}

/// Deltas for one contribution, including the carry-forward into the
/// following month.
pub fn expand(key: CellKey, delta: f64) -> Vec<CellDelta> {
    let mut deltas = vec![CellDelta { key, delta }];
    if key.is_carry_forward() {
        deltas.push(CellDelta {
            key: key.in_period(key.period().next()),
            delta,
        });
    }
    deltas
}

/// Persistent report cells. [`TotalsLedger::store_report`] replaces a whole
/// period, [`TotalsLedger::record_transaction`] folds in one new transaction.
pub struct TotalsLedger<S: TotalsStore> {
    store: S,
}

impl<S: TotalsStore> TotalsLedger<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn upsert(&self, key: CellKey, delta: f64) -> Result<()> {
        self.store.apply(&expand(key, delta))
    }

    pub fn get(&self, key: &CellKey) -> Result<f64> {
        Ok(self.store.get(key)?.unwrap_or(0.0))
    }

    pub fn period_cells(
        &self,
        distiller_id: DistillerId,
        report: ReportType,
        period: ReportPeriod,
    ) -> Result<Vec<(CellKey, f64)>> {
        self.store.period_cells(distiller_id, report, period)
    }

    /// Replaces the report's period with its cells. Storing the same report
    /// again is a no-op.
    pub fn store_report<R: ReportCells>(&self, report: &R) -> Result<usize> {
        let header = report.header();
        let cells: Vec<(CellKey, f64)> = report
            .cells()
            .into_iter()
            .map(|cell| {
                (
                    CellKey::new(
                        header.distiller_id,
                        header.report_type,
                        cell.part,
                        cell.row,
                        cell.column,
                        header.period,
                    ),
                    cell.value,
                )
            })
            .collect();
        self.store.replace_period(
            header.distiller_id,
            header.report_type,
            header.period,
            &cells,
        )?;
        info!(
            "Stored {} cell(s) of the {} report for distiller {} ({})",
            cells.len(),
            header.report_type,
            header.distiller_id,
            header.period
        );
        Ok(cells.len())
    }

    /// Applies the report contributions of one newly recorded transaction as
    /// a single batch and returns what was written.
    ///
    /// Storage openings and closings are not carried forward by delta. They
    /// are recomputed from `index` for every month from the event month
    /// through `carry_forward_months` later, or through the latest stored
    /// storage month if that is further out.
    pub fn record_transaction(
        &self,
        index: &LineageIndex,
        config: &EngineConfig,
        id: TransactionId,
    ) -> Result<TotalsUpdate> {
        let tx = index.record(id).ok_or(ReportError::UnknownTransaction(id))?;
        let mut ctx = AssemblyContext::new(index, config);
        let mut update = TotalsUpdate::default();

        transaction_deltas(&mut ctx, tx, &mut update.deltas)?;

        let event = ReportPeriod::containing(tx.end_time);
        let horizon = event.advance(config.carry_forward_months);
        let horizon = match self.store.latest_period(tx.distiller_id, ReportType::Storage)? {
            Some(latest) => latest.max(horizon),
            None => horizon,
        };
        update.balances = storage_balances(&mut ctx, tx.distiller_id, event, horizon)?;

        self.store.apply_update(&update)?;
        debug!(
            "Transaction {} contributed {} cell delta(s) and {} balance row(s) through {}",
            id,
            update.deltas.len(),
            update.balances.len(),
            horizon
        );
        Ok(update)
    }
}

/// Opening rows for `from..=through` and the matching closing rows of the
/// month before each, skipping the closing row ahead of `from`.
fn storage_balances(
    ctx: &mut AssemblyContext<'_>,
    distiller_id: DistillerId,
    from: ReportPeriod,
    through: ReportPeriod,
) -> Result<Vec<BalanceRow>> {
    let mut balances = Vec::new();
    let mut month = from;
    while month <= through {
        let held = on_hand_records(ctx, month, StorageLine::OnHandFirstOfMonth, month.start())?;
        let mut columns = BTreeMap::new();
        for (tx, amount) in held {
            if let Some((column, _)) =
                ctx.category_for(tx.id, CategoryKind::SpiritType, "storage line 1")
            {
                let cell = columns.entry(column).or_insert(0.0);
                *cell = round3(*cell + amount);
            }
        }

        let row = |line: StorageLine, period: ReportPeriod| BalanceRow {
            distiller_id,
            report: ReportType::Storage,
            part: STORAGE_PART,
            row: line.number(),
            period,
            columns: columns.clone(),
        };
        balances.push(row(StorageLine::OnHandFirstOfMonth, month));
        if month != from {
            balances.push(row(StorageLine::OnHandEndOfMonth, month.prev()));
        }
        month = month.next();
    }
    Ok(balances)
}

fn storage_key(tx: &Transaction, line: StorageLine, column: u32, period: ReportPeriod) -> CellKey {
    CellKey::new(tx.distiller_id, ReportType::Storage, STORAGE_PART, line.number(), column, period)
}

fn transaction_deltas(
    ctx: &mut AssemblyContext<'_>,
    tx: &Transaction,
    deltas: &mut Vec<CellDelta>,
) -> Result<()> {
    let index = ctx.index;
    let period = ReportPeriod::containing(tx.end_time);

    if tx.is_storage_record() && counts_as_deposit(tx, &period) {
        let proof = ctx.proof_of(tx);
        if let Some((column, _)) = ctx.category_for(tx.id, CategoryKind::SpiritType, "storage line 2") {
            deltas.push(CellDelta {
                key: storage_key(tx, StorageLine::DepositedInBulkStorage, column, period),
                delta: proof,
            });
        }
    }

    // Storage records this production drew from.
    for edge in index.inputs_of(tx.id) {
        let Some(source) = index.record(edge.source_id) else {
            continue;
        };
        if !source.is_storage_record() || !counts_as_transfer(source, tx, &period) {
            continue;
        }
        let line = if tx.batch_type.is_processing_stage() {
            StorageLine::TransferredToProcessing
        } else if tx.batch_type.is_production_stage() {
            StorageLine::TransferredToProduction
        } else {
            continue;
        };
        let amount = index.proof_equivalent(edge);
        if let Some((column, _)) =
            ctx.category_for(source.id, CategoryKind::SpiritType, "storage transfer")
        {
            deltas.push(CellDelta {
                key: storage_key(source, line, column, period),
                delta: amount,
            });
        }
    }

    if tx.batch_type == BatchType::Distillation && tx.gauged && counts_as_deposit(tx, &period) {
        let split = account_split(index, tx, &period, ctx.config.balance_tolerance)?;
        if let Some((column, _)) = ctx.category_for(tx.id, CategoryKind::SpiritType, "production part 1") {
            for (line, amount) in [
                (ProductionLine::EnteredStorageAccount, split.storage),
                (ProductionLine::EnteredProcessingAccount, split.processing),
                (ProductionLine::ProducedTotal, split.storage + split.processing),
            ] {
                if amount != 0.0 {
                    deltas.push(CellDelta {
                        key: CellKey::new(
                            tx.distiller_id,
                            ReportType::Production,
                            1,
                            line.number(),
                            column,
                            period,
                        ),
                        delta: amount,
                    });
                }
            }
        }
        if let Some((column, _)) =
            ctx.category_for(tx.id, CategoryKind::MaterialKind, "production parts 2-4")
        {
            deltas.push(CellDelta {
                key: CellKey::new(
                    tx.distiller_id,
                    ReportType::Production,
                    2,
                    MaterialLine::ProofGallons.number(),
                    column,
                    period,
                ),
                delta: ctx.proof_of(tx),
            });
        }
    }

    deltas.retain(|delta| delta.delta != 0.0);
    Ok(())
}
