use crate::period::ReportPeriod;
use crate::schema::{
    CategoryId, DestructionRecord, State, Status, Transaction, TransactionId,
};
use crate::utils::round3;
use chrono::NaiveDateTime;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;

/// Row id of the synthetic total row.
pub const TOTAL_ROW_ID: CategoryId = CategoryId::MAX;

/// A named cell of a report row, carrying its printed line number.
pub trait ReportLine: Copy + Ord + Debug + Serialize + JsonSchema {
    fn number(&self) -> u32;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CategoryRow<L: ReportLine> {
    pub category_id: CategoryId,
    pub category_name: String,
    pub cells: BTreeMap<L, f64>,
}

impl<L: ReportLine> CategoryRow<L> {
    pub fn new(category_id: CategoryId, category_name: impl Into<String>) -> Self {
        Self {
            category_id,
            category_name: category_name.into(),
            cells: BTreeMap::new(),
        }
    }

    pub fn get(&self, line: L) -> f64 {
        self.cells.get(&line).copied().unwrap_or(0.0)
    }

    pub fn add(&mut self, line: L, amount: f64) {
        let cell = self.cells.entry(line).or_insert(0.0);
        *cell = round3(*cell + amount);
    }

    pub fn set(&mut self, line: L, value: f64) {
        self.cells.insert(line, round3(value));
    }

    pub fn sum_of(&self, lines: &[L]) -> f64 {
        lines.iter().map(|line| self.get(*line)).sum()
    }

    pub fn is_total(&self) -> bool {
        self.category_id == TOTAL_ROW_ID
    }
}

/// Report rows keyed by category id, created on first contribution.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryTable<L: ReportLine> {
    rows: BTreeMap<CategoryId, CategoryRow<L>>,
}

impl<L: ReportLine> Default for CategoryTable<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ReportLine> CategoryTable<L> {
    pub fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }

    pub fn contribute(&mut self, category_id: CategoryId, category_name: &str, line: L, amount: f64) {
        self.rows
            .entry(category_id)
            .or_insert_with(|| CategoryRow::new(category_id, category_name))
            .add(line, amount);
    }

    pub fn get(&self, category_id: CategoryId, line: L) -> f64 {
        self.rows
            .get(&category_id)
            .map_or(0.0, |row| row.get(line))
    }

    pub fn row(&self, category_id: CategoryId) -> Option<&CategoryRow<L>> {
        self.rows.get(&category_id)
    }

    pub fn rows(&self) -> impl Iterator<Item = &CategoryRow<L>> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sets `target` on every row to the sum of `sources`.
    pub fn derive_sum(&mut self, target: L, sources: &[L]) {
        for row in self.rows.values_mut() {
            let sum = row.sum_of(sources);
            row.set(target, sum);
        }
    }

    /// Per-cell sum across all rows.
    pub fn total_row(&self, name: &str) -> CategoryRow<L> {
        let mut total = CategoryRow::new(TOTAL_ROW_ID, name);
        for row in self.rows.values() {
            for (line, value) in &row.cells {
                total.add(*line, *value);
            }
        }
        total
    }

    pub fn into_rows(self) -> Vec<CategoryRow<L>> {
        self.rows.into_values().collect()
    }
}

/// Purchase ids already counted in a pass over joined rows.
#[derive(Debug, Default)]
pub struct SeenSet {
    seen: HashSet<TransactionId>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time `id` is offered.
    pub fn first_sighting(&mut self, id: TransactionId) -> bool {
        self.seen.insert(id)
    }
}

/// On premises at instant `at`: a live record, or one destroyed during the
/// reporting month that starts at `at`.
pub fn counts_on_hand(
    tx: &Transaction,
    destruction: Option<&DestructionRecord>,
    at: NaiveDateTime,
) -> bool {
    if tx.status.is_live() {
        return true;
    }
    if tx.status != Status::Destroyed {
        return false;
    }
    let window = ReportPeriod::containing(at);
    destruction.is_some_and(|record| record.end_time >= at && window.contains(record.end_time))
}

/// Entered the account during `period`.
///
/// Partially consumed records (Processing) only count with a real proof
/// value and once out of the ungauged fermented state.
pub fn counts_as_deposit(tx: &Transaction, period: &ReportPeriod) -> bool {
    if !tx.status.is_live() || !period.contains(tx.end_time) {
        return false;
    }
    if tx.status == Status::Processing {
        return tx.original.proof_or_zero() > 0.0 && tx.state != State::Fermented;
    }
    true
}

pub fn counts_as_destroyed(
    tx: &Transaction,
    destruction: &DestructionRecord,
    period: &ReportPeriod,
) -> bool {
    tx.status == Status::Destroyed
        && destruction.workflow == tx.kind()
        && period.contains_strictly(destruction.end_time)
}

/// Transfers are recognised when the consuming batch finishes inside the
/// window, provided the source had ended before the window opened.
pub fn counts_as_transfer(source: &Transaction, target: &Transaction, period: &ReportPeriod) -> bool {
    let target_ok = target.status.is_live() || target.status == Status::Destroyed;
    target_ok && period.contains(target.end_time) && source.end_time < period.start()
}
