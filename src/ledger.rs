use crate::error::{ReportError, Result};
use crate::schema::*;
use chrono::NaiveDateTime;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Quantities smaller than this are treated as fully consumed.
const QUANTITY_EPSILON: f64 = 1e-6;

/// What is left of `before` once `quantity` of `unit` is taken out; every
/// unit shrinks in proportion.
fn burned(
    id: TransactionId,
    before: &Measurements,
    unit: ContentUnit,
    quantity: f64,
) -> Result<Measurements> {
    let available = before.get_or_zero(unit);
    if quantity > available + QUANTITY_EPSILON {
        return Err(ReportError::ConservationViolation {
            transaction_id: id,
            period: None,
            details: format!(
                "requested {:.3} {:?} but only {:.3} remains",
                quantity, unit, available
            ),
        });
    }
    let left = (available - quantity).max(0.0);
    let factor = if available > 0.0 { left / available } else { 0.0 };
    Ok(before.scaled(factor))
}

/// Read access the report engine needs from whatever persistence backs it.
pub trait LedgerStore {
    fn transactions_by_state_and_status(&self, query: &TransactionQuery)
        -> Result<Vec<Transaction>>;

    fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>>;

    fn lineage_edges_by_source(&self, id: TransactionId) -> Result<Vec<LineageEdge>>;

    fn lineage_edges_by_target(&self, id: TransactionId) -> Result<Vec<LineageEdge>>;

    /// Direct associations only; `UNCATEGORIZED` where none exists.
    fn category_of(&self, id: TransactionId) -> Result<CategoryAssignment>;

    fn categories(&self, distiller_id: DistillerId) -> Result<Vec<CategoryInfo>>;

    fn destruction_record(&self, id: TransactionId) -> Result<Option<DestructionRecord>>;

    fn tax_withdrawals(
        &self,
        distiller_id: DistillerId,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<TaxWithdrawal>>;
}

/// Filter for [`LedgerStore::transactions_by_state_and_status`]. Empty lists
/// and `None` bounds do not filter.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionQuery {
    pub distiller_id: DistillerId,
    pub kind: Option<RecordKind>,
    pub batch_types: Vec<BatchType>,
    pub states: Vec<State>,
    pub statuses: Vec<Status>,
    pub ended_from: Option<NaiveDateTime>,
    pub ended_to: Option<NaiveDateTime>,
}

impl TransactionQuery {
    pub fn for_distiller(distiller_id: DistillerId) -> Self {
        Self {
            distiller_id,
            kind: None,
            batch_types: Vec::new(),
            states: Vec::new(),
            statuses: Vec::new(),
            ended_from: None,
            ended_to: None,
        }
    }

    pub fn kind(mut self, kind: RecordKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn batch_types(mut self, batch_types: &[BatchType]) -> Self {
        self.batch_types = batch_types.to_vec();
        self
    }

    pub fn states(mut self, states: &[State]) -> Self {
        self.states = states.to_vec();
        self
    }

    pub fn statuses(mut self, statuses: &[Status]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    /// Inclusive bounds on the record's end time.
    pub fn ended_between(mut self, from: NaiveDateTime, to: NaiveDateTime) -> Self {
        self.ended_from = Some(from);
        self.ended_to = Some(to);
        self
    }

    pub fn ended_before(mut self, to: NaiveDateTime) -> Self {
        self.ended_to = Some(to);
        self
    }

    pub fn matches(&self, tx: &Transaction) -> bool {
        tx.distiller_id == self.distiller_id
            && self.kind.map_or(true, |k| tx.kind() == k)
            && (self.batch_types.is_empty() || self.batch_types.contains(&tx.batch_type))
            && (self.states.is_empty() || self.states.contains(&tx.state))
            && (self.statuses.is_empty() || self.statuses.contains(&tx.status))
            && self.ended_from.map_or(true, |from| tx.end_time >= from)
            && self.ended_to.map_or(true, |to| tx.end_time <= to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BurnDownReason {
    Consumption,
    TaxWithdrawal,
    Destruction,
}

/// One entry of the audit trail kept for every quantity change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BurnDown {
    pub transaction_id: TransactionId,
    pub consumer_id: Option<TransactionId>,
    pub reason: BurnDownReason,
    pub unit: ContentUnit,
    pub quantity: f64,
    pub before: Measurements,
    pub after: Measurements,
    pub at: NaiveDateTime,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    transactions: BTreeMap<TransactionId, Transaction>,
    assignments: HashMap<TransactionId, CategoryAssignment>,
    categories: BTreeMap<(CategoryKind, CategoryId), CategoryInfo>,
    edges: Vec<LineageEdge>,
    destructions: BTreeMap<TransactionId, DestructionRecord>,
    withdrawals: Vec<TaxWithdrawal>,
    audit: Vec<BurnDown>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_transaction_id(&self) -> TransactionId {
        self.transactions.keys().next_back().map_or(1, |id| id + 1)
    }

    pub fn add_category(&mut self, info: CategoryInfo) {
        self.categories.insert((info.kind, info.id), info);
    }

    /// Loads a record as-is, e.g. from an existing data set. No burn-down is
    /// applied; use [`InMemoryLedger::consume`] for workflow changes.
    pub fn insert_transaction(&mut self, tx: Transaction) -> Result<()> {
        if self.transactions.contains_key(&tx.id) {
            return Err(ReportError::InvalidIntake(format!(
                "transaction {} already exists",
                tx.id
            )));
        }
        self.transactions.insert(tx.id, tx);
        Ok(())
    }

    pub fn assign_category(
        &mut self,
        id: TransactionId,
        kind: CategoryKind,
        category: CategoryId,
    ) -> Result<()> {
        if !self.transactions.contains_key(&id) {
            return Err(ReportError::UnknownTransaction(id));
        }
        let assignment = self.assignments.entry(id).or_default();
        match kind {
            CategoryKind::SpiritType => assignment.spirit_type = category,
            CategoryKind::MaterialKind => assignment.material_kind = category,
        }
        Ok(())
    }

    /// Loads an edge as-is. Both ends must exist and the target must be a
    /// production record.
    pub fn insert_edge(&mut self, edge: LineageEdge) -> Result<()> {
        let source = self.get(edge.source_id)?;
        let target = self.get(edge.target_id)?;
        if target.kind() != RecordKind::Production {
            return Err(ReportError::InvalidIntake(format!(
                "edge target {} is not a production record",
                edge.target_id
            )));
        }
        if source.kind() != edge.field.origin {
            return Err(ReportError::InvalidIntake(format!(
                "edge field {} does not match source {} of kind {:?}",
                edge.field,
                edge.source_id,
                source.kind()
            )));
        }
        self.edges.push(edge);
        Ok(())
    }

    /// Burns `quantity` (in `unit`) of `source_id` into production
    /// `target_id`, recording the lineage edge and an audit entry.
    pub fn consume(
        &mut self,
        source_id: TransactionId,
        target_id: TransactionId,
        unit: ContentUnit,
        quantity: f64,
    ) -> Result<LineageEdge> {
        let target_end = self.get(target_id)?.end_time;
        let source = self.consumable(source_id, quantity)?;
        let field = ContentField::new(source.kind(), source.state, unit);
        let edge = LineageEdge {
            source_id,
            target_id,
            field,
            quantity,
        };
        self.insert_edge(edge)?;
        if let Err(e) = self.burn_down(
            source_id,
            Some(target_id),
            BurnDownReason::Consumption,
            unit,
            quantity,
            target_end,
        ) {
            self.edges.pop();
            return Err(e);
        }
        debug!("Transaction {} consumed {} {} of {}", target_id, quantity, field, source_id);
        Ok(edge)
    }

    /// Checks consumptions against what each source has left without
    /// changing anything. A source named twice is checked cumulatively.
    pub fn validate_consumptions(
        &self,
        consumptions: &[(TransactionId, ContentUnit, f64)],
    ) -> Result<()> {
        let mut remaining: HashMap<TransactionId, Measurements> = HashMap::new();
        for &(source_id, unit, quantity) in consumptions {
            let source = self.consumable(source_id, quantity)?;
            let before = remaining.get(&source_id).copied().unwrap_or(source.remaining);
            remaining.insert(source_id, burned(source_id, &before, unit, quantity)?);
        }
        Ok(())
    }

    fn consumable(&self, source_id: TransactionId, quantity: f64) -> Result<&Transaction> {
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(ReportError::InvalidIntake(format!(
                "consumed quantity {} of transaction {} must be positive",
                quantity, source_id
            )));
        }
        let source = self.get(source_id)?;
        if !source.status.is_live() {
            return Err(ReportError::InvalidIntake(format!(
                "transaction {} with status {:?} cannot be consumed",
                source_id, source.status
            )));
        }
        Ok(source)
    }

    /// Destroys whatever remains of a batch.
    pub fn destroy(
        &mut self,
        id: TransactionId,
        start_time: NaiveDateTime,
        end_time: NaiveDateTime,
    ) -> Result<DestructionRecord> {
        let tx = self.get(id)?;
        if !tx.status.is_live() {
            return Err(ReportError::InvalidIntake(format!(
                "transaction {} with status {:?} cannot be destroyed",
                id, tx.status
            )));
        }
        let before = tx.remaining;
        let record = DestructionRecord {
            transaction_id: id,
            workflow: tx.kind(),
            start_time,
            end_time,
            proof_gallons: before.proof_or_zero(),
            volume: before.volume_or_zero(),
        };

        let tx = self.get_mut(id)?;
        tx.remaining = before.zeroed();
        tx.status = Status::Destroyed;
        let after = tx.remaining;

        self.audit.push(BurnDown {
            transaction_id: id,
            consumer_id: None,
            reason: BurnDownReason::Destruction,
            unit: ContentUnit::ProofGallons,
            quantity: record.proof_gallons,
            before,
            after,
            at: end_time,
        });
        self.destructions.insert(id, record);
        Ok(record)
    }

    /// Removes bottled spirits from bond on payment of tax.
    pub fn withdraw_tax_paid(
        &mut self,
        id: TransactionId,
        withdrawn_at: NaiveDateTime,
        proof_gallons: f64,
    ) -> Result<TaxWithdrawal> {
        let tx = self.get(id)?;
        if tx.batch_type != BatchType::Bottling {
            return Err(ReportError::InvalidIntake(format!(
                "transaction {} is not a bottling run",
                id
            )));
        }
        let before = tx.remaining;
        self.burn_down(
            id,
            None,
            BurnDownReason::TaxWithdrawal,
            ContentUnit::ProofGallons,
            proof_gallons,
            withdrawn_at,
        )?;
        let after = self.get(id)?.remaining;
        let withdrawal = TaxWithdrawal {
            transaction_id: id,
            withdrawn_at,
            proof_gallons,
            volume: (before.volume_or_zero() - after.volume_or_zero()).max(0.0),
        };
        self.withdrawals.push(withdrawal);
        Ok(withdrawal)
    }

    pub fn burn_down_history(&self, id: TransactionId) -> Vec<&BurnDown> {
        self.audit
            .iter()
            .filter(|entry| entry.transaction_id == id)
            .collect()
    }

    /// Checks that no record has given away more than it was recorded with,
    /// in any unit.
    pub fn verify_conservation(&self, tolerance: f64) -> Result<()> {
        for tx in self.transactions.values() {
            for unit in [
                ContentUnit::Volume,
                ContentUnit::Weight,
                ContentUnit::ProofGallons,
            ] {
                let outgoing: f64 = self
                    .edges
                    .iter()
                    .filter(|e| e.source_id == tx.id && e.field.unit == unit)
                    .map(|e| e.quantity)
                    .sum();
                if outgoing == 0.0 {
                    continue;
                }
                let original = tx.original.get_or_zero(unit);
                if outgoing > original + tolerance {
                    return Err(ReportError::ConservationViolation {
                        transaction_id: tx.id,
                        period: None,
                        details: format!(
                            "consumed {:.3} {:?} out of an original {:.3}",
                            outgoing, unit, original
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    fn burn_down(
        &mut self,
        id: TransactionId,
        consumer_id: Option<TransactionId>,
        reason: BurnDownReason,
        unit: ContentUnit,
        quantity: f64,
        at: NaiveDateTime,
    ) -> Result<()> {
        let tx = self.get_mut(id)?;
        let before = tx.remaining;
        tx.remaining = burned(id, &before, unit, quantity)?;
        tx.status = if tx.remaining.get_or_zero(unit) <= QUANTITY_EPSILON {
            Status::Processed
        } else {
            Status::Processing
        };
        let after = tx.remaining;

        self.audit.push(BurnDown {
            transaction_id: id,
            consumer_id,
            reason,
            unit,
            quantity,
            before,
            after,
            at,
        });
        Ok(())
    }

    fn get(&self, id: TransactionId) -> Result<&Transaction> {
        self.transactions
            .get(&id)
            .ok_or(ReportError::UnknownTransaction(id))
    }

    fn get_mut(&mut self, id: TransactionId) -> Result<&mut Transaction> {
        self.transactions
            .get_mut(&id)
            .ok_or(ReportError::UnknownTransaction(id))
    }
}

impl LedgerStore for InMemoryLedger {
    fn transactions_by_state_and_status(
        &self,
        query: &TransactionQuery,
    ) -> Result<Vec<Transaction>> {
        Ok(self
            .transactions
            .values()
            .filter(|tx| query.matches(tx))
            .cloned()
            .collect())
    }

    fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
        Ok(self.transactions.get(&id).cloned())
    }

    fn lineage_edges_by_source(&self, id: TransactionId) -> Result<Vec<LineageEdge>> {
        Ok(self
            .edges
            .iter()
            .filter(|e| e.source_id == id)
            .copied()
            .collect())
    }

    fn lineage_edges_by_target(&self, id: TransactionId) -> Result<Vec<LineageEdge>> {
        Ok(self
            .edges
            .iter()
            .filter(|e| e.target_id == id)
            .copied()
            .collect())
    }

    fn category_of(&self, id: TransactionId) -> Result<CategoryAssignment> {
        Ok(self.assignments.get(&id).copied().unwrap_or_default())
    }

    fn categories(&self, _distiller_id: DistillerId) -> Result<Vec<CategoryInfo>> {
        Ok(self.categories.values().cloned().collect())
    }

    fn destruction_record(&self, id: TransactionId) -> Result<Option<DestructionRecord>> {
        Ok(self.destructions.get(&id).copied())
    }

    fn tax_withdrawals(
        &self,
        distiller_id: DistillerId,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<TaxWithdrawal>> {
        Ok(self
            .withdrawals
            .iter()
            .filter(|w| w.withdrawn_at >= from && w.withdrawn_at <= to)
            .filter(|w| {
                self.transactions
                    .get(&w.transaction_id)
                    .is_some_and(|tx| tx.distiller_id == distiller_id)
            })
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(month: u32, day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, month, day)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn batch(id: TransactionId, batch_type: BatchType, end: NaiveDateTime, proof: f64) -> Transaction {
        let measurements = Measurements {
            volume: Some(proof * 2.0),
            weight: None,
            alcohol: Some(25.0),
            proof: Some(proof),
        };
        Transaction {
            id,
            distiller_id: 1,
            batch_type,
            status: Status::Active,
            state: batch_type.initial_state(),
            gauged: true,
            start_time: end,
            end_time: end,
            original: measurements,
            remaining: measurements,
        }
    }

    fn ledger() -> InMemoryLedger {
        let mut ledger = InMemoryLedger::new();
        ledger
            .insert_transaction(batch(1, BatchType::Fermented, at(1, 10), 100.0))
            .unwrap();
        ledger
            .insert_transaction(batch(2, BatchType::Distillation, at(2, 15), 95.0))
            .unwrap();
        ledger
    }

    #[test]
    fn test_consume_burns_down_proportionally() {
        let mut ledger = ledger();
        let edge = ledger
            .consume(1, 2, ContentUnit::ProofGallons, 40.0)
            .unwrap();
        assert_eq!(edge.field.to_string(), "purchased-fermented-proof-gallons");

        let source = ledger.transaction(1).unwrap().unwrap();
        assert_eq!(source.status, Status::Processing);
        assert!((source.remaining.proof_or_zero() - 60.0).abs() < 1e-9);
        assert!((source.remaining.volume_or_zero() - 120.0).abs() < 1e-9);
        assert_eq!(source.original.proof, Some(100.0));

        ledger.consume(1, 2, ContentUnit::Volume, 120.0).unwrap();
        let source = ledger.transaction(1).unwrap().unwrap();
        assert_eq!(source.status, Status::Processed);
        assert_eq!(ledger.burn_down_history(1).len(), 2);
    }

    #[test]
    fn test_over_consumption_is_rejected_without_side_effects() {
        let mut ledger = ledger();
        let result = ledger.consume(1, 2, ContentUnit::ProofGallons, 150.0);
        assert!(matches!(
            result,
            Err(ReportError::ConservationViolation { transaction_id: 1, .. })
        ));
        assert!(ledger.lineage_edges_by_source(1).unwrap().is_empty());
        assert_eq!(
            ledger.transaction(1).unwrap().unwrap().status,
            Status::Active
        );
    }

    #[test]
    fn test_validation_checks_repeated_sources_cumulatively() {
        let ledger = ledger();
        let proof = ContentUnit::ProofGallons;
        assert!(ledger.validate_consumptions(&[(1, proof, 60.0), (1, proof, 40.0)]).is_ok());
        // 60 PG leaves 120 gal of the 200 gal wash
        assert!(ledger
            .validate_consumptions(&[(1, proof, 60.0), (1, ContentUnit::Volume, 120.0)])
            .is_ok());
        assert!(matches!(
            ledger.validate_consumptions(&[(1, proof, 60.0), (1, proof, 50.0)]),
            Err(ReportError::ConservationViolation { transaction_id: 1, .. })
        ));
        assert!(matches!(
            ledger.validate_consumptions(&[(1, proof, -1.0)]),
            Err(ReportError::InvalidIntake(_))
        ));
        assert!(matches!(
            ledger.validate_consumptions(&[(9, proof, 1.0)]),
            Err(ReportError::UnknownTransaction(9))
        ));

        let source = ledger.transaction(1).unwrap().unwrap();
        assert_eq!(source.status, Status::Active);
        assert!(ledger.burn_down_history(1).is_empty());
    }

    #[test]
    fn test_destroy_records_remaining_proof() {
        let mut ledger = ledger();
        ledger.consume(1, 2, ContentUnit::ProofGallons, 30.0).unwrap();
        let record = ledger.destroy(1, at(3, 1), at(3, 2)).unwrap();
        assert!((record.proof_gallons - 70.0).abs() < 1e-9);
        assert_eq!(record.workflow, RecordKind::Purchase);

        let tx = ledger.transaction(1).unwrap().unwrap();
        assert_eq!(tx.status, Status::Destroyed);
        assert!(ledger.destroy(1, at(3, 3), at(3, 4)).is_err());
    }

    #[test]
    fn test_verify_conservation_detects_loaded_overdraw() {
        let mut ledger = ledger();
        ledger
            .insert_edge(LineageEdge {
                source_id: 1,
                target_id: 2,
                field: ContentField::new(
                    RecordKind::Purchase,
                    State::Fermented,
                    ContentUnit::ProofGallons,
                ),
                quantity: 120.0,
            })
            .unwrap();
        assert!(ledger.verify_conservation(0.001).is_err());
    }

    #[test]
    fn test_query_filters() {
        let ledger = ledger();
        let query = TransactionQuery::for_distiller(1)
            .kind(RecordKind::Production)
            .statuses(&[Status::Active])
            .ended_between(at(2, 1), at(2, 28));
        let found = ledger.transactions_by_state_and_status(&query).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, 2);

        let other = TransactionQuery::for_distiller(9);
        assert!(ledger.transactions_by_state_and_status(&other).unwrap().is_empty());
    }
}
