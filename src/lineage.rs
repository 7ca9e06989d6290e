use crate::error::Result;
use crate::ledger::{LedgerStore, TransactionQuery};
use crate::schema::*;
use chrono::NaiveDateTime;
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// In-memory snapshot of one distiller's records and edges, loaded once per
/// report build so lineage walks never go back to the store.
#[derive(Debug, Clone, Default)]
pub struct LineageIndex {
    distiller_id: DistillerId,
    records: BTreeMap<TransactionId, Transaction>,
    assignments: HashMap<TransactionId, CategoryAssignment>,
    categories: HashMap<(CategoryKind, CategoryId), CategoryInfo>,
    by_source: HashMap<TransactionId, Vec<LineageEdge>>,
    by_target: HashMap<TransactionId, Vec<LineageEdge>>,
    destructions: HashMap<TransactionId, DestructionRecord>,
    withdrawals: HashMap<TransactionId, Vec<TaxWithdrawal>>,
}

impl LineageIndex {
    pub fn load<S: LedgerStore + ?Sized>(store: &S, distiller_id: DistillerId) -> Result<Self> {
        let mut index = LineageIndex {
            distiller_id,
            ..Default::default()
        };

        let records =
            store.transactions_by_state_and_status(&TransactionQuery::for_distiller(distiller_id))?;
        for tx in records {
            let id = tx.id;
            index.assignments.insert(id, store.category_of(id)?);
            let outgoing = store.lineage_edges_by_source(id)?;
            if !outgoing.is_empty() {
                index.by_source.insert(id, outgoing);
            }
            let incoming = store.lineage_edges_by_target(id)?;
            if !incoming.is_empty() {
                index.by_target.insert(id, incoming);
            }
            if tx.status == Status::Destroyed {
                if let Some(record) = store.destruction_record(id)? {
                    index.destructions.insert(id, record);
                }
            }
            index.records.insert(id, tx);
        }

        for info in store.categories(distiller_id)? {
            index.categories.insert((info.kind, info.id), info);
        }

        for withdrawal in
            store.tax_withdrawals(distiller_id, NaiveDateTime::MIN, NaiveDateTime::MAX)?
        {
            index
                .withdrawals
                .entry(withdrawal.transaction_id)
                .or_default()
                .push(withdrawal);
        }

        debug!(
            "Loaded lineage index for distiller {}: {} records, {} categories",
            distiller_id,
            index.records.len(),
            index.categories.len()
        );
        Ok(index)
    }

    pub fn distiller_id(&self) -> DistillerId {
        self.distiller_id
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&self, id: TransactionId) -> Option<&Transaction> {
        self.records.get(&id)
    }

    /// Every loaded record, in id order.
    pub fn records(&self) -> impl Iterator<Item = &Transaction> {
        self.records.values()
    }

    pub fn withdrawals_of(&self, id: TransactionId) -> &[TaxWithdrawal] {
        self.withdrawals.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn inputs_of(&self, id: TransactionId) -> &[LineageEdge] {
        self.by_target.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn consumers_of(&self, id: TransactionId) -> &[LineageEdge] {
        self.by_source.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn assignment(&self, id: TransactionId) -> CategoryAssignment {
        self.assignments.get(&id).copied().unwrap_or_default()
    }

    pub fn category_info(&self, kind: CategoryKind, id: CategoryId) -> Option<&CategoryInfo> {
        self.categories.get(&(kind, id))
    }

    pub fn category_name(&self, kind: CategoryKind, id: CategoryId) -> String {
        if id == UNCATEGORIZED {
            return "Unknown".to_string();
        }
        self.category_info(kind, id)
            .map(|info| info.name.clone())
            .unwrap_or_else(|| format!("Category {}", id))
    }

    pub fn destruction_of(&self, id: TransactionId) -> Option<&DestructionRecord> {
        self.destructions.get(&id)
    }

    /// Edge quantity expressed in `unit`, converted through the source's
    /// original measurement ratio. Missing measurements convert to zero.
    pub fn quantity_in(&self, edge: &LineageEdge, unit: ContentUnit) -> f64 {
        if edge.field.unit == unit {
            return edge.quantity;
        }
        let Some(source) = self.record(edge.source_id) else {
            return 0.0;
        };
        match (source.original.get(edge.field.unit), source.original.get(unit)) {
            (Some(from), Some(to)) if from > 0.0 => edge.quantity * to / from,
            _ => 0.0,
        }
    }

    pub fn proof_equivalent(&self, edge: &LineageEdge) -> f64 {
        self.quantity_in(edge, ContentUnit::ProofGallons)
    }

    /// Proof gallons of `id` physically on premises at instant `at`: the
    /// original proof less everything consumed by productions finished, or
    /// withdrawn, before `at`. Zero if the record did not exist yet or was
    /// destroyed before `at`. May be negative if the ledger is inconsistent.
    pub fn proof_on_hand_at(&self, id: TransactionId, at: NaiveDateTime) -> f64 {
        let Some(tx) = self.record(id) else {
            return 0.0;
        };
        if tx.end_time >= at {
            return 0.0;
        }
        if self
            .destruction_of(id)
            .is_some_and(|record| record.end_time < at)
        {
            return 0.0;
        }

        let consumed: f64 = self
            .consumers_of(id)
            .iter()
            .filter(|edge| {
                self.record(edge.target_id)
                    .is_some_and(|target| target.end_time < at)
            })
            .map(|edge| self.proof_equivalent(edge))
            .sum();
        let withdrawn: f64 = self
            .withdrawals_of(id)
            .iter()
            .filter(|w| w.withdrawn_at < at)
            .map(|w| w.proof_gallons)
            .sum();

        tx.original.proof_or_zero() - consumed - withdrawn
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Direct(CategoryId),
    Inherited {
        category: CategoryId,
        from: TransactionId,
        hops: usize,
    },
    Untraceable {
        depth_exhausted: bool,
    },
}

impl Resolution {
    pub fn category_id(&self) -> CategoryId {
        match self {
            Resolution::Direct(category) => *category,
            Resolution::Inherited { category, .. } => *category,
            Resolution::Untraceable { .. } => UNCATEGORIZED,
        }
    }

    pub fn is_traceable(&self) -> bool {
        !matches!(self, Resolution::Untraceable { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Ancestors,
    Consumers,
}

enum WalkOutcome {
    Found {
        category: CategoryId,
        from: TransactionId,
        hops: usize,
    },
    NotFound {
        depth_exhausted: bool,
    },
}

/// Where spirits received for redistillation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedistillOrigin {
    Purchased { purchase_id: TransactionId },
    Produced { production_id: TransactionId },
}

impl RedistillOrigin {
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            RedistillOrigin::Purchased { purchase_id } => *purchase_id,
            RedistillOrigin::Produced { production_id } => *production_id,
        }
    }
}

/// Inherits a missing spirit type or material kind from the nearest related
/// record. Consumption edges are followed backwards first, then forwards, so
/// a purchased wash picks up the spirit type of the distillation that used it.
pub struct LineageResolver<'a> {
    index: &'a LineageIndex,
    max_depth: usize,
    cache: HashMap<(TransactionId, CategoryKind), Resolution>,
}

impl<'a> LineageResolver<'a> {
    pub fn new(index: &'a LineageIndex, max_depth: usize) -> Self {
        Self {
            index,
            max_depth,
            cache: HashMap::new(),
        }
    }

    pub fn index(&self) -> &'a LineageIndex {
        self.index
    }

    /// `(spirit type, material kind)`, `UNCATEGORIZED` where untraceable.
    pub fn resolve_category(&mut self, id: TransactionId) -> (CategoryId, CategoryId) {
        (
            self.resolve(id, CategoryKind::SpiritType).category_id(),
            self.resolve(id, CategoryKind::MaterialKind).category_id(),
        )
    }

    pub fn resolve(&mut self, id: TransactionId, kind: CategoryKind) -> Resolution {
        if let Some(cached) = self.cache.get(&(id, kind)) {
            return *cached;
        }

        let direct = self.index.assignment(id).get(kind);
        let resolution = if direct != UNCATEGORIZED {
            Resolution::Direct(direct)
        } else {
            let backward = self.walk(id, kind, Direction::Ancestors);
            let outcome = match backward {
                WalkOutcome::Found { .. } => backward,
                WalkOutcome::NotFound { depth_exhausted } => {
                    match self.walk(id, kind, Direction::Consumers) {
                        WalkOutcome::NotFound {
                            depth_exhausted: forward_exhausted,
                        } => WalkOutcome::NotFound {
                            depth_exhausted: depth_exhausted || forward_exhausted,
                        },
                        found => found,
                    }
                }
            };
            match outcome {
                WalkOutcome::Found {
                    category,
                    from,
                    hops,
                } => Resolution::Inherited {
                    category,
                    from,
                    hops,
                },
                WalkOutcome::NotFound { depth_exhausted } => {
                    if depth_exhausted {
                        warn!(
                            "Lineage walk for transaction {} stopped at depth {} without a {:?}",
                            id, self.max_depth, kind
                        );
                    }
                    Resolution::Untraceable { depth_exhausted }
                }
            }
        };

        self.cache.insert((id, kind), resolution);
        resolution
    }

    /// Classifies an edge feeding a distillation as a redistillation when its
    /// source is already a finished spirit.
    pub fn redistillation_origin(&self, edge: &LineageEdge) -> Option<RedistillOrigin> {
        let target = self.index.record(edge.target_id)?;
        if target.batch_type != BatchType::Distillation {
            return None;
        }
        let source = self.index.record(edge.source_id)?;
        if !source.is_finished_spirit() {
            return None;
        }
        Some(if source.is_purchase() {
            RedistillOrigin::Purchased {
                purchase_id: source.id,
            }
        } else {
            RedistillOrigin::Produced {
                production_id: source.id,
            }
        })
    }

    /// Spirit type a redistillate is reported under. Purchased spirits carry
    /// their own classification; produced ones are traced through their
    /// lineage like any other record.
    pub fn redistillate_category(&mut self, origin: RedistillOrigin) -> Resolution {
        match origin {
            RedistillOrigin::Purchased { purchase_id } => {
                let direct = self.index.assignment(purchase_id).spirit_type;
                if direct != UNCATEGORIZED {
                    Resolution::Direct(direct)
                } else {
                    self.resolve(purchase_id, CategoryKind::SpiritType)
                }
            }
            RedistillOrigin::Produced { production_id } => {
                self.resolve(production_id, CategoryKind::SpiritType)
            }
        }
    }

    fn walk(&self, start: TransactionId, kind: CategoryKind, direction: Direction) -> WalkOutcome {
        let mut visited: HashSet<TransactionId> = HashSet::from([start]);
        let mut queue: VecDeque<(TransactionId, usize)> = VecDeque::new();
        let mut depth_exhausted = false;

        for next in self.neighbours(start, direction) {
            if visited.insert(next) {
                queue.push_back((next, 1));
            }
        }

        while let Some((node, hops)) = queue.pop_front() {
            let category = self.index.assignment(node).get(kind);
            if category != UNCATEGORIZED {
                return WalkOutcome::Found {
                    category,
                    from: node,
                    hops,
                };
            }
            if hops >= self.max_depth {
                if !self.neighbours(node, direction).is_empty() {
                    depth_exhausted = true;
                }
                continue;
            }
            for next in self.neighbours(node, direction) {
                if visited.insert(next) {
                    queue.push_back((next, hops + 1));
                }
            }
        }

        WalkOutcome::NotFound { depth_exhausted }
    }

    fn neighbours(&self, id: TransactionId, direction: Direction) -> Vec<TransactionId> {
        match direction {
            Direction::Ancestors => self.index.inputs_of(id).iter().map(|e| e.source_id).collect(),
            Direction::Consumers => self
                .index
                .consumers_of(id)
                .iter()
                .map(|e| e.target_id)
                .collect(),
        }
    }
}
