use crate::aggregator::{counts_as_deposit, counts_on_hand, CategoryRow, CategoryTable, ReportLine};
use crate::config::EngineConfig;
use crate::error::{ReportError, Result};
use crate::lineage::LineageIndex;
use crate::period::ReportPeriod;
use crate::report::{
    row_cells, AssemblyContext, Diagnostics, ReportCell, ReportCells, ReportHeader, ReportType,
};
use crate::schema::{
    BatchType, CategoryId, CategoryKind, ContentUnit, LineageEdge, Status, Transaction,
    TransactionId,
};
use log::{debug, info};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

const SPIRITS_PART: u8 = 1;
const MATERIALS_PART: u8 = 2;
const RAW_MATERIALS_PART: u8 = 6;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum ProductionLine {
    EnteredProcessingAccount,
    EnteredStorageAccount,
    ProducedTotal,
    ReceivedForRedistillation,
    UnfinishedSpiritsEndOfQuarter,
}

impl ReportLine for ProductionLine {
    fn number(&self) -> u32 {
        match self {
            ProductionLine::EnteredProcessingAccount => 9,
            ProductionLine::EnteredStorageAccount => 10,
            ProductionLine::ProducedTotal => 14,
            ProductionLine::ReceivedForRedistillation => 15,
            ProductionLine::UnfinishedSpiritsEndOfQuarter => 17,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum MaterialLine {
    ProofGallons,
}

impl ReportLine for MaterialLine {
    fn number(&self) -> u32 {
        1
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum RawMaterialLine {
    #[schemars(description = "Pounds")]
    Weight,
    #[schemars(description = "Gallons")]
    Volume,
}

impl ReportLine for RawMaterialLine {
    fn number(&self) -> u32 {
        match self {
            RawMaterialLine::Weight => 1,
            RawMaterialLine::Volume => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProductionReport {
    pub header: ReportHeader,
    pub spirits: Vec<CategoryRow<ProductionLine>>,
    pub spirits_total: CategoryRow<ProductionLine>,
    pub materials: Vec<CategoryRow<MaterialLine>>,
    pub materials_total: CategoryRow<MaterialLine>,
    pub raw_materials: Vec<CategoryRow<RawMaterialLine>>,
    pub raw_materials_total: CategoryRow<RawMaterialLine>,
    pub diagnostics: Diagnostics,
}

impl ProductionReport {
    pub fn spirit_row(&self, category_id: CategoryId) -> Option<&CategoryRow<ProductionLine>> {
        self.spirits.iter().find(|row| row.category_id == category_id)
    }

    pub fn material_row(&self, category_id: CategoryId) -> Option<&CategoryRow<MaterialLine>> {
        self.materials.iter().find(|row| row.category_id == category_id)
    }

    pub fn raw_material_row(
        &self,
        category_id: CategoryId,
    ) -> Option<&CategoryRow<RawMaterialLine>> {
        self.raw_materials
            .iter()
            .find(|row| row.category_id == category_id)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn json_schema() -> std::result::Result<String, serde_json::Error> {
        let schema = schemars::schema_for!(ProductionReport);
        serde_json::to_string_pretty(&schema)
    }
}

impl ReportCells for ProductionReport {
    fn header(&self) -> ReportHeader {
        self.header
    }

    fn cells(&self) -> Vec<ReportCell> {
        let mut cells = row_cells(SPIRITS_PART, &self.spirits);
        cells.extend(row_cells(MATERIALS_PART, &self.materials));
        cells.extend(row_cells(RAW_MATERIALS_PART, &self.raw_materials));
        cells
    }
}

/// Proof of a distillation split between the two accounts it can enter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountSplit {
    pub storage: f64,
    pub processing: f64,
}

/// Output sent straight to blending or bottling within the same month went
/// to the processing account; the rest entered storage.
pub fn account_split(
    index: &LineageIndex,
    distillation: &Transaction,
    period: &ReportPeriod,
    tolerance: f64,
) -> Result<AccountSplit> {
    let proof = distillation.original.proof_or_zero();
    let processing: f64 = index
        .consumers_of(distillation.id)
        .iter()
        .filter(|edge| {
            index.record(edge.target_id).is_some_and(|target| {
                target.batch_type.is_processing_stage() && period.contains(target.end_time)
            })
        })
        .map(|edge| index.proof_equivalent(edge))
        .sum();

    let storage = proof - processing;
    if storage < -tolerance {
        return Err(ReportError::ConservationViolation {
            transaction_id: distillation.id,
            period: Some(*period),
            details: format!(
                "{:.3} PG went to processing out of {:.3} PG produced",
                processing, proof
            ),
        });
    }
    Ok(AccountSplit {
        storage: storage.max(0.0),
        processing,
    })
}

pub struct ProductionAssembler<'a> {
    ctx: AssemblyContext<'a>,
    period: ReportPeriod,
    spirits: CategoryTable<ProductionLine>,
    materials: CategoryTable<MaterialLine>,
    raw_materials: CategoryTable<RawMaterialLine>,
}

impl<'a> ProductionAssembler<'a> {
    pub fn new(index: &'a LineageIndex, config: &'a EngineConfig, period: ReportPeriod) -> Self {
        Self {
            ctx: AssemblyContext::new(index, config),
            period,
            spirits: CategoryTable::new(),
            materials: CategoryTable::new(),
            raw_materials: CategoryTable::new(),
        }
    }

    pub fn assemble(mut self) -> Result<ProductionReport> {
        let distiller_id = self.ctx.index.distiller_id();
        info!(
            "Assembling production report for distiller {} ({})",
            distiller_id, self.period
        );

        let produced = self.produced_distillations();
        debug!("{} gauged distillation(s) in {}", produced.len(), self.period);

        self.account_pass(&produced)?;
        if self.period.carries_quarterly_inventory() {
            self.unfinished_spirits_pass();
        }
        self.redistillation_pass();
        self.material_pass(&produced);
        self.raw_material_pass();

        self.spirits.derive_sum(
            ProductionLine::ProducedTotal,
            &[
                ProductionLine::EnteredProcessingAccount,
                ProductionLine::EnteredStorageAccount,
            ],
        );

        let spirits_total = self.spirits.total_row("Total");
        let materials_total = self.materials.total_row("Total");
        let raw_materials_total = self.raw_materials.total_row("Total");
        let diagnostics = self.ctx.finish();
        info!(
            "Production report for {}: {:.3} PG produced",
            self.period,
            spirits_total.get(ProductionLine::ProducedTotal)
        );

        Ok(ProductionReport {
            header: ReportHeader {
                distiller_id,
                report_type: ReportType::Production,
                period: self.period,
            },
            spirits: self.spirits.into_rows(),
            spirits_total,
            materials: self.materials.into_rows(),
            materials_total,
            raw_materials: self.raw_materials.into_rows(),
            raw_materials_total,
            diagnostics,
        })
    }

    fn produced_distillations(&self) -> Vec<&'a Transaction> {
        let index: &'a LineageIndex = self.ctx.index;
        index
            .records()
            .filter(|tx| {
                tx.batch_type == BatchType::Distillation
                    && tx.gauged
                    && counts_as_deposit(tx, &self.period)
            })
            .collect()
    }

    fn contribute_spirit(&mut self, id: TransactionId, line: ProductionLine, amount: f64) {
        if amount == 0.0 {
            return;
        }
        let label = format!("production line {}", line.number());
        if let Some((category, name)) = self.ctx.category_for(id, CategoryKind::SpiritType, &label) {
            self.spirits.contribute(category, &name, line, amount);
        }
    }

    fn account_pass(&mut self, produced: &[&'a Transaction]) -> Result<()> {
        let tolerance = self.ctx.config.balance_tolerance;
        for tx in produced {
            let split = account_split(self.ctx.index, tx, &self.period, tolerance)?;
            self.contribute_spirit(tx.id, ProductionLine::EnteredStorageAccount, split.storage);
            self.contribute_spirit(
                tx.id,
                ProductionLine::EnteredProcessingAccount,
                split.processing,
            );
        }
        Ok(())
    }

    /// Distillation runs not yet gauged when the quarter closed.
    fn unfinished_spirits_pass(&mut self) {
        let index = self.ctx.index;
        let at = self.period.start();
        let unfinished: Vec<(TransactionId, f64)> = index
            .records()
            .filter(|tx| tx.batch_type == BatchType::Distillation && !tx.gauged)
            .filter(|tx| counts_on_hand(tx, index.destruction_of(tx.id), at))
            .map(|tx| (tx.id, index.proof_on_hand_at(tx.id, at)))
            .filter(|(_, proof)| *proof > 0.0)
            .collect();
        debug!("{} unfinished distillation(s) at {}", unfinished.len(), at);
        for (id, proof) in unfinished {
            self.contribute_spirit(id, ProductionLine::UnfinishedSpiritsEndOfQuarter, proof);
        }
    }

    /// Finished spirits fed back into a still, reported under the spirit
    /// type of what was redistilled.
    fn redistillation_pass(&mut self) {
        let index = self.ctx.index;
        let period = self.period;
        let edges: Vec<&LineageEdge> = index
            .records()
            .filter(|tx| {
                tx.batch_type == BatchType::Distillation
                    && tx.status.is_live()
                    && period.contains(tx.end_time)
            })
            .flat_map(|tx| index.inputs_of(tx.id))
            .collect();

        let line = ProductionLine::ReceivedForRedistillation;
        let label = format!("production line {}", line.number());
        for edge in edges {
            let Some(origin) = self.ctx.resolver.redistillation_origin(edge) else {
                continue;
            };
            let amount = index.proof_equivalent(edge);
            if amount == 0.0 {
                continue;
            }
            let resolution = self.ctx.resolver.redistillate_category(origin);
            if let Some((category, name)) = self.ctx.row_for(
                origin.transaction_id(),
                CategoryKind::SpiritType,
                &label,
                resolution,
            ) {
                self.spirits.contribute(category, &name, line, amount);
            }
        }
    }

    fn material_pass(&mut self, produced: &[&'a Transaction]) {
        for tx in produced {
            let proof = self.ctx.proof_of(tx);
            if proof == 0.0 {
                continue;
            }
            if let Some((category, name)) =
                self.ctx
                    .category_for(tx.id, CategoryKind::MaterialKind, "production parts 2-4")
            {
                self.materials
                    .contribute(category, &name, MaterialLine::ProofGallons, proof);
            }
        }
    }

    /// Raw material behind every distillation finished in the month. A
    /// fermentation's inputs are pro-rated by the share of its output the
    /// still consumed.
    fn raw_material_pass(&mut self) {
        let index = self.ctx.index;
        let period = self.period;
        let mut attributions: Vec<(TransactionId, f64, f64)> = Vec::new();

        let distillations = index.records().filter(|tx| {
            tx.batch_type == BatchType::Distillation
                && (tx.status.is_live() || tx.status == Status::Destroyed)
                && period.contains(tx.end_time)
        });
        for distillation in distillations {
            for edge in index.inputs_of(distillation.id) {
                let Some(source) = index.record(edge.source_id) else {
                    continue;
                };
                match source.batch_type {
                    BatchType::Fermented => attributions.push((
                        source.id,
                        index.quantity_in(edge, ContentUnit::Volume),
                        index.quantity_in(edge, ContentUnit::Weight),
                    )),
                    BatchType::Fermentation => {
                        let produced = source.original.get_or_zero(edge.field.unit);
                        if produced <= 0.0 {
                            continue;
                        }
                        let fraction = (edge.quantity / produced).min(1.0);
                        for input in index.inputs_of(source.id) {
                            let is_raw = index
                                .record(input.source_id)
                                .is_some_and(|raw| raw.batch_type == BatchType::Fermentable);
                            if !is_raw {
                                continue;
                            }
                            attributions.push((
                                input.source_id,
                                index.quantity_in(input, ContentUnit::Volume) * fraction,
                                index.quantity_in(input, ContentUnit::Weight) * fraction,
                            ));
                        }
                    }
                    _ => {}
                }
            }
        }

        debug!("{} raw material attribution(s) in {}", attributions.len(), period);
        for (source_id, volume, weight) in attributions {
            if volume == 0.0 && weight == 0.0 {
                continue;
            }
            let Some((category, name)) =
                self.ctx
                    .category_for(source_id, CategoryKind::MaterialKind, "production part 6")
            else {
                continue;
            };
            if volume > 0.0 {
                self.raw_materials
                    .contribute(category, &name, RawMaterialLine::Volume, volume);
            }
            if weight > 0.0 {
                self.raw_materials
                    .contribute(category, &name, RawMaterialLine::Weight, weight);
            }
        }
    }
}

pub fn build_production_report(
    index: &LineageIndex,
    config: &EngineConfig,
    period: ReportPeriod,
) -> Result<ProductionReport> {
    ProductionAssembler::new(index, config, period).assemble()
}
