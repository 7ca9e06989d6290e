use crate::aggregator::{
    counts_as_destroyed, counts_as_transfer, counts_on_hand, CategoryRow, CategoryTable,
    ReportLine,
};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::lineage::LineageIndex;
use crate::period::ReportPeriod;
use crate::report::{
    row_cells, AssemblyContext, Diagnostics, ReportCell, ReportCells, ReportHeader, ReportType,
};
use crate::schema::{
    BatchType, CategoryKind, SpiritClass, State, Status, Transaction, UNCATEGORIZED,
};
use crate::utils::round3;
use log::{debug, info};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

const BULK_PART: u8 = 1;
const BOTTLED_PART: u8 = 2;
const CLASS_PART: u8 = 4;

/// Part 1: spirits held in bulk in the processing account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BulkAccount {
    pub on_hand_first_of_month: f64,
    pub received: f64,
    pub gains: f64,
    pub bottled: f64,
    pub destroyed: f64,
    pub losses: f64,
    #[schemars(description = "(on hand + received + gains) - (bottled + destroyed + losses)")]
    pub on_hand_end_of_month: f64,
}

impl BulkAccount {
    pub fn running_in(&self) -> f64 {
        self.on_hand_first_of_month + self.received + self.gains
    }

    pub fn running_out(&self) -> f64 {
        self.bottled + self.destroyed + self.losses
    }

    fn rounded(self) -> Self {
        Self {
            on_hand_first_of_month: round3(self.on_hand_first_of_month),
            received: round3(self.received),
            gains: round3(self.gains),
            bottled: round3(self.bottled),
            destroyed: round3(self.destroyed),
            losses: round3(self.losses),
            on_hand_end_of_month: round3(self.on_hand_end_of_month),
        }
    }

    fn lines(&self) -> [(u32, f64); 7] {
        [
            (1, self.on_hand_first_of_month),
            (2, self.received),
            (6, self.gains),
            (9, self.bottled),
            (22, self.destroyed),
            (24, self.losses),
            (25, self.on_hand_end_of_month),
        ]
    }
}

/// Part 2: bottled and packaged spirits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BottledAccount {
    pub on_hand_first_of_month: f64,
    pub bottled: f64,
    pub withdrawn_tax_paid: f64,
    pub destroyed: f64,
    pub on_hand_end_of_month: f64,
}

impl BottledAccount {
    pub fn running_in(&self) -> f64 {
        self.on_hand_first_of_month + self.bottled
    }

    pub fn running_out(&self) -> f64 {
        self.withdrawn_tax_paid + self.destroyed
    }

    fn rounded(self) -> Self {
        Self {
            on_hand_first_of_month: round3(self.on_hand_first_of_month),
            bottled: round3(self.bottled),
            withdrawn_tax_paid: round3(self.withdrawn_tax_paid),
            destroyed: round3(self.destroyed),
            on_hand_end_of_month: round3(self.on_hand_end_of_month),
        }
    }

    fn lines(&self) -> [(u32, f64); 5] {
        [
            (26, self.on_hand_first_of_month),
            (27, self.bottled),
            (31, self.withdrawn_tax_paid),
            (43, self.destroyed),
            (46, self.on_hand_end_of_month),
        ]
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum ClassLine {
    #[schemars(description = "Proof gallons dumped for blending")]
    BulkDumped,
    #[schemars(description = "Wine gallons bottled")]
    Bottled,
}

impl ReportLine for ClassLine {
    fn number(&self) -> u32 {
        match self {
            ClassLine::BulkDumped => 1,
            ClassLine::Bottled => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProcessingReport {
    pub header: ReportHeader,
    pub bulk: BulkAccount,
    pub bottled: BottledAccount,
    #[schemars(description = "Rows keyed by spirit class row id")]
    pub classes: Vec<CategoryRow<ClassLine>>,
    pub classes_total: CategoryRow<ClassLine>,
    pub diagnostics: Diagnostics,
}

impl ProcessingReport {
    pub fn class_row(&self, class: SpiritClass) -> Option<&CategoryRow<ClassLine>> {
        self.classes
            .iter()
            .find(|row| row.category_id == class.row_id())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn json_schema() -> std::result::Result<String, serde_json::Error> {
        let schema = schemars::schema_for!(ProcessingReport);
        serde_json::to_string_pretty(&schema)
    }
}

impl ReportCells for ProcessingReport {
    fn header(&self) -> ReportHeader {
        self.header
    }

    fn cells(&self) -> Vec<ReportCell> {
        let single_row = |part: u8, lines: &[(u32, f64)]| -> Vec<ReportCell> {
            lines
                .iter()
                .filter(|(_, value)| *value != 0.0)
                .map(|(row, value)| ReportCell {
                    part,
                    row: *row,
                    column: 0,
                    value: *value,
                })
                .collect()
        };
        let mut cells = single_row(BULK_PART, &self.bulk.lines());
        cells.extend(single_row(BOTTLED_PART, &self.bottled.lines()));
        cells.extend(row_cells(CLASS_PART, &self.classes));
        cells
    }
}

pub struct ProcessingAssembler<'a> {
    ctx: AssemblyContext<'a>,
    period: ReportPeriod,
    classes: CategoryTable<ClassLine>,
}

impl<'a> ProcessingAssembler<'a> {
    pub fn new(index: &'a LineageIndex, config: &'a EngineConfig, period: ReportPeriod) -> Self {
        Self {
            ctx: AssemblyContext::new(index, config),
            period,
            classes: CategoryTable::new(),
        }
    }

    pub fn assemble(mut self) -> Result<ProcessingReport> {
        let distiller_id = self.ctx.index.distiller_id();
        info!(
            "Assembling processing report for distiller {} ({})",
            distiller_id, self.period
        );

        let bulk = self.bulk_account()?;
        let bottled = self.bottled_account()?;
        self.class_pass();

        let classes_total = self.classes.total_row("Total");
        let diagnostics = self.ctx.finish();
        info!(
            "Processing report for {}: {:.3} PG bulk and {:.3} PG bottled on hand at month end",
            self.period, bulk.on_hand_end_of_month, bottled.on_hand_end_of_month
        );

        Ok(ProcessingReport {
            header: ReportHeader {
                distiller_id,
                report_type: ReportType::Processing,
                period: self.period,
            },
            bulk,
            bottled,
            classes: self.classes.into_rows(),
            classes_total,
            diagnostics,
        })
    }

    fn records_of(&self, batch_type: BatchType) -> impl Iterator<Item = &'a Transaction> {
        let index: &'a LineageIndex = self.ctx.index;
        index
            .records()
            .filter(move |tx| tx.batch_type == batch_type)
    }

    fn finished_in_period(&self, tx: &Transaction) -> bool {
        (tx.status.is_live() || tx.status == Status::Destroyed) && self.period.contains(tx.end_time)
    }

    fn on_hand_at_start(&self, batch_type: BatchType) -> f64 {
        let index = self.ctx.index;
        let at = self.period.start();
        self.records_of(batch_type)
            .filter(|tx| counts_on_hand(tx, index.destruction_of(tx.id), at))
            .map(|tx| index.proof_on_hand_at(tx.id, at))
            .sum()
    }

    fn destroyed_in_period(&self, batch_type: BatchType) -> f64 {
        let index = self.ctx.index;
        self.records_of(batch_type)
            .filter_map(|tx| {
                let record = index.destruction_of(tx.id)?;
                counts_as_destroyed(tx, record, &self.period).then_some(record.proof_gallons)
            })
            .sum()
    }

    fn bulk_account(&mut self) -> Result<BulkAccount> {
        let index = self.ctx.index;
        let mut account = BulkAccount {
            on_hand_first_of_month: self.on_hand_at_start(BatchType::Blending),
            destroyed: self.destroyed_in_period(BatchType::Blending),
            ..BulkAccount::default()
        };

        // Storage records moved into blending or bottling this month.
        for source in index.records().filter(|tx| tx.is_storage_record()) {
            for edge in index.consumers_of(source.id) {
                let received = index.record(edge.target_id).is_some_and(|target| {
                    target.batch_type.is_processing_stage()
                        && counts_as_transfer(source, target, &self.period)
                });
                if received {
                    account.received += index.proof_equivalent(edge);
                }
            }
        }

        let blends: Vec<&Transaction> = self
            .records_of(BatchType::Blending)
            .filter(|tx| self.finished_in_period(tx))
            .collect();
        for blend in blends {
            let input: f64 = index
                .inputs_of(blend.id)
                .iter()
                .map(|edge| index.proof_equivalent(edge))
                .sum();
            let output = self.ctx.proof_of(blend);
            if input > output {
                account.losses += input - output;
            } else {
                account.gains += output - input;
            }
        }

        let bottlings: Vec<&Transaction> = self
            .records_of(BatchType::Bottling)
            .filter(|tx| self.finished_in_period(tx))
            .collect();
        for bottling in bottlings {
            account.bottled += index
                .inputs_of(bottling.id)
                .iter()
                .map(|edge| index.proof_equivalent(edge))
                .sum::<f64>();
        }

        let mut account = account.rounded();
        account.on_hand_end_of_month = round3(self.ctx.ensure_non_negative(
            ReportType::Processing,
            self.period,
            BULK_PART,
            25,
            "bulk spirits",
            account.running_in(),
            account.running_out(),
        )?);
        debug!("Processing part 1 for {}: {:?}", self.period, account);
        Ok(account)
    }

    fn bottled_account(&mut self) -> Result<BottledAccount> {
        let index = self.ctx.index;
        let period = self.period;
        let bottlings: Vec<&Transaction> = self
            .records_of(BatchType::Bottling)
            .filter(|tx| self.finished_in_period(tx))
            .collect();
        let mut bottled = 0.0;
        for tx in bottlings {
            bottled += self.ctx.proof_of(tx);
        }

        let withdrawn_tax_paid: f64 = self
            .records_of(BatchType::Bottling)
            .flat_map(|tx| index.withdrawals_of(tx.id))
            .filter(|withdrawal| period.contains(withdrawal.withdrawn_at))
            .map(|withdrawal| withdrawal.proof_gallons)
            .sum();

        let mut account = BottledAccount {
            on_hand_first_of_month: self.on_hand_at_start(BatchType::Bottling),
            bottled,
            withdrawn_tax_paid,
            destroyed: self.destroyed_in_period(BatchType::Bottling),
            on_hand_end_of_month: 0.0,
        }
        .rounded();
        account.on_hand_end_of_month = round3(self.ctx.ensure_non_negative(
            ReportType::Processing,
            self.period,
            BOTTLED_PART,
            46,
            "bottled spirits",
            account.running_in(),
            account.running_out(),
        )?);
        Ok(account)
    }

    /// Blended batches are dumped by proof, bottled batches counted by
    /// volume, each under the processing class of its spirit type.
    fn class_pass(&mut self) {
        let index = self.ctx.index;
        let entries: Vec<(&Transaction, ClassLine)> = index
            .records()
            .filter(|tx| self.finished_in_period(tx))
            .filter_map(|tx| match (tx.batch_type, tx.state) {
                (BatchType::Blending, State::Blended) => Some((tx, ClassLine::BulkDumped)),
                (BatchType::Bottling, State::Bottled) => Some((tx, ClassLine::Bottled)),
                _ => None,
            })
            .collect();

        for (tx, line) in entries {
            let amount = match line {
                ClassLine::BulkDumped => self.ctx.proof_of(tx),
                ClassLine::Bottled => tx.original.volume_or_zero(),
            };
            if amount == 0.0 {
                continue;
            }
            let Some(class) = self.spirit_class_of(tx) else {
                continue;
            };
            self.classes
                .contribute(class.row_id(), class.label(), line, amount);
        }
    }

    fn spirit_class_of(&mut self, tx: &Transaction) -> Option<SpiritClass> {
        let (category, _) = self
            .ctx
            .category_for(tx.id, CategoryKind::SpiritType, "processing part 4")?;
        if category == UNCATEGORIZED {
            return Some(SpiritClass::Other);
        }
        Some(
            self.ctx
                .index
                .category_info(CategoryKind::SpiritType, category)
                .and_then(|info| info.processing_class)
                .unwrap_or(SpiritClass::Other),
        )
    }
}

pub fn build_processing_report(
    index: &LineageIndex,
    config: &EngineConfig,
    period: ReportPeriod,
) -> Result<ProcessingReport> {
    ProcessingAssembler::new(index, config, period).assemble()
}
