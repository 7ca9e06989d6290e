use crate::error::{ReportError, Result};
use crate::ledger::InMemoryLedger;
use crate::schema::{
    BatchType, CategoryId, CategoryKind, ContentUnit, DistillerId, Measurements, RecordKind,
    Status, Transaction, TransactionId, UNCATEGORIZED,
};
use crate::utils::proof_gallons;
use chrono::NaiveDateTime;
use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseIntake {
    pub distiller_id: DistillerId,
    pub batch_type: BatchType,
    pub received_at: NaiveDateTime,
    pub measurements: Measurements,
    #[serde(default)]
    pub spirit_type: CategoryId,
    #[serde(default)]
    pub material_kind: CategoryId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consumption {
    pub source_id: TransactionId,
    pub unit: ContentUnit,
    pub quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionIntake {
    pub distiller_id: DistillerId,
    pub batch_type: BatchType,
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
    pub gauged: bool,
    pub measurements: Measurements,
    #[serde(default)]
    pub spirit_type: CategoryId,
    #[serde(default)]
    pub material_kind: CategoryId,
    #[serde(default)]
    pub consumed: Vec<Consumption>,
}

/// Fills in proof gallons from volume and ABV when the proof was not recorded.
fn complete_measurements(measurements: Measurements) -> Measurements {
    match (measurements.proof, measurements.volume, measurements.alcohol) {
        (None, Some(volume), Some(alcohol)) => Measurements {
            proof: Some(proof_gallons(volume, alcohol)),
            ..measurements
        },
        _ => measurements,
    }
}

fn validate_measurements(measurements: &Measurements) -> Result<()> {
    let quantities = [
        measurements.volume,
        measurements.weight,
        measurements.alcohol,
        measurements.proof,
    ];
    if quantities
        .iter()
        .flatten()
        .any(|v| !v.is_finite() || *v < 0.0)
    {
        return Err(ReportError::InvalidIntake(format!(
            "measurements must be non-negative numbers: {:?}",
            measurements
        )));
    }
    Ok(())
}

fn assign(
    ledger: &mut InMemoryLedger,
    id: TransactionId,
    spirit_type: CategoryId,
    material_kind: CategoryId,
) -> Result<()> {
    if spirit_type != UNCATEGORIZED {
        ledger.assign_category(id, CategoryKind::SpiritType, spirit_type)?;
    }
    if material_kind != UNCATEGORIZED {
        ledger.assign_category(id, CategoryKind::MaterialKind, material_kind)?;
    }
    Ok(())
}

pub fn record_purchase(ledger: &mut InMemoryLedger, intake: &PurchaseIntake) -> Result<TransactionId> {
    if intake.batch_type.record_kind() != RecordKind::Purchase {
        return Err(ReportError::InvalidIntake(format!(
            "{:?} is not a purchase type",
            intake.batch_type
        )));
    }
    validate_measurements(&intake.measurements)?;

    let id = ledger.next_transaction_id();
    let measurements = complete_measurements(intake.measurements);
    ledger.insert_transaction(Transaction {
        id,
        distiller_id: intake.distiller_id,
        batch_type: intake.batch_type,
        status: Status::Active,
        state: intake.batch_type.initial_state(),
        // purchased material arrives with vendor-recorded measurements
        gauged: true,
        start_time: intake.received_at,
        end_time: intake.received_at,
        original: measurements,
        remaining: measurements,
    })?;
    assign(ledger, id, intake.spirit_type, intake.material_kind)?;

    debug!("Recorded purchase {} ({:?})", id, intake.batch_type);
    Ok(id)
}

/// Records a production run and burns down everything it consumed. Either
/// every consumption applies or the intake is rejected before any of them.
pub fn record_production(
    ledger: &mut InMemoryLedger,
    intake: &ProductionIntake,
) -> Result<TransactionId> {
    if intake.batch_type.record_kind() != RecordKind::Production {
        return Err(ReportError::InvalidIntake(format!(
            "{:?} is not a production type",
            intake.batch_type
        )));
    }
    if intake.finished_at < intake.started_at {
        return Err(ReportError::InvalidIntake(format!(
            "production finished at {} before it started at {}",
            intake.finished_at, intake.started_at
        )));
    }
    validate_measurements(&intake.measurements)?;

    let consumptions: Vec<(TransactionId, ContentUnit, f64)> = intake
        .consumed
        .iter()
        .map(|consumption| (consumption.source_id, consumption.unit, consumption.quantity))
        .collect();
    ledger.validate_consumptions(&consumptions)?;

    let id = ledger.next_transaction_id();
    let measurements = complete_measurements(intake.measurements);
    ledger.insert_transaction(Transaction {
        id,
        distiller_id: intake.distiller_id,
        batch_type: intake.batch_type,
        status: Status::Active,
        state: intake.batch_type.initial_state(),
        gauged: intake.gauged,
        start_time: intake.started_at,
        end_time: intake.finished_at,
        original: measurements,
        remaining: measurements,
    })?;
    assign(ledger, id, intake.spirit_type, intake.material_kind)?;

    for (source_id, unit, quantity) in consumptions {
        ledger.consume(source_id, id, unit, quantity)?;
    }

    debug!(
        "Recorded production {} ({:?}) consuming {} source(s)",
        id,
        intake.batch_type,
        intake.consumed.len()
    );
    Ok(id)
}
