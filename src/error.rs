use crate::period::ReportPeriod;
use crate::schema::TransactionId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Cannot generate {report} report for {period}: part {part} line {line} for '{category}' would be negative (in {running_in}, out {running_out})")]
    NegativeBalance {
        report: String,
        period: ReportPeriod,
        part: u8,
        line: u32,
        category: String,
        running_in: f64,
        running_out: f64,
    },

    #[error("{}Conservation violated for transaction {transaction_id}: {details}", report_prefix(.period))]
    ConservationViolation {
        transaction_id: TransactionId,
        period: Option<ReportPeriod>,
        details: String,
    },

    #[error("Unknown transaction: {0}")]
    UnknownTransaction(TransactionId),

    #[error("Invalid reporting period: {0}")]
    InvalidPeriod(String),

    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid intake record: {0}")]
    InvalidIntake(String),

    #[error("Ledger store error: {0}")]
    Store(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl ReportError {
    /// Invariant violations and persistence failures abort a build; everything
    /// else is a caller or input problem.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReportError::NegativeBalance { .. }
                | ReportError::ConservationViolation { .. }
                | ReportError::Persistence(_)
        )
    }

    pub fn period(&self) -> Option<ReportPeriod> {
        match self {
            ReportError::NegativeBalance { period, .. } => Some(*period),
            ReportError::ConservationViolation { period, .. } => *period,
            _ => None,
        }
    }
}

fn report_prefix(period: &Option<ReportPeriod>) -> String {
    period
        .map(|period| format!("Cannot generate report for {}: ", period))
        .unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, ReportError>;
