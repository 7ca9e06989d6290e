use chrono::NaiveDateTime;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type TransactionId = u64;
pub type DistillerId = u32;
pub type CategoryId = u32;

/// Sentinel for "no category". Lookups coalesce a missing association to it.
pub const UNCATEGORIZED: CategoryId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum RecordKind {
    #[schemars(description = "Material bought in from a vendor")]
    Purchase,

    #[schemars(description = "Material made on premises from other records")]
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum BatchType {
    Fermentable,
    Fermented,
    Distilled,
    Additive,
    Supply,
    Fermentation,
    Distillation,
    Blending,
    Bottling,
}

impl BatchType {
    pub fn record_kind(&self) -> RecordKind {
        match self {
            BatchType::Fermentable
            | BatchType::Fermented
            | BatchType::Distilled
            | BatchType::Additive
            | BatchType::Supply => RecordKind::Purchase,
            BatchType::Fermentation
            | BatchType::Distillation
            | BatchType::Blending
            | BatchType::Bottling => RecordKind::Production,
        }
    }

    /// The lifecycle state a freshly recorded batch of this type starts in.
    pub fn initial_state(&self) -> State {
        match self {
            BatchType::Fermentable => State::Fermentable,
            BatchType::Fermented | BatchType::Fermentation => State::Fermented,
            BatchType::Distilled | BatchType::Distillation => State::Distilled,
            BatchType::Additive => State::Additive,
            BatchType::Supply => State::Supply,
            BatchType::Blending => State::Blended,
            BatchType::Bottling => State::Bottled,
        }
    }

    pub fn is_processing_stage(&self) -> bool {
        matches!(self, BatchType::Blending | BatchType::Bottling)
    }

    pub fn is_production_stage(&self) -> bool {
        matches!(self, BatchType::Fermentation | BatchType::Distillation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum Status {
    Active,
    Processing,
    Processed,
    Deleted,
    Archived,
    Destroyed,
}

impl Status {
    /// Statuses that still describe material which exists (or existed) on premises.
    pub fn is_live(&self) -> bool {
        matches!(self, Status::Active | Status::Processing | Status::Processed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum State {
    Fermentable,
    Fermented,
    Distilled,
    Blended,
    Bottled,
    Supply,
    Additive,
}

impl State {
    fn slug(&self) -> &'static str {
        match self {
            State::Fermentable => "fermentable",
            State::Fermented => "fermented",
            State::Distilled => "distilled",
            State::Blended => "blended",
            State::Bottled => "bottled",
            State::Supply => "supply",
            State::Additive => "additive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum ContentUnit {
    #[schemars(description = "Wine gallons")]
    Volume,

    #[schemars(description = "Pounds")]
    Weight,

    ProofGallons,
}

impl ContentUnit {
    fn slug(&self) -> &'static str {
        match self {
            ContentUnit::Volume => "volume",
            ContentUnit::Weight => "weight",
            ContentUnit::ProofGallons => "proof-gallons",
        }
    }
}

/// Measured quantities of a batch. Every field is independently optional;
/// a missing measurement reads as zero at the query boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Measurements {
    pub volume: Option<f64>,
    pub weight: Option<f64>,
    #[schemars(description = "Alcohol by volume, percent")]
    pub alcohol: Option<f64>,
    pub proof: Option<f64>,
}

impl Measurements {
    pub fn get(&self, unit: ContentUnit) -> Option<f64> {
        match unit {
            ContentUnit::Volume => self.volume,
            ContentUnit::Weight => self.weight,
            ContentUnit::ProofGallons => self.proof,
        }
    }

    pub fn get_or_zero(&self, unit: ContentUnit) -> f64 {
        self.get(unit).unwrap_or(0.0)
    }

    pub fn proof_or_zero(&self) -> f64 {
        self.proof.unwrap_or(0.0)
    }

    pub fn volume_or_zero(&self) -> f64 {
        self.volume.unwrap_or(0.0)
    }

    /// Scales every quantity (not the alcohol percentage) by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            volume: self.volume.map(|v| v * factor),
            weight: self.weight.map(|w| w * factor),
            alcohol: self.alcohol,
            proof: self.proof.map(|p| p * factor),
        }
    }

    pub fn zeroed(&self) -> Self {
        self.scaled(0.0)
    }
}

/// One purchase or production batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Transaction {
    pub id: TransactionId,
    pub distiller_id: DistillerId,
    pub batch_type: BatchType,
    pub status: Status,
    pub state: State,
    #[schemars(description = "Whether proof and volume have been formally recorded")]
    pub gauged: bool,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    #[schemars(description = "Quantities as first recorded; never mutated by burn-down")]
    pub original: Measurements,
    #[schemars(description = "Quantities left after burn-down and destruction")]
    pub remaining: Measurements,
}

impl Transaction {
    pub fn kind(&self) -> RecordKind {
        self.batch_type.record_kind()
    }

    pub fn is_purchase(&self) -> bool {
        self.kind() == RecordKind::Purchase
    }

    /// Records held in the bulk storage account: purchased fermented or
    /// distilled material and gauged distillation runs.
    pub fn is_storage_record(&self) -> bool {
        match self.batch_type {
            BatchType::Fermented | BatchType::Distilled => true,
            BatchType::Distillation => self.gauged,
            _ => false,
        }
    }

    /// Spirits that can be redistilled: purchased distilled spirits or a
    /// gauged distillation run.
    pub fn is_finished_spirit(&self) -> bool {
        match self.batch_type {
            BatchType::Distilled => true,
            BatchType::Distillation => self.gauged,
            _ => false,
        }
    }
}

/// Content-field tag of a lineage edge: origin x stage x unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct ContentField {
    pub origin: RecordKind,
    pub stage: State,
    pub unit: ContentUnit,
}

impl ContentField {
    pub fn new(origin: RecordKind, stage: State, unit: ContentUnit) -> Self {
        Self {
            origin,
            stage,
            unit,
        }
    }
}

impl fmt::Display for ContentField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = match self.origin {
            RecordKind::Purchase => "purchased",
            RecordKind::Production => "produced",
        };
        write!(f, "{}-{}-{}", origin, self.stage.slug(), self.unit.slug())
    }
}

/// Consumption of `quantity` (in `field.unit`) of `source_id` by `target_id`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LineageEdge {
    pub source_id: TransactionId,
    pub target_id: TransactionId,
    pub field: ContentField,
    pub quantity: f64,
}

impl LineageEdge {
    pub fn source_is_production(&self) -> bool {
        self.field.origin == RecordKind::Production
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "PascalCase")]
pub enum CategoryKind {
    SpiritType,
    MaterialKind,
}

/// Direct category associations of one record; `UNCATEGORIZED` when absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CategoryAssignment {
    pub spirit_type: CategoryId,
    pub material_kind: CategoryId,
}

impl CategoryAssignment {
    pub fn get(&self, kind: CategoryKind) -> CategoryId {
        match kind {
            CategoryKind::SpiritType => self.spirit_type,
            CategoryKind::MaterialKind => self.material_kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CategoryInfo {
    pub id: CategoryId,
    pub kind: CategoryKind,
    pub name: String,
    #[schemars(description = "Processing report class for spirit types; ignored for material kinds")]
    #[serde(default)]
    pub processing_class: Option<SpiritClass>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DestructionRecord {
    pub transaction_id: TransactionId,
    #[schemars(description = "Table the destroyed batch came from")]
    pub workflow: RecordKind,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub proof_gallons: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaxWithdrawal {
    pub transaction_id: TransactionId,
    pub withdrawn_at: NaiveDateTime,
    pub proof_gallons: f64,
    pub volume: f64,
}

/// Fixed catalog of processing-report spirit classes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "PascalCase")]
pub enum SpiritClass {
    AlcoholAndNeutralSpirits,
    BlendedStraightWhiskey,
    BlendedWhiskeyWithNeutralSpirits,
    BlendedWhiskeyWithLightWhiskey,
    BlendedLightWhiskey,
    AnyOtherBlendsOfWhiskey,
    ScotchWhiskey,
    CanadianWhiskey,
    IrishAndOtherImportedWhiskey,
    DomesticWhiskeyUnder160,
    DomesticWhiskeyOver160,
    BrandyUnder170,
    BrandyOver170,
    RumPuertoRican,
    RumVirginIslands,
    RumOtherImported,
    RumDomestic,
    Gin,
    Vodka,
    CordialsAndLiqueurs,
    Cocktails,
    Tequila,
    Other,
}

impl SpiritClass {
    pub const ALL: [SpiritClass; 23] = [
        SpiritClass::AlcoholAndNeutralSpirits,
        SpiritClass::BlendedStraightWhiskey,
        SpiritClass::BlendedWhiskeyWithNeutralSpirits,
        SpiritClass::BlendedWhiskeyWithLightWhiskey,
        SpiritClass::BlendedLightWhiskey,
        SpiritClass::AnyOtherBlendsOfWhiskey,
        SpiritClass::ScotchWhiskey,
        SpiritClass::CanadianWhiskey,
        SpiritClass::IrishAndOtherImportedWhiskey,
        SpiritClass::DomesticWhiskeyUnder160,
        SpiritClass::DomesticWhiskeyOver160,
        SpiritClass::BrandyUnder170,
        SpiritClass::BrandyOver170,
        SpiritClass::RumPuertoRican,
        SpiritClass::RumVirginIslands,
        SpiritClass::RumOtherImported,
        SpiritClass::RumDomestic,
        SpiritClass::Gin,
        SpiritClass::Vodka,
        SpiritClass::CordialsAndLiqueurs,
        SpiritClass::Cocktails,
        SpiritClass::Tequila,
        SpiritClass::Other,
    ];

    /// Stable row identity used in report tables and persisted cells.
    pub fn row_id(&self) -> CategoryId {
        Self::ALL
            .iter()
            .position(|c| c == self)
            .map(|i| i as CategoryId + 1)
            .unwrap_or(UNCATEGORIZED)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SpiritClass::AlcoholAndNeutralSpirits => "Alcohol and neutral spirits (other than vodka)",
            SpiritClass::BlendedStraightWhiskey => "Blended straight whiskey",
            SpiritClass::BlendedWhiskeyWithNeutralSpirits => "Blended whiskey with neutral spirits",
            SpiritClass::BlendedWhiskeyWithLightWhiskey => "Blended whiskey with light whiskey",
            SpiritClass::BlendedLightWhiskey => "Blended light whiskey",
            SpiritClass::AnyOtherBlendsOfWhiskey => "Any other blends of 100% whiskey",
            SpiritClass::ScotchWhiskey => "Imported whiskey: Scotch",
            SpiritClass::CanadianWhiskey => "Imported whiskey: Canadian",
            SpiritClass::IrishAndOtherImportedWhiskey => "Imported whiskey: Irish and others",
            SpiritClass::DomesticWhiskeyUnder160 => "Domestic whiskey distilled at 160 and under",
            SpiritClass::DomesticWhiskeyOver160 => "Domestic whiskey distilled at over 160",
            SpiritClass::BrandyUnder170 => "Brandy distilled at 170 and under",
            SpiritClass::BrandyOver170 => "Brandy distilled at over 170",
            SpiritClass::RumPuertoRican => "Rum: Puerto Rican",
            SpiritClass::RumVirginIslands => "Rum: Virgin Islands",
            SpiritClass::RumOtherImported => "Rum: others imported",
            SpiritClass::RumDomestic => "Rum: domestic",
            SpiritClass::Gin => "Gin",
            SpiritClass::Vodka => "Vodka",
            SpiritClass::CordialsAndLiqueurs => "Cordials, liqueurs and specialties",
            SpiritClass::Cocktails => "Cocktails and mixed drinks",
            SpiritClass::Tequila => "Tequila",
            SpiritClass::Other => "Other",
        }
    }
}
