use chrono::{NaiveDate, NaiveDateTime};
use spirits_compliance_reports::*;

const DISTILLER: DistillerId = 1;
const WHISKEY: CategoryId = 3;
const CORN: CategoryId = 7;

fn at(month: u32, day: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2023, month, day)
        .unwrap()
        .and_hms_opt(11, 0, 0)
        .unwrap()
}

fn period(month: u32) -> ReportPeriod {
    ReportPeriod::new(2023, month).unwrap()
}

fn measured(volume: f64, alcohol: f64) -> Measurements {
    Measurements {
        volume: Some(volume),
        weight: None,
        alcohol: Some(alcohol),
        proof: None,
    }
}

fn catalog() -> InMemoryLedger {
    let mut ledger = InMemoryLedger::new();
    ledger.add_category(CategoryInfo {
        id: WHISKEY,
        kind: CategoryKind::SpiritType,
        name: "Bourbon Whiskey".to_string(),
        processing_class: Some(SpiritClass::DomesticWhiskeyUnder160),
    });
    ledger.add_category(CategoryInfo {
        id: CORN,
        kind: CategoryKind::MaterialKind,
        name: "Corn".to_string(),
        processing_class: None,
    });
    ledger
}

fn production(
    batch_type: BatchType,
    started: NaiveDateTime,
    finished: NaiveDateTime,
    measurements: Measurements,
    consumed: Vec<Consumption>,
) -> ProductionIntake {
    ProductionIntake {
        distiller_id: DISTILLER,
        batch_type,
        started_at: started,
        finished_at: finished,
        gauged: true,
        measurements,
        spirit_type: WHISKEY,
        material_kind: CORN,
        consumed,
    }
}

fn proof_of(source_id: TransactionId, quantity: f64) -> Consumption {
    Consumption {
        source_id,
        unit: ContentUnit::ProofGallons,
        quantity,
    }
}

/// 1000 gal of 5% wash bought on Jan 5, distilled on Feb 15 into 95 PG.
fn wash_and_still() -> (InMemoryLedger, TransactionId, TransactionId) {
    let mut ledger = catalog();
    let wash = record_purchase(
        &mut ledger,
        &PurchaseIntake {
            distiller_id: DISTILLER,
            batch_type: BatchType::Fermented,
            received_at: at(1, 5),
            measurements: measured(1000.0, 5.0),
            spirit_type: WHISKEY,
            material_kind: CORN,
        },
    )
    .unwrap();
    let still = record_production(
        &mut ledger,
        &production(
            BatchType::Distillation,
            at(2, 14),
            at(2, 15),
            measured(190.0, 25.0),
            vec![proof_of(wash, 100.0)],
        ),
    )
    .unwrap();
    (ledger, wash, still)
}

/// Blends the Feb distillation in March, loses 2 PG, bottles the blend and
/// withdraws 40 PG tax-paid.
fn blend_and_bottle(ledger: &mut InMemoryLedger, still: TransactionId) -> TransactionId {
    let blend = record_production(
        ledger,
        &production(
            BatchType::Blending,
            at(3, 9),
            at(3, 10),
            measured(186.0, 25.0),
            vec![proof_of(still, 95.0)],
        ),
    )
    .unwrap();
    let bottling = record_production(
        ledger,
        &production(
            BatchType::Bottling,
            at(3, 19),
            at(3, 20),
            measured(232.5, 20.0),
            vec![proof_of(blend, 93.0)],
        ),
    )
    .unwrap();
    ledger.withdraw_tax_paid(bottling, at(3, 25), 40.0).unwrap();
    bottling
}

fn storage(ledger: &InMemoryLedger, month: u32) -> StorageReport {
    let engine = ReportEngine::new(ledger, EngineConfig::default()).unwrap();
    engine.storage_report(DISTILLER, period(month)).unwrap()
}

fn storage_line(report: &StorageReport, line: StorageLine) -> f64 {
    report.row(WHISKEY).map(|row| row.get(line)).unwrap_or(0.0)
}

fn print_storage(report: &StorageReport) {
    println!("\n=== Storage {} ===", report.header.period);
    for row in report.rows.iter().chain(std::iter::once(&report.total)) {
        println!("{:<20} {:?}", row.category_name, row.cells);
    }
}

#[test]
fn test_wash_purchase_then_distillation() {
    let (ledger, _, _) = wash_and_still();

    let january = storage(&ledger, 1);
    print_storage(&january);
    assert!(storage_line(&january, StorageLine::OnHandFirstOfMonth).abs() < 0.001);
    assert!((storage_line(&january, StorageLine::DepositedInBulkStorage) - 100.0).abs() < 0.001);
    assert!((storage_line(&january, StorageLine::OnHandEndOfMonth) - 100.0).abs() < 0.001);
    assert!(january.diagnostics.discrepancies.is_empty());

    let february = storage(&ledger, 2);
    print_storage(&february);
    assert!((storage_line(&february, StorageLine::OnHandFirstOfMonth) - 100.0).abs() < 0.001);
    assert!((storage_line(&february, StorageLine::DepositedInBulkStorage) - 95.0).abs() < 0.001);
    assert!((storage_line(&february, StorageLine::TransferredToProduction) - 100.0).abs() < 0.001);
    assert!((storage_line(&february, StorageLine::OnHandEndOfMonth) - 95.0).abs() < 0.001);
    assert!((storage_line(&february, StorageLine::TotalLines1To5) - 195.0).abs() < 0.001);
    assert!((storage_line(&february, StorageLine::TotalLines7To23) - 195.0).abs() < 0.001);
    assert!(february.diagnostics.discrepancies.is_empty());
    assert_eq!(february.row(WHISKEY).unwrap().category_name, "Bourbon Whiskey");

    let engine = ReportEngine::new(&ledger, EngineConfig::default()).unwrap();
    let produced = engine.production_report(DISTILLER, period(2)).unwrap();
    let spirits = produced.spirit_row(WHISKEY).unwrap();
    assert!((spirits.get(ProductionLine::EnteredStorageAccount) - 95.0).abs() < 0.001);
    assert!((spirits.get(ProductionLine::ProducedTotal) - 95.0).abs() < 0.001);
    assert!(spirits.get(ProductionLine::EnteredProcessingAccount).abs() < 0.001);
    assert!(
        (produced.material_row(CORN).unwrap().get(MaterialLine::ProofGallons) - 95.0).abs()
            < 0.001
    );
    assert!(
        (produced.raw_material_row(CORN).unwrap().get(RawMaterialLine::Volume) - 1000.0).abs()
            < 0.001
    );
}

#[test]
fn test_closing_balance_carries_into_next_month() {
    let (mut ledger, _, still) = wash_and_still();
    blend_and_bottle(&mut ledger, still);

    for month in 1..=5 {
        let this_month = storage(&ledger, month);
        let next_month = storage(&ledger, month + 1);
        assert!(
            (storage_line(&this_month, StorageLine::OnHandEndOfMonth)
                - storage_line(&next_month, StorageLine::OnHandFirstOfMonth))
            .abs()
                < 0.001,
            "storage carry-forward broken between {} and {}",
            this_month.header.period,
            next_month.header.period
        );

        let engine = ReportEngine::new(&ledger, EngineConfig::default()).unwrap();
        let this_month = engine.processing_report(DISTILLER, period(month)).unwrap();
        let next_month = engine.processing_report(DISTILLER, period(month + 1)).unwrap();
        assert!(
            (this_month.bulk.on_hand_end_of_month - next_month.bulk.on_hand_first_of_month).abs()
                < 0.001
        );
        assert!(
            (this_month.bottled.on_hand_end_of_month - next_month.bottled.on_hand_first_of_month)
                .abs()
                < 0.001
        );
    }
}

#[test]
fn test_processing_flow_with_tax_paid_withdrawal() {
    let (mut ledger, _, still) = wash_and_still();
    blend_and_bottle(&mut ledger, still);
    let engine = ReportEngine::new(&ledger, EngineConfig::default()).unwrap();

    let march = storage(&ledger, 3);
    assert!((storage_line(&march, StorageLine::TransferredToProcessing) - 95.0).abs() < 0.001);
    assert!(storage_line(&march, StorageLine::OnHandEndOfMonth).abs() < 0.001);

    let processing = engine.processing_report(DISTILLER, period(3)).unwrap();
    println!("\n=== Processing 2023-03 ===\n{}", processing.to_json().unwrap());
    assert!((processing.bulk.received - 95.0).abs() < 0.001);
    assert!((processing.bulk.losses - 2.0).abs() < 0.001);
    assert!((processing.bulk.bottled - 93.0).abs() < 0.001);
    assert!(processing.bulk.on_hand_end_of_month.abs() < 0.001);

    assert!((processing.bottled.bottled - 93.0).abs() < 0.001);
    assert!((processing.bottled.withdrawn_tax_paid - 40.0).abs() < 0.001);
    assert!((processing.bottled.on_hand_end_of_month - 53.0).abs() < 0.001);

    let class = processing
        .class_row(SpiritClass::DomesticWhiskeyUnder160)
        .unwrap();
    assert!((class.get(ClassLine::BulkDumped) - 93.0).abs() < 0.001);
    assert!((class.get(ClassLine::Bottled) - 232.5).abs() < 0.001);

    let april = engine.processing_report(DISTILLER, period(4)).unwrap();
    assert!((april.bottled.on_hand_first_of_month - 53.0).abs() < 0.001);
    assert!(april.bulk.on_hand_first_of_month.abs() < 0.001);
}

#[test]
fn test_destroyed_batch_leaves_storage_the_month_it_is_destroyed() {
    let mut ledger = catalog();
    let spirits = record_production(
        &mut ledger,
        &production(
            BatchType::Distillation,
            at(3, 19),
            at(3, 20),
            measured(100.0, 25.0),
            Vec::new(),
        ),
    )
    .unwrap();
    ledger.destroy(spirits, at(4, 10), at(4, 10)).unwrap();

    // A destroyed record is no longer a deposit, so March is flagged as unbalanced.
    let march = storage(&ledger, 3);
    assert!(storage_line(&march, StorageLine::DepositedInBulkStorage).abs() < 0.001);
    assert!((storage_line(&march, StorageLine::OnHandEndOfMonth) - 50.0).abs() < 0.001);
    assert_eq!(march.diagnostics.discrepancies.len(), 1);

    let april = storage(&ledger, 4);
    print_storage(&april);
    assert!((storage_line(&april, StorageLine::OnHandFirstOfMonth) - 50.0).abs() < 0.001);
    assert!((storage_line(&april, StorageLine::Destroyed) - 50.0).abs() < 0.001);
    assert!(storage_line(&april, StorageLine::OnHandEndOfMonth).abs() < 0.001);
    assert!(april.diagnostics.discrepancies.is_empty());

    let may = storage(&ledger, 5);
    assert!(may.row(WHISKEY).is_none());
}

#[test]
fn test_purchase_feeding_several_runs_deposits_once() {
    let mut ledger = catalog();
    let spirits = record_purchase(
        &mut ledger,
        &PurchaseIntake {
            distiller_id: DISTILLER,
            batch_type: BatchType::Distilled,
            received_at: at(5, 20),
            measurements: measured(150.0, 40.0),
            spirit_type: WHISKEY,
            material_kind: UNCATEGORIZED,
        },
    )
    .unwrap();
    for day in [10, 20] {
        record_production(
            &mut ledger,
            &production(
                BatchType::Blending,
                at(6, day - 1),
                at(6, day),
                measured(50.0, 40.0),
                vec![proof_of(spirits, 40.0)],
            ),
        )
        .unwrap();
    }

    let may = storage(&ledger, 5);
    assert!((storage_line(&may, StorageLine::DepositedInBulkStorage) - 120.0).abs() < 0.001);
    assert!((storage_line(&may, StorageLine::OnHandEndOfMonth) - 120.0).abs() < 0.001);

    let june = storage(&ledger, 6);
    assert!((storage_line(&june, StorageLine::OnHandFirstOfMonth) - 120.0).abs() < 0.001);
    assert!(storage_line(&june, StorageLine::DepositedInBulkStorage).abs() < 0.001);
    assert!((storage_line(&june, StorageLine::TransferredToProcessing) - 80.0).abs() < 0.001);
    assert!((storage_line(&june, StorageLine::OnHandEndOfMonth) - 40.0).abs() < 0.001);
    assert!(june.diagnostics.discrepancies.is_empty());
}

#[test]
fn test_uncategorized_chain_is_reported_as_gap() {
    let mut ledger = catalog();
    record_purchase(
        &mut ledger,
        &PurchaseIntake {
            distiller_id: DISTILLER,
            batch_type: BatchType::Distilled,
            received_at: at(8, 3),
            measurements: measured(10.0, 50.0),
            spirit_type: UNCATEGORIZED,
            material_kind: UNCATEGORIZED,
        },
    )
    .unwrap();

    let dropped = storage(&ledger, 8);
    assert!(dropped.rows.is_empty());
    assert!(dropped.diagnostics.is_partial());
    assert!(!dropped.diagnostics.traceability_gaps.is_empty());

    let config = EngineConfig {
        include_unknown_category: true,
        ..EngineConfig::default()
    };
    let engine = ReportEngine::new(&ledger, config).unwrap();
    let kept = engine.storage_report(DISTILLER, period(8)).unwrap();
    let unknown = kept.row(UNCATEGORIZED).unwrap();
    assert_eq!(unknown.category_name, "Unknown");
    assert!((unknown.get(StorageLine::DepositedInBulkStorage) - 10.0).abs() < 0.001);
}

#[test]
fn test_overdrawn_blend_fails_the_processing_report() {
    let (mut ledger, _, still) = wash_and_still();
    let blend = record_production(
        &mut ledger,
        &production(
            BatchType::Blending,
            at(3, 9),
            at(3, 10),
            measured(190.0, 25.0),
            vec![proof_of(still, 95.0)],
        ),
    )
    .unwrap();
    let bottling = ledger.next_transaction_id();
    let bottled = Measurements {
        volume: Some(300.0),
        weight: None,
        alcohol: Some(25.0),
        proof: Some(150.0),
    };
    ledger
        .insert_transaction(Transaction {
            id: bottling,
            distiller_id: DISTILLER,
            batch_type: BatchType::Bottling,
            status: Status::Active,
            state: State::Bottled,
            gauged: true,
            start_time: at(3, 20),
            end_time: at(3, 20),
            original: bottled,
            remaining: bottled,
        })
        .unwrap();
    ledger
        .insert_edge(LineageEdge {
            source_id: blend,
            target_id: bottling,
            field: ContentField::new(RecordKind::Production, State::Blended, ContentUnit::ProofGallons),
            quantity: 150.0,
        })
        .unwrap();

    let request = ReportRequest {
        distiller_id: DISTILLER,
        report_type: ReportType::Processing,
        period: period(3),
    };
    let err = generate_report(&ledger, &request, &EngineConfig::default()).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(err.period(), Some(period(3)));
    assert!(matches!(
        err,
        ReportError::NegativeBalance {
            part: 1,
            line: 25,
            ..
        }
    ));

    let err = generate_with_verification(&ledger, &request, &EngineConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        ReportError::ConservationViolation { transaction_id, .. } if transaction_id == blend
    ));
}

#[test]
fn test_rejected_production_leaves_ledger_untouched() {
    let (mut ledger, wash, _) = wash_and_still();
    let before = ledger.transactions_by_state_and_status(&TransactionQuery::for_distiller(DISTILLER)).unwrap();

    let result = record_production(
        &mut ledger,
        &production(
            BatchType::Distillation,
            at(3, 1),
            at(3, 2),
            measured(20.0, 25.0),
            vec![proof_of(wash, 5.0)],
        ),
    );
    assert!(result.is_err());
    assert_eq!(
        ledger
            .transactions_by_state_and_status(&TransactionQuery::for_distiller(DISTILLER))
            .unwrap(),
        before
    );
    assert!(ledger.verify_conservation(0.001).is_ok());
}

#[test]
fn test_storing_a_report_twice_is_idempotent() {
    let (ledger, _, _) = wash_and_still();
    let totals = TotalsLedger::new(InMemoryTotals::new());
    let config = EngineConfig {
        persist_reports: true,
        ..EngineConfig::default()
    };
    let engine = ReportEngine::new(&ledger, config).unwrap().with_totals(&totals);

    engine.storage_report(DISTILLER, period(2)).unwrap();
    let first = totals
        .period_cells(DISTILLER, ReportType::Storage, period(2))
        .unwrap();
    engine.storage_report(DISTILLER, period(2)).unwrap();
    let second = totals
        .period_cells(DISTILLER, ReportType::Storage, period(2))
        .unwrap();
    assert_eq!(first, second);

    let end_of_month = CellKey::new(
        DISTILLER,
        ReportType::Storage,
        1,
        StorageLine::OnHandEndOfMonth.number(),
        WHISKEY,
        period(2),
    );
    assert!((totals.get(&end_of_month).unwrap() - 95.0).abs() < 0.001);
}

#[test]
fn test_incremental_updates_track_new_transactions() {
    let mut ledger = catalog();
    let totals = TotalsLedger::new(InMemoryTotals::new());
    let key = |report: ReportType, part: u8, row: u32, column: CategoryId, month: u32| {
        CellKey::new(DISTILLER, report, part, row, column, period(month))
    };

    let wash = record_purchase(
        &mut ledger,
        &PurchaseIntake {
            distiller_id: DISTILLER,
            batch_type: BatchType::Fermented,
            received_at: at(1, 5),
            measurements: measured(1000.0, 5.0),
            spirit_type: WHISKEY,
            material_kind: CORN,
        },
    )
    .unwrap();
    {
        let engine = ReportEngine::new(&ledger, EngineConfig::default())
            .unwrap()
            .with_totals(&totals);
        let update = engine.record_transaction(DISTILLER, wash).unwrap();
        assert!(!update.deltas.is_empty());
        assert!(!update.balances.is_empty());
    }
    assert!((totals.get(&key(ReportType::Storage, 1, 2, WHISKEY, 1)).unwrap() - 100.0).abs() < 0.001);
    assert!((totals.get(&key(ReportType::Storage, 1, 1, WHISKEY, 2)).unwrap() - 100.0).abs() < 0.001);

    let still = record_production(
        &mut ledger,
        &production(
            BatchType::Distillation,
            at(2, 14),
            at(2, 15),
            measured(190.0, 25.0),
            vec![proof_of(wash, 100.0)],
        ),
    )
    .unwrap();
    let engine = ReportEngine::new(&ledger, EngineConfig::default())
        .unwrap()
        .with_totals(&totals);
    engine.record_transaction(DISTILLER, still).unwrap();

    assert!((totals.get(&key(ReportType::Storage, 1, 2, WHISKEY, 2)).unwrap() - 95.0).abs() < 0.001);
    assert!((totals.get(&key(ReportType::Storage, 1, 18, WHISKEY, 2)).unwrap() - 100.0).abs() < 0.001);
    assert!((totals.get(&key(ReportType::Storage, 1, 1, WHISKEY, 3)).unwrap() - 95.0).abs() < 0.001);
    assert!((totals.get(&key(ReportType::Production, 1, 10, WHISKEY, 2)).unwrap() - 95.0).abs() < 0.001);
    assert!((totals.get(&key(ReportType::Production, 1, 14, WHISKEY, 2)).unwrap() - 95.0).abs() < 0.001);
    assert!((totals.get(&key(ReportType::Production, 2, 1, CORN, 2)).unwrap() - 95.0).abs() < 0.001);

    let february = engine.storage_report(DISTILLER, period(2)).unwrap();
    assert!(
        (totals.get(&key(ReportType::Storage, 1, 1, WHISKEY, 2)).unwrap()
            - storage_line(&february, StorageLine::OnHandFirstOfMonth))
        .abs()
            < 0.001
    );
}

#[test]
fn test_incremental_openings_match_rebuilt_reports_months_later() -> anyhow::Result<()> {
    let mut ledger = catalog();
    let totals = TotalsLedger::new(InMemoryTotals::new());
    let record = |ledger: &InMemoryLedger, id: TransactionId| {
        let engine = ReportEngine::new(ledger, EngineConfig::default())
            .unwrap()
            .with_totals(&totals);
        engine.record_transaction(DISTILLER, id).unwrap();
    };

    let wash = record_purchase(
        &mut ledger,
        &PurchaseIntake {
            distiller_id: DISTILLER,
            batch_type: BatchType::Fermented,
            received_at: at(1, 5),
            measurements: measured(1000.0, 5.0),
            spirit_type: WHISKEY,
            material_kind: CORN,
        },
    )
    .unwrap();
    record(&ledger, wash);
    let still = record_production(
        &mut ledger,
        &production(
            BatchType::Distillation,
            at(2, 14),
            at(2, 15),
            measured(190.0, 25.0),
            vec![proof_of(wash, 100.0)],
        ),
    )
    .unwrap();
    record(&ledger, still);

    // Storage openings after the still run, before anything leaves storage.
    let key = |row: u32, month: u32| {
        CellKey::new(DISTILLER, ReportType::Storage, 1, row, WHISKEY, period(month))
    };
    for month in 3..=6 {
        let opening = totals.get(&key(1, month))?;
        assert!(opening >= 0.0);
        assert!((opening - 95.0).abs() < 0.001, "opening of {}", period(month));
    }

    let blend = record_production(
        &mut ledger,
        &production(
            BatchType::Blending,
            at(3, 9),
            at(3, 10),
            measured(186.0, 25.0),
            vec![proof_of(still, 95.0)],
        ),
    )
    .unwrap();
    record(&ledger, blend);

    for month in 1..=8 {
        let rebuilt = storage(&ledger, month);
        for line in [StorageLine::OnHandFirstOfMonth, StorageLine::OnHandEndOfMonth] {
            let stored = totals.get(&key(line.number(), month))?;
            assert!(
                (stored - storage_line(&rebuilt, line)).abs() < 0.001,
                "{:?} of {}: ledger {} report {}",
                line,
                period(month),
                stored,
                storage_line(&rebuilt, line)
            );
        }
    }
    let march = totals.get(&key(StorageLine::TransferredToProcessing.number(), 3))?;
    assert!((march - 95.0).abs() < 0.001);
    Ok(())
}

#[test]
fn test_config_and_request_from_json() -> anyhow::Result<()> {
    let config = EngineConfig::from_json_str(
        r#"{"max_lineage_depth": 8, "include_unknown_category": true}"#,
    )?;
    assert_eq!(config.max_lineage_depth, 8);
    assert!(config.include_unknown_category);
    assert!(!config.persist_reports);
    assert!((config.balance_tolerance - 0.001).abs() < 1e-12);
    assert!(EngineConfig::from_json_str(r#"{"balance_tolerance": -1.0}"#).is_err());

    let (ledger, _, _) = wash_and_still();
    let request = ReportRequest::from_json_str(
        r#"{"distiller_id": 1, "report_type": "Production", "period": "2023-02"}"#,
    )?;
    let report = generate_report(&ledger, &request, &config)?;
    let json = report.to_json()?;
    assert!(json.contains("\"report\": \"Production\""));
    assert!(json.contains("\"period\": \"2023-02\""));
    let read_back: Report = serde_json::from_str(&json)?;
    assert_eq!(read_back, report);
    match report {
        Report::Production(production) => {
            assert!((production.spirits_total.get(ProductionLine::ProducedTotal) - 95.0).abs() < 0.001)
        }
        other => panic!("expected a production report, got {:?}", other.header()),
    }
    Ok(())
}
