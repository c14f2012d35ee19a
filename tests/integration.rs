//! Integration tests for CltvForge

use chrono::{Duration, NaiveDate, NaiveDateTime};
use cltvforge::data::{write_results_csv, LoadedTransactions};
use cltvforge::rfm::RfmSegment;
use cltvforge::{
    load_transactions, CltvError, CltvPipeline, IngestOptions, PipelineConfig, PurchaseHistory,
    ValidationPolicy,
};
use std::io::Write;
use tempfile::NamedTempFile;

fn cutoff() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2011, 12, 11)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

/// Create a test CSV file with 40 repeat customers, 5 one-off customers and
/// two rows the loader must drop
fn create_test_csv() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "InvoiceNo,StockCode,Description,Quantity,InvoiceDate,UnitPrice,CustomerID,Country"
    )
    .unwrap();

    let base = NaiveDate::from_ymd_opt(2011, 1, 3)
        .unwrap()
        .and_hms_opt(9, 0, 0)
        .unwrap();
    for c in 0..40i64 {
        let purchases = 2 + (c * 7) % 9;
        let first = base + Duration::days((c * 11) % 120);
        let gap = 3 + (c * 5) % 17;
        let price = 1.25 + (c % 7) as f64 * 0.85;
        for k in 0..purchases {
            let ts = first + Duration::days(k * gap) + Duration::hours(k % 4);
            writeln!(
                file,
                "{},22633,HAND WARMER UNION JACK,{},{},{:.2},{},United Kingdom",
                500_000 + c * 100 + k,
                1 + (c + k) % 5,
                ts.format("%Y-%m-%d %H:%M:%S"),
                price,
                12_000 + c
            )
            .unwrap();
        }
    }

    // One-off customers
    for j in 0..5 {
        writeln!(
            file,
            "{},84406B,CREAM CUPID HEARTS COAT HANGER,2,2011-06-0{} 10:00:00,3.00,{},United Kingdom",
            560_000 + j,
            j + 1,
            12_100 + j
        )
        .unwrap();
    }

    // Cancellation and a return
    writeln!(file, "C570000,22633,HAND WARMER UNION JACK,1,2011-07-01 10:00:00,2.95,12000,United Kingdom").unwrap();
    writeln!(file, "570001,22633,HAND WARMER UNION JACK,-3,2011-07-02 10:00:00,2.95,12001,United Kingdom").unwrap();

    file
}

fn load(file: &NamedTempFile) -> LoadedTransactions {
    load_transactions(file.path(), &IngestOptions::default()).unwrap()
}

fn pipeline() -> CltvPipeline {
    CltvPipeline::new(PipelineConfig {
        analysis_cutoff: cutoff(),
        ..PipelineConfig::default()
    })
    .unwrap()
}

#[test]
fn test_end_to_end_pipeline() {
    let test_file = create_test_csv();
    let loaded = load(&test_file);

    // Verify data loading
    assert_eq!(loaded.report.rows_read, 246);
    assert_eq!(loaded.report.kept, 244);
    assert_eq!(loaded.report.cancelled, 1);
    assert_eq!(loaded.report.non_positive_quantity, 1);

    let report = pipeline().run(&loaded.records).unwrap();

    // Verify the cohort
    assert_eq!(report.rows.len(), 40);
    assert_eq!(report.excluded_single_purchase, 5);
    assert!(report.dropped.is_empty());
    assert_eq!(report.horizons, vec![1, 4, 12]);

    // Verify fitted parameters
    let bg = report.count_model.params;
    assert!((bg.r - 5.75).abs() / 5.75 < 0.02, "{bg:?}");
    assert!((bg.alpha - 6.44).abs() / 6.44 < 0.02, "{bg:?}");
    assert!((bg.a - 2.14).abs() / 2.14 < 0.02, "{bg:?}");
    assert!((bg.b - 8.17).abs() / 8.17 < 0.02, "{bg:?}");
    let gg = report.monetary_model.params;
    assert!((gg.p - 3.36).abs() / 3.36 < 0.02, "{gg:?}");
    assert!((gg.q - 1.53).abs() / 1.53 < 0.02, "{gg:?}");
    assert!((gg.v - 3.24).abs() / 3.24 < 0.02, "{gg:?}");
    assert!(report.monetary_model.population_mean().is_some());

    // Verify per-customer columns
    for row in &report.rows {
        assert!(row.frequency > 1);
        assert!(row.age >= row.recency);
        assert_eq!(row.expected_purchases.len(), 3);
        assert!(row.expected_purchases[0] <= row.expected_purchases[1]);
        assert!(row.expected_purchases[1] <= row.expected_purchases[2]);
        assert!((0.0..=1.0).contains(&row.probability_alive));
        assert!(row.expected_average_profit > 0.0);
        assert!(row.clv > 0.0);
    }

    // Verify segments partition the cohort and follow the value order
    assert_eq!(report.segmentation.bucket_sizes(), vec![10; 4]);
    let best = report
        .rows
        .iter()
        .max_by(|a, b| a.clv.total_cmp(&b.clv))
        .unwrap();
    assert_eq!(best.segment.letter(), 'A');
    let stats = report.segment_stats();
    assert_eq!(stats.len(), 4);
    assert!(stats.windows(2).all(|w| w[0].mean_clv >= w[1].mean_clv));
    assert_eq!(stats.iter().map(|s| s.customers).sum::<usize>(), 40);
}

#[test]
fn test_runs_are_deterministic() {
    let test_file = create_test_csv();
    let loaded = load(&test_file);

    let first = pipeline().run(&loaded.records).unwrap();
    let second = pipeline().run(&loaded.records).unwrap();
    assert_eq!(first.count_model.params, second.count_model.params);
    assert_eq!(first.monetary_model.params, second.monetary_model.params);
    assert_eq!(first.rows, second.rows);
}

#[test]
fn test_prediction() {
    let test_file = create_test_csv();
    let loaded = load(&test_file);
    let report = pipeline().run(&loaded.records).unwrap();

    let loyal = PurchaseHistory {
        frequency: 10.0,
        recency: 30.0,
        age: 32.0,
    };
    let lapsed = PurchaseHistory {
        frequency: 2.0,
        recency: 1.0,
        age: 40.0,
    };
    let strong = report.predict_customer(&loyal, 30.0).unwrap();
    let weak = report.predict_customer(&lapsed, 5.0).unwrap();

    assert!(strong.clv > weak.clv);
    assert!(strong.probability_alive > weak.probability_alive);
    assert_eq!(strong.expected_purchases.len(), 3);
    assert_eq!(strong.expected_purchases[2].0, 12);
    assert!(strong.segment.bucket >= weak.segment.bucket);

    let impossible = PurchaseHistory {
        frequency: 3.0,
        recency: 10.0,
        age: 5.0,
    };
    assert!(matches!(
        report.predict_customer(&impossible, 10.0),
        Err(CltvError::InvalidHistory { .. })
    ));
    assert!(matches!(
        report.predict_customer(&loyal, 0.0),
        Err(CltvError::InvalidMonetary { .. })
    ));
}

#[test]
fn test_results_csv_export() {
    let test_file = create_test_csv();
    let loaded = load(&test_file);
    let report = pipeline().run(&loaded.records).unwrap();

    let output = NamedTempFile::new().unwrap();
    write_results_csv(&report, output.path()).unwrap();

    let written = std::fs::read_to_string(output.path()).unwrap();
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines.len(), 41);
    assert_eq!(
        lines[0],
        "customer_id,recency,age,frequency,monetary,expected_purchases_1,expected_purchases_4,\
         expected_purchases_12,probability_alive,expected_average_profit,clv,segment"
    );
    assert!(lines[1].starts_with("12000,"));
}

#[test]
fn test_purchase_after_cutoff() {
    let test_file = create_test_csv();
    let loaded = load(&test_file);

    // Customers whose history runs past the cutoff break age >= recency.
    let early = NaiveDate::from_ymd_opt(2011, 6, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    let strict = CltvPipeline::new(PipelineConfig {
        analysis_cutoff: early,
        ..PipelineConfig::default()
    })
    .unwrap();
    assert!(matches!(
        strict.run(&loaded.records),
        Err(CltvError::InvalidSummary { .. })
    ));

    let lenient = CltvPipeline::new(PipelineConfig {
        analysis_cutoff: early,
        validation: ValidationPolicy::Lenient,
        ..PipelineConfig::default()
    })
    .unwrap();
    let validated = lenient.summarize(&loaded.records).unwrap();
    assert!(!validated.dropped.is_empty());
    assert!(validated.summaries.iter().all(|s| s.age >= s.recency));
}

#[test]
fn test_historical_mode() {
    let test_file = create_test_csv();
    let loaded = load(&test_file);
    let report = pipeline().historical(&loaded.records).unwrap();

    assert_eq!(report.customer_count, 45);
    assert!((report.churn_rate - 5.0 / 45.0).abs() < 1e-12);
    assert_eq!(report.rows.len(), 45);
    assert!(report.rows.iter().all(|r| r.cltv > 0.0));
}

#[test]
fn test_rfm_mode() {
    let test_file = create_test_csv();
    let loaded = load(&test_file);
    let rows = pipeline().rfm(&loaded.records).unwrap();

    assert_eq!(rows.len(), 45);
    for score in 1..=5u8 {
        assert_eq!(rows.iter().filter(|r| r.recency_score == score).count(), 9);
        assert_eq!(rows.iter().filter(|r| r.monetary_score == score).count(), 9);
    }
    for row in &rows {
        assert_eq!(
            RfmSegment::from_scores(row.recency_score, row.frequency_score),
            Some(row.segment)
        );
    }
    // One-off customers have the lowest frequency score
    let one_off = rows.iter().find(|r| r.customer_id == 12_100).unwrap();
    assert_eq!(one_off.frequency, 1);
    assert_eq!(one_off.frequency_score, 1);
}
