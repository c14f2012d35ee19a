//! CltvForge: customer lifetime value forecasting and segmentation CLI
//!
//! This is the main entrypoint that orchestrates data loading, model fitting,
//! reporting, export and single-customer prediction.

use anyhow::Result;
use clap::Parser;
use cltvforge::cli::Prediction;
use cltvforge::data::{
    write_historical_csv, write_results_csv, write_rfm_csv, LoadedTransactions,
};
use cltvforge::diagnostics::period_transactions;
use cltvforge::rfm::RfmSegment;
use cltvforge::{
    load_transactions, top_expected_purchasers, Args, CltvPipeline, CustomerSummary, Mode,
};
use std::time::Instant;

/// Largest purchase count shown separately in the calibration table
const CALIBRATION_BUCKETS: u32 = 7;

fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if args.verbose {
        println!("CltvForge - Customer Lifetime Value Forecasting");
        println!("===============================================\n");
    }

    let config = args.pipeline_config()?;
    let prediction = args.parse_prediction()?;
    if prediction.is_some() && args.mode != Mode::Probabilistic {
        anyhow::bail!("--predict is only available in probabilistic mode");
    }

    let start_time = Instant::now();
    let loaded = load_transactions(&args.input, &args.ingest_options(&config))?;
    print_ingest_summary(&args, &loaded);

    let pipeline = CltvPipeline::new(config)?;
    match (args.mode, prediction) {
        (Mode::Probabilistic, Some(prediction)) => {
            run_prediction_mode(&pipeline, &loaded, prediction)?
        }
        (Mode::Probabilistic, None) => run_probabilistic(&args, &pipeline, &loaded)?,
        (Mode::Historical, _) => run_historical(&args, &pipeline, &loaded)?,
        (Mode::Rfm, _) => run_rfm(&args, &pipeline, &loaded)?,
    }

    println!("\nTotal processing time: {:.2}s", start_time.elapsed().as_secs_f64());
    Ok(())
}

fn print_ingest_summary(args: &Args, loaded: &LoadedTransactions) {
    let report = &loaded.report;
    println!(
        "✓ Data loaded: {} transactions from {} ({} rows dropped)",
        report.kept,
        args.input,
        report.dropped()
    );
    if args.verbose {
        println!("  Missing customer id: {}", report.missing_customer);
        println!("  Bad customer id:     {}", report.bad_customer_id);
        println!("  Missing invoice:     {}", report.missing_invoice);
        println!("  Cancelled:           {}", report.cancelled);
        println!("  Quantity <= 0:       {}", report.non_positive_quantity);
        println!("  Price <= 0:          {}", report.non_positive_price);
        println!("  Bad timestamp:       {}", report.bad_timestamp);
        println!(
            "  Clamped outliers:    {} quantities, {} prices",
            report.clamped_quantity, report.clamped_price
        );
    }
}

/// Run full probabilistic pipeline
fn run_probabilistic(
    args: &Args,
    pipeline: &CltvPipeline,
    loaded: &LoadedTransactions,
) -> Result<()> {
    println!("\n=== Probabilistic CLTV (BG/NBD + Gamma-Gamma) ===\n");

    let fit_start = Instant::now();
    let validated = pipeline.summarize(&loaded.records)?;
    let eligible: Vec<CustomerSummary> = validated
        .summaries
        .iter()
        .filter(|s| s.is_repeat_customer())
        .cloned()
        .collect();
    let report = pipeline.run_summaries(validated)?;

    println!("✓ Models fitted on {} repeat customers", report.rows.len());
    println!(
        "  Excluded: {} single-purchase, {} invalid",
        report.excluded_single_purchase,
        report.dropped.len()
    );
    if args.verbose {
        println!("  Fitting time: {:.2}s", fit_start.elapsed().as_secs_f64());
    }

    let bg = &report.count_model;
    println!(
        "\nBG/NBD:      r={:.4} alpha={:.4} a={:.4} b={:.4} ({} iterations)",
        bg.params.r, bg.params.alpha, bg.params.a, bg.params.b, bg.iterations
    );
    let gg = &report.monetary_model;
    println!(
        "Gamma-Gamma: p={:.4} q={:.4} v={:.4} ({} iterations)",
        gg.params.p, gg.params.q, gg.params.v, gg.iterations
    );
    match gg.population_mean() {
        Some(mean) => println!("  Population mean spend: {mean:.2}"),
        None => println!("  Population mean spend: undefined (q <= 1)"),
    }

    for &horizon in &report.horizons {
        println!("\nTop {} expected purchasers, next {} weeks:", args.top, horizon);
        let ranked = top_expected_purchasers(bg, &eligible, f64::from(horizon), args.top);
        for (customer_id, expected) in ranked {
            println!("  {customer_id:>10}  {expected:>8.3}");
        }
    }

    println!("\n=== Segment Statistics ===");
    for stats in report.segment_stats() {
        let percentage = stats.customers as f64 / report.rows.len() as f64 * 100.0;
        println!(
            "Segment {}: {} customers ({:.1}%), mean CLV {:.2}, total CLV {:.2}",
            stats.tier, stats.customers, percentage, stats.mean_clv, stats.total_clv
        );
    }
    if report.segmentation.degenerate {
        println!("  (fewer distinct values than segments; some segments are empty)");
    }

    if args.verbose {
        let histories: Vec<_> = eligible.iter().map(CustomerSummary::history).collect();
        println!("\n=== Calibration (repeat customers by purchase count) ===");
        print!("{}", period_transactions(bg, &histories, CALIBRATION_BUCKETS));
    }

    if let Some(ref output) = args.output {
        write_results_csv(&report, output)?;
        println!("\n✓ Results saved to: {output}");
    }
    Ok(())
}

/// Run prediction mode for a single purchase history
fn run_prediction_mode(
    pipeline: &CltvPipeline,
    loaded: &LoadedTransactions,
    prediction: Prediction,
) -> Result<()> {
    println!("=== Prediction Mode ===");
    let Prediction { history, monetary } = prediction;
    println!(
        "Input: frequency={}, recency={}, age={}, monetary={}",
        history.frequency, history.recency, history.age, monetary
    );

    let report = pipeline.run(&loaded.records)?;
    let forecast = report.predict_customer(&history, monetary)?;

    println!("\n✓ Predicted segment: {}", forecast.segment);
    for (horizon, expected) in &forecast.expected_purchases {
        println!("  Expected purchases, next {horizon} weeks: {expected:.3}");
    }
    println!("  Probability alive:       {:.3}", forecast.probability_alive);
    println!("  Expected average profit: {:.2}", forecast.expected_average_profit);
    println!("  CLV:                     {:.2}", forecast.clv);
    Ok(())
}

fn run_historical(args: &Args, pipeline: &CltvPipeline, loaded: &LoadedTransactions) -> Result<()> {
    println!("\n=== Historical CLTV ===\n");
    let report = pipeline.historical(&loaded.records)?;

    println!("✓ {} customers valued", report.customer_count);
    println!("  Repeat rate: {:.3}", report.repeat_rate);
    println!("  Churn rate:  {:.3}", report.churn_rate);

    println!("\n=== Segment Statistics ===");
    for bucket in (0..report.segmentation.buckets).rev() {
        let members: Vec<_> = report.rows.iter().filter(|r| r.segment.bucket == bucket).collect();
        let Some(first) = members.first() else {
            continue;
        };
        let total: f64 = members.iter().map(|r| r.cltv).sum();
        println!(
            "Segment {}: {} customers, mean CLTV {:.2}, total CLTV {:.2}",
            first.segment,
            members.len(),
            total / members.len() as f64,
            total
        );
    }

    if let Some(ref output) = args.output {
        write_historical_csv(&report, output)?;
        println!("\n✓ Results saved to: {output}");
    }
    Ok(())
}

fn run_rfm(args: &Args, pipeline: &CltvPipeline, loaded: &LoadedTransactions) -> Result<()> {
    println!("\n=== RFM Segmentation ===\n");
    let rows = pipeline.rfm(&loaded.records)?;
    println!("✓ {} customers scored", rows.len());

    for segment in RfmSegment::ALL.iter().rev() {
        let members: Vec<_> = rows.iter().filter(|r| r.segment == *segment).collect();
        if members.is_empty() {
            continue;
        }
        let n = members.len() as f64;
        println!(
            "{:<20} {:>6} customers  recency {:>7.1}d  frequency {:>6.2}  monetary {:>10.2}",
            segment.as_str(),
            members.len(),
            members.iter().map(|r| r.recency_days as f64).sum::<f64>() / n,
            members.iter().map(|r| f64::from(r.frequency)).sum::<f64>() / n,
            members.iter().map(|r| r.monetary).sum::<f64>() / n
        );
    }

    if let Some(ref output) = args.output {
        write_rfm_csv(&rows, output)?;
        println!("\n✓ Results saved to: {output}");
    }
    Ok(())
}
