//! Transaction loading and result export using Polars

use std::fs::File;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime};
use polars::prelude::*;

use crate::config::ValidationPolicy;
use crate::historical::HistoricalReport;
use crate::pipeline::CltvReport;
use crate::rfm::RfmRow;

pub type CustomerId = i64;

/// Lower quantile used for the outlier limits
pub const LOWER_QUANTILE: f64 = 0.01;
/// Upper quantile used for the outlier limits
pub const UPPER_QUANTILE: f64 = 0.99;

const INVOICE_COLUMNS: &[&str] = &["InvoiceNo", "Invoice"];
const QUANTITY_COLUMNS: &[&str] = &["Quantity"];
const DATE_COLUMNS: &[&str] = &["InvoiceDate"];
const PRICE_COLUMNS: &[&str] = &["UnitPrice", "Price"];
const CUSTOMER_COLUMNS: &[&str] = &["CustomerID", "Customer ID"];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M",
];

/// One line item of a purchase event
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub customer_id: CustomerId,
    /// Purchase-event identifier; line items sharing it form one purchase
    pub invoice: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub timestamp: NaiveDateTime,
}

impl TransactionRecord {
    pub fn total(&self) -> f64 {
        self.quantity * self.unit_price
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IngestOptions {
    /// Strict fails on an unreadable customer id or timestamp, lenient drops
    /// the row
    pub policy: ValidationPolicy,
    /// Cap quantity and unit price at the IQR outlier limits
    pub clamp_outliers: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            policy: ValidationPolicy::Strict,
            clamp_outliers: true,
        }
    }
}

/// Row counts per ingestion outcome
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub rows_read: usize,
    pub kept: usize,
    pub missing_customer: usize,
    /// Customer id present but not an integer
    pub bad_customer_id: usize,
    pub missing_invoice: usize,
    pub cancelled: usize,
    pub non_positive_quantity: usize,
    pub non_positive_price: usize,
    pub bad_timestamp: usize,
    pub clamped_quantity: usize,
    pub clamped_price: usize,
}

impl IngestReport {
    pub fn dropped(&self) -> usize {
        self.rows_read - self.kept
    }
}

#[derive(Debug, Clone)]
pub struct LoadedTransactions {
    pub records: Vec<TransactionRecord>,
    pub report: IngestReport,
}

/// Load a retail transaction CSV and filter it down to valid purchases.
///
/// Rows without a customer id, cancelled invoices (`C` prefix) and rows with
/// a non-positive quantity or price are dropped and counted. A customer id or
/// timestamp that is present but unreadable fails the load under the strict
/// policy.
pub fn load_transactions(
    path: impl AsRef<Path>,
    options: &IngestOptions,
) -> crate::Result<LoadedTransactions> {
    let path = path.as_ref();
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(10_000))
        .try_into_reader_with_file_path(Some(path.to_path_buf()))
        .with_context(|| format!("Failed to open {}", path.display()))?
        .finish()
        .with_context(|| format!("Failed to parse CSV {}", path.display()))?;

    let names: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
    let invoice_col = resolve_column(&names, INVOICE_COLUMNS)?;
    let quantity_col = resolve_column(&names, QUANTITY_COLUMNS)?;
    let date_col = resolve_column(&names, DATE_COLUMNS)?;
    let price_col = resolve_column(&names, PRICE_COLUMNS)?;
    let customer_col = resolve_column(&names, CUSTOMER_COLUMNS)?;

    let customers = df.column(customer_col)?.cast(&DataType::String)?;
    let customers: Vec<Option<&str>> = customers.str()?.into_iter().collect();
    let invoices = df.column(invoice_col)?.cast(&DataType::String)?;
    let invoices: Vec<Option<&str>> = invoices.str()?.into_iter().collect();
    let quantities = df.column(quantity_col)?.cast(&DataType::Float64)?;
    let quantities: Vec<Option<f64>> = quantities.f64()?.into_iter().collect();
    let prices = df.column(price_col)?.cast(&DataType::Float64)?;
    let prices: Vec<Option<f64>> = prices.f64()?.into_iter().collect();
    let dates = df.column(date_col)?.cast(&DataType::String)?;
    let dates: Vec<Option<&str>> = dates.str()?.into_iter().collect();

    let mut report = IngestReport {
        rows_read: df.height(),
        ..IngestReport::default()
    };
    let mut records = Vec::with_capacity(df.height());

    for row in 0..df.height() {
        let Some(raw_customer) = customers[row].map(str::trim).filter(|s| !s.is_empty()) else {
            report.missing_customer += 1;
            continue;
        };
        let customer_id = match parse_customer_id(raw_customer) {
            Some(id) => id,
            None if options.policy == ValidationPolicy::Lenient => {
                report.bad_customer_id += 1;
                continue;
            }
            None => anyhow::bail!("Row {}: unparseable {customer_col} {raw_customer:?}", row + 1),
        };
        let Some(invoice) = invoices[row].map(str::trim).filter(|s| !s.is_empty()) else {
            report.missing_invoice += 1;
            continue;
        };
        if invoice.starts_with('C') {
            report.cancelled += 1;
            continue;
        }
        let Some(quantity) = quantities[row].filter(|q| *q > 0.0) else {
            report.non_positive_quantity += 1;
            continue;
        };
        let Some(unit_price) = prices[row].filter(|p| *p > 0.0) else {
            report.non_positive_price += 1;
            continue;
        };
        let timestamp = match dates[row].and_then(parse_timestamp) {
            Some(ts) => ts,
            None if options.policy == ValidationPolicy::Lenient => {
                report.bad_timestamp += 1;
                continue;
            }
            None => anyhow::bail!(
                "Row {}: missing or unparseable {date_col} {:?}",
                row + 1,
                dates[row].unwrap_or("")
            ),
        };

        records.push(TransactionRecord {
            customer_id,
            invoice: invoice.to_string(),
            quantity,
            unit_price,
            timestamp,
        });
    }
    report.kept = records.len();

    if options.clamp_outliers {
        let (quantity, price) = clamp_outliers(&mut records, LOWER_QUANTILE, UPPER_QUANTILE);
        report.clamped_quantity = quantity;
        report.clamped_price = price;
    }

    log::info!(
        "Loaded {} of {} rows from {} ({} dropped)",
        report.kept,
        report.rows_read,
        path.display(),
        report.dropped()
    );
    log::debug!("Ingestion report: {report:?}");

    if records.is_empty() {
        anyhow::bail!("No valid transactions found in {}", path.display());
    }

    Ok(LoadedTransactions { records, report })
}

fn resolve_column<'a>(names: &'a [String], candidates: &[&str]) -> crate::Result<&'a str> {
    names
        .iter()
        .find(|name| candidates.contains(&name.trim()))
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("Missing column: expected one of {candidates:?}"))
}

/// Ids come through as `17850` or, from float-typed columns, `17850.0`.
fn parse_customer_id(raw: &str) -> Option<CustomerId> {
    if let Ok(id) = raw.parse::<CustomerId>() {
        return Some(id);
    }
    let value: f64 = raw.parse().ok()?;
    (value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15)
        .then_some(value as CustomerId)
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.naive_utc());
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// Cap quantity and unit price at `q_hi + 1.5 * (q_hi - q_lo)` and floor them
/// at `q_lo - 1.5 * (q_hi - q_lo)`.
///
/// Returns how many quantities and prices were changed.
pub fn clamp_outliers(
    records: &mut [TransactionRecord],
    lower_q: f64,
    upper_q: f64,
) -> (usize, usize) {
    let quantities: Vec<f64> = records.iter().map(|r| r.quantity).collect();
    let prices: Vec<f64> = records.iter().map(|r| r.unit_price).collect();

    let mut clamped = (0, 0);
    if let Some((low, high)) = outlier_limits(&quantities, lower_q, upper_q) {
        for record in records.iter_mut() {
            let capped = record.quantity.clamp(low, high);
            if capped != record.quantity {
                record.quantity = capped;
                clamped.0 += 1;
            }
        }
    }
    if let Some((low, high)) = outlier_limits(&prices, lower_q, upper_q) {
        for record in records.iter_mut() {
            let capped = record.unit_price.clamp(low, high);
            if capped != record.unit_price {
                record.unit_price = capped;
                clamped.1 += 1;
            }
        }
    }
    if clamped != (0, 0) {
        log::info!(
            "Clamped {} quantities and {} unit prices to outlier limits",
            clamped.0,
            clamped.1
        );
    }
    clamped
}

fn outlier_limits(values: &[f64], lower_q: f64, upper_q: f64) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let low = quantile(&sorted, lower_q);
    let high = quantile(&sorted, upper_q);
    let spread = high - low;
    Some((low - 1.5 * spread, high + 1.5 * spread))
}

/// Linear-interpolation quantile of sorted values.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let below = pos.floor() as usize;
    let above = pos.ceil() as usize;
    sorted[below] + (sorted[above] - sorted[below]) * (pos - below as f64)
}

/// Write the per-customer probabilistic CLTV table.
pub fn write_results_csv(report: &CltvReport, path: impl AsRef<Path>) -> crate::Result<()> {
    let rows = &report.rows;
    let mut columns = vec![
        Series::new("customer_id", rows.iter().map(|r| r.customer_id).collect::<Vec<_>>()),
        Series::new("recency", rows.iter().map(|r| r.recency).collect::<Vec<_>>()),
        Series::new("age", rows.iter().map(|r| r.age).collect::<Vec<_>>()),
        Series::new(
            "frequency",
            rows.iter().map(|r| i64::from(r.frequency)).collect::<Vec<_>>(),
        ),
        Series::new("monetary", rows.iter().map(|r| r.monetary).collect::<Vec<_>>()),
    ];
    for (i, horizon) in report.horizons.iter().enumerate() {
        columns.push(Series::new(
            &format!("expected_purchases_{horizon}"),
            rows.iter().map(|r| r.expected_purchases[i]).collect::<Vec<_>>(),
        ));
    }
    columns.extend([
        Series::new(
            "probability_alive",
            rows.iter().map(|r| r.probability_alive).collect::<Vec<_>>(),
        ),
        Series::new(
            "expected_average_profit",
            rows.iter().map(|r| r.expected_average_profit).collect::<Vec<_>>(),
        ),
        Series::new("clv", rows.iter().map(|r| r.clv).collect::<Vec<_>>()),
        Series::new(
            "segment",
            rows.iter().map(|r| r.segment.to_string()).collect::<Vec<_>>(),
        ),
    ]);
    write_frame(DataFrame::new(columns)?, path.as_ref())
}

pub fn write_rfm_csv(rows: &[RfmRow], path: impl AsRef<Path>) -> crate::Result<()> {
    let df = DataFrame::new(vec![
        Series::new("customer_id", rows.iter().map(|r| r.customer_id).collect::<Vec<_>>()),
        Series::new(
            "recency_days",
            rows.iter().map(|r| r.recency_days).collect::<Vec<_>>(),
        ),
        Series::new(
            "frequency",
            rows.iter().map(|r| i64::from(r.frequency)).collect::<Vec<_>>(),
        ),
        Series::new("monetary", rows.iter().map(|r| r.monetary).collect::<Vec<_>>()),
        Series::new(
            "recency_score",
            rows.iter().map(|r| i64::from(r.recency_score)).collect::<Vec<_>>(),
        ),
        Series::new(
            "frequency_score",
            rows.iter().map(|r| i64::from(r.frequency_score)).collect::<Vec<_>>(),
        ),
        Series::new(
            "monetary_score",
            rows.iter().map(|r| i64::from(r.monetary_score)).collect::<Vec<_>>(),
        ),
        Series::new("rf_score", rows.iter().map(RfmRow::score_code).collect::<Vec<_>>()),
        Series::new(
            "segment",
            rows.iter().map(|r| r.segment.as_str()).collect::<Vec<_>>(),
        ),
    ])?;
    write_frame(df, path.as_ref())
}

pub fn write_historical_csv(
    report: &HistoricalReport,
    path: impl AsRef<Path>,
) -> crate::Result<()> {
    let rows = &report.rows;
    let df = DataFrame::new(vec![
        Series::new("customer_id", rows.iter().map(|r| r.customer_id).collect::<Vec<_>>()),
        Series::new(
            "transactions",
            rows.iter().map(|r| i64::from(r.transactions)).collect::<Vec<_>>(),
        ),
        Series::new("total_spend", rows.iter().map(|r| r.total_spend).collect::<Vec<_>>()),
        Series::new(
            "average_order_value",
            rows.iter().map(|r| r.average_order_value).collect::<Vec<_>>(),
        ),
        Series::new(
            "purchase_frequency",
            rows.iter().map(|r| r.purchase_frequency).collect::<Vec<_>>(),
        ),
        Series::new(
            "profit_margin",
            rows.iter().map(|r| r.profit_margin).collect::<Vec<_>>(),
        ),
        Series::new(
            "customer_value",
            rows.iter().map(|r| r.customer_value).collect::<Vec<_>>(),
        ),
        Series::new("cltv", rows.iter().map(|r| r.cltv).collect::<Vec<_>>()),
        Series::new(
            "segment",
            rows.iter().map(|r| r.segment.to_string()).collect::<Vec<_>>(),
        ),
    ])?;
    write_frame(df, path.as_ref())
}

fn write_frame(mut df: DataFrame, path: &Path) -> crate::Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    CsvWriter::new(&mut file).include_header(true).finish(&mut df)?;
    log::info!("Wrote {} rows to {}", df.height(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_csv() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "InvoiceNo,StockCode,Description,Quantity,InvoiceDate,UnitPrice,CustomerID,Country").unwrap();
        writeln!(file, "536365,85123A,WHITE HANGING HEART T-LIGHT HOLDER,6,2010-12-01T08:26:00Z,2.55,17850,United Kingdom").unwrap();
        writeln!(file, "536365,71053,WHITE METAL LANTERN,6,2010-12-01T08:26:00Z,3.39,17850,United Kingdom").unwrap();
        writeln!(file, "536366,22633,HAND WARMER UNION JACK,6,2010-12-01 08:28:00,1.85,17850,United Kingdom").unwrap();
        writeln!(file, "536367,84406B,CREAM CUPID HEARTS COAT HANGER,8,12/01/2010 08:34,2.75,13047,United Kingdom").unwrap();
        writeln!(file, "C536379,D,Discount,1,2010-12-01 09:41:00,27.50,14527,United Kingdom").unwrap();
        writeln!(file, "536380,22961,JAM MAKING SET PRINTED,-2,2010-12-01 09:45:00,1.45,13047,United Kingdom").unwrap();
        writeln!(file, "536381,22139,RETROSPOT TEA SET CERAMIC,1,2010-12-01 09:50:00,0.0,13047,United Kingdom").unwrap();
        writeln!(file, "536382,21730,GLASS STAR FROSTED T-LIGHT HOLDER,6,2010-12-01 09:52:00,4.25,,United Kingdom").unwrap();
        file
    }

    #[test]
    fn test_load_transactions_filters_invalid_rows() {
        let file = create_test_csv();
        let loaded = load_transactions(file.path(), &IngestOptions::default()).unwrap();

        assert_eq!(loaded.records.len(), 4);
        let report = &loaded.report;
        assert_eq!(report.rows_read, 8);
        assert_eq!(report.kept, 4);
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.non_positive_quantity, 1);
        assert_eq!(report.non_positive_price, 1);
        assert_eq!(report.missing_customer, 1);
        assert_eq!(report.dropped(), 4);

        let first = &loaded.records[0];
        assert_eq!(first.customer_id, 17850);
        assert_eq!(first.invoice, "536365");
        assert!((first.total() - 15.3).abs() < 1e-9);
        assert_eq!(first.timestamp.to_string(), "2010-12-01 08:26:00");
        assert_eq!(loaded.records[3].timestamp.to_string(), "2010-12-01 08:34:00");
    }

    #[test]
    fn test_alternate_column_names() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "Invoice,StockCode,Quantity,InvoiceDate,Price,Customer ID").unwrap();
        writeln!(file, "489434,85048,12,2009-12-01 07:45:00,6.95,13085").unwrap();
        writeln!(file, "489435,22350,6,2009-12-02 07:46:00,2.10,13085").unwrap();

        let loaded = load_transactions(file.path(), &IngestOptions::default()).unwrap();
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.records[1].invoice, "489435");
    }

    #[test]
    fn test_bad_timestamp_strict_and_lenient() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "InvoiceNo,Quantity,InvoiceDate,UnitPrice,CustomerID").unwrap();
        writeln!(file, "1001,2,2011-01-05 10:00:00,3.5,12001").unwrap();
        writeln!(file, "1002,1,not a date,3.5,12001").unwrap();

        assert!(load_transactions(file.path(), &IngestOptions::default()).is_err());

        let lenient = IngestOptions {
            policy: ValidationPolicy::Lenient,
            clamp_outliers: true,
        };
        let loaded = load_transactions(file.path(), &lenient).unwrap();
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.report.bad_timestamp, 1);
    }

    #[test]
    fn test_non_numeric_customer_id_strict_and_lenient() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "InvoiceNo,Quantity,InvoiceDate,UnitPrice,CustomerID").unwrap();
        writeln!(file, "1001,2,2011-01-05 10:00:00,3.5,12001").unwrap();
        writeln!(file, "1002,1,2011-01-06 10:00:00,3.5,CUST-A").unwrap();
        writeln!(file, "1003,1,2011-01-07 10:00:00,3.5,CUST-B").unwrap();
        writeln!(file, "1004,1,2011-01-08 10:00:00,3.5,").unwrap();

        let err = load_transactions(file.path(), &IngestOptions::default()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Row 2"), "{message}");
        assert!(message.contains("CUST-A"), "{message}");

        let lenient = IngestOptions {
            policy: ValidationPolicy::Lenient,
            clamp_outliers: true,
        };
        let loaded = load_transactions(file.path(), &lenient).unwrap();
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.records[0].customer_id, 12001);
        assert_eq!(loaded.report.bad_customer_id, 2);
        assert_eq!(loaded.report.missing_customer, 1);
        assert_eq!(loaded.report.dropped(), 3);
    }

    #[test]
    fn test_parse_customer_id() {
        assert_eq!(parse_customer_id("17850"), Some(17850));
        assert_eq!(parse_customer_id("17850.0"), Some(17850));
        assert_eq!(parse_customer_id("17850.5"), None);
        assert_eq!(parse_customer_id("CUST-A"), None);
        assert_eq!(parse_customer_id("NaN"), None);
    }

    #[test]
    fn test_missing_column_is_reported() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "InvoiceNo,Quantity,UnitPrice,CustomerID").unwrap();
        writeln!(file, "1001,2,3.5,12001").unwrap();

        let err = load_transactions(file.path(), &IngestOptions::default()).unwrap_err();
        assert!(err.to_string().contains("InvoiceDate"));
    }

    #[test]
    fn test_clamp_outliers_caps_extremes() {
        let ts = parse_timestamp("2011-01-01 00:00:00").unwrap();
        let mut records: Vec<TransactionRecord> = (0..200)
            .map(|i| TransactionRecord {
                customer_id: 1,
                invoice: format!("I{i}"),
                quantity: f64::from(1 + i % 10),
                unit_price: 2.0,
                timestamp: ts,
            })
            .collect();
        records.push(TransactionRecord {
            customer_id: 2,
            invoice: "BIG".to_string(),
            quantity: 10_000.0,
            unit_price: 2.0,
            timestamp: ts,
        });

        let (quantity, price) = clamp_outliers(&mut records, LOWER_QUANTILE, UPPER_QUANTILE);
        assert_eq!((quantity, price), (1, 0));
        assert!((records[200].quantity - 23.5).abs() < 1e-9);
        assert_eq!(records[0].quantity, 1.0);
    }

    #[test]
    fn test_quantile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile(&sorted, 0.0), 1.0);
        assert_eq!(quantile(&sorted, 1.0), 5.0);
        assert!((quantile(&sorted, 0.5) - 3.0).abs() < 1e-12);
        assert!((quantile(&sorted, 0.99) - 4.96).abs() < 1e-12);
    }

    #[test]
    fn test_write_rfm_csv() {
        use crate::rfm::RfmSegment;

        let rows = vec![RfmRow {
            customer_id: 12346,
            recency_days: 3,
            frequency: 7,
            monetary: 420.5,
            recency_score: 5,
            frequency_score: 4,
            monetary_score: 5,
            segment: RfmSegment::Champions,
        }];
        let file = NamedTempFile::new().unwrap();
        write_rfm_csv(&rows, file.path()).unwrap();

        let written = std::fs::read_to_string(file.path()).unwrap();
        let mut lines = written.lines();
        assert_eq!(
            lines.next().unwrap(),
            "customer_id,recency_days,frequency,monetary,recency_score,frequency_score,monetary_score,rf_score,segment"
        );
        assert_eq!(lines.next().unwrap(), "12346,3,7,420.5,5,4,5,54,champions");
    }
}
