//! Stored records: list, show

use colored::Colorize;

use loanharvest::db::Database;
use loanharvest::error::{HarvestError, Result};
use loanharvest::record::NormalizedLoanRecord;

/// List stored loan products
pub fn cmd_records(institution: Option<String>, json: bool) -> Result<()> {
    let db = Database::open()?;
    let mut records = db.list_records()?;
    if let Some(ref institution) = institution {
        records.retain(|r| &r.record.institution_id == institution);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No records stored. Run `loanharvest run <sources>` first.");
        return Ok(());
    }

    println!("\nLoan products ({} of {}):\n", records.len(), db.count_records()?);
    for stored in &records {
        let record = &stored.record;
        println!(
            "  {:>4}  {}  {}  {}  {}",
            format!("#{}", stored.id).dimmed(),
            record.institution_id,
            record.product_name.bold(),
            format_rate(record.interest_rate_min, record.interest_rate_max),
            stored.updated_at.format("%Y-%m-%d %H:%M").to_string().dimmed()
        );
    }
    println!();
    Ok(())
}

/// Show one stored loan product
pub fn cmd_show(id: i64, json: bool) -> Result<()> {
    let db = Database::open()?;
    let stored = db.get_record(id)?.ok_or(HarvestError::RecordNotFound(id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stored)?);
        return Ok(());
    }

    println!();
    print_record(&stored.record);
    println!("  Created:    {}", stored.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Updated:    {}", stored.updated_at.format("%Y-%m-%d %H:%M:%S"));
    println!();
    Ok(())
}

pub(super) fn print_record(record: &NormalizedLoanRecord) {
    println!("  {}", record.product_name.bold());
    println!("  Institution: {}", record.institution_id);
    println!("  Type:        {}", record.loan_type.label());
    if let Some(ref category) = record.category {
        println!("  Category:    {}", category);
    }
    println!(
        "  Rate:        {} {}",
        format_rate(record.interest_rate_min, record.interest_rate_max),
        record.interest_type.map(|t| t.label()).unwrap_or("")
    );
    println!(
        "  Amount:      {}",
        format_range(record.loan_amount_min, record.loan_amount_max, "円")
    );
    println!(
        "  Term:        {}",
        format_range(record.loan_term_min, record.loan_term_max, "ヶ月")
    );
    println!("  Age:         {}", format_range(record.age_min, record.age_max, "歳"));
    if let Some(ref repayment) = record.repayment_method {
        println!("  Repayment:   {}", repayment);
    }
    if !record.special_features.is_empty() {
        println!("  Features:    {}", record.special_features);
    }
    println!("  Source:      {}", record.source_reference.dimmed());
    println!("  Hash:        {}", record.content_hash[..12.min(record.content_hash.len())].dimmed());
}

fn format_rate(min: Option<f64>, max: Option<f64>) -> String {
    let pct = |v: Option<f64>| {
        v.map(|v| format!("{:.3}%", v * 100.0))
            .unwrap_or_else(|| "?".to_string())
    };
    match (min, max) {
        (None, None) => "-".to_string(),
        (Some(a), Some(b)) if a == b => pct(Some(a)),
        _ => format!("{} - {}", pct(min), pct(max)),
    }
}

fn format_range<T: std::fmt::Display + PartialEq>(min: Option<T>, max: Option<T>, unit: &str) -> String {
    match (min, max) {
        (None, None) => "-".to_string(),
        (Some(a), Some(b)) if a == b => format!("{}{}", a, unit),
        (min, max) => format!(
            "{}{} - {}{}",
            min.map(|v| v.to_string()).unwrap_or_else(|| "?".into()),
            unit,
            max.map(|v| v.to_string()).unwrap_or_else(|| "?".into()),
            unit
        ),
    }
}
