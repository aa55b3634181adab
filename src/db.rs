use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::config::Config;
use crate::error::Result;
use crate::record::{NormalizedLoanRecord, RawProvenance};

/// Safely convert a Unix timestamp to DateTime<Utc>, falling back to current time if invalid
fn timestamp_to_datetime(timestamp: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// What a save did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// New record stored under this id
    Inserted(i64),
    /// A record with the same content hash already existed; only its timestamp moved
    Refreshed(i64),
}

impl SaveOutcome {
    pub fn id(&self) -> i64 {
        match self {
            SaveOutcome::Inserted(id) | SaveOutcome::Refreshed(id) => *id,
        }
    }
}

/// Durable store for normalized records, keyed by content hash
pub trait RecordStore: Send + Sync {
    /// Id of the record stored under `content_hash`, if any
    fn find_by_hash(&self, content_hash: &str) -> Result<Option<i64>>;

    /// Refresh `updated_at` of an existing record
    fn touch(&self, id: i64) -> Result<()>;

    /// Store a record and its provenance. Idempotent on the content hash.
    fn save(&self, record: &NormalizedLoanRecord, raw: &RawProvenance) -> Result<SaveOutcome>;
}

/// A stored record with its bookkeeping columns
#[derive(Debug, Clone, Serialize)]
pub struct StoredRecord {
    pub id: i64,
    pub record: NormalizedLoanRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Database connection wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database
    pub fn open() -> Result<Self> {
        let db_path = Config::db_path()?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(&db_path)?;

        // Run migrations
        embedded::migrations::runner().run(&mut conn)?;

        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        embedded::migrations::runner().run(&mut conn)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // Unfinished transactions roll back on drop, so a poisoned lock is still usable
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ========== Record operations ==========

    /// Get a record by id
    pub fn get_record(&self, id: i64) -> Result<Option<StoredRecord>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM loan_products WHERE id = ?1", RECORD_COLUMNS),
                params![id],
                stored_record_from_row,
            )
            .optional()?;
        row.transpose()
    }

    /// List all records, oldest first
    pub fn list_records(&self) -> Result<Vec<StoredRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM loan_products ORDER BY id",
            RECORD_COLUMNS
        ))?;
        let rows = stmt.query_map([], stored_record_from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row??);
        }
        Ok(records)
    }

    /// Number of stored records
    pub fn count_records(&self) -> Result<usize> {
        let count: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM loan_products", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl RecordStore for Database {
    fn find_by_hash(&self, content_hash: &str) -> Result<Option<i64>> {
        let id = self
            .conn()
            .query_row(
                "SELECT id FROM loan_products WHERE content_hash = ?1",
                params![content_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn touch(&self, id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE loan_products SET updated_at = ?1 WHERE id = ?2",
            params![Utc::now().timestamp(), id],
        )?;
        Ok(())
    }

    fn save(&self, record: &NormalizedLoanRecord, raw: &RawProvenance) -> Result<SaveOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = Utc::now().timestamp();

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM loan_products WHERE content_hash = ?1",
                params![record.content_hash],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            tx.execute(
                "UPDATE loan_products SET updated_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
            tx.commit()?;
            return Ok(SaveOutcome::Refreshed(id));
        }

        tx.execute(
            "INSERT INTO raw_loan_data (institution_id, source_url, html_content, extracted_text,
             content_hash, scraping_status, scraped_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(content_hash) DO NOTHING",
            params![
                raw.institution_id,
                raw.source_url,
                raw.html_content,
                raw.extracted_text,
                raw.content_hash,
                raw.scraping_status.as_str(),
                raw.scraped_at.timestamp(),
            ],
        )?;
        let raw_id: i64 = tx.query_row(
            "SELECT id FROM raw_loan_data WHERE content_hash = ?1",
            params![raw.content_hash],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO loan_products (raw_data_id, institution_id, product_name, loan_type, category,
             interest_rate_min, interest_rate_max, interest_type, loan_amount_min, loan_amount_max,
             loan_term_min, loan_term_max, age_min, age_max, repayment_method, special_features,
             source_reference, content_hash, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?20)",
            params![
                raw_id,
                record.institution_id,
                record.product_name,
                serde_json::to_string(&record.loan_type)?,
                record.category,
                record.interest_rate_min,
                record.interest_rate_max,
                record.interest_type.map(|t| serde_json::to_string(&t)).transpose()?,
                record.loan_amount_min,
                record.loan_amount_max,
                record.loan_term_min,
                record.loan_term_max,
                record.age_min,
                record.age_max,
                record.repayment_method,
                record.special_features,
                record.source_reference,
                record.content_hash,
                record.is_active,
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(SaveOutcome::Inserted(id))
    }
}

const RECORD_COLUMNS: &str = "id, institution_id, product_name, loan_type, category,
    interest_rate_min, interest_rate_max, interest_type, loan_amount_min, loan_amount_max,
    loan_term_min, loan_term_max, age_min, age_max, repayment_method, special_features,
    source_reference, content_hash, is_active, created_at, updated_at";

/// Map a `RECORD_COLUMNS` row. JSON decoding errors surface through the outer Result.
fn stored_record_from_row(row: &Row<'_>) -> rusqlite::Result<Result<StoredRecord>> {
    let loan_type: String = row.get(3)?;
    let interest_type: Option<String> = row.get(7)?;
    let created_at: i64 = row.get(19)?;
    let updated_at: i64 = row.get(20)?;

    let record = NormalizedLoanRecord {
        institution_id: row.get(1)?,
        product_name: row.get(2)?,
        loan_type: Default::default(),
        category: row.get(4)?,
        interest_rate_min: row.get(5)?,
        interest_rate_max: row.get(6)?,
        interest_type: None,
        loan_amount_min: row.get(8)?,
        loan_amount_max: row.get(9)?,
        loan_term_min: row.get(10)?,
        loan_term_max: row.get(11)?,
        age_min: row.get(12)?,
        age_max: row.get(13)?,
        repayment_method: row.get(14)?,
        special_features: row.get(15)?,
        source_reference: row.get(16)?,
        content_hash: row.get(17)?,
        is_active: row.get(18)?,
    };
    let id: i64 = row.get(0)?;

    Ok(
        decode_enums(record, &loan_type, interest_type.as_deref()).map(|record| StoredRecord {
            id,
            record,
            created_at: timestamp_to_datetime(created_at),
            updated_at: timestamp_to_datetime(updated_at),
        }),
    )
}

fn decode_enums(
    mut record: NormalizedLoanRecord,
    loan_type: &str,
    interest_type: Option<&str>,
) -> Result<NormalizedLoanRecord> {
    record.loan_type = serde_json::from_str(loan_type)?;
    record.interest_type = interest_type.map(serde_json::from_str).transpose()?;
    Ok(record)
}
