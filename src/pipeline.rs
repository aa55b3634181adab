//! Per-product extraction pipeline and batch runner
//!
//! A product moves through
//! FETCH_HTML → EXTRACT_HTML → FETCH_PDF → EXTRACT_PDF → MERGE → VALIDATE →
//! BUILD → DEDUPLICATE → PERSIST (or SKIP), with the rate-list page read after
//! MERGE when needed. Fetch failures of the page or its PDF end the product;
//! extraction misses only null fields; persistence is the one retried stage.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::{RecordStore, SaveOutcome};
use crate::dedup::{fingerprint, DedupDecision, Deduplicator};
use crate::document::{DocumentKind, RawDocument};
use crate::error::{HarvestError, Result};
use crate::extract::{
    extract_fields, extract_rate_for_channel, extract_rate_in_context, Extraction,
    ExtractionSettings,
};
use crate::fetch::{resolve_url, Fetcher};
use crate::fields::{Channel, FieldGroup, FieldMiss, FieldSet, MissReason};
use crate::merge::merge;
use crate::profile::ProfileTable;
use crate::record::{build, BuildContext, NormalizedLoanRecord};
use crate::validate::{validate, Repair};

// ========== Sources ==========

/// One product to harvest, as listed in a sources file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSource {
    /// Product page (or a PDF, for PDF-only products)
    pub url: String,
    /// Rate sheet; overrides the profile's fixed PDF
    #[serde(default)]
    pub pdf_url: Option<String>,
    /// Rate-list page; overrides the profile's
    #[serde(default)]
    pub rate_page: Option<String>,
    #[serde(default)]
    pub channel: Option<Channel>,
    pub institution_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Sources file: `[[products]]` entries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceList {
    #[serde(default)]
    pub products: Vec<ProductSource>,
}

impl SourceList {
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }
}

// ========== Outcomes ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    FetchHtml,
    ExtractHtml,
    FetchPdf,
    ExtractPdf,
    Merge,
    Validate,
    Build,
    Deduplicate,
    Persist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::FetchHtml => "fetch_html",
            Stage::ExtractHtml => "extract_html",
            Stage::FetchPdf => "fetch_pdf",
            Stage::ExtractPdf => "extract_pdf",
            Stage::Merge => "merge",
            Stage::Validate => "validate",
            Stage::Build => "build",
            Stage::Deduplicate => "deduplicate",
            Stage::Persist => "persist",
        };
        f.write_str(s)
    }
}

/// How one product ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Every field group filled. No id on dry runs.
    Success { record_id: Option<i64> },
    /// Persisted with some field groups null
    Partial {
        record_id: Option<i64>,
        missing: Vec<FieldGroup>,
    },
    /// Content already stored (or claimed by another item of this run)
    Skipped { duplicate_of: Option<i64> },
    Failed { stage: Stage, reason: String },
    Cancelled,
}

impl ItemOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ItemOutcome::Success { .. } => "success",
            ItemOutcome::Partial { .. } => "partial",
            ItemOutcome::Skipped { .. } => "skipped",
            ItemOutcome::Failed { .. } => "failed",
            ItemOutcome::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one product plus what was learned on the way
#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub source: String,
    pub outcome: ItemOutcome,
    pub record: Option<NormalizedLoanRecord>,
    pub misses: Vec<FieldMiss>,
    pub repairs: Vec<Repair>,
}

impl ItemReport {
    fn new(source: &ProductSource) -> Self {
        Self {
            source: source.url.clone(),
            outcome: ItemOutcome::Cancelled,
            record: None,
            misses: Vec::new(),
            repairs: Vec::new(),
        }
    }

    fn failed(mut self, stage: Stage, err: &HarvestError) -> Self {
        warn!(source = %self.source, %stage, error = %err, "product failed");
        self.outcome = ItemOutcome::Failed {
            stage,
            reason: err.to_string(),
        };
        self
    }
}

/// Counts per outcome for a whole batch
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub items: Vec<ItemReport>,
    pub succeeded: usize,
    pub partial: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub elapsed_ms: u64,
}

impl BatchReport {
    fn from_items(items: Vec<ItemReport>, elapsed: Duration) -> Self {
        let mut report = BatchReport {
            elapsed_ms: elapsed.as_millis() as u64,
            ..Default::default()
        };
        for item in &items {
            match item.outcome {
                ItemOutcome::Success { .. } => report.succeeded += 1,
                ItemOutcome::Partial { .. } => report.partial += 1,
                ItemOutcome::Skipped { .. } => report.skipped += 1,
                ItemOutcome::Failed { .. } => report.failed += 1,
                ItemOutcome::Cancelled => report.cancelled += 1,
            }
        }
        report.items = items;
        report
    }

    pub fn total(&self) -> usize {
        self.items.len()
    }

    /// True when nothing failed
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

// ========== Retry ==========

/// Bounded exponential backoff with jitter, used for persistence only
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    200
}

fn default_max_delay() -> u64 {
    5000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Policy that tries once and never sleeps
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based): base·2^(attempt-1), capped, ±25% jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.max_delay_ms);
        let jitter_range = capped / 4;
        let jittered = if jitter_range > 0 {
            capped - jitter_range + rand::random::<u64>() % (jitter_range * 2)
        } else {
            capped
        };
        Duration::from_millis(jittered)
    }

    /// Run `op` until it succeeds or attempts run out
    pub fn run<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= attempts => {
                    return Err(HarvestError::PersistenceError {
                        attempts,
                        reason: err.to_string(),
                    });
                }
                Err(err) => {
                    let delay = self.delay_for(attempt);
                    warn!(attempt, error = %err, ?delay, "persistence failed, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

// ========== Pipeline ==========

/// Batch scheduling options
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// 1 runs sequentially with `delay` between products
    pub workers: usize,
    pub delay: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            delay: Duration::from_millis(1000),
        }
    }
}

/// Everything a product run needs, shared read-only across workers
pub struct Harvester<'a> {
    fetcher: &'a dyn Fetcher,
    /// None on dry runs: nothing is deduplicated or written
    store: Option<&'a dyn RecordStore>,
    profiles: &'a ProfileTable,
    settings: &'a ExtractionSettings,
    retry: RetryPolicy,
    dedup: Deduplicator,
}

impl<'a> Harvester<'a> {
    pub fn new(
        fetcher: &'a dyn Fetcher,
        store: Option<&'a dyn RecordStore>,
        profiles: &'a ProfileTable,
        settings: &'a ExtractionSettings,
    ) -> Self {
        Self {
            fetcher,
            store,
            profiles,
            settings,
            retry: RetryPolicy::default(),
            dedup: Deduplicator::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run one product through every stage
    pub fn run_product(&self, source: &ProductSource) -> ItemReport {
        let mut report = ItemReport::new(source);
        let profile = self.profiles.resolve(&source.url);
        debug!(source = %source.url, profile = %profile.key, "profile resolved");

        // FETCH_HTML (the primary document may itself be a PDF)
        let primary_kind = DocumentKind::from_reference(&source.url);
        let primary = match self.fetch(&source.url, primary_kind) {
            Ok(doc) => doc,
            Err(e) => return report.failed(Stage::FetchHtml, &e),
        };

        // EXTRACT_HTML
        let primary_text = document_text(&primary);
        let mut base = self.extract(&primary_text, source.channel);
        let heading = primary.heading();
        if base.fields.product_name.is_none() {
            base.fields.product_name = heading.clone();
        }

        // FETCH_PDF
        let pdf_reference = match primary_kind {
            DocumentKind::Pdf => None,
            DocumentKind::Html => source
                .pdf_url
                .as_deref()
                .or(profile.fixed_pdf_reference.as_deref())
                .map(|pdf| resolve_url(&source.url, pdf).unwrap_or_else(|| pdf.to_string())),
        };
        let pdf = match &pdf_reference {
            Some(reference) => match self.fetch(reference, DocumentKind::Pdf) {
                Ok(doc) => Some(doc),
                Err(e) => return report.failed(Stage::FetchPdf, &e),
            },
            None => None,
        };

        // EXTRACT_PDF
        let pdf_text = pdf.as_ref().map(document_text).unwrap_or_default();
        let secondary = match &pdf {
            Some(_) => self.extract(&pdf_text, source.channel),
            None => Extraction::default(),
        };

        report.misses = base.misses.clone();
        report
            .misses
            .extend(secondary.misses.iter().filter(|m| base.missed(m.group)).cloned());

        // MERGE
        let mut merged = merge(&base.fields, &secondary.fields, &profile.priority_fields);
        if merged.interest_rate_min.is_none() && merged.interest_rate_max.is_none() {
            // Rate sheets often carry the only published rate
            merged.interest_rate_min = secondary.fields.interest_rate_min;
            merged.interest_rate_max = secondary.fields.interest_rate_max;
        }
        merged.special_features.extend(secondary.fields.special_features.iter().cloned());

        // Rate-list page
        let profile_page = profile.rate_page.as_deref();
        let rate_page = match self.read_rate_page(source, profile_page, &mut merged) {
            Ok(page) => page,
            Err(e) => {
                warn!(source = %source.url, error = %e, "rate page unavailable");
                report
                    .misses
                    .push(FieldMiss::new(FieldGroup::Rate, MissReason::Unreachable));
                None
            }
        };

        // VALIDATE
        let validated = validate(merged, profile);
        report.repairs = validated.repairs;

        // BUILD
        let mut documents = vec![&primary];
        documents.extend(pdf.as_ref());
        documents.extend(rate_page.as_ref());
        let content_hash = fingerprint(&documents);
        let source_text = if pdf_text.is_empty() {
            primary_text.clone()
        } else {
            format!("{}\n{}", primary_text, pdf_text)
        };
        let html_content = match primary_kind {
            DocumentKind::Html => Some(primary.content_str()),
            DocumentKind::Pdf => None,
        };
        let context = BuildContext {
            institution_id: &source.institution_id,
            source_url: &source.url,
            pdf_url: pdf_reference.as_deref(),
            channel: source.channel,
            configured_name: source.name.as_deref(),
            html_heading: heading.as_deref(),
            html_content: html_content.as_deref(),
            source_text: &source_text,
            content_hash: &content_hash,
        };
        let (record, raw) = build(&validated.fields, profile, &context);
        let missing = record.missing_groups();
        report.record = Some(record);

        let Some(store) = self.store else {
            info!(source = %source.url, "dry run, not persisted");
            report.outcome = completed(None, missing);
            return report;
        };

        // DEDUPLICATE
        match self.dedup.check(&content_hash, store) {
            Ok(DedupDecision::Fresh) => {}
            Ok(DedupDecision::Duplicate(id)) => {
                if let Err(e) = self.retry.run(|| store.touch(id)) {
                    return report.failed(Stage::Persist, &e);
                }
                info!(source = %source.url, id, "unchanged, skipped");
                report.outcome = ItemOutcome::Skipped {
                    duplicate_of: Some(id),
                };
                return report;
            }
            Ok(DedupDecision::SeenThisRun) => {
                info!(source = %source.url, "duplicate within this run, skipped");
                report.outcome = ItemOutcome::Skipped { duplicate_of: None };
                return report;
            }
            Err(e) => return report.failed(Stage::Deduplicate, &e),
        }

        // PERSIST
        let Some(record) = report.record.as_ref() else {
            return report;
        };
        match self.retry.run(|| store.save(record, &raw)) {
            Ok(outcome) => {
                let id = outcome.id();
                if let SaveOutcome::Refreshed(_) = outcome {
                    debug!(source = %source.url, id, "stored by a concurrent run, refreshed");
                }
                info!(source = %source.url, id, "persisted");
                report.outcome = completed(Some(id), missing);
            }
            Err(e) => return report.failed(Stage::Persist, &e),
        }
        report
    }

    /// Run every product, sequentially with a delay or on a bounded pool.
    ///
    /// Once `cancel` is set no new product starts; the rest are reported as cancelled.
    pub fn run_batch(
        &self,
        sources: &[ProductSource],
        options: BatchOptions,
        cancel: &AtomicBool,
    ) -> BatchReport {
        let start = Instant::now();

        let items = if options.workers > 1 {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(options.workers)
                .build()
            {
                Ok(pool) => pool.install(|| {
                    sources
                        .par_iter()
                        .map(|source| self.run_guarded(source, cancel))
                        .collect::<Vec<_>>()
                }),
                Err(e) => {
                    warn!(error = %e, "could not build worker pool, running sequentially");
                    self.run_sequential(sources, options.delay, cancel)
                }
            }
        } else {
            self.run_sequential(sources, options.delay, cancel)
        };

        BatchReport::from_items(items, start.elapsed())
    }

    fn run_sequential(
        &self,
        sources: &[ProductSource],
        delay: Duration,
        cancel: &AtomicBool,
    ) -> Vec<ItemReport> {
        let mut items = Vec::with_capacity(sources.len());
        for (i, source) in sources.iter().enumerate() {
            if i > 0 && !delay.is_zero() && !cancel.load(Ordering::SeqCst) {
                std::thread::sleep(delay);
            }
            items.push(self.run_guarded(source, cancel));
        }
        items
    }

    fn run_guarded(&self, source: &ProductSource, cancel: &AtomicBool) -> ItemReport {
        if cancel.load(Ordering::SeqCst) {
            return ItemReport::new(source);
        }
        info!(source = %source.url, "processing");
        self.run_product(source)
    }

    fn fetch(&self, reference: &str, kind: DocumentKind) -> Result<RawDocument> {
        let content = match kind {
            DocumentKind::Html => self.fetcher.fetch_html(reference)?.into_bytes(),
            DocumentKind::Pdf => self.fetcher.fetch_bytes(reference)?,
        };
        let document = RawDocument::new(reference, kind, content);
        debug!(
            source = reference,
            kind = kind.as_str(),
            hash = document.content_hash(),
            fetched_at = %document.fetched_at(),
            "document fetched"
        );
        Ok(document)
    }

    /// Fetch the rate-list page when the rate is still empty or the product
    /// is channel-specific. A channel section overrides the merged rate;
    /// otherwise the page only fills an empty one.
    fn read_rate_page(
        &self,
        source: &ProductSource,
        profile_page: Option<&str>,
        merged: &mut FieldSet,
    ) -> Result<Option<RawDocument>> {
        let rate_missing =
            merged.interest_rate_min.is_none() && merged.interest_rate_max.is_none();
        if !rate_missing && source.channel.is_none() {
            return Ok(None);
        }
        let Some(page) = source.rate_page.as_deref().or(profile_page) else {
            return Ok(None);
        };
        let reference = resolve_url(&source.url, page).unwrap_or_else(|| page.to_string());
        let document = self.fetch(&reference, DocumentKind::Html)?;

        let text = document_text(&document);
        let (min, max) = match source.channel {
            Some(channel) => extract_rate_for_channel(&text, channel, self.settings),
            None => extract_rate_in_context(&text, self.settings),
        };
        if min.is_some() && max.is_some() {
            debug!(
                source = %source.url,
                rate_page = %reference,
                ?min,
                ?max,
                "rate taken from rate page"
            );
            merged.interest_rate_min = min;
            merged.interest_rate_max = max;
        }
        Ok(Some(document))
    }

    fn extract(&self, text: &str, channel: Option<Channel>) -> Extraction {
        let extraction = extract_fields(text, self.settings, channel);
        for miss in &extraction.misses {
            warn!(%miss, "field not extracted");
        }
        extraction
    }
}

/// Normalized text of a document; unreadable PDFs give empty text
fn document_text(document: &RawDocument) -> String {
    match document.text() {
        Ok(text) => text,
        Err(e) => {
            warn!(source = document.source_url(), error = %e, "no text layer");
            String::new()
        }
    }
}

fn completed(record_id: Option<i64>, missing: Vec<FieldGroup>) -> ItemOutcome {
    if missing.is_empty() {
        ItemOutcome::Success { record_id }
    } else {
        ItemOutcome::Partial { record_id, missing }
    }
}
