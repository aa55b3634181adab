//! End-to-end pipeline runs against a scripted fetcher and an in-memory store

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use loanharvest::db::{Database, RecordStore, SaveOutcome};
use loanharvest::error::{HarvestError, Result};
use loanharvest::extract::ExtractionSettings;
use loanharvest::fetch::Fetcher;
use loanharvest::fields::{Channel, FieldGroup, FieldMiss, InterestType, MissReason};
use loanharvest::pipeline::{
    BatchOptions, Harvester, ItemOutcome, ProductSource, RetryPolicy, Stage,
};
use loanharvest::profile::{LoanType, ProfileTable};
use loanharvest::record::{NormalizedLoanRecord, RawProvenance};

// ============================================================================
// Fixtures
// ============================================================================

const PROFILES: &str = r#"
[[profiles]]
key = "/loans/car/"
product_name = "サンプルマイカーローン"
loan_type = "car"
category = "自動車"
special_keywords = ["新車", "中古車"]
priority_fields = ["age_min", "age_max"]

[[profiles]]
key = "/loans/free/"
loan_type = "free"

[[profiles]]
key = "/loans/edu/"
loan_type = "education"
fixed_pdf_reference = "/pdf/edu.pdf"

[[profiles]]
key = "/loans/card/"
loan_type = "card"
rate_page = "/rates/card.html"
"#;

const CAR_PAGE: &str = r#"
<html>
<body>
    <h1>マイカーローン</h1>
    <p>新車・中古車のご購入に。来店不要でお申込みいただけます。</p>
    <table>
        <tr><th>金利</th><td>年1.800%～年3.500%（固定金利）</td></tr>
        <tr><th>ご融資金額</th><td>10万円以上1,000万円以内</td></tr>
        <tr><th>ご融資期間</th><td>6ヵ月以上10年以内</td></tr>
        <tr><th>ご利用いただける方</th><td>満20歳以上、完済時75歳以下の方</td></tr>
    </table>
</body>
</html>
"#;

const FREE_PAGE: &str = r#"
<html>
<body>
    <h1>フリーローン</h1>
    <h2>WEB完結型</h2>
    <p>金利 年2.800%～年7.800%（変動金利）</p>
    <h2>来店型</h2>
    <p>金利 年3.500%～年9.800%（変動金利）</p>
    <p>ご融資金額 10万円以上500万円以内</p>
    <p>ご融資期間 6ヵ月以上7年以内</p>
</body>
</html>
"#;

const CARD_PAGE: &str = r#"
<html>
<body>
    <h1>カードローン</h1>
    <p>ご融資限度額 10万円以上500万円以内</p>
    <p>金利は金利一覧ページをご覧ください。</p>
</body>
</html>
"#;

const CARD_RATES: &str = r#"
<html>
<body>
    <h1>金利一覧</h1>
    <p>カードローン 金利 年7.500%～年14.500%</p>
</body>
</html>
"#;

const FREE_RATES: &str = r#"
<html>
<body>
    <h1>金利一覧</h1>
    <h2>WEB完結型</h2>
    <p>金利 年2.000%～年6.000%</p>
    <h2>来店型</h2>
    <p>金利 年3.000%～年8.000%</p>
</body>
</html>
"#;

const CAR_URL: &str = "https://bank.example/loans/car/";
const FREE_URL: &str = "https://bank.example/loans/free/";
const EDU_URL: &str = "https://bank.example/loans/edu/";
const CARD_URL: &str = "https://bank.example/loans/card/";
const CARD_RATES_URL: &str = "https://bank.example/rates/card.html";

/// Serves canned documents by URL; anything else is a 404
#[derive(Default)]
struct ScriptedFetcher {
    documents: HashMap<String, Vec<u8>>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    fn with(mut self, url: &str, body: impl AsRef<[u8]>) -> Self {
        self.documents.insert(url.to_string(), body.as_ref().to_vec());
        self
    }

    fn serve(&self, url: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.documents
            .get(url)
            .cloned()
            .ok_or_else(|| HarvestError::SourceUnavailable {
                url: url.to_string(),
                reason: "HTTP 404 Not Found".to_string(),
            })
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch_html(&self, url: &str) -> Result<String> {
        self.serve(url)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        self.serve(url)
    }
}

fn source(url: &str) -> ProductSource {
    ProductSource {
        url: url.to_string(),
        pdf_url: None,
        rate_page: None,
        channel: None,
        institution_id: "0117".to_string(),
        name: None,
    }
}

fn profiles() -> ProfileTable {
    ProfileTable::from_toml(PROFILES).unwrap()
}

fn sequential() -> BatchOptions {
    BatchOptions {
        workers: 1,
        delay: Duration::ZERO,
    }
}

fn harvester<'a>(
    fetcher: &'a ScriptedFetcher,
    db: Option<&'a Database>,
    profiles: &'a ProfileTable,
    settings: &'a ExtractionSettings,
) -> Harvester<'a> {
    let store = db.map(|db| db as &dyn RecordStore);
    Harvester::new(fetcher, store, profiles, settings).with_retry(RetryPolicy::none())
}

// ============================================================================
// Single products
// ============================================================================

#[test]
fn test_complete_page_is_persisted_as_success() {
    let fetcher = ScriptedFetcher::default().with(CAR_URL, CAR_PAGE);
    let db = Database::open_in_memory().unwrap();
    let (profiles, settings) = (profiles(), ExtractionSettings::default());

    let report = harvester(&fetcher, Some(&db), &profiles, &settings).run_product(&source(CAR_URL));

    let ItemOutcome::Success { record_id: Some(id) } = report.outcome else {
        panic!("unexpected outcome: {:?}", report.outcome);
    };
    let record = report.record.unwrap();
    assert_eq!(record.product_name, "サンプルマイカーローン");
    assert_eq!(record.loan_type, LoanType::Car);
    assert_eq!(record.interest_type, Some(InterestType::Fixed));
    assert_eq!((record.interest_rate_min, record.interest_rate_max), (Some(0.018), Some(0.035)));
    assert_eq!((record.loan_term_min, record.loan_term_max), (Some(6), Some(120)));
    assert!(record.special_features.contains("新車"));
    assert!(record.special_features.contains("来店不要"));
    assert_eq!(record.source_reference, CAR_URL);

    let stored = db.get_record(id).unwrap().unwrap();
    assert_eq!(stored.record.content_hash, record.content_hash);
    assert_eq!(stored.record.product_name, record.product_name);
    assert_eq!(db.count_records().unwrap(), 1);
}

#[test]
fn test_unchanged_content_is_skipped_on_the_next_run() {
    let fetcher = ScriptedFetcher::default().with(CAR_URL, CAR_PAGE);
    let db = Database::open_in_memory().unwrap();
    let (profiles, settings) = (profiles(), ExtractionSettings::default());

    let first = harvester(&fetcher, Some(&db), &profiles, &settings).run_product(&source(CAR_URL));
    let ItemOutcome::Success { record_id: Some(id) } = first.outcome else {
        panic!("unexpected outcome: {:?}", first.outcome);
    };

    // A fresh harvester has no memory of the first run; only the store does
    let second = harvester(&fetcher, Some(&db), &profiles, &settings).run_product(&source(CAR_URL));
    assert_eq!(second.outcome, ItemOutcome::Skipped { duplicate_of: Some(id) });
    assert_eq!(db.count_records().unwrap(), 1);
}

#[test]
fn test_changed_content_is_stored_again() {
    let db = Database::open_in_memory().unwrap();
    let (profiles, settings) = (profiles(), ExtractionSettings::default());

    let before = ScriptedFetcher::default().with(CAR_URL, CAR_PAGE);
    harvester(&before, Some(&db), &profiles, &settings).run_product(&source(CAR_URL));

    let revised = CAR_PAGE.replace("年1.800%", "年1.900%");
    let after = ScriptedFetcher::default().with(CAR_URL, revised);
    let report = harvester(&after, Some(&db), &profiles, &settings).run_product(&source(CAR_URL));

    let record = report.record.unwrap();
    assert_eq!(record.interest_rate_min, Some(0.019));
    assert!(matches!(report.outcome, ItemOutcome::Success { record_id: Some(2) }));
    assert_eq!(db.count_records().unwrap(), 2);
}

#[test]
fn test_channel_product_reads_its_own_section() {
    let fetcher = ScriptedFetcher::default().with(FREE_URL, FREE_PAGE);
    let db = Database::open_in_memory().unwrap();
    let (profiles, settings) = (profiles(), ExtractionSettings::default());

    let mut web = source(FREE_URL);
    web.channel = Some(Channel::Web);
    let report = harvester(&fetcher, Some(&db), &profiles, &settings).run_product(&web);
    let record = report.record.unwrap();

    assert_eq!(record.product_name, "フリーローン〈WEB完結型〉");
    assert_eq!((record.interest_rate_min, record.interest_rate_max), (Some(0.028), Some(0.078)));
    assert_eq!(record.interest_type, Some(InterestType::Variable));
    assert!(record.special_features.ends_with("WEB完結型"));
    // No age on the page: the free loan defaults fill it
    assert_eq!((record.age_min, record.age_max), (Some(20), Some(80)));
    assert!(report.repairs.iter().any(|r| r.group == FieldGroup::Age));
}

#[test]
fn test_configured_name_wins() {
    let fetcher = ScriptedFetcher::default().with(CAR_URL, CAR_PAGE);
    let (profiles, settings) = (profiles(), ExtractionSettings::default());

    let mut named = source(CAR_URL);
    named.name = Some("マイカーローン（新車）".to_string());
    let report = harvester(&fetcher, None, &profiles, &settings).run_product(&named);
    assert_eq!(report.record.unwrap().product_name, "マイカーローン（新車）");
}

#[test]
fn test_missing_rate_sheet_fails_the_product() {
    let fetcher = ScriptedFetcher::default().with(EDU_URL, CAR_PAGE);
    let db = Database::open_in_memory().unwrap();
    let (profiles, settings) = (profiles(), ExtractionSettings::default());

    let report = harvester(&fetcher, Some(&db), &profiles, &settings).run_product(&source(EDU_URL));

    match report.outcome {
        ItemOutcome::Failed { stage, reason } => {
            assert_eq!(stage, Stage::FetchPdf);
            assert!(reason.contains("https://bank.example/pdf/edu.pdf"), "{}", reason);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(db.count_records().unwrap(), 0);
}

#[test]
fn test_unreadable_rate_sheet_is_only_a_miss() {
    let pdf_url = "https://bank.example/loans/pdf/car.pdf";
    let fetcher = ScriptedFetcher::default()
        .with(CAR_URL, CAR_PAGE)
        .with(pdf_url, b"scanned rate sheet without a text layer");
    let db = Database::open_in_memory().unwrap();
    let (profiles, settings) = (profiles(), ExtractionSettings::default());

    let mut with_pdf = source(CAR_URL);
    with_pdf.pdf_url = Some("../pdf/car.pdf".to_string());
    let report = harvester(&fetcher, Some(&db), &profiles, &settings).run_product(&with_pdf);

    assert!(matches!(report.outcome, ItemOutcome::Success { .. }), "{:?}", report.outcome);
    let record = report.record.unwrap();
    assert_eq!(record.source_reference, format!("{} {}", CAR_URL, pdf_url));
    assert_eq!((record.age_min, record.age_max), (Some(20), Some(75)));
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_pdf_only_product_without_text_is_partial() {
    let url = "https://bank.example/toshin/loan/free_s.pdf";
    let fetcher = ScriptedFetcher::default().with(url, b"\x00\x01 not a pdf");
    let db = Database::open_in_memory().unwrap();
    let (profiles, settings) = (profiles(), ExtractionSettings::default());

    let report = harvester(&fetcher, Some(&db), &profiles, &settings).run_product(&source(url));

    match &report.outcome {
        ItemOutcome::Partial { record_id, missing } => {
            assert!(record_id.is_some());
            assert!(missing.contains(&FieldGroup::Rate));
            assert!(missing.contains(&FieldGroup::Amount));
            assert!(!missing.contains(&FieldGroup::Age));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(!report.misses.is_empty());
    assert_eq!(report.record.unwrap().product_name, url);
}

#[test]
fn test_dry_run_writes_nothing() {
    let fetcher = ScriptedFetcher::default().with(CAR_URL, CAR_PAGE);
    let (profiles, settings) = (profiles(), ExtractionSettings::default());

    let report = harvester(&fetcher, None, &profiles, &settings).run_product(&source(CAR_URL));
    assert_eq!(report.outcome, ItemOutcome::Success { record_id: None });
    assert!(report.record.is_some());
}

// ============================================================================
// Rate-list pages
// ============================================================================

#[test]
fn test_rate_page_fills_a_missing_rate() {
    let fetcher = ScriptedFetcher::default()
        .with(CARD_URL, CARD_PAGE)
        .with(CARD_RATES_URL, CARD_RATES);
    let db = Database::open_in_memory().unwrap();
    let (profiles, settings) = (profiles(), ExtractionSettings::default());

    let report = harvester(&fetcher, Some(&db), &profiles, &settings).run_product(&source(CARD_URL));

    let record = report.record.unwrap();
    assert_eq!((record.interest_rate_min, record.interest_rate_max), (Some(0.075), Some(0.145)));
    assert!(!matches!(report.outcome, ItemOutcome::Failed { .. }), "{:?}", report.outcome);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_rate_page_section_overrides_channel_rate() {
    let rates_url = "https://bank.example/rates/free.html";
    let fetcher = ScriptedFetcher::default()
        .with(FREE_URL, FREE_PAGE)
        .with(rates_url, FREE_RATES);
    let (profiles, settings) = (profiles(), ExtractionSettings::default());

    let mut branch = source(FREE_URL);
    branch.channel = Some(Channel::Branch);
    branch.rate_page = Some("/rates/free.html".to_string());
    let report = harvester(&fetcher, None, &profiles, &settings).run_product(&branch);

    let record = report.record.unwrap();
    assert_eq!((record.interest_rate_min, record.interest_rate_max), (Some(0.03), Some(0.08)));
    assert_eq!(record.product_name, "フリーローン〈来店型〉");
}

#[test]
fn test_rate_page_is_not_fetched_when_the_page_has_a_rate() {
    let fetcher = ScriptedFetcher::default().with(CAR_URL, CAR_PAGE);
    let (profiles, settings) = (profiles(), ExtractionSettings::default());

    let mut car = source(CAR_URL);
    car.rate_page = Some("/rates/car.html".to_string());
    let report = harvester(&fetcher, None, &profiles, &settings).run_product(&car);

    assert_eq!(report.outcome, ItemOutcome::Success { record_id: None });
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unreachable_rate_page_is_only_a_miss() {
    let fetcher = ScriptedFetcher::default().with(CARD_URL, CARD_PAGE);
    let db = Database::open_in_memory().unwrap();
    let (profiles, settings) = (profiles(), ExtractionSettings::default());

    let report = harvester(&fetcher, Some(&db), &profiles, &settings).run_product(&source(CARD_URL));

    match &report.outcome {
        ItemOutcome::Partial { record_id, missing } => {
            assert!(record_id.is_some());
            assert!(missing.contains(&FieldGroup::Rate));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(report
        .misses
        .contains(&FieldMiss::new(FieldGroup::Rate, MissReason::Unreachable)));
    assert_eq!(db.count_records().unwrap(), 1);
}

// ============================================================================
// Batches
// ============================================================================

/// Store whose writes for one source always fail, as a locked database would
struct LockedStore {
    locked_source: &'static str,
    failed_saves: AtomicUsize,
    inserted: AtomicUsize,
}

impl LockedStore {
    fn locking(locked_source: &'static str) -> Self {
        Self {
            locked_source,
            failed_saves: AtomicUsize::new(0),
            inserted: AtomicUsize::new(0),
        }
    }
}

impl RecordStore for LockedStore {
    fn find_by_hash(&self, _content_hash: &str) -> Result<Option<i64>> {
        Ok(None)
    }

    fn touch(&self, _id: i64) -> Result<()> {
        Ok(())
    }

    fn save(&self, record: &NormalizedLoanRecord, _raw: &RawProvenance) -> Result<SaveOutcome> {
        if record.source_reference.starts_with(self.locked_source) {
            self.failed_saves.fetch_add(1, Ordering::SeqCst);
            return Err(HarvestError::ConfigError("database is locked".into()));
        }
        let id = self.inserted.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SaveOutcome::Inserted(id as i64))
    }
}

#[test]
fn test_persistence_failure_is_retried_then_isolated() {
    let fetcher = ScriptedFetcher::default()
        .with(CAR_URL, CAR_PAGE)
        .with(FREE_URL, FREE_PAGE);
    let store = LockedStore::locking(CAR_URL);
    let (profiles, settings) = (profiles(), ExtractionSettings::default());
    let retry = RetryPolicy {
        max_attempts: 2,
        base_delay_ms: 0,
        max_delay_ms: 0,
    };

    let report = Harvester::new(&fetcher, Some(&store as &dyn RecordStore), &profiles, &settings)
        .with_retry(retry)
        .run_batch(
            &[source(CAR_URL), source(FREE_URL)],
            sequential(),
            &AtomicBool::new(false),
        );

    assert_eq!(store.failed_saves.load(Ordering::SeqCst), 2);
    match &report.items[0].outcome {
        ItemOutcome::Failed { stage, reason } => {
            assert_eq!(*stage, Stage::Persist);
            assert!(reason.contains("database is locked"), "{}", reason);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(matches!(
        report.items[1].outcome,
        ItemOutcome::Success { record_id: Some(1) } | ItemOutcome::Partial { record_id: Some(1), .. }
    ));
    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded + report.partial, 1);
}


#[test]
fn test_fetch_failure_is_isolated_to_its_product() {
    let fetcher = ScriptedFetcher::default()
        .with(CAR_URL, CAR_PAGE)
        .with(FREE_URL, FREE_PAGE);
    let db = Database::open_in_memory().unwrap();
    let (profiles, settings) = (profiles(), ExtractionSettings::default());
    let sources = vec![
        source(CAR_URL),
        source("https://bank.example/loans/gone/"),
        source(FREE_URL),
    ];

    let report = harvester(&fetcher, Some(&db), &profiles, &settings).run_batch(
        &sources,
        sequential(),
        &AtomicBool::new(false),
    );

    assert_eq!(report.total(), 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded + report.partial, 2);
    assert!(!report.is_clean());
    assert!(matches!(
        report.items[1].outcome,
        ItemOutcome::Failed { stage: Stage::FetchHtml, .. }
    ));
    assert_eq!(db.count_records().unwrap(), 2);
}

#[test]
fn test_same_content_twice_in_one_run_is_stored_once() {
    let mirror = "https://mirror.example/loans/car/";
    let fetcher = ScriptedFetcher::default()
        .with(CAR_URL, CAR_PAGE)
        .with(mirror, CAR_PAGE);
    let db = Database::open_in_memory().unwrap();
    let (profiles, settings) = (profiles(), ExtractionSettings::default());

    let report = harvester(&fetcher, Some(&db), &profiles, &settings).run_batch(
        &[source(CAR_URL), source(mirror)],
        sequential(),
        &AtomicBool::new(false),
    );

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(db.count_records().unwrap(), 1);
}

#[test]
fn test_cancelled_batch_starts_nothing() {
    let fetcher = ScriptedFetcher::default().with(CAR_URL, CAR_PAGE);
    let db = Database::open_in_memory().unwrap();
    let (profiles, settings) = (profiles(), ExtractionSettings::default());

    let report = harvester(&fetcher, Some(&db), &profiles, &settings).run_batch(
        &[source(CAR_URL), source(FREE_URL)],
        sequential(),
        &AtomicBool::new(true),
    );

    assert_eq!(report.cancelled, 2);
    assert!(report.items.iter().all(|i| i.outcome == ItemOutcome::Cancelled));
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    assert_eq!(db.count_records().unwrap(), 0);
}

#[test]
fn test_worker_pool_processes_every_product() {
    let urls: Vec<String> = (0..8)
        .map(|i| format!("https://bank.example/loans/car/{}/", i))
        .collect();
    let fetcher = urls.iter().enumerate().fold(ScriptedFetcher::default(), |f, (i, url)| {
        f.with(url, CAR_PAGE.replace("マイカーローン", &format!("マイカーローン{}", i)))
    });
    let db = Database::open_in_memory().unwrap();
    let (profiles, settings) = (profiles(), ExtractionSettings::default());
    let sources: Vec<ProductSource> = urls.iter().map(|u| source(u)).collect();

    let report = harvester(&fetcher, Some(&db), &profiles, &settings).run_batch(
        &sources,
        BatchOptions {
            workers: 4,
            delay: Duration::ZERO,
        },
        &AtomicBool::new(false),
    );

    assert_eq!(report.total(), 8);
    assert_eq!(report.succeeded, 8);
    assert_eq!(db.count_records().unwrap(), 8);
    // Reports keep the order of the sources file
    for (item, url) in report.items.iter().zip(&urls) {
        assert_eq!(&item.source, url);
    }
}
