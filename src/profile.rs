use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{HarvestError, Result};
use crate::fields::{FieldName, InterestType};

/// Profile table shipped with the crate
const BUILTIN_PROFILES: &str = include_str!("../profiles.toml");

/// Profile used when no table key matches: no hints, no priorities, no defaults
static NEUTRAL_PROFILE: Lazy<ProductProfile> = Lazy::new(ProductProfile::default);

/// Product category of a loan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanType {
    Education,
    Car,
    Free,
    Consolidation,
    Card,
    Housing,
    #[default]
    Other,
}

impl LoanType {
    /// Japanese label stored in records
    pub fn label(&self) -> &'static str {
        match self {
            LoanType::Education => "教育ローン",
            LoanType::Car => "マイカーローン",
            LoanType::Free => "フリーローン",
            LoanType::Consolidation => "おまとめローン",
            LoanType::Card => "カードローン",
            LoanType::Housing => "住宅ローン",
            LoanType::Other => "その他",
        }
    }

    /// Eligible age range assumed when neither source states one
    pub fn default_age_range(&self) -> (u32, u32) {
        match self {
            LoanType::Education => (20, 75),
            LoanType::Car => (18, 75),
            LoanType::Free => (20, 80),
            LoanType::Consolidation => (20, 69),
            _ => (20, 75),
        }
    }
}

/// Static per-product configuration selected by source URL
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductProfile {
    /// URL path prefix (or plain identifier prefix) this profile applies to
    pub key: String,
    #[serde(default)]
    pub product_name: Option<String>,
    /// Wins over every other name source
    #[serde(default)]
    pub product_name_override: Option<String>,
    #[serde(default)]
    pub loan_type: LoanType,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub interest_type_hints: Vec<String>,
    /// Keywords copied into special features when found in the source text
    #[serde(default)]
    pub special_keywords: Vec<String>,
    /// Fields where a non-null PDF value overrides the HTML value
    #[serde(default)]
    pub priority_fields: Vec<FieldName>,
    #[serde(default)]
    pub default_age_range: Option<(u32, u32)>,
    /// Months
    #[serde(default)]
    pub default_term_range: Option<(u32, u32)>,
    /// PDF to fetch when the product source names none
    #[serde(default)]
    pub fixed_pdf_reference: Option<String>,
    /// Rate-list page read when no rate was found, or for channel products
    #[serde(default)]
    pub rate_page: Option<String>,
}

impl ProductProfile {
    /// Interest type implied by the first hint that names one
    pub fn hinted_interest_type(&self) -> Option<InterestType> {
        self.interest_type_hints
            .iter()
            .find_map(|hint| InterestType::from_text(hint))
    }

    /// Age range used when extraction found none
    pub fn age_defaults(&self) -> (u32, u32) {
        self.default_age_range
            .unwrap_or_else(|| self.loan_type.default_age_range())
    }

    /// Whether this is the neutral fallback profile
    pub fn is_neutral(&self) -> bool {
        self.key.is_empty()
    }

    fn check(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            return Err(HarvestError::ProfileError("profile with empty key".into()));
        }
        for (label, range) in [
            ("default_age_range", self.default_age_range),
            ("default_term_range", self.default_term_range),
        ] {
            if let Some((min, max)) = range {
                if min > max {
                    return Err(HarvestError::ProfileError(format!(
                        "{}: {} has min {} above max {}",
                        self.key, label, min, max
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Ordered profile table. Loaded once, then shared read-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileTable {
    #[serde(default)]
    profiles: Vec<ProductProfile>,
}

impl ProfileTable {
    pub fn new(profiles: Vec<ProductProfile>) -> Result<Self> {
        for profile in &profiles {
            profile.check()?;
        }
        Ok(Self { profiles })
    }

    /// Parse a table from TOML (`[[profiles]]` entries, in priority order)
    pub fn from_toml(content: &str) -> Result<Self> {
        let table: ProfileTable = toml::from_str(content)?;
        Self::new(table.profiles)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// The table shipped with the crate
    pub fn builtin() -> Result<Self> {
        Self::from_toml(BUILTIN_PROFILES)
    }

    /// Load from `path` when given, otherwise the built-in table
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Self::builtin(),
        }
    }

    pub fn profiles(&self) -> &[ProductProfile] {
        &self.profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Select the profile for a source URL or identifier.
    ///
    /// The URL path is matched by prefix against profile keys; the longest key
    /// wins and equal-length keys resolve to the earlier entry. Unmatched
    /// identifiers get the neutral profile.
    pub fn resolve(&self, identifier: &str) -> &ProductProfile {
        let path = match Url::parse(identifier) {
            Ok(url) if url.has_host() => url.path().to_string(),
            _ => identifier.to_string(),
        };

        let mut best: Option<&ProductProfile> = None;
        for profile in &self.profiles {
            if !path.starts_with(&profile.key) {
                continue;
            }
            if best.map_or(true, |b| profile.key.len() > b.key.len()) {
                best = Some(profile);
            }
        }

        best.unwrap_or_else(|| &*NEUTRAL_PROFILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TABLE: &str = r#"
[[profiles]]
key = "/kojin/loan/freeloan/"
product_name = "フリーローン"
loan_type = "free"
priority_fields = ["age_min", "age_max"]

[[profiles]]
key = "/kojin/loan/freeloan/silverloan"
product_name = "シルバーローン"
loan_type = "free"
default_age_range = [60, 85]

[[profiles]]
key = "/kojin/loan/jutakuloan/"
product_name = "住宅ローン（保証会社A）"
loan_type = "housing"

[[profiles]]
key = "/kojin/loan/jutakuloan/"
product_name = "住宅ローン（保証会社B）"
loan_type = "housing"
"#;

    fn table() -> ProfileTable {
        ProfileTable::from_toml(TABLE).unwrap()
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = table();
        let profile = table.resolve("https://bank.example/kojin/loan/freeloan/silverloan/index.html");
        assert_eq!(profile.product_name.as_deref(), Some("シルバーローン"));
        let profile = table.resolve("https://bank.example/kojin/loan/freeloan/");
        assert_eq!(profile.product_name.as_deref(), Some("フリーローン"));
        assert_eq!(profile.priority_fields, vec![FieldName::AgeMin, FieldName::AgeMax]);
    }

    #[test]
    fn test_equal_length_tie_resolves_to_first_entry() {
        let table = table();
        let profile = table.resolve("https://bank.example/kojin/loan/jutakuloan/");
        assert_eq!(profile.product_name.as_deref(), Some("住宅ローン（保証会社A）"));
    }

    #[test]
    fn test_unmatched_gets_neutral_profile() {
        let table = table();
        let profile = table.resolve("https://bank.example/kojin/deposit/");
        assert!(profile.is_neutral());
        assert!(profile.priority_fields.is_empty());
        assert!(profile.interest_type_hints.is_empty());
        assert_eq!(profile.default_term_range, None);
    }

    #[test]
    fn test_plain_identifier_matches_by_prefix() {
        let table = table();
        let profile = table.resolve("/kojin/loan/freeloan/silverloan");
        assert_eq!(profile.default_age_range, Some((60, 85)));
    }

    #[test]
    fn test_unknown_priority_field_rejected() {
        let bad = r#"
[[profiles]]
key = "/loan/"
priority_fields = ["min_age"]
"#;
        assert!(matches!(
            ProfileTable::from_toml(bad),
            Err(HarvestError::TomlError(_))
        ));
    }

    #[test]
    fn test_inverted_default_range_rejected() {
        let bad = r#"
[[profiles]]
key = "/loan/"
default_term_range = [120, 6]
"#;
        assert!(matches!(
            ProfileTable::from_toml(bad),
            Err(HarvestError::ProfileError(_))
        ));
    }

    #[test]
    fn test_age_defaults() {
        let mut profile = ProductProfile {
            loan_type: LoanType::Consolidation,
            ..Default::default()
        };
        assert_eq!(profile.age_defaults(), (20, 69));
        profile.default_age_range = Some((25, 65));
        assert_eq!(profile.age_defaults(), (25, 65));
        assert_eq!(LoanType::Car.default_age_range(), (18, 75));
        assert_eq!(LoanType::Card.default_age_range(), (20, 75));
    }

    #[test]
    fn test_first_hint_decides_interest_type() {
        let mut profile = ProductProfile {
            interest_type_hints: vec!["固定金利".into(), "変動金利".into()],
            ..Default::default()
        };
        assert_eq!(profile.hinted_interest_type(), Some(InterestType::Fixed));
        profile.interest_type_hints.reverse();
        assert_eq!(profile.hinted_interest_type(), Some(InterestType::Variable));
        profile.interest_type_hints = vec!["店頭表示".into(), "変動金利".into()];
        assert_eq!(profile.hinted_interest_type(), Some(InterestType::Variable));
        profile.interest_type_hints.clear();
        assert_eq!(profile.hinted_interest_type(), None);
    }

    #[test]
    fn test_builtin_table_loads() {
        let table = ProfileTable::builtin().unwrap();
        assert!(!table.is_empty());
        let profile = table.resolve("https://www.am-bk.co.jp/kojin/loan/mycarloan/");
        assert_eq!(profile.loan_type, LoanType::Car);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TABLE.as_bytes()).unwrap();
        let table = ProfileTable::load(file.path()).unwrap();
        assert_eq!(table.len(), 4);
    }
}
