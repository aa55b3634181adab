use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fields::{Channel, FieldGroup, FieldSet, InterestType};
use crate::profile::{LoanType, ProductProfile};

/// Separator between special features in a record
pub const FEATURE_SEPARATOR: &str = " / ";

/// One normalized loan product, as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedLoanRecord {
    pub institution_id: String,
    pub product_name: String,
    pub loan_type: LoanType,
    pub category: Option<String>,
    pub interest_rate_min: Option<f64>,
    pub interest_rate_max: Option<f64>,
    pub interest_type: Option<InterestType>,
    pub loan_amount_min: Option<i64>,
    pub loan_amount_max: Option<i64>,
    pub loan_term_min: Option<u32>,
    pub loan_term_max: Option<u32>,
    pub age_min: Option<u32>,
    pub age_max: Option<u32>,
    pub repayment_method: Option<String>,
    pub special_features: String,
    /// HTML page, plus the PDF when one was read
    pub source_reference: String,
    pub content_hash: String,
    pub is_active: bool,
}

impl NormalizedLoanRecord {
    /// Field groups the record holds no complete value for
    pub fn missing_groups(&self) -> Vec<FieldGroup> {
        let checks = [
            (FieldGroup::Rate, self.interest_rate_min.is_none() || self.interest_rate_max.is_none()),
            (FieldGroup::InterestType, self.interest_type.is_none()),
            (FieldGroup::Amount, self.loan_amount_min.is_none() || self.loan_amount_max.is_none()),
            (FieldGroup::Term, self.loan_term_min.is_none() || self.loan_term_max.is_none()),
            (FieldGroup::Age, self.age_min.is_none() || self.age_max.is_none()),
        ];
        checks
            .into_iter()
            .filter(|(_, missing)| *missing)
            .map(|(group, _)| group)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapingStatus {
    Success,
    Partial,
}

impl ScrapingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapingStatus::Success => "success",
            ScrapingStatus::Partial => "partial",
        }
    }
}

/// What the sources looked like when a record was built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawProvenance {
    pub institution_id: String,
    pub source_url: String,
    pub html_content: Option<String>,
    pub extracted_text: String,
    pub content_hash: String,
    pub scraping_status: ScrapingStatus,
    pub scraped_at: DateTime<Utc>,
}

/// Everything about a product's sources that the builder needs besides the fields
#[derive(Debug, Clone, Default)]
pub struct BuildContext<'a> {
    pub institution_id: &'a str,
    pub source_url: &'a str,
    pub pdf_url: Option<&'a str>,
    pub channel: Option<Channel>,
    /// Name given in the sources file
    pub configured_name: Option<&'a str>,
    pub html_heading: Option<&'a str>,
    pub html_content: Option<&'a str>,
    /// Normalized HTML and PDF text, concatenated
    pub source_text: &'a str,
    pub content_hash: &'a str,
}

/// Assemble the durable record and its provenance from validated fields
pub fn build(
    fields: &FieldSet,
    profile: &ProductProfile,
    context: &BuildContext<'_>,
) -> (NormalizedLoanRecord, RawProvenance) {
    let interest_type = InterestType::from_text(context.source_text)
        .or_else(|| profile.hinted_interest_type())
        .or(fields.interest_type);

    let source_reference = match context.pdf_url {
        Some(pdf) => format!("{} {}", context.source_url, pdf),
        None => context.source_url.to_string(),
    };

    let record = NormalizedLoanRecord {
        institution_id: context.institution_id.to_string(),
        product_name: product_name(fields, profile, context),
        loan_type: profile.loan_type,
        category: profile.category.clone(),
        interest_rate_min: fields.interest_rate_min,
        interest_rate_max: fields.interest_rate_max,
        interest_type,
        loan_amount_min: fields.loan_amount_min,
        loan_amount_max: fields.loan_amount_max,
        loan_term_min: fields.loan_term_min,
        loan_term_max: fields.loan_term_max,
        age_min: fields.age_min,
        age_max: fields.age_max,
        repayment_method: fields.repayment_method.clone(),
        special_features: special_features(fields, profile, context),
        source_reference,
        content_hash: context.content_hash.to_string(),
        is_active: true,
    };

    let scraping_status = if record.missing_groups().is_empty() {
        ScrapingStatus::Success
    } else {
        ScrapingStatus::Partial
    };

    let raw = RawProvenance {
        institution_id: context.institution_id.to_string(),
        source_url: context.source_url.to_string(),
        html_content: context.html_content.map(str::to_string),
        extracted_text: context.source_text.to_string(),
        content_hash: context.content_hash.to_string(),
        scraping_status,
        scraped_at: Utc::now(),
    };

    (record, raw)
}

/// configured name > profile override > profile name > page heading > extracted > URL
fn product_name(fields: &FieldSet, profile: &ProductProfile, context: &BuildContext<'_>) -> String {
    let base = context
        .configured_name
        .map(str::to_string)
        .or_else(|| profile.product_name_override.clone())
        .or_else(|| profile.product_name.clone())
        .or_else(|| context.html_heading.map(str::to_string))
        .or_else(|| fields.product_name.clone())
        .unwrap_or_else(|| context.source_url.to_string());

    match context.channel {
        Some(channel) if !base.ends_with(channel.name_suffix()) => {
            format!("{}{}", base, channel.name_suffix())
        }
        _ => base,
    }
}

fn special_features(fields: &FieldSet, profile: &ProductProfile, context: &BuildContext<'_>) -> String {
    let mut features: BTreeSet<String> = profile
        .special_keywords
        .iter()
        .filter(|keyword| context.source_text.contains(keyword.as_str()))
        .cloned()
        .collect();
    features.extend(fields.special_features.iter().cloned());

    let mut parts: Vec<String> = features.into_iter().collect();
    if let Some(channel) = context.channel {
        let tag = channel.label().to_string();
        parts.retain(|p| p != &tag);
        parts.push(tag);
    }
    parts.join(FEATURE_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ProductProfile {
        ProductProfile {
            key: "/kojin/loan/mycarloan/".into(),
            product_name: Some("マイカーローン".into()),
            loan_type: LoanType::Car,
            category: Some("自動車".into()),
            interest_type_hints: vec!["固定金利".into()],
            special_keywords: vec!["新車".into(), "中古車".into(), "船舶".into()],
            ..Default::default()
        }
    }

    fn fields() -> FieldSet {
        FieldSet {
            interest_rate_min: Some(0.018),
            interest_rate_max: Some(0.035),
            interest_type: Some(InterestType::Variable),
            loan_amount_min: Some(100_000),
            loan_amount_max: Some(10_000_000),
            loan_term_min: Some(6),
            loan_term_max: Some(120),
            age_min: Some(18),
            age_max: Some(75),
            special_features: ["来店不要".to_string()].into_iter().collect(),
            ..Default::default()
        }
    }

    fn context<'a>(text: &'a str) -> BuildContext<'a> {
        BuildContext {
            institution_id: "0117",
            source_url: "https://bank.example/kojin/loan/mycarloan/",
            source_text: text,
            content_hash: "abc123",
            html_heading: Some("見出しの商品名"),
            ..Default::default()
        }
    }

    #[test]
    fn test_interest_type_text_wins_over_hints() {
        let (record, _) = build(&fields(), &profile(), &context("変動金利型です 新車"));
        assert_eq!(record.interest_type, Some(InterestType::Variable));

        let (record, _) = build(&fields(), &profile(), &context("金利は店頭表示"));
        assert_eq!(record.interest_type, Some(InterestType::Fixed));

        let no_hints = ProductProfile {
            interest_type_hints: vec![],
            ..profile()
        };
        let (record, _) = build(&fields(), &no_hints, &context("金利は店頭表示"));
        assert_eq!(record.interest_type, Some(InterestType::Variable));
    }

    #[test]
    fn test_two_hint_profile_falls_back_to_fixed() {
        let both = ProductProfile {
            interest_type_hints: vec!["固定金利".into(), "変動金利".into()],
            ..profile()
        };
        let (record, _) = build(&FieldSet::default(), &both, &context("金利 年2.0%"));
        assert_eq!(record.interest_type, Some(InterestType::Fixed));
    }

    #[test]
    fn test_special_features_sorted_and_joined() {
        let (record, _) = build(&fields(), &profile(), &context("新車・中古車どちらも対象"));
        assert_eq!(record.special_features, "中古車 / 新車 / 来店不要");
    }

    #[test]
    fn test_channel_suffix_and_tag() {
        let mut ctx = context("新車");
        ctx.channel = Some(Channel::Web);
        let (record, _) = build(&fields(), &profile(), &ctx);
        assert_eq!(record.product_name, "マイカーローン〈WEB完結型〉");
        assert!(record.special_features.ends_with(" / WEB完結型"));
    }

    #[test]
    fn test_product_name_precedence() {
        let with_override = ProductProfile {
            product_name_override: Some("上書き名".into()),
            ..profile()
        };
        let (record, _) = build(&fields(), &with_override, &context(""));
        assert_eq!(record.product_name, "上書き名");

        let neutral = ProductProfile::default();
        let (record, _) = build(&fields(), &neutral, &context(""));
        assert_eq!(record.product_name, "見出しの商品名");

        let mut ctx = context("");
        ctx.configured_name = Some("設定ファイルの名前");
        let (record, _) = build(&fields(), &with_override, &ctx);
        assert_eq!(record.product_name, "設定ファイルの名前");
    }

    #[test]
    fn test_provenance_status() {
        let (record, raw) = build(&fields(), &profile(), &context(""));
        assert_eq!(raw.scraping_status, ScrapingStatus::Success);
        assert_eq!(raw.content_hash, record.content_hash);

        let (record, raw) = build(&FieldSet::default(), &profile(), &context(""));
        assert_eq!(raw.scraping_status, ScrapingStatus::Partial);
        assert_eq!(
            record.missing_groups(),
            vec![FieldGroup::Rate, FieldGroup::Amount, FieldGroup::Term, FieldGroup::Age]
        );
    }
}
