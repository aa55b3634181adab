use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Interest rate type of a loan product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterestType {
    Fixed,
    Variable,
}

impl InterestType {
    /// Japanese label as published by institutions
    pub fn label(&self) -> &'static str {
        match self {
            InterestType::Fixed => "固定金利",
            InterestType::Variable => "変動金利",
        }
    }

    /// Infer from text: 固定 without 変動 is fixed, any 変動 is variable
    pub fn from_text(text: &str) -> Option<Self> {
        if text.contains("固定") && !text.contains("変動") {
            Some(InterestType::Fixed)
        } else if text.contains("変動") {
            Some(InterestType::Variable)
        } else {
            None
        }
    }
}

/// Application channel a product variant is offered through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Online-only application (WEB完結型)
    Web,
    /// Branch-visit application (来店型)
    Branch,
}

impl Channel {
    /// Label used in source text and special features
    pub fn label(&self) -> &'static str {
        match self {
            Channel::Web => "WEB完結型",
            Channel::Branch => "来店型",
        }
    }

    /// Suffix appended to the product name
    pub fn name_suffix(&self) -> &'static str {
        match self {
            Channel::Web => "〈WEB完結型〉",
            Channel::Branch => "〈来店型〉",
        }
    }

    pub fn other(&self) -> Channel {
        match self {
            Channel::Web => Channel::Branch,
            Channel::Branch => Channel::Web,
        }
    }
}

/// Names of every FieldSet attribute, used for merge priority lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    ProductName,
    InterestRateMin,
    InterestRateMax,
    InterestType,
    LoanAmountMin,
    LoanAmountMax,
    LoanTermMin,
    LoanTermMax,
    AgeMin,
    AgeMax,
    RepaymentMethod,
    SpecialFeatures,
}

impl FieldName {
    pub const ALL: [FieldName; 12] = [
        FieldName::ProductName,
        FieldName::InterestRateMin,
        FieldName::InterestRateMax,
        FieldName::InterestType,
        FieldName::LoanAmountMin,
        FieldName::LoanAmountMax,
        FieldName::LoanTermMin,
        FieldName::LoanTermMax,
        FieldName::AgeMin,
        FieldName::AgeMax,
        FieldName::RepaymentMethod,
        FieldName::SpecialFeatures,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldName::ProductName => "product_name",
            FieldName::InterestRateMin => "interest_rate_min",
            FieldName::InterestRateMax => "interest_rate_max",
            FieldName::InterestType => "interest_type",
            FieldName::LoanAmountMin => "loan_amount_min",
            FieldName::LoanAmountMax => "loan_amount_max",
            FieldName::LoanTermMin => "loan_term_min",
            FieldName::LoanTermMax => "loan_term_max",
            FieldName::AgeMin => "age_min",
            FieldName::AgeMax => "age_max",
            FieldName::RepaymentMethod => "repayment_method",
            FieldName::SpecialFeatures => "special_features",
        }
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Groups of related fields that extractors and validation rules operate on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldGroup {
    ProductName,
    Rate,
    InterestType,
    Amount,
    Term,
    Age,
    Repayment,
    SpecialFeatures,
}

impl fmt::Display for FieldGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldGroup::ProductName => "product_name",
            FieldGroup::Rate => "rate",
            FieldGroup::InterestType => "interest_type",
            FieldGroup::Amount => "amount",
            FieldGroup::Term => "term",
            FieldGroup::Age => "age",
            FieldGroup::Repayment => "repayment",
            FieldGroup::SpecialFeatures => "special_features",
        };
        f.write_str(s)
    }
}

/// Fixed-schema set of optional fields produced by one extraction pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldSet {
    pub product_name: Option<String>,
    /// Lower bound as a fraction of 1 (0.025 = 2.5%)
    pub interest_rate_min: Option<f64>,
    pub interest_rate_max: Option<f64>,
    pub interest_type: Option<InterestType>,
    /// Yen
    pub loan_amount_min: Option<i64>,
    pub loan_amount_max: Option<i64>,
    /// Months
    pub loan_term_min: Option<u32>,
    pub loan_term_max: Option<u32>,
    pub age_min: Option<u32>,
    pub age_max: Option<u32>,
    pub repayment_method: Option<String>,
    #[serde(default)]
    pub special_features: BTreeSet<String>,
}

impl FieldSet {
    /// Whether the named field holds a value (an empty feature set counts as null)
    pub fn is_present(&self, name: FieldName) -> bool {
        match name {
            FieldName::ProductName => self.product_name.is_some(),
            FieldName::InterestRateMin => self.interest_rate_min.is_some(),
            FieldName::InterestRateMax => self.interest_rate_max.is_some(),
            FieldName::InterestType => self.interest_type.is_some(),
            FieldName::LoanAmountMin => self.loan_amount_min.is_some(),
            FieldName::LoanAmountMax => self.loan_amount_max.is_some(),
            FieldName::LoanTermMin => self.loan_term_min.is_some(),
            FieldName::LoanTermMax => self.loan_term_max.is_some(),
            FieldName::AgeMin => self.age_min.is_some(),
            FieldName::AgeMax => self.age_max.is_some(),
            FieldName::RepaymentMethod => self.repayment_method.is_some(),
            FieldName::SpecialFeatures => !self.special_features.is_empty(),
        }
    }

    /// Copy the named field from `other`, overwriting the current value
    pub fn copy_field(&mut self, other: &FieldSet, name: FieldName) {
        match name {
            FieldName::ProductName => self.product_name = other.product_name.clone(),
            FieldName::InterestRateMin => self.interest_rate_min = other.interest_rate_min,
            FieldName::InterestRateMax => self.interest_rate_max = other.interest_rate_max,
            FieldName::InterestType => self.interest_type = other.interest_type,
            FieldName::LoanAmountMin => self.loan_amount_min = other.loan_amount_min,
            FieldName::LoanAmountMax => self.loan_amount_max = other.loan_amount_max,
            FieldName::LoanTermMin => self.loan_term_min = other.loan_term_min,
            FieldName::LoanTermMax => self.loan_term_max = other.loan_term_max,
            FieldName::AgeMin => self.age_min = other.age_min,
            FieldName::AgeMax => self.age_max = other.age_max,
            FieldName::RepaymentMethod => {
                self.repayment_method = other.repayment_method.clone()
            }
            FieldName::SpecialFeatures => {
                self.special_features = other.special_features.clone()
            }
        }
    }

    pub fn rate_range(&self) -> (Option<f64>, Option<f64>) {
        (self.interest_rate_min, self.interest_rate_max)
    }

    pub fn amount_range(&self) -> (Option<i64>, Option<i64>) {
        (self.loan_amount_min, self.loan_amount_max)
    }

    pub fn term_range(&self) -> (Option<u32>, Option<u32>) {
        (self.loan_term_min, self.loan_term_max)
    }

    pub fn age_range(&self) -> (Option<u32>, Option<u32>) {
        (self.age_min, self.age_max)
    }
}

/// Why an extractor produced no value for a field group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum MissReason {
    /// No recognized pattern matched
    NoMatch,
    /// Matches were found but all fell outside the plausible band
    OutOfBand,
    /// Every candidate sat next to an exclusion keyword
    Excluded,
    /// The source document had no usable text
    NoText,
    /// A supplementary document could not be fetched
    Unreachable,
}

/// A field group an extraction pass could not fill
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMiss {
    pub group: FieldGroup,
    #[serde(flatten)]
    pub reason: MissReason,
}

impl FieldMiss {
    pub fn new(group: FieldGroup, reason: MissReason) -> Self {
        Self { group, reason }
    }
}

impl fmt::Display for FieldMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self.reason {
            MissReason::NoMatch => "no pattern matched",
            MissReason::OutOfBand => "values out of plausible range",
            MissReason::Excluded => "only promotional values found",
            MissReason::NoText => "document had no text",
            MissReason::Unreachable => "document could not be fetched",
        };
        write!(f, "{}: {}", self.group, reason)
    }
}
