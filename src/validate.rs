//! Post-merge plausibility checks
//!
//! Every rule that changes a value leaves a [`Repair`] behind so a record can
//! be audited back to what the sources actually said. Rejections are never
//! fatal: the field is nulled or defaulted and processing continues.

use std::fmt;

use serde::Serialize;
use tracing::warn;

use crate::fields::{FieldGroup, FieldSet};
use crate::profile::ProductProfile;

/// Rates outside this band are treated as misreads
pub const VALID_RATE_BAND: (f64, f64) = (0.003, 0.2);

/// Minimum loan amount assumed when only the maximum is published
pub const DEFAULT_MIN_AMOUNT: i64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    /// Values removed
    Discarded,
    /// Bounds exchanged
    Swapped,
    /// The known bound copied to the unknown one
    Mirrored,
    /// Filled from the profile or loan-type defaults
    Defaulted,
}

/// One validation rule applied to a field group
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Repair {
    pub group: FieldGroup,
    pub action: RepairAction,
    pub detail: String,
}

impl Repair {
    fn new(group: FieldGroup, action: RepairAction, detail: impl Into<String>) -> Self {
        Self {
            group,
            action,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Repair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}: {}", self.group, self.action, self.detail)
    }
}

/// Validated fields plus the repairs that produced them
#[derive(Debug, Clone, PartialEq)]
pub struct Validated {
    pub fields: FieldSet,
    pub repairs: Vec<Repair>,
}

/// Apply the plausibility rules to a merged field set
pub fn validate(fields: FieldSet, profile: &ProductProfile) -> Validated {
    let mut fields = fields;
    let mut repairs = Vec::new();

    check_rate(&mut fields, &mut repairs);
    check_amount(&mut fields, &mut repairs);
    check_term(&mut fields, profile, &mut repairs);
    check_age(&mut fields, profile, &mut repairs);

    for repair in &repairs {
        warn!(%repair, "field repaired");
    }

    Validated { fields, repairs }
}

fn check_rate(fields: &mut FieldSet, repairs: &mut Vec<Repair>) {
    let reason = match fields.rate_range() {
        (None, None) => return,
        (Some(min), Some(max)) if min > max => {
            format!("min {} above max {}", min, max)
        }
        (Some(min), Some(_)) if min < VALID_RATE_BAND.0 => {
            format!("min {} below {}", min, VALID_RATE_BAND.0)
        }
        (Some(_), Some(max)) if max > VALID_RATE_BAND.1 => {
            format!("max {} above {}", max, VALID_RATE_BAND.1)
        }
        (Some(_), Some(_)) => return,
        (min, max) => format!("one-sided rate {:?}/{:?}", min, max),
    };

    fields.interest_rate_min = None;
    fields.interest_rate_max = None;
    repairs.push(Repair::new(FieldGroup::Rate, RepairAction::Discarded, reason));
}

fn check_amount(fields: &mut FieldSet, repairs: &mut Vec<Repair>) {
    match fields.amount_range() {
        (min, Some(max)) if min.map_or(true, |min| min > max) => {
            let repaired = max.min(DEFAULT_MIN_AMOUNT);
            fields.loan_amount_min = Some(repaired);
            repairs.push(Repair::new(
                FieldGroup::Amount,
                RepairAction::Defaulted,
                format!("min {:?} set to {} (max {})", min, repaired, max),
            ));
        }
        (Some(min), None) => {
            fields.loan_amount_min = None;
            repairs.push(Repair::new(
                FieldGroup::Amount,
                RepairAction::Discarded,
                format!("min {} without max", min),
            ));
        }
        _ => {}
    }
}

fn check_term(fields: &mut FieldSet, profile: &ProductProfile, repairs: &mut Vec<Repair>) {
    match fields.term_range() {
        (Some(min), Some(max)) if min > max => {
            fields.loan_term_min = Some(max);
            fields.loan_term_max = Some(min);
            repairs.push(Repair::new(
                FieldGroup::Term,
                RepairAction::Swapped,
                format!("{} > {} months", min, max),
            ));
        }
        (Some(value), None) | (None, Some(value)) => {
            fields.loan_term_min = Some(value);
            fields.loan_term_max = Some(value);
            repairs.push(Repair::new(
                FieldGroup::Term,
                RepairAction::Mirrored,
                format!("{} months", value),
            ));
        }
        (None, None) => {
            if let Some((min, max)) = profile.default_term_range {
                fields.loan_term_min = Some(min);
                fields.loan_term_max = Some(max);
                repairs.push(Repair::new(
                    FieldGroup::Term,
                    RepairAction::Defaulted,
                    format!("{}-{} months from profile", min, max),
                ));
            }
        }
        _ => {}
    }
}

fn check_age(fields: &mut FieldSet, profile: &ProductProfile, repairs: &mut Vec<Repair>) {
    let (default_min, default_max) = profile.age_defaults();

    match fields.age_range() {
        (None, None) => {
            fields.age_min = Some(default_min);
            fields.age_max = Some(default_max);
            repairs.push(Repair::new(
                FieldGroup::Age,
                RepairAction::Defaulted,
                format!("{}-{}", default_min, default_max),
            ));
        }
        (Some(_), None) => {
            fields.age_max = Some(default_max);
            repairs.push(Repair::new(
                FieldGroup::Age,
                RepairAction::Defaulted,
                format!("max {}", default_max),
            ));
        }
        (None, Some(_)) => {
            fields.age_min = Some(default_min);
            repairs.push(Repair::new(
                FieldGroup::Age,
                RepairAction::Defaulted,
                format!("min {}", default_min),
            ));
        }
        _ => {}
    }

    if let (Some(min), Some(max)) = fields.age_range() {
        if min > max {
            fields.age_min = Some(max);
            fields.age_max = Some(min);
            repairs.push(Repair::new(
                FieldGroup::Age,
                RepairAction::Swapped,
                format!("{} > {}", min, max),
            ));
        }
    }
}
