use crate::fields::{FieldName, FieldSet};

/// Combine HTML and PDF extractions.
///
/// The HTML set is the base. For every field in `priority`, a non-null PDF
/// value overwrites it; null PDF values never erase HTML values. Fields not in
/// `priority` keep the HTML value.
pub fn merge(html: &FieldSet, pdf: &FieldSet, priority: &[FieldName]) -> FieldSet {
    let mut merged = html.clone();
    for name in priority {
        if pdf.is_present(*name) {
            merged.copy_field(pdf, *name);
        }
    }
    merged
}
