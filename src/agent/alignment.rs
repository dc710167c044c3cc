//! Batch alignment validation.
//!
//! Every batch-producing phase must return output ids that correspond to the
//! requested work item ids. The report always enumerates all three
//! discrepancy categories at once; reporting only the first category causes
//! repeated round-trips where the backend fixes one class of error and
//! introduces another.

use std::collections::{BTreeSet, HashMap};

use crate::phase::AlignmentPolicy;

/// Structured discrepancy report for one batch call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AlignmentReport {
    /// Requested ids absent from the output.
    pub missing: Vec<String>,
    /// Returned ids that were never requested.
    pub extra: Vec<String>,
    /// Returned ids appearing more than once.
    pub duplicates: Vec<String>,
}

impl AlignmentReport {
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty() && self.duplicates.is_empty()
    }

    /// One feedback message enumerating every non-empty category, appended
    /// verbatim to the retry prompt.
    pub fn feedback(&self) -> String {
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!(
                "missing ids (requested but not returned): {}",
                self.missing.join(", ")
            ));
        }
        if !self.extra.is_empty() {
            parts.push(format!(
                "extra ids (returned but never requested): {}",
                self.extra.join(", ")
            ));
        }
        if !self.duplicates.is_empty() {
            parts.push(format!(
                "duplicate ids (returned more than once): {}",
                self.duplicates.join(", ")
            ));
        }
        format!(
            "Your previous response had id alignment errors. {}. \
             Return exactly one object per requested id.",
            parts.join("; ")
        )
    }
}

/// Reconcile requested vs. returned ids under the phase's policy.
///
/// Sparse phases (opt-in, e.g. annotation) only flag `extra` and
/// `duplicates`; full coverage is not required of them.
pub fn check(
    expected: &[String],
    returned: &[String],
    policy: AlignmentPolicy,
) -> AlignmentReport {
    let expected_set: BTreeSet<&str> = expected.iter().map(String::as_str).collect();
    let returned_set: BTreeSet<&str> = returned.iter().map(String::as_str).collect();

    let missing = match policy {
        AlignmentPolicy::Exact => expected_set
            .difference(&returned_set)
            .map(|s| s.to_string())
            .collect(),
        AlignmentPolicy::Sparse => Vec::new(),
    };

    let extra: Vec<String> = returned_set
        .difference(&expected_set)
        .map(|s| s.to_string())
        .collect();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for id in returned {
        *counts.entry(id.as_str()).or_insert(0) += 1;
    }
    let mut duplicates: Vec<String> = counts
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(id, _)| id.to_string())
        .collect();
    duplicates.sort();

    AlignmentReport {
        missing,
        extra,
        duplicates,
    }
}
