//! Coverage check for merged plans
//!
//! The union of `covered_candidate_ids` across merged subtasks must equal
//! the candidate set exactly. A candidate may appear in a second subtask
//! only if that subtask carries a duplicate justification.

use sdo_artifact::{CandidateId, MergedSubtask};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Outcome of a coverage check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageReport {
    /// Candidates no subtask covers
    pub missing: Vec<CandidateId>,
    /// Ids that name no generated candidate
    pub fabricated: Vec<CandidateId>,
    /// Candidates repeated without justification
    pub unjustified_duplicates: Vec<CandidateId>,
    /// Subtasks required
    pub expected_count: usize,
    /// Subtasks proposed
    pub actual_count: usize,
}

impl CoverageReport {
    /// No violation of any kind
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.missing.is_empty()
            && self.fabricated.is_empty()
            && self.unjustified_duplicates.is_empty()
            && self.expected_count == self.actual_count
    }
}

fn join(ids: &[CandidateId]) -> String {
    ids.iter().map(CandidateId::as_str).collect::<Vec<_>>().join(", ")
}

impl fmt::Display for CoverageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            return f.write_str("coverage complete");
        }
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("missing [{}]", join(&self.missing)));
        }
        if !self.fabricated.is_empty() {
            parts.push(format!("unknown [{}]", join(&self.fabricated)));
        }
        if !self.unjustified_duplicates.is_empty() {
            parts.push(format!(
                "unjustified duplicates [{}]",
                join(&self.unjustified_duplicates)
            ));
        }
        if self.expected_count != self.actual_count {
            parts.push(format!(
                "expected {} subtasks, got {}",
                self.expected_count, self.actual_count
            ));
        }
        f.write_str(&parts.join("; "))
    }
}

/// Check `merged` against the generated `candidates` and required size `k`
#[must_use]
pub fn check_coverage(candidates: &[CandidateId], merged: &[MergedSubtask], k: usize) -> CoverageReport {
    let known: BTreeSet<&CandidateId> = candidates.iter().collect();
    let mut seen: HashMap<&CandidateId, usize> = HashMap::new();
    let mut fabricated = BTreeSet::new();
    let mut duplicates = BTreeSet::new();

    for subtask in merged {
        let justified = subtask
            .duplicate_justification
            .as_deref()
            .is_some_and(|j| !j.trim().is_empty());
        for id in &subtask.covered_candidate_ids {
            if !known.contains(id) {
                fabricated.insert(id.clone());
                continue;
            }
            let count = seen.entry(id).or_insert(0);
            *count += 1;
            if *count > 1 && !justified {
                duplicates.insert(id.clone());
            }
        }
    }

    CoverageReport {
        missing: known
            .iter()
            .filter(|id| !seen.contains_key(*id))
            .map(|id| (*id).clone())
            .collect(),
        fabricated: fabricated.into_iter().collect(),
        unjustified_duplicates: duplicates.into_iter().collect(),
        expected_count: k,
        actual_count: merged.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<CandidateId> {
        raw.iter().map(|s| CandidateId::from(*s)).collect()
    }

    fn subtask(id: u32, covers: &[&str], justification: Option<&str>) -> MergedSubtask {
        MergedSubtask {
            id,
            description: format!("step {id}"),
            covered_candidate_ids: ids(covers),
            reasoning: String::new(),
            duplicate_justification: justification.map(ToString::to_string),
            score: 0.0,
        }
    }

    #[test]
    fn complete_partition_is_valid() {
        let report = check_coverage(
            &ids(&["1", "2", "3"]),
            &[subtask(1, &["1", "3"], None), subtask(2, &["2"], None)],
            2,
        );
        assert!(report.is_valid(), "{report}");
    }

    #[test]
    fn omission_and_fabrication_are_reported() {
        let report = check_coverage(
            &ids(&["1", "2", "3"]),
            &[subtask(1, &["1", "9"], None), subtask(2, &["2"], None)],
            2,
        );
        assert_eq!(report.missing, ids(&["3"]));
        assert_eq!(report.fabricated, ids(&["9"]));
        assert!(report.to_string().contains("missing [3]"));
    }

    #[test]
    fn duplicates_need_justification() {
        let candidates = ids(&["1", "2"]);
        let bare = check_coverage(
            &candidates,
            &[subtask(1, &["1", "2"], None), subtask(2, &["2"], None)],
            2,
        );
        assert_eq!(bare.unjustified_duplicates, ids(&["2"]));

        let justified = check_coverage(
            &candidates,
            &[
                subtask(1, &["1", "2"], None),
                subtask(2, &["2"], Some("shared schema migration")),
            ],
            2,
        );
        assert!(justified.is_valid());
    }

    #[test]
    fn wrong_size_is_a_violation() {
        let report = check_coverage(&ids(&["1", "2"]), &[subtask(1, &["1", "2"], None)], 2);
        assert!(!report.is_valid());
        assert!(report.to_string().contains("expected 2 subtasks, got 1"));
    }
}
