//! Deterministic weighted grouping
//!
//! Candidates are visited by score descending, id ascending. The first `k`
//! distinct descriptions anchor groups; a candidate whose description is
//! already anchored folds into that group, anything else joins the group
//! with the lowest cumulative score (earliest group on ties).

use crate::error::PlanningError;
use sdo_artifact::{mean, CandidateId, CandidateSubtask, MergedSubtask};
use std::cmp::Ordering;
use std::collections::HashMap;

/// One weighted group
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    /// Highest-scoring member
    pub anchor: CandidateId,
    /// Members, anchor first
    pub members: Vec<CandidateId>,
    /// Member ids folded in as duplicates of the anchor description
    pub duplicates: Vec<CandidateId>,
    /// Sum of member scores
    pub cumulative_score: f64,
}

/// Normalized description key for duplicate detection
#[must_use]
pub fn description_key(description: &str) -> String {
    description
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Number of distinct descriptions
#[must_use]
pub fn distinct_count(candidates: &[CandidateSubtask]) -> usize {
    let mut keys: Vec<String> = candidates.iter().map(|c| description_key(&c.description)).collect();
    keys.sort_unstable();
    keys.dedup();
    keys.len()
}

fn by_score_then_id(a: &CandidateSubtask, b: &CandidateSubtask) -> Ordering {
    b.total_score
        .partial_cmp(&a.total_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.id.cmp(&b.id))
}

/// Group `candidates` into exactly `k` groups
pub fn weighted_groups(candidates: &[CandidateSubtask], k: usize) -> Result<Vec<Group>, PlanningError> {
    let available = distinct_count(candidates);
    if k == 0 || available < k {
        return Err(PlanningError::InsufficientCandidates {
            available,
            required: k,
        });
    }

    let mut ordered: Vec<&CandidateSubtask> = candidates.iter().collect();
    ordered.sort_by(|a, b| by_score_then_id(a, b));

    let mut groups: Vec<Group> = Vec::with_capacity(k);
    let mut anchored: HashMap<String, usize> = HashMap::new();

    for candidate in ordered {
        let key = description_key(&candidate.description);
        let slot = if let Some(&index) = anchored.get(&key) {
            groups[index].duplicates.push(candidate.id.clone());
            index
        } else if groups.len() < k {
            groups.push(Group {
                anchor: candidate.id.clone(),
                members: Vec::new(),
                duplicates: Vec::new(),
                cumulative_score: 0.0,
            });
            anchored.insert(key, groups.len() - 1);
            groups.len() - 1
        } else {
            lightest(&groups)
        };
        let group = &mut groups[slot];
        group.members.push(candidate.id.clone());
        group.cumulative_score += candidate.total_score;
    }
    Ok(groups)
}

fn lightest(groups: &[Group]) -> usize {
    groups
        .iter()
        .enumerate()
        .min_by(|(ia, a), (ib, b)| {
            a.cumulative_score
                .partial_cmp(&b.cumulative_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| ia.cmp(ib))
        })
        .map_or(0, |(i, _)| i)
}

/// Turn groups into merged subtasks
#[must_use]
pub fn groups_to_subtasks(groups: &[Group], candidates: &[CandidateSubtask]) -> Vec<MergedSubtask> {
    let by_id: HashMap<&CandidateId, &CandidateSubtask> = candidates.iter().map(|c| (&c.id, c)).collect();
    groups
        .iter()
        .zip(1_u32..)
        .map(|(group, position)| {
            let scores: Vec<f64> = group
                .members
                .iter()
                .filter_map(|id| by_id.get(id).map(|c| c.total_score))
                .collect();
            let description = by_id
                .get(&group.anchor)
                .map_or_else(String::new, |c| c.description.clone());
            let mut reasoning = format!("anchored on candidate {}", group.anchor);
            let folded: Vec<&str> = group
                .members
                .iter()
                .filter(|id| **id != group.anchor)
                .map(CandidateId::as_str)
                .collect();
            if !folded.is_empty() {
                reasoning.push_str(&format!("; folded in {}", folded.join(", ")));
            }
            MergedSubtask {
                id: position,
                description,
                covered_candidate_ids: group.members.clone(),
                reasoning,
                duplicate_justification: None,
                score: mean(&scores),
            }
        })
        .collect()
}
