// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Propose/reject stable matching over asymmetric preference lists.
//!
//! Side A proposes in the order of its own lists. Side B judges proposals with
//! a `{candidate -> score}` map built from *its* lists. Because the two sides'
//! lists are filtered independently, a side-B member may be proposed to by
//! someone it never ranked:
//!
//! - a free side-B member accepts any proposer;
//! - an unranked proposer is rejected and goes back to the free queue;
//! - an unranked incumbent is replaced by a ranked proposer;
//! - otherwise the strictly higher score wins and ties keep the incumbent.
//!
//! Every pop either advances the proposer's pointer or drops the proposer, so
//! the number of proposals is bounded by the total length of side A's lists.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{MatchResult, PreferenceList};

/// Result of one solver run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SolverOutcome {
    /// Mutually matched pairs, canonicalized, in side-A order.
    pub pairs: Vec<MatchResult>,
    /// Number of proposals made.
    pub proposals: usize,
}

impl SolverOutcome {
    /// Whether `user_id` appears in any pair.
    pub fn is_matched(&self, user_id: &str) -> bool {
        self.pairs.iter().any(|pair| pair.contains(user_id))
    }
}

/// The stable matching solver.
#[derive(Debug, Clone, Copy, Default)]
pub struct StableMatcher;

impl StableMatcher {
    /// Run the propose/reject loop with side A proposing.
    pub fn solve(&self, side_a: &[PreferenceList], side_b: &[PreferenceList]) -> Result<SolverOutcome> {
        let mut proposer_index: HashMap<&str, usize> = HashMap::with_capacity(side_a.len());
        for (i, list) in side_a.iter().enumerate() {
            if proposer_index.insert(list.user_id.as_str(), i).is_some() {
                return Err(Error::SolverInvariant(format!(
                    "user '{}' appears twice on the proposing side",
                    list.user_id
                )));
            }
        }

        let receiver_prefs: HashMap<&str, HashMap<&str, f64>> = side_b
            .iter()
            .map(|list| {
                let prefs = list
                    .references
                    .iter()
                    .map(|r| (r.candidate_id.as_str(), r.score))
                    .collect();
                (list.user_id.as_str(), prefs)
            })
            .collect();
        let no_prefs = HashMap::new();

        let mut next_proposal = vec![0usize; side_a.len()];
        let mut proposer_match: Vec<Option<&str>> = vec![None; side_a.len()];
        let mut receiver_match: HashMap<&str, usize> = HashMap::new();
        let mut free: VecDeque<usize> = (0..side_a.len()).collect();
        let mut proposals = 0usize;

        while let Some(m) = free.pop_front() {
            let list = &side_a[m];
            let Some(reference) = list.references.get(next_proposal[m]) else {
                // exhausted: unmatched this round
                continue;
            };
            next_proposal[m] += 1;
            proposals += 1;

            let w = reference.candidate_id.as_str();
            let Some(&incumbent) = receiver_match.get(w) else {
                receiver_match.insert(w, m);
                proposer_match[m] = Some(w);
                continue;
            };

            let prefs = receiver_prefs.get(w).unwrap_or(&no_prefs);
            let Some(&proposer_score) = prefs.get(list.user_id.as_str()) else {
                free.push_back(m);
                continue;
            };

            let replace = match prefs.get(side_a[incumbent].user_id.as_str()) {
                None => true,
                Some(&incumbent_score) => proposer_score > incumbent_score,
            };

            if replace {
                proposer_match[incumbent] = None;
                free.push_back(incumbent);
                receiver_match.insert(w, m);
                proposer_match[m] = Some(w);
            } else {
                free.push_back(m);
            }
        }

        let mut pairs = Vec::new();
        let mut seen: HashSet<MatchResult> = HashSet::new();
        for (m, matched) in proposer_match.iter().enumerate() {
            let Some(w) = matched else { continue };
            if receiver_match.get(w) != Some(&m) {
                return Err(Error::SolverInvariant(format!(
                    "'{}' holds '{}' but the match is not mutual",
                    side_a[m].user_id, w
                )));
            }
            let pair = MatchResult::new(side_a[m].user_id.as_str(), *w);
            if seen.insert(pair.clone()) {
                pairs.push(pair);
            }
        }

        debug!(
            proposers = side_a.len(),
            receivers = side_b.len(),
            proposals,
            pairs = pairs.len(),
            "Stable matching finished"
        );

        Ok(SolverOutcome { pairs, proposals })
    }
}
