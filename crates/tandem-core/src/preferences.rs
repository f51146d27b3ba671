// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Preference list building.
//!
//! Turns two sides of a batch into ranked [`PreferenceList`]s using the
//! [`CompatibilityScorer`]. The zodiac term is the only asynchronous input; it
//! is looked up once per (sign, sign) pair per build and awaited in order, so
//! the resulting lists never depend on lookup completion order.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::collaborators::ZodiacTable;
use crate::error::Result;
use crate::model::{CandidateReference, Gender, PreferenceList, UserSnapshot, ZodiacSign};
use crate::scoring::CompatibilityScorer;

/// Builds ranked preference lists for one side against the other.
pub struct PreferenceListBuilder {
    scorer: CompatibilityScorer,
    zodiac: Arc<dyn ZodiacTable>,
}

impl PreferenceListBuilder {
    /// Create a builder.
    pub fn new(scorer: CompatibilityScorer, zodiac: Arc<dyn ZodiacTable>) -> Self {
        Self { scorer, zodiac }
    }

    /// The scorer used by this builder.
    pub fn scorer(&self) -> &CompatibilityScorer {
        &self.scorer
    }

    /// Build one list per proposer, in proposer order.
    ///
    /// Every list holds exactly the candidates that pass the scorer's filter,
    /// sorted by score descending with ties kept in candidate order. A proposer
    /// with no passing candidate gets an empty list.
    pub async fn build(
        &self,
        proposers: &[UserSnapshot],
        candidates: &[UserSnapshot],
    ) -> Result<Vec<PreferenceList>> {
        let mut zodiac_memo: HashMap<(ZodiacSign, ZodiacSign), f64> = HashMap::new();
        let mut lists = Vec::with_capacity(proposers.len());

        for proposer in proposers {
            let mut references = Vec::new();

            for candidate in candidates {
                if !self.scorer.is_candidate(proposer, candidate) {
                    continue;
                }

                let zodiac = if CompatibilityScorer::needs_zodiac(proposer, candidate) {
                    let key = (proposer.zodiac, candidate.zodiac);
                    match zodiac_memo.get(&key) {
                        Some(score) => *score,
                        None => {
                            let score = self.zodiac.compatibility(key.0, key.1).await?;
                            zodiac_memo.insert(key, score);
                            score
                        }
                    }
                } else {
                    0.0
                };

                references.push(CandidateReference {
                    candidate_id: candidate.id.clone(),
                    score: self.scorer.score(proposer, candidate, zodiac),
                });
            }

            // sort_by is stable: equal scores keep candidate order
            references.sort_by(|a, b| b.score.total_cmp(&a.score));

            debug!(
                user_id = %proposer.id,
                candidates = references.len(),
                "Built preference list"
            );

            lists.push(PreferenceList {
                user_id: proposer.id.clone(),
                references,
            });
        }

        Ok(lists)
    }
}

/// Partition a batch into the two solver sides.
///
/// Side A is male, side B is female. Members of any other gender cannot be
/// placed on either side and are returned separately; they sit out the round.
pub fn split_by_side(
    users: Vec<UserSnapshot>,
) -> (Vec<UserSnapshot>, Vec<UserSnapshot>, Vec<UserSnapshot>) {
    let mut side_a = Vec::new();
    let mut side_b = Vec::new();
    let mut unplaced = Vec::new();

    for user in users {
        match user.gender {
            Gender::Male => side_a.push(user),
            Gender::Female => side_b.push(user),
            Gender::Another => unplaced.push(user),
        }
    }

    (side_a, side_b, unplaced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ZodiacMatrix;
    use crate::error::Error;
    use crate::model::{GeoPoint, MatchPreferences};
    use crate::scoring::RangePolicy;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTable {
        inner: ZodiacMatrix,
        lookups: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ZodiacTable for CountingTable {
        async fn compatibility(&self, sign: ZodiacSign, partner: ZodiacSign) -> Result<f64> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::collaborator("zodiac table", "unavailable"));
            }
            self.inner.compatibility(sign, partner).await
        }
    }

    fn counting(fail: bool) -> Arc<CountingTable> {
        Arc::new(CountingTable {
            inner: ZodiacMatrix::new().with_score(ZodiacSign::Leo, ZodiacSign::Aries, 10.0),
            lookups: AtomicUsize::new(0),
            fail,
        })
    }

    fn scorer() -> CompatibilityScorer {
        CompatibilityScorer::with_reference_date(
            RangePolicy::SoftDecay,
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        )
    }

    fn person(id: &str, gender: Gender, desired: Gender, lon: f64) -> UserSnapshot {
        UserSnapshot {
            id: id.to_string(),
            gender,
            location: Some(GeoPoint::new(lon, 21.0)),
            birth_date: NaiveDate::from_ymd_opt(1995, 5, 5),
            zodiac: ZodiacSign::Leo,
            interests: BTreeSet::new(),
            preferences: MatchPreferences {
                desired_gender: desired,
                max_distance_km: 20.0,
                interest_weight: 0,
                distance_weight: 10,
                zodiac_weight: 0,
                age_weight: 0,
                max_age_difference: 5,
            },
        }
    }

    fn ids(list: &PreferenceList) -> Vec<&str> {
        list.references
            .iter()
            .map(|r| r.candidate_id.as_str())
            .collect()
    }

    #[tokio::test]
    async fn test_lists_sorted_by_score_descending() {
        let builder = PreferenceListBuilder::new(scorer(), counting(false));
        let men = vec![person("m1", Gender::Male, Gender::Female, 105.0)];
        let women = vec![
            person("far", Gender::Female, Gender::Male, 105.10),
            person("near", Gender::Female, Gender::Male, 105.01),
            person("mid", Gender::Female, Gender::Male, 105.05),
        ];

        let lists = builder.build(&men, &women).await.unwrap();
        assert_eq!(lists.len(), 1);
        assert_eq!(ids(&lists[0]), vec!["near", "mid", "far"]);
        assert!(lists[0].references[0].score > lists[0].references[1].score);
    }

    #[tokio::test]
    async fn test_ties_keep_candidate_order() {
        let builder = PreferenceListBuilder::new(scorer(), counting(false));
        let men = vec![person("m1", Gender::Male, Gender::Female, 105.0)];
        let women = vec![
            person("w2", Gender::Female, Gender::Male, 105.0),
            person("w1", Gender::Female, Gender::Male, 105.0),
            person("w3", Gender::Female, Gender::Male, 105.0),
        ];

        let lists = builder.build(&men, &women).await.unwrap();
        assert_eq!(ids(&lists[0]), vec!["w2", "w1", "w3"]);
    }

    #[tokio::test]
    async fn test_filtered_candidates_never_listed() {
        let builder = PreferenceListBuilder::new(scorer(), counting(false));
        let men = vec![person("m1", Gender::Male, Gender::Female, 105.0)];
        let women = vec![
            person("w1", Gender::Female, Gender::Male, 105.0),
            person("w2", Gender::Female, Gender::Female, 105.0),
        ];

        let lists = builder.build(&men, &women).await.unwrap();
        assert_eq!(ids(&lists[0]), vec!["w1"]);

        let reverse = builder.build(&women, &men).await.unwrap();
        assert_eq!(ids(&reverse[0]), vec!["m1"]);
        assert!(reverse[1].references.is_empty());
    }

    #[tokio::test]
    async fn test_zodiac_lookups_memoized_per_build() {
        let table = counting(false);
        let builder = PreferenceListBuilder::new(scorer(), table.clone());
        let men = vec![
            person("m1", Gender::Male, Gender::Female, 105.0),
            person("m2", Gender::Male, Gender::Female, 105.0),
        ];
        let women = vec![
            person("w1", Gender::Female, Gender::Male, 105.0),
            person("w2", Gender::Female, Gender::Male, 105.0),
        ];

        builder.build(&men, &women).await.unwrap();
        // every pair is (Leo, Leo)
        assert_eq!(table.lookups.load(Ordering::SeqCst), 1);

        builder.build(&men, &women).await.unwrap();
        assert_eq!(table.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_sign_skips_lookup() {
        let table = counting(false);
        let builder = PreferenceListBuilder::new(scorer(), table.clone());
        let mut man = person("m1", Gender::Male, Gender::Female, 105.0);
        man.zodiac = ZodiacSign::Unknown;
        let women = vec![person("w1", Gender::Female, Gender::Male, 105.0)];

        let lists = builder.build(&[man], &women).await.unwrap();
        assert_eq!(lists[0].references.len(), 1);
        assert_eq!(table.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zodiac_failure_propagates() {
        let builder = PreferenceListBuilder::new(scorer(), counting(true));
        let men = vec![person("m1", Gender::Male, Gender::Female, 105.0)];
        let women = vec![person("w1", Gender::Female, Gender::Male, 105.0)];

        let err = builder.build(&men, &women).await.unwrap_err();
        assert_eq!(err.error_code(), "COLLABORATOR_ERROR");
    }

    #[test]
    fn test_split_by_side() {
        let users = vec![
            person("m1", Gender::Male, Gender::Female, 105.0),
            person("x1", Gender::Another, Gender::Another, 105.0),
            person("f1", Gender::Female, Gender::Male, 105.0),
            person("m2", Gender::Male, Gender::Female, 105.0),
        ];

        let (a, b, rest) = split_by_side(users);
        let a: Vec<_> = a.iter().map(|u| u.id.as_str()).collect();
        let b: Vec<_> = b.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(a, vec!["m1", "m2"]);
        assert_eq!(b, vec!["f1"]);
        assert_eq!(rest.len(), 1);
    }
}
