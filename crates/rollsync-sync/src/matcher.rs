use rollsync_core::{ExternalNameRow, InternalStudent, MatchResult};
use strsim::normalized_levenshtein;

use crate::names::{canonical_student_name, normalize_name};

pub const DEFAULT_MATCH_THRESHOLD: u8 = 80;

/// Confidence reserved for exact normalized matches.
const EXACT_CONFIDENCE: u8 = 100;

pub fn similarity(a: &str, b: &str) -> f64 {
    normalized_levenshtein(a, b)
}

/// Similarity in `[0, 1]` scaled to a whole-number percentage.
pub fn confidence(score: f64) -> u8 {
    (score * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Pairs internal students with portal rows.
///
/// Exact normalized matches are claimed first across all students, then each
/// remaining student takes its best unclaimed row if the confidence clears the
/// threshold. A row is never claimed twice; ties go to the earlier row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StudentMatcher {
    threshold: u8,
}

impl Default for StudentMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl StudentMatcher {
    pub fn new(threshold: u8) -> Self {
        Self {
            threshold: threshold.min(EXACT_CONFIDENCE),
        }
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn match_students(
        &self,
        internal: &[InternalStudent],
        external: &[ExternalNameRow],
    ) -> Vec<MatchResult> {
        let student_names = internal
            .iter()
            .map(canonical_student_name)
            .collect::<Vec<_>>();
        let row_names = external
            .iter()
            .map(|row| normalize_name(&row.name))
            .collect::<Vec<_>>();

        let mut claimed = vec![false; external.len()];
        let mut assigned: Vec<Option<(usize, u8)>> = vec![None; internal.len()];
        let mut best_seen = vec![0u8; internal.len()];

        for (si, name) in student_names.iter().enumerate() {
            if let Some(ri) = (0..external.len()).find(|&ri| !claimed[ri] && row_names[ri] == *name) {
                claimed[ri] = true;
                assigned[si] = Some((ri, EXACT_CONFIDENCE));
            }
        }

        for si in 0..internal.len() {
            if assigned[si].is_some() {
                continue;
            }
            let mut best: Option<(usize, u8)> = None;
            for ri in 0..external.len() {
                if claimed[ri] {
                    continue;
                }
                // Anything short of equal text stays below an exact match.
                let score = confidence(similarity(&student_names[si], &row_names[ri]))
                    .min(EXACT_CONFIDENCE - 1);
                if best.map_or(true, |(_, b)| score > b) {
                    best = Some((ri, score));
                }
            }
            if let Some((ri, score)) = best {
                best_seen[si] = score;
                if score >= self.threshold {
                    claimed[ri] = true;
                    assigned[si] = Some((ri, score));
                }
            }
        }

        internal
            .iter()
            .zip(assigned)
            .zip(best_seen)
            .map(|((student, slot), best)| match slot {
                Some((ri, score)) => MatchResult {
                    student_id: student.student_id.clone(),
                    matched: true,
                    external_name: Some(external[ri].name.clone()),
                    external_row_reference: Some(external[ri].external_row_reference.clone()),
                    confidence: score,
                },
                None => MatchResult {
                    student_id: student.student_id.clone(),
                    matched: false,
                    external_name: None,
                    external_row_reference: None,
                    confidence: best,
                },
            })
            .collect()
    }
}

/// Matches with the default threshold.
pub fn match_students(
    internal: &[InternalStudent],
    external: &[ExternalNameRow],
) -> Vec<MatchResult> {
    StudentMatcher::default().match_students(internal, external)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student(id: &str, first: &str, last: &str) -> InternalStudent {
        InternalStudent {
            student_id: id.into(),
            first_name: first.into(),
            last_name: last.into(),
        }
    }

    fn row(name: &str, reference: &str) -> ExternalNameRow {
        ExternalNameRow {
            name: name.into(),
            external_row_reference: reference.into(),
        }
    }

    #[test]
    fn exact_match_ignores_accents_and_case() {
        let results = match_students(
            &[student("s1", "José", "García")],
            &[row("GARCIA,  Jose", "r1")],
        );
        assert_eq!(results.len(), 1);
        assert!(results[0].matched);
        assert_eq!(results[0].confidence, 100);
        assert_eq!(results[0].external_row_reference.as_deref(), Some("r1"));
        assert_eq!(results[0].external_name.as_deref(), Some("GARCIA,  Jose"));
    }

    #[test]
    fn fuzzy_match_reports_partial_confidence() {
        let results = match_students(&[student("s1", "Jon", "Smith")], &[row("Smith, John", "r1")]);
        assert!(results[0].matched);
        assert_eq!(results[0].confidence, 91);
    }

    #[test]
    fn threshold_is_inclusive() {
        // "smith, ann" vs "smith, amm": 2 edits over 10 chars.
        let at = match_students(&[student("s1", "Ann", "Smith")], &[row("Smith, Amm", "r1")]);
        assert!(at[0].matched);
        assert_eq!(at[0].confidence, 80);

        // 4 edits over 19 chars rounds to 79.
        let below = match_students(
            &[student("s1", "Firstname", "Lastname")],
            &[row("Lastname, Firstxxxx", "r1")],
        );
        assert!(!below[0].matched);
        assert_eq!(below[0].confidence, 79);
        assert_eq!(below[0].external_row_reference, None);
    }

    #[test]
    fn custom_threshold_applies() {
        let lenient = StudentMatcher::new(75);
        let results = lenient.match_students(
            &[student("s1", "Firstname", "Lastname")],
            &[row("Lastname, Firstxxxx", "r1")],
        );
        assert!(results[0].matched);
        assert_eq!(StudentMatcher::new(250).threshold(), 100);
    }

    #[test]
    fn exact_matches_win_over_earlier_fuzzy_candidates() {
        let results = match_students(
            &[student("s1", "Jon", "Smith"), student("s2", "John", "Smith")],
            &[row("Smith, John", "r1")],
        );
        assert!(!results[0].matched);
        assert_eq!(results[0].confidence, 0);
        assert!(results[1].matched);
        assert_eq!(results[1].confidence, 100);
    }

    #[test]
    fn exact_row_preferred_over_fuzzy_row() {
        let results = match_students(
            &[student("s1", "John", "Smith")],
            &[row("Smith, Jon", "r1"), row("Smith, John", "r2")],
        );
        assert_eq!(results[0].external_row_reference.as_deref(), Some("r2"));
        assert_eq!(results[0].confidence, 100);
    }

    #[test]
    fn rows_are_never_claimed_twice() {
        let results = match_students(
            &[
                student("s1", "Ann", "Lee"),
                student("s2", "Ann", "Lee"),
                student("s3", "Anne", "Lee"),
            ],
            &[row("Lee, Ann", "r1"), row("Lee, Ann", "r2")],
        );
        let refs = results
            .iter()
            .filter_map(|r| r.external_row_reference.clone())
            .collect::<Vec<_>>();
        assert_eq!(refs, vec!["r1".to_string(), "r2".to_string()]);
        assert!(!results[2].matched);
    }

    #[test]
    fn ties_go_to_earlier_row() {
        let results = match_students(
            &[student("s1", "Jon", "Smith")],
            &[row("Smith, Jan", "r1"), row("Smith, Jen", "r2")],
        );
        assert_eq!(results[0].external_row_reference.as_deref(), Some("r1"));
    }

    #[test]
    fn one_result_per_student_in_input_order() {
        let students = vec![
            student("s2", "Bea", "Zed"),
            student("s1", "Al", "Ames"),
            student("s3", "Cy", "Moe"),
        ];
        let results = match_students(&students, &[]);
        assert_eq!(
            results.iter().map(|r| r.student_id.as_str()).collect::<Vec<_>>(),
            vec!["s2", "s1", "s3"]
        );
        assert!(results.iter().all(|r| !r.matched && r.confidence == 0));
    }
}
