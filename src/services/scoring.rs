use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::core::config::GradingSettings;
use crate::db::models::CriterionScore;
use crate::db::types::FailureKind;
use crate::services::comparison::{CompareOptions, ComparisonProvider, ProviderError, Similarity};
use crate::services::model_answer_index::{keyword_coverage, ModelAnswerReference, ReferenceSegment};

const ROUNDING_EPSILON: f64 = 1e-9;
const EMPTY_ANSWER_FEEDBACK: &str = "No answer text was found on the sheet.";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringPolicy {
    /// Holistic similarity below this earns no marks.
    pub similarity_floor: f64,
    /// Share of keyword coverage blended into each similarity.
    pub keyword_weight: f64,
    pub compare_timeout: Duration,
}

impl ScoringPolicy {
    pub fn from_grading(grading: &GradingSettings) -> Self {
        Self {
            similarity_floor: grading.similarity_floor,
            keyword_weight: grading.keyword_weight,
            compare_timeout: grading.compare_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreResult {
    pub marks: i32,
    pub total_marks: i32,
    /// `marks / total_marks`, zero when the total is zero.
    pub normalized: f64,
    pub similarity: f64,
    pub keyword_coverage: f64,
    pub criterion_scores: Option<Vec<CriterionScore>>,
    pub feedback: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScoringUnavailable {
    #[error("comparison timed out")]
    Timeout,
    #[error("comparison was rate limited")]
    RateLimited,
    #[error("comparison response was malformed: {0}")]
    MalformedResponse(String),
    #[error("comparison provider unavailable: {0}")]
    ProviderUnavailable(String),
}

impl ScoringUnavailable {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Timeout => FailureKind::Timeout,
            Self::RateLimited => FailureKind::RateLimited,
            Self::MalformedResponse(_) => FailureKind::MalformedResponse,
            Self::ProviderUnavailable(_) => FailureKind::ProviderUnavailable,
        }
    }
}

impl From<ProviderError> for ScoringUnavailable {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Timeout => Self::Timeout,
            ProviderError::RateLimited => Self::RateLimited,
            ProviderError::MalformedResponse(detail) => Self::MalformedResponse(detail),
            ProviderError::Upstream(detail) => Self::ProviderUnavailable(detail),
        }
    }
}

/// Stateless scorer: every call is independent and safe to repeat.
#[derive(Clone)]
pub struct ScoringEngine {
    provider: Arc<dyn ComparisonProvider>,
    policy: ScoringPolicy,
}

impl ScoringEngine {
    pub fn new(provider: Arc<dyn ComparisonProvider>, policy: ScoringPolicy) -> Self {
        Self { provider, policy }
    }

    pub async fn score(
        &self,
        text: &str,
        reference: &ModelAnswerReference,
    ) -> Result<ScoreResult, ScoringUnavailable> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(empty_answer(reference));
        }

        match &reference.criteria {
            None => self.score_holistic(text, reference).await,
            Some(criteria) => {
                let mut scores = Vec::with_capacity(criteria.len());
                let mut weighted_similarity = 0.0;
                let mut total_weight = 0.0;

                for criterion in criteria {
                    let options = CompareOptions {
                        criterion: Some(criterion.criterion.description.as_str()),
                        reference_embedding: Some(&criterion.segment.embedding),
                    };
                    let similarity = self.blended(text, &criterion.segment, &options).await?;
                    scores.push(CriterionScore {
                        criterion_id: criterion.criterion.id.clone(),
                        similarity,
                        marks: round_half_up(similarity * f64::from(criterion.criterion.max_marks)),
                        max_marks: criterion.criterion.max_marks,
                    });
                    weighted_similarity += similarity * criterion.criterion.weight;
                    total_weight += criterion.criterion.weight;
                }

                let marks = aggregate_marks(&scores, reference.total_marks);
                let similarity =
                    if total_weight > 0.0 { weighted_similarity / total_weight } else { 0.0 };
                let coverage = keyword_coverage(&reference.overall.keywords, text);

                Ok(ScoreResult {
                    marks,
                    total_marks: reference.total_marks,
                    normalized: normalized(marks, reference.total_marks),
                    similarity,
                    keyword_coverage: coverage,
                    criterion_scores: Some(scores),
                    feedback: feedback(similarity, coverage),
                })
            }
        }
    }

    async fn score_holistic(
        &self,
        text: &str,
        reference: &ModelAnswerReference,
    ) -> Result<ScoreResult, ScoringUnavailable> {
        let options = CompareOptions {
            criterion: None,
            reference_embedding: Some(&reference.overall.embedding),
        };
        let similarity = self.blended(text, &reference.overall, &options).await?;
        let coverage = keyword_coverage(&reference.overall.keywords, text);
        let marks = holistic_marks(similarity, reference.total_marks, self.policy.similarity_floor);

        Ok(ScoreResult {
            marks,
            total_marks: reference.total_marks,
            normalized: normalized(marks, reference.total_marks),
            similarity,
            keyword_coverage: coverage,
            criterion_scores: None,
            feedback: feedback(similarity, coverage),
        })
    }

    /// Provider similarity, blended with keyword coverage when configured.
    async fn blended(
        &self,
        text: &str,
        segment: &ReferenceSegment,
        options: &CompareOptions<'_>,
    ) -> Result<f64, ScoringUnavailable> {
        let semantic = self.compare(&segment.content, text, options).await?.value();
        let weight = self.policy.keyword_weight;
        if weight <= 0.0 {
            return Ok(semantic);
        }
        let coverage = keyword_coverage(&segment.keywords, text);
        Ok(Similarity::new((1.0 - weight) * semantic + weight * coverage).value())
    }

    async fn compare(
        &self,
        reference: &str,
        candidate: &str,
        options: &CompareOptions<'_>,
    ) -> Result<Similarity, ScoringUnavailable> {
        let strategy = self.provider.name();
        let started = Instant::now();

        let outcome = tokio::time::timeout(
            self.policy.compare_timeout,
            self.provider.compare(reference, candidate, options),
        )
        .await
        .unwrap_or(Err(ProviderError::Timeout));

        let label = match &outcome {
            Ok(_) => "ok",
            Err(ProviderError::Timeout) => "timeout",
            Err(ProviderError::RateLimited) => "rate_limited",
            Err(ProviderError::MalformedResponse(_)) => "malformed",
            Err(ProviderError::Upstream(_)) => "unavailable",
        };
        metrics::counter!("comparison_calls_total", "strategy" => strategy, "outcome" => label)
            .increment(1);
        metrics::histogram!("comparison_duration_seconds", "strategy" => strategy)
            .record(started.elapsed().as_secs_f64());

        if let Err(err) = &outcome {
            tracing::warn!(strategy, error = %err, "Comparison call failed");
        }
        Ok(outcome?)
    }
}

fn empty_answer(reference: &ModelAnswerReference) -> ScoreResult {
    let criterion_scores = reference.criteria.as_ref().map(|criteria| {
        criteria
            .iter()
            .map(|criterion| CriterionScore {
                criterion_id: criterion.criterion.id.clone(),
                similarity: 0.0,
                marks: 0,
                max_marks: criterion.criterion.max_marks,
            })
            .collect()
    });

    ScoreResult {
        marks: 0,
        total_marks: reference.total_marks,
        normalized: 0.0,
        similarity: 0.0,
        keyword_coverage: 0.0,
        criterion_scores,
        feedback: EMPTY_ANSWER_FEEDBACK.to_string(),
    }
}

/// Rounds halves away from zero for non-negative inputs. The epsilon keeps
/// products such as `0.35 * 10` from rounding down on representation error.
pub fn round_half_up(value: f64) -> i32 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    (value + 0.5 + ROUNDING_EPSILON).floor() as i32
}

pub fn holistic_marks(similarity: f64, total_marks: i32, floor: f64) -> i32 {
    if similarity < floor {
        return 0;
    }
    round_half_up(similarity * f64::from(total_marks)).min(total_marks)
}

pub fn aggregate_marks(scores: &[CriterionScore], total_marks: i32) -> i32 {
    let sum: i64 = scores.iter().map(|score| i64::from(score.marks)).sum();
    sum.min(i64::from(total_marks)) as i32
}

fn normalized(marks: i32, total_marks: i32) -> f64 {
    if total_marks <= 0 {
        return 0.0;
    }
    f64::from(marks) / f64::from(total_marks)
}

fn feedback(similarity: f64, coverage: f64) -> String {
    format!(
        "Answer evaluated with {:.1}% semantic similarity and {:.1}% keyword coverage.",
        similarity * 100.0,
        coverage * 100.0
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Criterion;
    use crate::services::model_answer_index::build;
    use crate::test_support::ScriptedProvider;

    fn policy() -> ScoringPolicy {
        ScoringPolicy {
            similarity_floor: 0.2,
            keyword_weight: 0.0,
            compare_timeout: Duration::from_secs(5),
        }
    }

    fn criterion(id: &str, weight: f64, max_marks: i32) -> Criterion {
        Criterion {
            id: id.to_string(),
            description: format!("Covers {id}"),
            weight,
            max_marks,
        }
    }

    #[test]
    fn round_half_up_rounds_halves_up() {
        assert_eq!(round_half_up(2.5), 3);
        assert_eq!(round_half_up(2.4999), 2);
        assert_eq!(round_half_up(0.35 * 10.0), 4);
        assert_eq!(round_half_up(-1.0), 0);
        assert_eq!(round_half_up(f64::NAN), 0);
    }

    #[test]
    fn holistic_marks_respect_floor_and_are_monotonic() {
        assert_eq!(holistic_marks(0.19, 10, 0.2), 0);
        assert_eq!(holistic_marks(0.2, 10, 0.2), 2);
        assert_eq!(holistic_marks(1.0, 10, 0.2), 10);

        let mut previous = 0;
        for step in 0..=1000 {
            let marks = holistic_marks(f64::from(step) / 1000.0, 17, 0.2);
            assert!(marks >= previous, "marks dropped at step {step}");
            previous = marks;
        }
    }

    #[test]
    fn aggregate_is_capped_at_total() {
        let scores = vec![
            CriterionScore { criterion_id: "a".into(), similarity: 1.0, marks: 6, max_marks: 6 },
            CriterionScore { criterion_id: "b".into(), similarity: 1.0, marks: 5, max_marks: 5 },
        ];
        assert_eq!(aggregate_marks(&scores, 10), 10);
    }

    #[tokio::test]
    async fn identical_text_earns_full_marks() {
        let provider = ScriptedProvider::identity();
        let engine = ScoringEngine::new(provider.clone(), policy());
        let reference = build("ma-1", "Plants convert light into chemical energy.", 10, None).unwrap();

        let result = engine
            .score("Plants convert light into chemical energy.", &reference)
            .await
            .unwrap();

        assert_eq!(result.marks, 10);
        assert_eq!(result.normalized, 1.0);
        assert_eq!(result.keyword_coverage, 1.0);
        assert!(result.feedback.contains("100.0% semantic similarity"));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn empty_text_scores_zero_without_calling_provider() {
        let provider = ScriptedProvider::identity();
        let engine = ScoringEngine::new(provider.clone(), policy());
        let reference = build("ma-1", "Plants convert light.", 10, None).unwrap();

        let result = engine.score("  \n\t ", &reference).await.unwrap();

        assert_eq!(result.marks, 0);
        assert_eq!(result.feedback, EMPTY_ANSWER_FEEDBACK);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn criteria_are_scored_independently_and_summed() {
        let provider = ScriptedProvider::by_criterion([("Covers a", 0.5), ("Covers b", 0.75)]);
        let engine = ScoringEngine::new(provider.clone(), policy());
        let criteria = [criterion("a", 0.6, 6), criterion("b", 0.4, 4)];
        let reference = build("ma-1", "Model text.", 10, Some(&criteria)).unwrap();

        let result = engine.score("Student text.", &reference).await.unwrap();

        let breakdown = result.criterion_scores.unwrap();
        let marks: Vec<i32> = breakdown.iter().map(|score| score.marks).collect();
        assert_eq!(marks, vec![3, 3]);
        assert_eq!(result.marks, 6);
        assert!((result.similarity - 0.6).abs() < 1e-9);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn keyword_weight_blends_coverage_into_similarity() {
        let provider = ScriptedProvider::constant(0.5);
        let engine =
            ScoringEngine::new(provider, ScoringPolicy { keyword_weight: 0.5, ..policy() });
        let reference = build("ma-1", "chlorophyll absorbs light", 10, None).unwrap();

        let result = engine.score("chlorophyll absorbs light", &reference).await.unwrap();

        assert!((result.similarity - 0.75).abs() < 1e-9);
        assert_eq!(result.marks, 8);
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let provider = ScriptedProvider::stalled();
        let engine = ScoringEngine::new(
            provider,
            ScoringPolicy { compare_timeout: Duration::from_millis(20), ..policy() },
        );
        let reference = build("ma-1", "text", 10, None).unwrap();

        let err = engine.score("answer", &reference).await.unwrap_err();
        assert_eq!(err, ScoringUnavailable::Timeout);
        assert_eq!(err.failure_kind(), FailureKind::Timeout);
    }

    #[tokio::test]
    async fn provider_errors_map_to_scoring_unavailable() {
        let provider = ScriptedProvider::failing(ProviderError::Upstream("502".to_string()));
        let engine = ScoringEngine::new(provider, policy());
        let reference = build("ma-1", "text", 10, None).unwrap();

        let err = engine.score("answer", &reference).await.unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::ProviderUnavailable);
    }
}
