//! Accept/reject decision against enrolled templates.

use crate::types::{AuthResult, DistanceMetric, EmbeddingVector, EnrolledTemplate};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecisionError {
    /// Nothing to compare against: a configuration problem, not a rejection.
    #[error("no enrolled templates")]
    NoEnrolledTemplates,
}

/// Comparison policy: which distance, and how close counts as a match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionPolicy {
    pub metric: DistanceMetric,
    /// Maximum accepted distance (inclusive).
    pub threshold: f32,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        // FaceNet verification operating point on unit-length embeddings.
        Self {
            metric: DistanceMetric::Euclidean,
            threshold: 1.1,
        }
    }
}

/// Compare `probe` against every template and accept if the closest one lies
/// within the threshold.
///
/// Always traverses the whole gallery, so timing does not reveal the match
/// position.
pub fn decide(
    probe: &EmbeddingVector,
    gallery: &[EnrolledTemplate],
    policy: &DecisionPolicy,
) -> Result<AuthResult, DecisionError> {
    if gallery.is_empty() {
        return Err(DecisionError::NoEnrolledTemplates);
    }

    let mut best_distance = f32::INFINITY;
    let mut idx = 0;

    for (i, template) in gallery.iter().enumerate() {
        let distance = probe.distance(&template.embedding, policy.metric);
        if distance < best_distance {
            best_distance = distance;
            idx = i;
        }
    }

    let matched = best_distance <= policy.threshold;

    tracing::info!(
        matched,
        score = best_distance,
        threshold = policy.threshold,
        metric = %policy.metric,
        template = %gallery[idx].id,
        "authentication decision"
    );

    Ok(AuthResult {
        matched,
        score: best_distance,
        metric: policy.metric,
        template_id: Some(gallery[idx].id.clone()),
    })
}
