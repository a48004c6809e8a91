//! Nearest-neighbour face matching over the enrolled gallery.
//!
//! Every detected face is compared against every stored embedding by
//! Euclidean distance. The closest member wins if it is strictly under the
//! match threshold; anything else is reported as unknown.

use crate::types::{DetectedFace, Descriptor, FaceMatch, MatchedFace, MemberEmbedding, MemberId};
use thiserror::Error;

/// Maximum descriptor distance for two faces to be the same person.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.55;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("descriptor length mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("descriptor is empty")]
    EmptyDescriptor,
    #[error("descriptor value at index {index} is not finite")]
    NonFinite { index: usize },
    #[error("match threshold must be finite and positive, got {0}")]
    InvalidThreshold(f32),
}

/// Snapshot of enrolled embeddings used as match candidates.
///
/// Members without an embedding are dropped on construction, and every
/// remaining embedding is checked to share one dimension.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<(MemberId, Descriptor)>,
    dimension: Option<usize>,
}

impl Gallery {
    pub fn new(members: impl IntoIterator<Item = MemberEmbedding>) -> Result<Self, MatchError> {
        let mut entries = Vec::new();
        let mut dimension = None;

        for member in members {
            let Some(embedding) = member.embedding else {
                continue;
            };
            match dimension {
                None => dimension = Some(embedding.len()),
                Some(dim) if dim != embedding.len() => {
                    tracing::error!(
                        member = %member.member_id,
                        expected = dim,
                        actual = embedding.len(),
                        "stored embedding has a different dimension than the gallery"
                    );
                    return Err(MatchError::DimensionMismatch {
                        expected: dim,
                        actual: embedding.len(),
                    });
                }
                Some(_) => {}
            }
            entries.push((member.member_id, embedding));
        }

        Ok(Self { entries, dimension })
    }

    /// Descriptor length shared by all entries, `None` for an empty gallery.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Strategy for classifying an observed descriptor against a gallery.
pub trait Matcher {
    fn classify(&self, observed: &Descriptor, gallery: &Gallery) -> Result<FaceMatch, MatchError>;
}

/// Euclidean nearest-neighbour matcher with a fixed threshold.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    threshold: f32,
}

impl EuclideanMatcher {
    pub fn new(threshold: f32) -> Result<Self, MatchError> {
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(MatchError::InvalidThreshold(threshold));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl Matcher for EuclideanMatcher {
    fn classify(&self, observed: &Descriptor, gallery: &Gallery) -> Result<FaceMatch, MatchError> {
        if let Some(dim) = gallery.dimension() {
            if observed.len() != dim {
                return Err(MatchError::DimensionMismatch {
                    expected: dim,
                    actual: observed.len(),
                });
            }
        }

        let mut best: Option<(usize, f32)> = None;

        // Strict `<` keeps the earliest entry on exact ties.
        for (i, (_, embedding)) in gallery.entries.iter().enumerate() {
            let distance = observed.euclidean_distance(embedding)?;
            if best.map_or(true, |(_, best_distance)| distance < best_distance) {
                best = Some((i, distance));
            }
        }

        Ok(match best {
            Some((idx, distance)) if distance < self.threshold => FaceMatch::Matched {
                member_id: gallery.entries[idx].0.clone(),
                confidence: confidence(distance, self.threshold),
                distance,
            },
            _ => FaceMatch::Unknown,
        })
    }
}

/// Map a distance onto [0, 1]: 1 at distance 0, 0 at the threshold.
pub fn confidence(distance: f32, threshold: f32) -> f32 {
    (1.0 - distance / threshold).max(0.0)
}

/// Classify each face against an already-built gallery. Output order follows input order.
pub fn match_gallery<M: Matcher>(
    matcher: &M,
    faces: &[DetectedFace],
    gallery: &Gallery,
) -> Result<Vec<MatchedFace>, MatchError> {
    faces
        .iter()
        .map(|face| {
            let outcome = matcher.classify(&face.descriptor, gallery)?;
            Ok(MatchedFace {
                face: face.clone(),
                outcome,
            })
        })
        .collect()
}

/// Match detected faces against a list of stored member embeddings.
pub fn match_faces(
    faces: &[DetectedFace],
    members: &[MemberEmbedding],
    threshold: f32,
) -> Result<Vec<MatchedFace>, MatchError> {
    let matcher = EuclideanMatcher::new(threshold)?;
    let gallery = Gallery::new(members.iter().cloned())?;
    match_gallery(&matcher, faces, &gallery)
}
