//! Incremental embedding learning from confirmed check-ins.
//!
//! A member's stored embedding drifts toward freshly observed descriptors:
//! `new = old * 0.7 + observed * 0.3`. The first observation is stored as-is.

use crate::matcher::MatchError;
use crate::types::Descriptor;

/// Weight kept from the stored embedding on each update.
pub const STORED_WEIGHT: f32 = 0.7;
/// Weight given to the newly observed descriptor on each update.
pub const OBSERVED_WEIGHT: f32 = 0.3;

/// Blend an observed descriptor into the current stored embedding.
///
/// With no stored embedding the observation is returned verbatim.
pub fn blend(current: Option<&Descriptor>, observed: &Descriptor) -> Result<Descriptor, MatchError> {
    let Some(current) = current else {
        return Ok(observed.clone());
    };

    if current.len() != observed.len() {
        return Err(MatchError::DimensionMismatch {
            expected: current.len(),
            actual: observed.len(),
        });
    }

    let values = current
        .values()
        .iter()
        .zip(observed.values())
        .map(|(old, new)| old * STORED_WEIGHT + new * OBSERVED_WEIGHT)
        .collect();

    Descriptor::new(values)
}
