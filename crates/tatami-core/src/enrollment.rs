//! Enrollment of a new member, optionally seeded with a captured descriptor.

use crate::store::{MemberRegistry, StoreError};
use crate::types::{MemberId, NewMember, MAX_STRIPES};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("first name is required")]
    MissingFirstName,
    #[error("stripes must be between 0 and {MAX_STRIPES}, got {0}")]
    InvalidStripes(u8),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Validate and normalise member details, then create the member.
///
/// A supplied descriptor becomes the initial embedding verbatim; there is
/// no prior value to blend with.
pub fn enroll<R: MemberRegistry + ?Sized>(
    registry: &R,
    member: NewMember,
) -> Result<MemberId, EnrollError> {
    let member = normalize(member)?;
    let has_face = member.descriptor.is_some();
    let id = registry.enroll(&member)?;
    tracing::info!(member = %id, has_face, "member enrolled");
    Ok(id)
}

fn normalize(member: NewMember) -> Result<NewMember, EnrollError> {
    let first_name = member.first_name.trim().to_string();
    if first_name.is_empty() {
        return Err(EnrollError::MissingFirstName);
    }
    if member.stripes > MAX_STRIPES {
        return Err(EnrollError::InvalidStripes(member.stripes));
    }
    let optional = |field: Option<String>| {
        field
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    Ok(NewMember {
        first_name,
        last_name: member.last_name.trim().to_string(),
        email: optional(member.email),
        phone: optional(member.phone),
        belt_rank: member.belt_rank,
        stripes: member.stripes,
        profile_image: member.profile_image,
        descriptor: member.descriptor,
    })
}
