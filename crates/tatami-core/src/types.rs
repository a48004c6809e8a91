use serde::{Deserialize, Serialize};
use std::fmt;

use crate::matcher::MatchError;

/// Opaque member identifier (a UUID string when issued by the SQLite store).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MemberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Fixed-length face descriptor produced by the detector model
/// (128-dimensional for the models the kiosk ships with).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Descriptor(Vec<f32>);

impl Descriptor {
    /// Build a descriptor, rejecting empty or non-finite vectors.
    pub fn new(values: Vec<f32>) -> Result<Self, MatchError> {
        if values.is_empty() {
            return Err(MatchError::EmptyDescriptor);
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(MatchError::NonFinite { index });
        }
        Ok(Self(values))
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_values(self) -> Vec<f32> {
        self.0
    }

    /// Euclidean distance to `other`. Both descriptors must have the same length.
    pub fn euclidean_distance(&self, other: &Descriptor) -> Result<f32, MatchError> {
        if self.len() != other.len() {
            return Err(MatchError::DimensionMismatch {
                expected: self.len(),
                actual: other.len(),
            });
        }
        Ok(self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt())
    }
}

impl TryFrom<Vec<f32>> for Descriptor {
    type Error = MatchError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Descriptor> for Vec<f32> {
    fn from(descriptor: Descriptor) -> Self {
        descriptor.0
    }
}

/// Face rectangle normalized to the frame: every field is a fraction of
/// the frame width or height.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl FaceBox {
    /// Normalize a pixel-space rectangle against the frame dimensions.
    pub fn from_pixels(x: f32, y: f32, width: f32, height: f32, frame_w: u32, frame_h: u32) -> Self {
        let fw = frame_w.max(1) as f32;
        let fh = frame_h.max(1) as f32;
        Self {
            x: x / fw,
            y: y / fh,
            width: width / fw,
            height: height / fh,
        }
    }

    /// True when the box lies within the unit square.
    pub fn is_normalized(&self) -> bool {
        let in_unit = |v: f32| v.is_finite() && (0.0..=1.0).contains(&v);
        in_unit(self.x)
            && in_unit(self.y)
            && in_unit(self.width)
            && in_unit(self.height)
            && self.x + self.width <= 1.0 + f32::EPSILON
            && self.y + self.height <= 1.0 + f32::EPSILON
    }
}

/// A face found in one frame. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    #[serde(rename = "box")]
    pub bbox: FaceBox,
    pub descriptor: Descriptor,
}

/// A member's stored embedding, absent until the member is enrolled with a face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberEmbedding {
    pub member_id: MemberId,
    pub embedding: Option<Descriptor>,
}

/// Outcome of matching one detected face against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaceMatch {
    Matched {
        member_id: MemberId,
        /// 1.0 at distance 0, falling linearly to 0.0 at the threshold.
        confidence: f32,
        distance: f32,
    },
    Unknown,
}

impl FaceMatch {
    pub fn member_id(&self) -> Option<&MemberId> {
        match self {
            FaceMatch::Matched { member_id, .. } => Some(member_id),
            FaceMatch::Unknown => None,
        }
    }

    pub fn confidence(&self) -> f32 {
        match self {
            FaceMatch::Matched { confidence, .. } => *confidence,
            FaceMatch::Unknown => 0.0,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, FaceMatch::Unknown)
    }
}

/// A detected face together with its match outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedFace {
    pub face: DetectedFace,
    pub outcome: FaceMatch,
}

/// Stripes a belt can carry before promotion.
pub const MAX_STRIPES: u8 = 4;

/// Jiu-jitsu belt rank. New members start on white.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeltRank {
    #[default]
    White,
    Blue,
    Purple,
    Brown,
    Black,
}

impl BeltRank {
    pub fn as_str(&self) -> &'static str {
        match self {
            BeltRank::White => "white",
            BeltRank::Blue => "blue",
            BeltRank::Purple => "purple",
            BeltRank::Brown => "brown",
            BeltRank::Black => "black",
        }
    }
}

impl std::str::FromStr for BeltRank {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "white" => BeltRank::White,
            "blue" => BeltRank::Blue,
            "purple" => BeltRank::Purple,
            "brown" => BeltRank::Brown,
            "black" => BeltRank::Black,
            other => return Err(format!("unknown belt rank: {other}")),
        })
    }
}

/// What the kiosk shows to greet a member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberCard {
    pub id: MemberId,
    pub first_name: String,
    pub last_name: String,
    pub belt_rank: BeltRank,
    pub stripes: u8,
    /// Fetch the photo itself with the profile image call.
    pub has_profile_image: bool,
}

/// Details for a new member created at the kiosk or by an admin.
#[derive(Debug, Clone, Default)]
pub struct NewMember {
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub belt_rank: BeltRank,
    pub stripes: u8,
    /// PNG-encoded profile photo.
    pub profile_image: Option<Vec<u8>>,
    pub descriptor: Option<Descriptor>,
}
