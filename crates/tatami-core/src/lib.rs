//! tatami-core — face matching and embedding learning for the check-in kiosk.
//!
//! Detected faces are matched to enrolled members by Euclidean
//! nearest-neighbour search; confirmed check-ins refine the stored
//! embedding with a weighted running average.

pub mod detector;
pub mod enrollment;
pub mod learning;
pub mod matcher;
pub mod store;
pub mod types;
pub mod updater;

pub use detector::{Detector, DetectorError};
pub use enrollment::{enroll, EnrollError};
pub use matcher::{
    match_faces, match_gallery, EuclideanMatcher, Gallery, MatchError, Matcher,
    DEFAULT_MATCH_THRESHOLD,
};
pub use store::{
    AttendanceRecorder, CheckIn, CheckInMethod, CheckInOutcome, EmbeddingStore, MemberRegistry,
    StoreError,
};
pub use types::{
    BeltRank, DetectedFace, Descriptor, FaceBox, FaceMatch, MatchedFace, MemberCard,
    MemberEmbedding, MemberId, NewMember, MAX_STRIPES,
};
pub use updater::{EmbeddingUpdater, UpdateError, UpdateOutcome};
