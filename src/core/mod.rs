pub mod exif;
pub mod faces;
pub mod hash;
pub mod keypoints;
pub mod scanner;
pub mod scoring;
pub mod similarity;
#[cfg(feature = "opencv")]
pub mod vision;

pub use exif::{CaptureInfo, ExifService};
pub use faces::{FaceBox, FaceDetector, NoFaceDetector};
#[cfg(feature = "opencv")]
pub use faces::YuNetDetector;
pub use hash::HashService;
pub use scanner::{DirectoryListing, FileStat, ScanError, ScannerService};
pub use scoring::{QualityScore, ScoringService};
pub use similarity::{Algorithm, Descriptor, SimilarityConfig, SimilarityError};
