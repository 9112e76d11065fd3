use crate::core::exif::CaptureInfo;

/// Service for computing the content identity of an image file.
///
/// The identity is derived from modification time, size and capture
/// metadata instead of the file bytes, so it is cheap enough to compute for
/// every file on every scan and still changes whenever the file is rewritten.
pub struct HashService;

impl HashService {
    pub fn new() -> Self {
        Self
    }

    pub fn compute_content_hash(
        &self,
        modified_time: i64,
        byte_size: u64,
        capture: &CaptureInfo,
    ) -> String {
        let capture = serde_json::to_string(capture).unwrap_or_default();
        let key = format!("{modified_time}-{byte_size}-{capture}");
        blake3::hash(key.as_bytes()).to_hex().to_string()
    }
}

impl Default for HashService {
    fn default() -> Self {
        Self::new()
    }
}
