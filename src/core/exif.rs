use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::time::UNIX_EPOCH;

use chrono::{DateTime, NaiveDateTime, Utc};
use exif::{In, Reader, Tag, Value};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Capture metadata kept per file. Only what the cache needs: when the shot
/// was taken, how it is oriented, and what took it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureInfo {
    pub taken_at: Option<DateTime<Utc>>,
    pub camera: Option<String>,
    pub orientation: u16,
}

/// Service for extracting EXIF metadata from image files
pub struct ExifService;

impl ExifService {
    pub fn new() -> Self {
        Self
    }

    /// Read capture metadata. Files without EXIF (or unreadable ones) yield an
    /// empty `CaptureInfo` with normal orientation.
    pub fn extract(&self, file_path: &Path) -> CaptureInfo {
        let mut info = CaptureInfo {
            orientation: 1,
            ..Default::default()
        };

        let file = match File::open(file_path) {
            Ok(f) => f,
            Err(_) => return info,
        };
        let mut buf_reader = BufReader::new(file);
        let exif_reader = match Reader::new().read_from_container(&mut buf_reader) {
            Ok(reader) => reader,
            Err(_) => return info,
        };

        let taken = exif_reader
            .get_field(Tag::DateTimeOriginal, In::PRIMARY)
            .or_else(|| exif_reader.get_field(Tag::DateTime, In::PRIMARY));
        if let Some(field) = taken {
            info.taken_at = field_to_string(&field.value).and_then(|s| parse_exif_datetime(&s));
        }

        let mut camera_parts = Vec::new();
        for tag in [Tag::Make, Tag::Model] {
            if let Some(part) = exif_reader
                .get_field(tag, In::PRIMARY)
                .and_then(|field| field_to_string(&field.value))
            {
                let part = part.trim();
                if !part.is_empty() {
                    camera_parts.push(part.to_string());
                }
            }
        }
        if !camera_parts.is_empty() {
            info.camera = Some(camera_parts.join(" "));
        }

        if let Some(field) = exif_reader.get_field(Tag::Orientation, In::PRIMARY) {
            if let Some(v) = field.value.get_uint(0) {
                if (1..=8).contains(&v) {
                    info.orientation = v as u16;
                }
            }
        }

        info
    }
}

impl Default for ExifService {
    fn default() -> Self {
        Self::new()
    }
}

/// Capture time in seconds: EXIF date if present, otherwise file creation
/// time, otherwise modification time.
pub fn capture_time(info: &CaptureInfo, file_path: &Path) -> Option<i64> {
    if let Some(taken_at) = info.taken_at {
        return Some(taken_at.timestamp());
    }
    let metadata = fs::metadata(file_path).ok()?;
    let time = metadata.created().or_else(|_| metadata.modified()).ok()?;
    let secs = time.duration_since(UNIX_EPOCH).ok()?.as_secs();
    Some(secs as i64)
}

/// Rotate/flip `image` so it displays upright for the given EXIF orientation.
pub fn apply_orientation(image: DynamicImage, orientation: u16) -> DynamicImage {
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

fn field_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Ascii(vec) => vec.first().map(|ascii_val| {
            String::from_utf8_lossy(ascii_val)
                .trim_end_matches('\0')
                .to_string()
        }),
        Value::Undefined(data, _) => Some(
            String::from_utf8_lossy(data)
                .trim_end_matches('\0')
                .to_string(),
        ),
        _ => None,
    }
}

/// EXIF datetime format: "YYYY:MM:DD HH:MM:SS"
fn parse_exif_datetime(datetime_str: &str) -> Option<DateTime<Utc>> {
    match NaiveDateTime::parse_from_str(datetime_str.trim(), "%Y:%m:%d %H:%M:%S") {
        Ok(dt) => Some(dt.and_utc()),
        Err(_) => {
            log::warn!("Failed to parse EXIF datetime: {}", datetime_str);
            None
        }
    }
}
