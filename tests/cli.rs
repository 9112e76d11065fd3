use std::fs;
use std::path::Path;

use assert_cmd::Command;
use image::{GrayImage, ImageBuffer, Luma};
use predicates::prelude::*;
use tempfile::TempDir;

fn fixture() -> (TempDir, TempDir) {
    let photos = TempDir::new().unwrap();
    for name in ["one.png", "two.png"] {
        let img: GrayImage = ImageBuffer::from_fn(24, 24, |x, y| Luma([((x + y * 24) % 128) as u8]));
        img.save(photos.path().join(name)).unwrap();
    }
    let white: GrayImage = ImageBuffer::from_pixel(24, 24, Luma([255]));
    white.save(photos.path().join("three.png")).unwrap();

    let config = TempDir::new().unwrap();
    fs::write(
        config.path().join("config.json"),
        r#"{ "algorithm": "histogram", "worker_limit": 2, "descriptor_store": "disabled" }"#,
    )
    .unwrap();
    (photos, config)
}

fn lenscull(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("lenscull").unwrap();
    cmd.arg("--config").arg(config.join("config.json"));
    cmd
}

#[test]
fn test_scan_lists_groups() {
    let (photos, config) = fixture();
    lenscull(config.path())
        .args(["scan", "--path"])
        .arg(photos.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("3 image(s) in 2 group(s)"))
        .stdout(predicate::str::contains("🏆 one.png"))
        .stdout(predicate::str::contains("▶ two.png"));

    assert!(photos.path().join("lenscull.db").exists());
}

#[test]
fn test_similar_reports_cluster() {
    let (photos, config) = fixture();
    lenscull(config.path())
        .args(["similar", "--file", "two.png", "--path"])
        .arg(photos.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("▶ one.png"))
        .stdout(predicate::str::contains("three.png").not());
}

#[test]
fn test_unknown_file_fails() {
    let (photos, config) = fixture();
    lenscull(config.path())
        .args(["similar", "--file", "missing.png", "--path"])
        .arg(photos.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing.png"));
}

#[test]
fn test_ratings_table() {
    let (photos, config) = fixture();
    lenscull(config.path())
        .args(["ratings", "--path"])
        .arg(photos.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("sharpness"))
        .stdout(predicate::str::contains("three.png"));
}

#[test]
fn test_clear_rejects_unknown_field() {
    let (photos, config) = fixture();
    lenscull(config.path())
        .args(["clear", "--yes", "--field", "thumbnail", "--path"])
        .arg(photos.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown field"));
}

#[test]
fn test_clear_with_yes_recomputes() {
    let (photos, config) = fixture();
    lenscull(config.path())
        .args(["clear", "--yes", "--field", "sharpness", "--path"])
        .arg(photos.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("recomputed 3 file(s)"));
}

#[test]
fn test_zero_workers_rejected() {
    let (photos, config) = fixture();
    lenscull(config.path())
        .args(["--workers", "0", "scan", "--path"])
        .arg(photos.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("worker limit"));
}

#[test]
fn test_clear_descriptors_alone_is_accepted() {
    let (photos, config) = fixture();
    lenscull(config.path())
        .args(["clear", "--yes", "--descriptors", "--path"])
        .arg(photos.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared 0 value(s)"));
}

#[test]
fn test_mark_toggles_blurred() {
    let (photos, config) = fixture();
    lenscull(config.path())
        .args(["mark", "--path"])
        .arg(photos.path())
        .arg("two.png")
        .assert()
        .success()
        .stdout(predicate::str::contains("blurred two.png"));

    lenscull(config.path())
        .args(["ratings", "--path"])
        .arg(photos.path())
        .arg("two.png")
        .assert()
        .success()
        .stdout(predicate::str::contains("yes"));

    lenscull(config.path())
        .args(["mark", "--path"])
        .arg(photos.path())
        .arg("two.png")
        .assert()
        .success()
        .stdout(predicate::str::contains("sharp"));
}

#[cfg(not(feature = "opencv"))]
#[test]
fn test_vision_features_need_opencv_build() {
    let (photos, config) = fixture();
    lenscull(config.path())
        .args(["--algorithm", "keypoints", "scan", "--path"])
        .arg(photos.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("`opencv` feature"));

    lenscull(config.path())
        .args(["--face-model", "face.onnx", "scan", "--path"])
        .arg(photos.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("`opencv` feature"));
}
