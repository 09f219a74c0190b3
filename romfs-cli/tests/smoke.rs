use assert_cmd::prelude::*;
use assert_fs::prelude::*;
use predicates::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::process::Command;

fn write_random(path: &std::path::Path, bytes: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let buf: Vec<u8> = (0..bytes).map(|_| rng.gen()).collect();
    std::fs::write(path, buf).unwrap();
}

fn demo_tree(td: &assert_fs::TempDir) {
    let data = td.child("demo");
    data.create_dir_all().unwrap();
    data.child("sub").create_dir_all().unwrap();
    write_random(data.child("a.bin").path(), 5, 1);
    write_random(data.child("sub/b.bin").path(), 4097, 2);
}

#[test]
fn build_writes_default_output_and_prints_hash() {
    let td = assert_fs::TempDir::new().unwrap();
    demo_tree(&td);

    let out = Command::cargo_bin("romfs")
        .unwrap()
        .current_dir(td.path())
        .arg("demo")
        .assert()
        .success()
        .stdout(predicate::str::is_match("^[0-9A-F]{64}\n$").unwrap())
        .get_output()
        .stdout
        .clone();
    assert_eq!(out.len(), 65);

    td.child("demo.bin").assert(predicate::path::is_file());
    let img = std::fs::read(td.child("demo.bin").path()).unwrap();
    assert_eq!(&img[..4], b"IVFC");
}

#[test]
fn missing_input_fails() {
    let td = assert_fs::TempDir::new().unwrap();
    Command::cargo_bin("romfs")
        .unwrap()
        .current_dir(td.path())
        .arg("does-not-exist")
        .assert()
        .failure()
        .stderr(predicate::str::contains("input directory does not exist"));
    td.child("does-not-exist.bin").assert(predicate::path::missing());
}

#[test]
fn report_and_verify_agree_with_stdout() {
    let td = assert_fs::TempDir::new().unwrap();
    demo_tree(&td);

    let assert = Command::cargo_bin("romfs")
        .unwrap()
        .current_dir(td.path())
        .args(["demo", "--no-metadata", "-o", "img.bin", "--report", "r.json", "--verify"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Verified"));
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();

    let report: serde_json::Value =
        serde_json::from_slice(&std::fs::read(td.child("r.json").path()).unwrap()).unwrap();
    assert_eq!(report["super_block_hash"].as_str().unwrap(), stdout.trim());
    assert_eq!(report["metadata_length"], 0);
    assert_eq!(report["files"].as_array().unwrap().len(), 2);
    assert_eq!(report["image_length"], 20480);
    td.child("img.bin").assert(predicate::path::is_file());
}

#[test]
fn exclude_glob_drops_files() {
    let td = assert_fs::TempDir::new().unwrap();
    demo_tree(&td);

    Command::cargo_bin("romfs")
        .unwrap()
        .current_dir(td.path())
        .args(["demo", "--exclude", "sub/**", "--report", "r.json"])
        .assert()
        .success();
    let report: serde_json::Value =
        serde_json::from_slice(&std::fs::read(td.child("r.json").path()).unwrap()).unwrap();
    let files = report["files"].as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["rel_path"], "a.bin");
}

#[test]
fn no_arguments_is_a_usage_error() {
    Command::cargo_bin("romfs").unwrap().assert().failure();
}

#[test]
fn odd_block_size_is_rejected() {
    let td = assert_fs::TempDir::new().unwrap();
    demo_tree(&td);
    Command::cargo_bin("romfs")
        .unwrap()
        .current_dir(td.path())
        .args(["demo", "--block-size", "3000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid build configuration"));
    td.child("demo.bin").assert(predicate::path::missing());
}

#[test]
fn oversized_alignment_is_rejected() {
    let td = assert_fs::TempDir::new().unwrap();
    demo_tree(&td);
    for alignment in ["18446744073709551615", "1099511627776", "24"] {
        Command::cargo_bin("romfs")
            .unwrap()
            .current_dir(td.path())
            .args(["demo", "--alignment", alignment])
            .assert()
            .failure()
            .stderr(predicate::str::contains("invalid build configuration"));
    }
    td.child("demo.bin").assert(predicate::path::missing());
}
