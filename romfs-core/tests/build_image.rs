use rand::{rngs::StdRng, Rng, SeedableRng};
use romfs_core::build::{build, build_with, spawn, BuildConfig, BuildContext, CancelToken};
use romfs_core::layout::FileEntry;
use romfs_core::metadata::{list_files, EmptyMetadata, MetadataProvider};
use romfs_core::progress::Progress;
use romfs_core::verify::verify_image;
use romfs_core::BuildError;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

fn write_random(path: &Path, bytes: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let buf: Vec<u8> = (0..bytes).map(|_| rng.gen()).collect();
    if let Some(p) = path.parent() {
        fs::create_dir_all(p).unwrap();
    }
    fs::write(path, &buf).unwrap();
    buf
}

fn block_digest(img: &[u8], at: usize, len: usize, bs: usize) -> [u8; 32] {
    let mut block = vec![0u8; bs];
    block[..len].copy_from_slice(&img[at..at + len]);
    Sha256::digest(&block).into()
}

fn dir_names(dir: &Path) -> Vec<String> {
    let mut v: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    v.sort();
    v
}

/// Runs a callback on the planned files in place of building metadata.
struct Hook<F>(F);

impl<F> MetadataProvider for Hook<F>
where
    F: Fn(&[FileEntry]) + Send + Sync,
{
    fn build(&self, _root: &Path, files: &[FileEntry]) -> anyhow::Result<Vec<u8>> {
        (self.0)(files);
        Ok(Vec::new())
    }
}

/// Parks the build inside the metadata stage until released.
struct Gate {
    started: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl MetadataProvider for Gate {
    fn build(&self, _root: &Path, _files: &[FileEntry]) -> anyhow::Result<Vec<u8>> {
        self.started.lock().unwrap().send(()).ok();
        self.release.lock().unwrap().recv().ok();
        Ok(Vec::new())
    }
}

#[test]
fn two_files_hash_tree_recomputes() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("data");
    let a = write_random(&root.join("file1"), 5, 1);
    let b = write_random(&root.join("file2"), 4097, 2);
    let out = td.path().join("out.bin");

    let ctx = BuildContext::new(&root, &out).with_metadata(EmptyMetadata);
    let report = build(&ctx).unwrap();
    let img = fs::read(&out).unwrap();

    assert_eq!(img.len(), 20480);
    assert_eq!(report.image_length, 20480);
    assert_eq!(&img[0..4], b"IVFC");

    // file data
    assert_eq!(&img[0x1000..0x1005], &a[..]);
    assert!(img[0x1005..0x1010].iter().all(|&x| x == 0));
    assert_eq!(&img[0x1010..0x1010 + 4097], &b[..]);

    // level 2 -> hashes at hash_base + level1 offset
    let bs = 0x1000;
    let l2_hashes = 12288 + 4096;
    assert_eq!(&img[l2_hashes..l2_hashes + 32], &block_digest(&img, 0x1000, bs, bs));
    assert_eq!(&img[l2_hashes + 32..l2_hashes + 64], &block_digest(&img, 0x2000, 17, bs));
    // level 1 -> hashes at hash_base + level0 offset
    let l1_hashes = 12288;
    assert_eq!(&img[l1_hashes..l1_hashes + 32], &block_digest(&img, l2_hashes, 64, bs));
    // level 0 -> master hashes
    assert_eq!(&img[0x60..0x80], &block_digest(&img, l1_hashes, 32, bs));

    let sb: [u8; 32] = Sha256::digest(&img[..0x200]).into();
    assert_eq!(report.super_block_digest, sb);
    assert_eq!(report.super_block_hash, hex::encode_upper(sb));

    // no scratch left next to the output
    assert_eq!(dir_names(td.path()), ["data", "out.bin"]);
}

#[test]
fn same_tree_builds_identical_images() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("data");
    for (i, name) in ["b/x.bin", "a.bin", "b/c/y.bin", "z"].iter().enumerate() {
        write_random(&root.join(name), 1000 * (i + 1) + 7, i as u64);
    }
    let r1 = build(&BuildContext::new(&root, td.path().join("1.bin"))).unwrap();
    let r2 = build(&BuildContext::new(&root, td.path().join("2.bin"))).unwrap();
    assert_eq!(r1.super_block_hash, r2.super_block_hash);
    assert_eq!(fs::read(td.path().join("1.bin")).unwrap(), fs::read(td.path().join("2.bin")).unwrap());
    let order: Vec<_> = r1.files.iter().map(|f| f.rel_path.as_str()).collect();
    assert_eq!(order, ["a.bin", "b/c/y.bin", "b/x.bin", "z"]);
}

#[test]
fn name_table_locates_every_file() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("data");
    let mut want = Vec::new();
    for (i, name) in ["top.txt", "sub/one", "sub/deeper/two"].iter().enumerate() {
        want.push((name.to_string(), write_random(&root.join(name), 300 * i + 11, 40 + i as u64)));
    }
    fs::create_dir_all(root.join("empty")).unwrap();
    let out = td.path().join("img.bin");
    let report = build(&BuildContext::new(&root, &out)).unwrap();
    let img = fs::read(&out).unwrap();

    let meta_at = report.regions.metadata_offset as usize;
    let meta = &img[meta_at..meta_at + report.metadata_length as usize];
    let listed = list_files(meta).unwrap();
    assert_eq!(listed.len(), want.len());
    for (name, data) in &want {
        let mf = listed.iter().find(|m| &m.path == name).unwrap();
        let at = report.regions.data_base as usize + mf.offset as usize;
        assert_eq!(&img[at..at + mf.size as usize], &data[..], "{name}");
    }
    assert!(listed.iter().all(|m| !m.path.starts_with("empty")));
    assert!(verify_image(&out).unwrap().is_ok());
}

#[test]
fn empty_folder_builds() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("data");
    fs::create_dir_all(&root).unwrap();

    let bare = td.path().join("bare.bin");
    let report = build(&BuildContext::new(&root, &bare).with_metadata(EmptyMetadata)).unwrap();
    assert!(report.files.is_empty());
    assert_eq!(fs::metadata(&bare).unwrap().len(), 0x1000);

    let named = td.path().join("named.bin");
    let report = build(&BuildContext::new(&root, &named)).unwrap();
    assert_eq!(report.metadata_length, 0x60);
    let vr = verify_image(&named).unwrap();
    assert!(vr.is_ok());
    assert_eq!(vr.super_block_hash, report.super_block_digest);
}

#[test]
fn missing_input_is_a_distinct_error() {
    let td = tempfile::tempdir().unwrap();
    let out = td.path().join("out.bin");
    let err = build(&BuildContext::new(td.path().join("nope"), &out)).unwrap_err();
    assert!(matches!(err, BuildError::InputDirectoryNotFound(_)));
    assert!(!out.exists());
}

#[test]
fn bad_block_size_is_rejected() {
    let td = tempfile::tempdir().unwrap();
    let cfg = BuildConfig { block_sizes: [0x1000, 0x1001, 0x1000], ..Default::default() };
    let ctx = BuildContext::new(td.path(), td.path().join("o.bin")).with_config(cfg);
    assert!(matches!(build(&ctx), Err(BuildError::InvalidConfig(_))));
}

#[test]
fn alignment_must_be_a_small_power_of_two() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("data");
    write_random(&root.join("a"), 5, 20);
    write_random(&root.join("b"), 5, 21);
    for alignment in [0, 24, u64::MAX, 1 << 40, 0x2000] {
        let cfg = BuildConfig { alignment, ..Default::default() };
        let ctx = BuildContext::new(&root, td.path().join("o.bin")).with_config(cfg);
        assert!(matches!(build(&ctx), Err(BuildError::InvalidConfig(_))), "alignment {alignment:#x}");
    }
    assert_eq!(dir_names(td.path()), ["data"]);

    let cfg = BuildConfig { alignment: 0x1000, ..Default::default() };
    let report = build(&BuildContext::new(&root, td.path().join("o.bin")).with_config(cfg)).unwrap();
    let offs: Vec<_> = report.files.iter().map(|f| f.offset).collect();
    assert_eq!(offs, [0, 0x1000]);
}

#[test]
fn single_digest_blocks_are_rejected() {
    let td = tempfile::tempdir().unwrap();
    let cfg = BuildConfig { block_sizes: [0x1000, 0x20, 0x1000], ..Default::default() };
    let ctx = BuildContext::new(td.path(), td.path().join("o.bin")).with_config(cfg);
    assert!(matches!(build(&ctx), Err(BuildError::InvalidConfig(_))));
}

#[test]
fn smallest_blocks_verify() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("data");
    write_random(&root.join("f"), 5000, 22);
    let out = td.path().join("o.bin");
    let cfg = BuildConfig { block_sizes: [0x40; 3], ..Default::default() };
    let report = build(&BuildContext::new(&root, &out).with_config(cfg)).unwrap();
    let vr = verify_image(&out).unwrap();
    assert!(vr.is_ok(), "{:?}", vr.blocks_bad);
    assert!(report.tree.master_hash_length < report.tree.levels[2].data_length);
}

#[test]
fn smaller_blocks_still_verify() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("data");
    write_random(&root.join("big"), 70_000, 9);
    write_random(&root.join("small"), 3, 10);
    let out = td.path().join("o.bin");
    let cfg = BuildConfig { block_sizes: [0x200, 0x400, 0x800], copy_chunk: 1000, finalize_chunk: 777, ..Default::default() };
    let report = build(&BuildContext::new(&root, &out).with_config(cfg)).unwrap();
    let vr = verify_image(&out).unwrap();
    assert!(vr.is_ok(), "{:?}", vr.blocks_bad);
    assert_eq!(vr.tree, report.tree);
    assert_eq!(fs::metadata(&out).unwrap().len(), report.image_length);
}

#[test]
fn verify_spots_a_flipped_data_byte() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("data");
    write_random(&root.join("f"), 10_000, 3);
    let out = td.path().join("o.bin");
    build(&BuildContext::new(&root, &out).with_metadata(EmptyMetadata)).unwrap();

    let mut img = fs::read(&out).unwrap();
    img[0x1000] ^= 0xFF;
    fs::write(&out, &img).unwrap();

    let vr = verify_image(&out).unwrap();
    assert!(!vr.is_ok());
    assert_eq!(vr.blocks_bad, [0, 0, 1]);
    assert_eq!(vr.blocks_ok[2], 2);
}

#[test]
fn cancel_before_scratch_leaves_nothing() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("data");
    write_random(&root.join("f"), 100, 4);
    let out_dir = td.path().join("out");
    fs::create_dir_all(&out_dir).unwrap();
    let out = out_dir.join("o.bin");

    let (started_tx, started_rx) = channel();
    let (release_tx, release_rx) = channel();
    let gate = Gate { started: Mutex::new(started_tx), release: Mutex::new(release_rx) };
    let handle = spawn(BuildContext::new(&root, &out).with_metadata(gate), Progress::default());

    started_rx.recv().unwrap();
    handle.cancel();
    release_tx.send(()).unwrap();
    assert!(matches!(handle.join(), Err(BuildError::Cancelled)));
    assert!(dir_names(&out_dir).is_empty());
}

#[test]
fn cancel_between_file_copies_removes_scratch() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("data");
    for i in 0..200 {
        write_random(&root.join(format!("f{i:03}")), 64 * 1024, 100 + i);
    }
    let out_dir = td.path().join("out");
    let scratch_dir = td.path().join("scratch");
    fs::create_dir_all(&out_dir).unwrap();
    fs::create_dir_all(&scratch_dir).unwrap();

    let ctx = BuildContext::new(&root, out_dir.join("o.bin")).with_scratch_dir(&scratch_dir);
    let handle = spawn(ctx, Progress::default());
    let progress = handle.progress().clone();
    let cancel = handle.cancel_token();
    while progress.files_done.load(Ordering::Relaxed) < 3 && !handle.is_finished() {
        std::hint::spin_loop();
    }
    cancel.cancel();

    assert!(matches!(handle.join(), Err(BuildError::Cancelled)));
    assert!(progress.files_done.load(Ordering::Relaxed) < 200);
    assert!(dir_names(&out_dir).is_empty());
    assert!(dir_names(&scratch_dir).is_empty());
}

#[test]
fn unwritable_destination_is_reported() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("data");
    write_random(&root.join("f"), 3000, 23);
    let scratch_dir = td.path().join("scratch");
    fs::create_dir_all(&scratch_dir).unwrap();
    // A directory sits where the image should go.
    let out = td.path().join("o.bin");
    fs::create_dir_all(&out).unwrap();

    let ctx = BuildContext::new(&root, &out).with_scratch_dir(&scratch_dir);
    match build(&ctx).unwrap_err() {
        BuildError::DestinationWriteFailure { path, .. } => assert_eq!(path, out),
        other => panic!("unexpected {other:?}"),
    }
    assert!(out.is_dir());
    assert!(dir_names(&scratch_dir).is_empty());
}

#[test]
fn pre_cancelled_token_stops_the_build() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("data");
    write_random(&root.join("f"), 100, 5);
    let cancel = CancelToken::new();
    cancel.cancel();
    let ctx = BuildContext::new(&root, td.path().join("o.bin"));
    assert!(matches!(build_with(&ctx, &cancel, &Progress::default()), Err(BuildError::Cancelled)));
    assert_eq!(dir_names(td.path()), ["data"]);
}

#[test]
fn vanished_source_aborts_and_cleans_up() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("data");
    write_random(&root.join("a"), 10, 6);
    let victim = root.join("b");
    write_random(&victim, 10, 7);
    let out_dir = td.path().join("out");
    fs::create_dir_all(&out_dir).unwrap();

    let v = victim.clone();
    let hook = Hook(move |_: &[FileEntry]| fs::remove_file(&v).unwrap());
    let err = build(&BuildContext::new(&root, out_dir.join("o.bin")).with_metadata(hook)).unwrap_err();
    match err {
        BuildError::SourceFileUnreadable { path, .. } => assert_eq!(path, victim),
        other => panic!("unexpected {other:?}"),
    }
    assert!(dir_names(&out_dir).is_empty());
}

#[test]
fn grown_source_is_reported() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("data");
    let victim = root.join("a");
    write_random(&victim, 10, 8);
    let out_dir = td.path().join("out");
    fs::create_dir_all(&out_dir).unwrap();

    let v = victim.clone();
    let hook = Hook(move |_: &[FileEntry]| fs::write(&v, vec![1u8; 25]).unwrap());
    let err = build(&BuildContext::new(&root, out_dir.join("o.bin")).with_metadata(hook)).unwrap_err();
    match err {
        BuildError::SourceFileChanged { expected, actual, .. } => {
            assert_eq!(expected, 10);
            assert_eq!(actual, 11);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(dir_names(&out_dir).is_empty());
}

#[test]
fn spawned_build_reports_progress() {
    let td = tempfile::tempdir().unwrap();
    let root = td.path().join("data");
    write_random(&root.join("x"), 5000, 11);
    write_random(&root.join("y"), 6000, 12);
    let out = td.path().join("o.bin");

    let handle = spawn(BuildContext::new(&root, &out), Progress::default());
    let progress = handle.progress().clone();
    let report = handle.join().unwrap();
    assert_eq!(report.files.len(), 2);
    assert!(out.exists());
    assert_eq!(progress.files_done.load(Ordering::Relaxed), 2);
    assert_eq!(progress.bytes_done.load(Ordering::Relaxed), 11_000);
    assert!(progress.blocks_hashed.load(Ordering::Relaxed) >= 3);
}
