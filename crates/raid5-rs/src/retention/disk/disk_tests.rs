use super::*;
use parking_lot::Mutex;
use rand::RngCore;
use std::sync::Arc;
use tempfile::{NamedTempFile, TempDir};

const DISK_LEN: u64 = 1 << 20;

fn capture() -> (Arc<Mutex<Option<(Block, bool)>>>, IoDone) {
    let slot = Arc::new(Mutex::new(None));
    let sink = slot.clone();
    (slot, Box::new(move |buf, ok| *sink.lock() = Some((buf, ok))))
}

#[test]
fn open_prealloc_creates_and_sizes_file() {
    let tf = NamedTempFile::new().expect("tmp file");

    let d = ImageDisk::open_prealloc(tf.path(), DISK_LEN).expect("open_prealloc");
    assert_eq!(d.len(), DISK_LEN, "disk length must match requested");
    let meta = std::fs::metadata(tf.path()).expect("metadata");
    assert_eq!(meta.len(), DISK_LEN, "backing file must be pre-sized");
    assert!(d.is_operational());
}

#[test]
fn image_write_then_read_roundtrip() {
    let tf = NamedTempFile::new().expect("tmp file");
    let mut d = ImageDisk::open_prealloc(tf.path(), DISK_LEN).expect("open_prealloc");

    let off = 64 * 1024 + 123;
    let mut data = vec![0u8; 8192];
    rand::rng().fill_bytes(&mut data);

    assert_eq!(d.write_at(off, &data), data.len(), "must write full buffer");

    let mut back = vec![0u8; data.len()];
    assert_eq!(d.read_at(off, &mut back), data.len(), "must read full buffer");
    assert_eq!(back, data);
}

#[test]
fn image_io_is_clamped_at_end_of_disk() {
    let tf = NamedTempFile::new().expect("tmp file");
    let mut d = ImageDisk::open_prealloc(tf.path(), 4096).expect("open_prealloc");
    assert_eq!(d.write_at(4000, &[7u8; 200]), 96);
    assert_eq!(d.write_at(4096, &[7u8; 4]), 0);
    let mut buf = [0u8; 200];
    assert_eq!(d.read_at(4000, &mut buf), 96);
}

#[test]
fn failed_image_disk_rejects_requests() {
    let dir = TempDir::new().expect("tmp dir");
    let disks = ImageDisks::open(dir.path(), 3, 64 * 1024).expect("open images");
    disks.fail(1).expect("fail disk");

    let (slot, done) = capture();
    disks.submit(DiskRequest::new(1, IoOp::Read, 0, Block::zeroed(512), done));
    let (_, ok) = slot.lock().take().expect("completed inline");
    assert!(!ok, "read from a failed image must error");

    let (slot, done) = capture();
    disks.submit(DiskRequest::new(0, IoOp::Write, 8, Block::filled(512, 0xEE), done));
    let (_, ok) = slot.lock().take().expect("completed inline");
    assert!(ok);

    assert!(disks.fail(9).is_err());
    let renamed = std::fs::read_dir(dir.path())
        .expect("list dir")
        .filter_map(Result::ok)
        .any(|e| e.file_name().to_string_lossy().contains(".failed."));
    assert!(renamed, "failed image is renamed on the host");
}

#[test]
fn mem_disks_roundtrip_and_log() {
    let disks = MemDisks::new(2, 8192);

    let (slot, done) = capture();
    disks.submit(DiskRequest::new(1, IoOp::Write, 2, Block::filled(1024, 0x42), done));
    assert!(slot.lock().take().expect("inline").1);
    assert_eq!(disks.read_raw(1, 1024, 1024), vec![0x42; 1024]);

    let (slot, done) = capture();
    disks.submit(DiskRequest::new(1, IoOp::Read, 2, Block::zeroed(1024), done));
    let (buf, ok) = slot.lock().take().expect("inline");
    assert!(ok);
    assert_eq!(buf, Block::filled(1024, 0x42));

    assert_eq!(
        disks.submitted(),
        vec![
            IoRecord { dev: 1, op: IoOp::Write, sector: 2 },
            IoRecord { dev: 1, op: IoOp::Read, sector: 2 },
        ]
    );
}

#[test]
fn mem_disks_failure_injection_and_bounds() {
    let disks = MemDisks::new(2, 4096);
    disks.set_failing(0, true);

    let (slot, done) = capture();
    disks.submit(DiskRequest::new(0, IoOp::Read, 0, Block::zeroed(512), done));
    assert!(!slot.lock().take().expect("inline").1);

    let (slot, done) = capture();
    disks.submit(DiskRequest::new(1, IoOp::Read, 8, Block::zeroed(512), done));
    assert!(!slot.lock().take().expect("inline").1, "past end of disk");

    disks.set_failing(0, false);
    let (slot, done) = capture();
    disks.submit(DiskRequest::new(0, IoOp::Read, 0, Block::zeroed(512), done));
    assert!(slot.lock().take().expect("inline").1);
}
