use super::*;
use crate::disk::secure_boot::{BOOT_IMG, BOOT_SIG, SigningKey, parse_signature, read_image_file};
use crate::disk::{Disk, DiskIo, FileDevices};
use crate::models::{
    Compression, CustomisationPayload, DeviceHandle, ImageKind, ImageSource, PayloadFile, ProgressEvent, RemoteImage,
    Stage, WriteOptions,
};
use crate::testutil::{
    HttpResponse, TEST_KEY_PEM, boot_root_names, bootable_device, patterned, read_boot_file, serve, sparse_device,
};
use crate::utils::hashing::Sha256Digest;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use zip::write::SimpleFileOptions;

const MIB: usize = 1024 * 1024;

fn config(dir: &Path) -> ImagerConfig {
    ImagerConfig {
        cache_enabled: false,
        temp_dir: Some(dir.join("tmp")),
        chunk_size: 64 * 1024,
        stall_timeout_secs: 5,
        use_system_proxy: false,
        ..Default::default()
    }
}

fn cached_config(dir: &Path) -> ImagerConfig {
    ImagerConfig {
        cache_enabled: true,
        cache_dir: Some(dir.join("cache")),
        cache_queue_depth: 4096,
        ..config(dir)
    }
}

async fn run<P: DeviceProvider>(imager: &Imager<P>, job: WriteJob) -> (JobReport, Vec<JobEvent>) {
    let mut handle = imager.start_write(job).unwrap();
    let mut rx = handle.events.take().unwrap();
    let report = handle.wait().await;
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    (report, events)
}

/// Stages in the order they were entered.
fn stages(events: &[JobEvent]) -> Vec<Stage> {
    let mut out: Vec<Stage> = Vec::new();
    for ev in events {
        if let JobEvent::Progress(p) = ev {
            if out.last() != Some(&p.stage) {
                out.push(p.stage);
            }
        }
    }
    out
}

fn device_prefix(path: &Path, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    File::open(path).unwrap().read_exact(&mut out).unwrap();
    out
}

fn write_image(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, data).unwrap();
    path
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// What a `Flaky` device does once `limit` bytes have been written.
#[derive(Debug, Clone)]
enum Trip {
    Cancel(CancelToken),
    Vanish(Arc<AtomicBool>),
}

/// File-backed device that misbehaves after a number of written bytes.
#[derive(Debug)]
struct Flaky {
    file: File,
    written: u64,
    limit: u64,
    trip: Trip,
    writes_after_trip: Arc<AtomicU64>,
}

impl Read for Flaky {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for Flaky {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written >= self.limit {
            self.writes_after_trip.fetch_add(1, Ordering::SeqCst);
            if let Trip::Vanish(present) = &self.trip {
                present.store(false, Ordering::SeqCst);
                return Err(io::Error::other("device went away"));
            }
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        if self.written >= self.limit {
            if let Trip::Cancel(token) = &self.trip {
                token.cancel();
            }
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for Flaky {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl DiskIo for Flaky {
    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn try_clone_io(&self) -> io::Result<Box<dyn DiskIo>> {
        Ok(Box::new(self.file.try_clone()?))
    }
}

struct FlakyDevices {
    limit: u64,
    trip: Trip,
    writes_after_trip: Arc<AtomicU64>,
}

impl DeviceProvider for FlakyDevices {
    async fn unmount(&self, _device: &DeviceHandle) -> anyhow::Result<()> {
        anyhow::bail!("udisks not available")
    }

    async fn open(&self, device: &DeviceHandle) -> Result<Disk, WriteError> {
        let file = OpenOptions::new().read(true).write(true).open(&device.path).unwrap();
        let present = match &self.trip {
            Trip::Vanish(flag) => flag.clone(),
            Trip::Cancel(_) => Arc::new(AtomicBool::new(true)),
        };
        Ok(Disk::new(
            Box::new(Flaky {
                file,
                written: 0,
                limit: self.limit,
                trip: self.trip.clone(),
                writes_after_trip: self.writes_after_trip.clone(),
            }),
            device.path.clone(),
            Arc::new(move || present.load(Ordering::SeqCst)),
        ))
    }
}

#[tokio::test]
async fn test_local_image_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let image = patterned(3 * MIB);
    let path = write_image(dir.path(), "os.img", &image);
    let (dev, handle) = sparse_device(dir.path(), "card.img", 16 << 20);
    let imager = Imager::with_provider(config(dir.path()), FileDevices).unwrap();

    let source = ImageSource::LocalFile {
        path,
        sha256: Some(Sha256Digest::of(&image)),
    };
    let job = WriteJob::new(source, ImageKind::Disk(Compression::None), handle);
    let (report, events) = run(&imager, job).await;

    assert_eq!(report.outcome, JobOutcome::Success);
    assert_eq!(device_prefix(&dev, image.len()), image);
    assert_eq!(
        stages(&events),
        vec![
            Stage::Download,
            Stage::Unmount,
            Stage::Clear,
            Stage::Write,
            Stage::Verify,
            Stage::Finalise
        ]
    );
    assert_eq!(events.last(), Some(&JobEvent::Finished(JobOutcome::Success)));

    let perf = report.performance.unwrap();
    assert_eq!(perf.outcome.as_deref(), Some("success"));
    assert!(perf.stage(Stage::Write).is_some());
    assert!(!imager.is_busy(&dev));
}

#[tokio::test]
async fn test_write_progress_is_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let image = patterned(2 * MIB);
    let path = write_image(dir.path(), "os.img", &image);
    let (_, handle) = sparse_device(dir.path(), "card.img", 8 << 20);
    let imager = Imager::with_provider(config(dir.path()), FileDevices).unwrap();

    let job = WriteJob::new(ImageSource::local(path), ImageKind::Disk(Compression::None), handle);
    let (_, events) = run(&imager, job).await;

    let write: Vec<u8> = events
        .iter()
        .filter_map(|ev| match ev {
            JobEvent::Progress(p) if p.stage == Stage::Write => p.percent,
            _ => None,
        })
        .collect();
    assert_eq!(write.last(), Some(&100));
    assert!(write.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_unaligned_declared_size_rejected_before_io() {
    let dir = tempfile::tempdir().unwrap();
    let (_, handle) = sparse_device(dir.path(), "card.img", 16 << 20);
    let imager = Imager::with_provider(config(dir.path()), FileDevices).unwrap();

    let mut remote = RemoteImage::new("http://127.0.0.1:9/never.img.xz");
    remote.extract_size = Some(1_000_000_511);
    let job = WriteJob::new(ImageSource::Network(remote), ImageKind::Disk(Compression::Xz), handle);
    let (report, events) = run(&imager, job).await;

    assert_eq!(
        report.outcome,
        JobOutcome::Failed(WriteError::InvalidImageSize { size: 1_000_000_511 })
    );
    assert!(stages(&events).is_empty());
}

#[tokio::test]
async fn test_unaligned_local_file_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "odd.img", &[7u8; 1000]);
    let (dev, handle) = sparse_device(dir.path(), "card.img", 4 << 20);
    fs::write(&dev, vec![0xAAu8; 4 << 20]).unwrap();
    let imager = Imager::with_provider(config(dir.path()), FileDevices).unwrap();

    let job = WriteJob::new(ImageSource::local(path), ImageKind::Disk(Compression::None), handle);
    let (report, events) = run(&imager, job).await;

    assert_eq!(report.outcome, JobOutcome::Failed(WriteError::InvalidImageSize { size: 1000 }));
    assert!(stages(&events).is_empty());
    assert_eq!(device_prefix(&dev, 4096), vec![0xAAu8; 4096]);
}

#[tokio::test]
async fn test_insufficient_capacity_rejected_before_clear() {
    let dir = tempfile::tempdir().unwrap();
    let (dev, mut handle) = sparse_device(dir.path(), "card.img", 1 << 20);
    fs::write(&dev, vec![0x55u8; 1 << 20]).unwrap();
    handle.capacity = 4_000_000_000;
    let imager = Imager::with_provider(config(dir.path()), FileDevices).unwrap();

    let mut remote = RemoteImage::new("http://127.0.0.1:9/big.img.xz");
    remote.extract_size = Some(8_000_000_000);
    let job = WriteJob::new(ImageSource::Network(remote), ImageKind::Disk(Compression::Xz), handle);
    let (report, events) = run(&imager, job).await;

    assert_eq!(
        report.outcome,
        JobOutcome::Failed(WriteError::InsufficientCapacity {
            required: 8_000_000_000,
            available: 4_000_000_000,
        })
    );
    assert!(stages(&events).is_empty());
    assert_eq!(fs::read(&dev).unwrap(), vec![0x55u8; 1 << 20]);
}

#[tokio::test]
async fn test_actual_capacity_rechecked_before_clear() {
    let dir = tempfile::tempdir().unwrap();
    let image = patterned(2 * MIB);
    let path = write_image(dir.path(), "os.img", &image);
    // The device claims more space than it really has.
    let (dev, mut handle) = sparse_device(dir.path(), "card.img", MIB as u64);
    handle.capacity = 64 << 20;
    let imager = Imager::with_provider(config(dir.path()), FileDevices).unwrap();

    let job = WriteJob::new(ImageSource::local(path), ImageKind::Disk(Compression::None), handle);
    let (report, events) = run(&imager, job).await;

    assert_eq!(
        report.outcome,
        JobOutcome::Failed(WriteError::InsufficientCapacity {
            required: 2 * MIB as u64,
            available: MIB as u64,
        })
    );
    assert!(!stages(&events).contains(&Stage::Clear));
    assert_eq!(fs::metadata(&dev).unwrap().len(), MIB as u64);
}

#[tokio::test]
async fn test_secure_boot_without_key_fails_first() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "os.img", &patterned(MIB));
    let (_, handle) = sparse_device(dir.path(), "card.img", 8 << 20);
    let imager = Imager::with_provider(config(dir.path()), FileDevices).unwrap();

    let job = WriteJob::new(ImageSource::local(path), ImageKind::Disk(Compression::None), handle).with_options(
        WriteOptions {
            verify: true,
            secure_boot: true,
        },
    );
    let (report, events) = run(&imager, job).await;

    assert_eq!(report.outcome, JobOutcome::Failed(WriteError::NoSigningKeyConfigured));
    assert!(stages(&events).is_empty());
    assert!(!dir.path().join("tmp").exists());
}

#[tokio::test]
async fn test_read_only_device_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "os.img", &patterned(MIB));
    let (dev, mut handle) = sparse_device(dir.path(), "card.img", 8 << 20);
    handle.read_only = true;
    let imager = Imager::with_provider(config(dir.path()), FileDevices).unwrap();

    let job = WriteJob::new(ImageSource::local(path), ImageKind::Disk(Compression::None), handle);
    let (report, events) = run(&imager, job).await;

    assert_eq!(report.outcome, JobOutcome::Failed(WriteError::DeviceReadOnly(dev)));
    assert_eq!(events, vec![JobEvent::Finished(report.outcome.clone())]);
}

#[tokio::test]
async fn test_local_file_digest_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let image = patterned(MIB);
    let path = write_image(dir.path(), "os.img", &image);
    let (dev, handle) = sparse_device(dir.path(), "card.img", 8 << 20);
    let imager = Imager::with_provider(config(dir.path()), FileDevices).unwrap();

    let expected = Sha256Digest::of(b"something else");
    let source = ImageSource::LocalFile {
        path,
        sha256: Some(expected),
    };
    let job = WriteJob::new(source, ImageKind::Disk(Compression::None), handle);
    let (report, events) = run(&imager, job).await;

    assert_eq!(
        report.outcome,
        JobOutcome::Failed(WriteError::IntegrityMismatch {
            expected,
            actual: Sha256Digest::of(&image),
        })
    );
    assert_eq!(stages(&events), vec![Stage::Download]);
    assert_eq!(device_prefix(&dev, 4096), vec![0u8; 4096]);
}

#[tokio::test]
async fn test_network_mismatch_is_terminal_and_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let body = patterned(256 * 1024);
    let url = serve(HttpResponse::ok(body.clone())).await;
    let (dev, handle) = sparse_device(dir.path(), "card.img", 8 << 20);
    fs::write(&dev, vec![0x11u8; 8 << 20]).unwrap();
    let imager = Imager::with_provider(cached_config(dir.path()), FileDevices).unwrap();

    let expected = Sha256Digest::of(b"published digest");
    let mut remote = RemoteImage::new(url.clone());
    remote.sha256 = Some(expected);
    let job = WriteJob::new(ImageSource::Network(remote), ImageKind::Disk(Compression::None), handle);
    let (report, events) = run(&imager, job).await;

    assert_eq!(
        report.outcome,
        JobOutcome::Failed(WriteError::IntegrityMismatch {
            expected,
            actual: Sha256Digest::of(&body),
        })
    );
    assert_eq!(stages(&events), vec![Stage::Download]);
    assert!(imager.cache().unwrap().lookup(&url, None).is_none());
    assert_eq!(device_prefix(&dev, 4096), vec![0x11u8; 4096]);
    assert_eq!(fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_download_is_cached_and_reused() {
    let dir = tempfile::tempdir().unwrap();
    let body = patterned(512 * 1024);
    let url = serve(HttpResponse::ok(body.clone())).await;
    let (dev, handle) = sparse_device(dir.path(), "card.img", 8 << 20);
    let imager = Imager::with_provider(cached_config(dir.path()), FileDevices).unwrap();

    let mut remote = RemoteImage::new(url.clone());
    remote.sha256 = Some(Sha256Digest::of(&body));
    let job = WriteJob::new(ImageSource::Network(remote.clone()), ImageKind::Disk(Compression::None), handle.clone());
    let (report, events) = run(&imager, job).await;

    assert_eq!(report.outcome, JobOutcome::Success);
    assert_eq!(device_prefix(&dev, body.len()), body);
    assert!(events.iter().any(|e| matches!(e, JobEvent::CacheStored(_))));

    let cache = imager.cache().unwrap();
    let source = cache.resolve_source(&remote);
    assert!(matches!(source, ImageSource::Cache { .. }));

    fs::write(&dev, vec![0u8; 8 << 20]).unwrap();
    let job = WriteJob::new(source, ImageKind::Disk(Compression::None), handle);
    let (report, _) = run(&imager, job).await;
    assert_eq!(report.outcome, JobOutcome::Success);
    assert_eq!(device_prefix(&dev, body.len()), body);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_corrupt_cache_entry_is_refetched() {
    let dir = tempfile::tempdir().unwrap();
    let body = patterned(256 * 1024);
    let url = serve(HttpResponse::ok(body.clone())).await;
    let (dev, handle) = sparse_device(dir.path(), "card.img", 8 << 20);
    let imager = Imager::with_provider(cached_config(dir.path()), FileDevices).unwrap();
    let cache = imager.cache().unwrap();

    fs::create_dir_all(cache.dir()).unwrap();
    let data_path = cache.data_path(&url);
    fs::write(&data_path, vec![0xEEu8; body.len()]).unwrap();

    let digest = Sha256Digest::of(&body);
    let source = ImageSource::Cache {
        path: data_path.clone(),
        sha256: digest,
        origin: Some(RemoteImage::new(url.clone())),
    };
    let job = WriteJob::new(source, ImageKind::Disk(Compression::None), handle);
    let (report, events) = run(&imager, job).await;

    assert_eq!(report.outcome, JobOutcome::Success);
    assert_eq!(device_prefix(&dev, body.len()), body);
    assert_eq!(stages(&events)[0], Stage::Download);
    let entry = cache.lookup(&url, Some(&digest)).unwrap();
    assert_eq!(fs::read(entry.path).unwrap(), body);
}

#[tokio::test]
async fn test_refetch_progress_starts_over() {
    let dir = tempfile::tempdir().unwrap();
    let body = patterned(4 * MIB);
    let url = serve(HttpResponse::ok(body.clone())).await;
    let (dev, handle) = sparse_device(dir.path(), "card.img", 8 << 20);
    let imager = Imager::with_provider(cached_config(dir.path()), FileDevices).unwrap();
    let cache = imager.cache().unwrap();

    fs::create_dir_all(cache.dir()).unwrap();
    let data_path = cache.data_path(&url);
    fs::write(&data_path, vec![0x11u8; body.len()]).unwrap();

    let source = ImageSource::Cache {
        path: data_path,
        sha256: Sha256Digest::of(&body),
        origin: Some(RemoteImage::new(url.clone())),
    };
    let job = WriteJob::new(source, ImageKind::Disk(Compression::None), handle);
    let (report, events) = run(&imager, job).await;

    assert_eq!(report.outcome, JobOutcome::Success);
    assert_eq!(device_prefix(&dev, body.len()), body);

    let refetch: Vec<&ProgressEvent> = events
        .iter()
        .filter_map(|ev| match ev {
            JobEvent::Progress(p) if p.stage == Stage::Download => Some(p),
            _ => None,
        })
        .skip_while(|p| !p.message.contains("downloading it again"))
        .collect();
    assert!(!refetch.is_empty());
    assert_eq!(refetch[0].bytes_done, 0);
    assert!(refetch.iter().any(|p| matches!(p.percent, Some(pct) if pct < 100)));
    assert_eq!(refetch.last().and_then(|p| p.percent), Some(100));
}

#[tokio::test]
async fn test_corrupt_cache_without_origin_is_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let (_, handle) = sparse_device(dir.path(), "card.img", 8 << 20);
    let imager = Imager::with_provider(config(dir.path()), FileDevices).unwrap();

    let data_path = write_image(dir.path(), "abc.bin", &vec![0xEEu8; 4096]);
    let sidecar = dir.path().join("abc.json");
    fs::write(&sidecar, b"{}").unwrap();
    let expected = Sha256Digest::of(b"original");
    let source = ImageSource::Cache {
        path: data_path.clone(),
        sha256: expected,
        origin: None,
    };
    let job = WriteJob::new(source, ImageKind::Disk(Compression::None), handle);
    let (report, _) = run(&imager, job).await;

    assert!(matches!(
        report.outcome,
        JobOutcome::Failed(WriteError::IntegrityMismatch { expected: e, .. }) if e == expected
    ));
    assert!(!data_path.exists());
    assert!(!sidecar.exists());
}

#[tokio::test]
async fn test_cancel_mid_write() {
    let dir = tempfile::tempdir().unwrap();
    let image = patterned(4 * MIB);
    let path = write_image(dir.path(), "os.img", &image);
    let (dev, handle) = sparse_device(dir.path(), "card.img", 16 << 20);

    let job = WriteJob::new(ImageSource::local(path), ImageKind::Disk(Compression::None), handle);
    let provider = FlakyDevices {
        // Clear writes 2 MiB, then one more megabyte of image.
        limit: 3 * MIB as u64,
        trip: Trip::Cancel(job.cancel.clone()),
        writes_after_trip: Arc::new(AtomicU64::new(0)),
    };
    let imager = Imager::with_provider(config(dir.path()), provider).unwrap();
    let (report, events) = run(&imager, job).await;

    assert_eq!(report.outcome, JobOutcome::Cancelled);
    assert_eq!(events.last(), Some(&JobEvent::Finished(JobOutcome::Cancelled)));
    assert!(!stages(&events).contains(&Stage::Verify));
    // The partition table is only written at the very end.
    assert_eq!(device_prefix(&dev, 4096), vec![0u8; 4096]);
    assert_eq!(fs::read_dir(dir.path().join("tmp")).map(|d| d.count()).unwrap_or(0), 0);
}

#[tokio::test]
async fn test_cancel_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let image = patterned(MIB);
    let path = write_image(dir.path(), "os.img", &image);
    let (dev, handle) = sparse_device(dir.path(), "card.img", 8 << 20);
    let imager = Imager::with_provider(config(dir.path()), FileDevices).unwrap();

    let source = ImageSource::LocalFile {
        path,
        sha256: Some(Sha256Digest::of(&image)),
    };
    let job = WriteJob::new(source, ImageKind::Disk(Compression::None), handle);
    job.cancel.cancel();
    let (report, _) = run(&imager, job).await;

    assert_eq!(report.outcome, JobOutcome::Cancelled);
    assert_eq!(device_prefix(&dev, 4096), vec![0u8; 4096]);
}

#[tokio::test]
async fn test_device_removed_mid_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "os.img", &patterned(4 * MIB));
    let (dev, handle) = sparse_device(dir.path(), "card.img", 16 << 20);

    let writes_after_trip = Arc::new(AtomicU64::new(0));
    let provider = FlakyDevices {
        limit: 3 * MIB as u64,
        trip: Trip::Vanish(Arc::new(AtomicBool::new(true))),
        writes_after_trip: writes_after_trip.clone(),
    };
    let imager = Imager::with_provider(config(dir.path()), provider).unwrap();
    let job = WriteJob::new(ImageSource::local(path), ImageKind::Disk(Compression::None), handle);
    let (report, events) = run(&imager, job).await;

    assert_eq!(report.outcome, JobOutcome::Failed(WriteError::DeviceRemoved(dev)));
    assert_eq!(writes_after_trip.load(Ordering::SeqCst), 1);
    // Unmount failure is reported but not fatal.
    assert!(stages(&events).contains(&Stage::Write));
}

#[tokio::test]
async fn test_busy_device_rejected_at_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "os.img", &patterned(MIB));
    let (dev, handle) = sparse_device(dir.path(), "card.img", 8 << 20);
    let imager = Imager::with_provider(config(dir.path()), FileDevices).unwrap();

    let lease = imager.registry.claim(&dev, Uuid::new_v4()).unwrap();
    let job = WriteJob::new(ImageSource::local(path.clone()), ImageKind::Disk(Compression::None), handle.clone());
    assert_eq!(imager.start_write(job).unwrap_err(), WriteError::DeviceBusy(dev.clone()));

    drop(lease);
    let job = WriteJob::new(ImageSource::local(path), ImageKind::Disk(Compression::None), handle);
    let (report, _) = run(&imager, job).await;
    assert_eq!(report.outcome, JobOutcome::Success);
}

#[tokio::test]
async fn test_gzip_local_image() {
    let dir = tempfile::tempdir().unwrap();
    let image = patterned(MIB + 512);
    let path = write_image(dir.path(), "os.img.gz", &gzip(&image));
    let (dev, handle) = sparse_device(dir.path(), "card.img", 8 << 20);
    let imager = Imager::with_provider(config(dir.path()), FileDevices).unwrap();

    let kind = ImageKind::sniff(&path).unwrap();
    assert_eq!(kind, ImageKind::Disk(Compression::Gzip));
    let job = WriteJob::new(ImageSource::local(path), kind, handle);
    let (report, _) = run(&imager, job).await;

    assert_eq!(report.outcome, JobOutcome::Success);
    assert_eq!(device_prefix(&dev, image.len()), image);
    assert_eq!(fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_zstd_download_streamed_with_declared_size() {
    let dir = tempfile::tempdir().unwrap();
    let image = patterned(2 * MIB);
    let compressed = zstd::encode_all(&image[..], 3).unwrap();
    let url = serve(HttpResponse::ok(compressed.clone())).await;
    let (dev, handle) = sparse_device(dir.path(), "card.img", 8 << 20);
    let imager = Imager::with_provider(config(dir.path()), FileDevices).unwrap();

    let mut remote = RemoteImage::new(url);
    remote.sha256 = Some(Sha256Digest::of(&compressed));
    remote.extract_size = Some(image.len() as u64);
    let job = WriteJob::new(ImageSource::Network(remote), ImageKind::Disk(Compression::Zstd), handle);
    let (report, _) = run(&imager, job).await;

    assert_eq!(report.outcome, JobOutcome::Success);
    assert_eq!(device_prefix(&dev, image.len()), image);
}

#[tokio::test]
async fn test_image_larger_than_declared_never_exceeds_device() {
    let dir = tempfile::tempdir().unwrap();
    let image = patterned(4 * MIB);
    let compressed = zstd::encode_all(&image[..], 3).unwrap();
    let url = serve(HttpResponse::ok(compressed.clone())).await;
    let (dev, handle) = sparse_device(dir.path(), "card.img", 2 * MIB as u64);
    let imager = Imager::with_provider(config(dir.path()), FileDevices).unwrap();

    let mut remote = RemoteImage::new(url);
    remote.sha256 = Some(Sha256Digest::of(&compressed));
    remote.extract_size = Some(MIB as u64);
    let job = WriteJob::new(ImageSource::Network(remote), ImageKind::Disk(Compression::Zstd), handle);
    let (report, events) = run(&imager, job).await;

    assert!(matches!(report.outcome, JobOutcome::Failed(WriteError::Extract(_))));
    assert!(!stages(&events).contains(&Stage::Verify));
    assert_eq!(fs::metadata(&dev).unwrap().len(), 2 * MIB as u64);
    let written = fs::read(&dev).unwrap();
    assert!(written[MIB..].iter().all(|b| *b == 0));
}

#[tokio::test]
async fn test_fat_archive_image() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("boot.zip");
    let firmware = patterned(200_000);
    {
        let mut zip = zip::ZipWriter::new(File::create(&archive).unwrap());
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        zip.add_directory("overlays/", options).unwrap();
        zip.start_file("start4.elf", options).unwrap();
        zip.write_all(&firmware).unwrap();
        zip.start_file("overlays/uart.dtbo", options).unwrap();
        zip.write_all(b"overlay").unwrap();
        zip.finish().unwrap();
    }
    let (dev, handle) = sparse_device(dir.path(), "card.img", 64 << 20);
    let imager = Imager::with_provider(config(dir.path()), FileDevices).unwrap();

    let kind = ImageKind::sniff(&archive).unwrap();
    assert_eq!(kind, ImageKind::FatArchive);
    let job = WriteJob::new(ImageSource::local(archive), kind, handle);
    let (report, events) = run(&imager, job).await;

    assert_eq!(report.outcome, JobOutcome::Success);
    assert!(events.iter().any(|e| matches!(
        e,
        JobEvent::Progress(p) if p.stage == Stage::Write && p.message == "Writing filesystem..."
    )));
    assert!(stages(&events).contains(&Stage::Verify));
    assert_eq!(read_boot_file(&dev, "start4.elf").unwrap(), firmware);
    assert_eq!(read_boot_file(&dev, "overlays/uart.dtbo").unwrap(), b"overlay");
}

#[tokio::test]
async fn test_customise_and_sign_after_write() {
    let dir = tempfile::tempdir().unwrap();
    let (image_path, _) = sparse_device(dir.path(), "os.img", 16 << 20);
    let kernel = patterned(150_000);
    bootable_device(
        &image_path,
        &[
            ("config.txt", b"arm_64bit=1\n"),
            ("cmdline.txt", b"console=tty1 rootwait\n"),
            ("kernel8.img", &kernel),
        ],
    );
    let key_path = dir.path().join("boot.pem");
    fs::write(&key_path, TEST_KEY_PEM).unwrap();
    let (dev, handle) = sparse_device(dir.path(), "card.img", 32 << 20);

    let mut config = config(dir.path());
    config.signing_key = Some(key_path.clone());
    let imager = Imager::with_provider(config, FileDevices).unwrap();

    let payload = CustomisationPayload {
        files: vec![PayloadFile {
            name: "user-data".into(),
            contents: b"#cloud-config\nhostname: pi\n".to_vec(),
        }],
        config_txt_append: Some("dtparam=spi=on".into()),
        cmdline_append: None,
    };
    let job = WriteJob::new(ImageSource::local(image_path), ImageKind::Disk(Compression::None), handle)
        .with_customisation(payload)
        .with_options(WriteOptions {
            verify: true,
            secure_boot: true,
        });
    let (report, events) = run(&imager, job).await;

    assert_eq!(report.outcome, JobOutcome::Success);
    assert_eq!(
        stages(&events),
        vec![
            Stage::Download,
            Stage::Unmount,
            Stage::Clear,
            Stage::Write,
            Stage::Verify,
            Stage::Customise,
            Stage::SecureBootSign,
            Stage::Finalise
        ]
    );

    assert_eq!(boot_root_names(&dev), vec!["boot.img", "boot.sig"]);
    let boot_img = read_boot_file(&dev, BOOT_IMG).unwrap();
    assert_eq!(read_image_file(&boot_img, "kernel8.img").unwrap(), kernel);
    assert_eq!(
        read_image_file(&boot_img, "user-data").unwrap(),
        b"#cloud-config\nhostname: pi\n"
    );
    assert_eq!(
        read_image_file(&boot_img, "config.txt").unwrap(),
        b"arm_64bit=1\ndtparam=spi=on\n"
    );

    let sig = String::from_utf8(read_boot_file(&dev, BOOT_SIG).unwrap()).unwrap();
    let parsed = parse_signature(&sig).unwrap();
    assert_eq!(parsed.digest, Sha256Digest::of(&boot_img));
    let key = SigningKey::load(Some(&key_path)).unwrap();
    key.verify(&boot_img, &parsed.signature).unwrap();

    let leftovers: Vec<_> = fs::read_dir(dir.path().join("tmp")).unwrap().collect();
    assert!(leftovers.is_empty());
}
