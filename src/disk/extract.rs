// Turning a verified artifact into something the device writer can consume:
// a raw block stream for disk images, or a freshly formatted FAT volume for
// file archives.

use super::{Disk, FIRST_BLOCK_SIZE, create_file_at, partition};
use crate::error::{DeviceOperation, WriteError};
use crate::models::{CancelToken, Compression};
use crate::utils::hashing::{Sha256Digest, StreamingHasher};
use crate::utils::tracker::ProgressBus;
use flate2::read::MultiGzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Component, Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, error, info};
use xz4rust::XzReader;
use zip::ZipArchive;

pub const SECTOR_SIZE: u64 = 512;

/// Reject images that cannot be a whole number of sectors.
pub fn check_alignment(size: u64) -> Result<(), WriteError> {
    if size == 0 || size % SECTOR_SIZE != 0 {
        return Err(WriteError::InvalidImageSize { size });
    }
    Ok(())
}

/// Wrap `reader` in the decoder for `compression`.
pub fn decoder<R: Read + Send + 'static>(
    compression: Compression,
    reader: R,
    buffer_size: usize,
) -> io::Result<Box<dyn Read + Send>> {
    Ok(match compression {
        Compression::None => Box::new(reader),
        Compression::Xz => {
            let buffer_size = NonZeroUsize::new(buffer_size).unwrap_or(NonZeroUsize::MIN);
            Box::new(XzReader::new_with_buffer_size(reader, buffer_size))
        }
        Compression::Gzip => Box::new(MultiGzDecoder::new(BufReader::new(reader))),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
    })
}

fn source_unreadable(path: &Path, e: io::Error) -> WriteError {
    WriteError::SourceNotReadable {
        path: path.to_path_buf(),
        cause: e.to_string(),
    }
}

/// A disk image ready to be streamed onto a device.
///
/// Uncompressed files are read in place. Compressed files whose extracted
/// size is declared are decoded on the fly while writing; otherwise they are
/// decompressed into a scratch file first so that the exact size is known
/// before the device is touched. The scratch file is deleted on drop.
#[derive(Debug)]
pub struct RawImage {
    path: PathBuf,
    compression: Compression,
    len: u64,
    buffer_size: usize,
    _scratch: Option<TempPath>,
}

impl RawImage {
    pub fn prepare(
        source: &Path,
        compression: Compression,
        declared_len: Option<u64>,
        temp_dir: &Path,
        buffer_size: usize,
        cancel: &CancelToken,
        bus: &ProgressBus,
    ) -> Result<Self, WriteError> {
        match (compression, declared_len) {
            (Compression::None, _) => {
                let len = fs::metadata(source)
                    .map_err(|e| source_unreadable(source, e))?
                    .len();
                check_alignment(len)?;
                Ok(Self {
                    path: source.to_path_buf(),
                    compression,
                    len,
                    buffer_size,
                    _scratch: None,
                })
            }
            (_, Some(len)) => {
                check_alignment(len)?;
                debug!("Streaming {:?} image of declared size {}", compression, len);
                Ok(Self {
                    path: source.to_path_buf(),
                    compression,
                    len,
                    buffer_size,
                    _scratch: None,
                })
            }
            (_, None) => Self::decompress(source, compression, temp_dir, buffer_size, cancel, bus),
        }
    }

    fn decompress(
        source: &Path,
        compression: Compression,
        temp_dir: &Path,
        buffer_size: usize,
        cancel: &CancelToken,
        bus: &ProgressBus,
    ) -> Result<Self, WriteError> {
        info!("Decompressing {} ({:?}) to a scratch file", source.display(), compression);
        let scratch_err = |e: io::Error| WriteError::Scratch(e.to_string());

        fs::create_dir_all(temp_dir).map_err(scratch_err)?;
        let mut temp = NamedTempFile::new_in(temp_dir).map_err(scratch_err)?;
        let input = File::open(source).map_err(|e| source_unreadable(source, e))?;
        let mut reader = decoder(compression, input, buffer_size)
            .map_err(|e| WriteError::Extract(e.to_string()))?;

        let mut total = 0u64;
        {
            let mut writer = BufWriter::with_capacity(buffer_size, temp.as_file_mut());
            let mut buffer = vec![0u8; buffer_size];
            loop {
                cancel.check()?;
                let n = match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(WriteError::Extract(e.to_string())),
                };
                writer.write_all(&buffer[..n]).map_err(scratch_err)?;
                total += n as u64;
                bus.report(total, None);
            }
            writer.flush().map_err(scratch_err)?;
        }

        check_alignment(total)?;
        let temp_path = temp.into_temp_path();
        info!("Decompressed {} bytes into {}", total, temp_path.display());

        Ok(Self {
            path: temp_path.to_path_buf(),
            compression: Compression::None,
            len: total,
            buffer_size,
            _scratch: Some(temp_path),
        })
    }

    /// Size of the raw image in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A fresh reader over the raw bytes.
    pub fn open(&self) -> Result<Box<dyn Read + Send>, WriteError> {
        let file = File::open(&self.path).map_err(|e| source_unreadable(&self.path, e))?;
        let reader = BufReader::with_capacity(self.buffer_size.max(FIRST_BLOCK_SIZE), file);
        decoder(self.compression, reader, self.buffer_size).map_err(|e| WriteError::Extract(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFile {
    pub name: String,
    pub size: u64,
}

/// Regular files of a FAT archive, in archive order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveManifest {
    pub files: Vec<ArchiveFile>,
    pub total: u64,
}

impl ArchiveManifest {
    /// Device bytes needed for the partition offset, the files and FAT overhead.
    pub fn required_capacity(&self) -> u64 {
        const SLACK: u64 = 32 * 1024;
        partition::FIRST_PARTITION_LBA * partition::SECTOR_SIZE
            + self.total
            + self.files.len() as u64 * SLACK
            + self.total / 64
            + 8 * 1024 * 1024
    }
}

/// `/`-joined relative path of an archive entry, rejecting anything that
/// would escape the volume root.
fn entry_name(raw: &str, enclosed: Option<PathBuf>) -> Result<String, WriteError> {
    let path = enclosed.ok_or_else(|| WriteError::Extract(format!("unsafe path in archive: {}", raw)))?;
    let parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(p) => Some(p.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        return Err(WriteError::Extract(format!("empty path in archive: {}", raw)));
    }
    Ok(parts.join("/"))
}

fn open_archive(path: &Path) -> Result<ZipArchive<BufReader<File>>, WriteError> {
    let file = File::open(path).map_err(|e| source_unreadable(path, e))?;
    ZipArchive::new(BufReader::new(file)).map_err(|e| WriteError::Extract(e.to_string()))
}

pub fn inspect_archive(path: &Path) -> Result<ArchiveManifest, WriteError> {
    let mut archive = open_archive(path)?;
    let mut files = Vec::new();
    let mut total = 0u64;

    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| WriteError::Extract(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry_name(entry.name(), entry.enclosed_name())?;
        total += entry.size();
        files.push(ArchiveFile {
            name,
            size: entry.size(),
        });
    }

    debug!("Archive {} holds {} files, {} bytes", path.display(), files.len(), total);
    Ok(ArchiveManifest { files, total })
}

/// Lay down a single FAT partition spanning the device and copy every file
/// of `archive` onto it. Returns the digest of each file as copied.
pub fn write_fat_archive(
    disk: &mut Disk,
    archive_path: &Path,
    manifest: &ArchiveManifest,
    capacity: u64,
    buffer_size: usize,
    cancel: &CancelToken,
    bus: &ProgressBus,
) -> Result<Vec<(String, Sha256Digest)>, WriteError> {
    cancel.check()?;
    if let Err(e) = partition::write_single_partition_mbr(disk.io_mut(), capacity) {
        return Err(disk.fail(DeviceOperation::Format, 0, &e));
    }
    disk.sync()?;

    let part = disk.boot_partition().map_err(|e| match e {
        WriteError::BootPartitionNotFound(_) => WriteError::MountNotPerformed,
        other => other,
    })?;

    info!("Formatting FAT partition at offset {} ({} bytes)", part.start, part.size);
    let proxy = disk.partition_io(&part)?;
    fatfs::format_volume(proxy, fatfs::FormatVolumeOptions::new().volume_label(*b"BOOT       "))
        .map_err(|e| WriteError::MountFailed(format!("formatting failed: {}", e)))?;

    let fs = disk.open_boot_filesystem()?;
    let mut archive = open_archive(archive_path)?;
    let mut buffer = vec![0u8; buffer_size];
    let mut digests = Vec::with_capacity(manifest.files.len());
    let mut done = 0u64;

    for i in 0..archive.len() {
        cancel.check()?;
        let mut entry = archive
            .by_index(i)
            .map_err(|e| WriteError::Extract(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry_name(entry.name(), entry.enclosed_name())?;
        debug!("Copying {} ({} bytes)", name, entry.size());

        let mut out = create_file_at(&fs, &name).map_err(|e| disk.fail(DeviceOperation::Write, done, &e))?;
        let mut hasher = StreamingHasher::new();
        loop {
            cancel.check()?;
            let n = match entry.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(WriteError::Extract(format!("{}: {}", name, e))),
            };
            out.write_all(&buffer[..n])
                .map_err(|e| disk.fail(DeviceOperation::Write, done, &e))?;
            hasher.update(&buffer[..n]);
            done += n as u64;
            bus.report(done, Some(manifest.total));
        }
        out.flush().map_err(|e| disk.fail(DeviceOperation::Flush, done, &e))?;
        digests.push((name, hasher.finalize()));
    }

    fs.unmount()
        .map_err(|e| disk.fail(DeviceOperation::Flush, 0, &e))?;
    disk.sync()?;

    info!("Copied {} files ({} bytes) onto {}", digests.len(), done, disk.device().display());
    Ok(digests)
}

/// Re-read each copied file and compare its digest.
pub fn verify_fat_archive(
    disk: &mut Disk,
    files: &[(String, Sha256Digest)],
    total: u64,
    buffer_size: usize,
    cancel: &CancelToken,
    bus: &ProgressBus,
) -> Result<(), WriteError> {
    if let Err(e) = disk.io_mut().drop_cache() {
        debug!("Could not drop cached pages before verify: {}", e);
    }
    let fs = disk.open_boot_filesystem()?;
    let mut buffer = vec![0u8; buffer_size];
    let mut done = 0u64;

    for (name, expected) in files {
        cancel.check()?;
        let mut hasher = StreamingHasher::new();
        let mut file = match fs.root_dir().open_file(name) {
            Ok(file) => file,
            Err(e) => {
                error!("Cannot open {} for verification: {}", name, e);
                // A missing file is a bad write, not a vanished device.
                let e = match e.kind() {
                    io::ErrorKind::NotFound => {
                        io::Error::new(io::ErrorKind::InvalidData, format!("{} is missing after write", name))
                    }
                    _ => e,
                };
                return Err(disk.fail(DeviceOperation::Read, done, &e));
            }
        };
        loop {
            cancel.check()?;
            let n = file
                .read(&mut buffer)
                .map_err(|e| disk.fail(DeviceOperation::Read, done, &e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            done += n as u64;
            bus.report(done, Some(total));
        }

        let actual = hasher.finalize();
        if actual != *expected {
            return Err(WriteError::VerifyFailed {
                device: disk.device().to_path_buf(),
                expected: *expected,
                actual,
            });
        }
    }

    info!("Verified {} files on {}", files.len(), disk.device().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobEvent, Stage};
    use crate::testutil::{patterned, read_boot_file};
    use crate::utils::perf::PerfRecorder;
    use tokio::sync::mpsc;
    use uuid::Uuid;
    use zip::write::SimpleFileOptions;

    fn bus() -> (ProgressBus, mpsc::UnboundedReceiver<JobEvent>) {
        let (bus, rx) = ProgressBus::new(PerfRecorder::new(Uuid::new_v4(), "test".into(), "/dev/test".into()));
        bus.enter(Stage::Download);
        (bus, rx)
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn archive(dir: &Path, files: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join("boot.zip");
        let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        zip.add_directory("overlays/", options).unwrap();
        for (name, data) in files {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
        path
    }

    #[test]
    fn test_alignment() {
        assert!(check_alignment(512).is_ok());
        assert!(check_alignment(1_000_000_512).is_ok());
        assert_eq!(
            check_alignment(1_000_000_511),
            Err(WriteError::InvalidImageSize { size: 1_000_000_511 })
        );
        assert_eq!(check_alignment(0), Err(WriteError::InvalidImageSize { size: 0 }));
    }

    #[test]
    fn test_gzip_decompressed_to_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let raw = patterned(8192);
        let src = dir.path().join("os.img.gz");
        fs::write(&src, gzip(&raw)).unwrap();
        let (bus, _rx) = bus();

        let image = RawImage::prepare(
            &src,
            Compression::Gzip,
            None,
            dir.path(),
            4096,
            &CancelToken::new(),
            &bus,
        )
        .unwrap();
        assert_eq!(image.len(), 8192);

        let mut out = Vec::new();
        image.open().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, raw);

        let scratch = image.path.clone();
        assert!(scratch.exists());
        drop(image);
        assert!(!scratch.exists());
    }

    #[test]
    fn test_zstd_streams_with_declared_size() {
        let dir = tempfile::tempdir().unwrap();
        let raw = patterned(16384);
        let src = dir.path().join("os.img.zst");
        fs::write(&src, zstd::encode_all(&raw[..], 3).unwrap()).unwrap();
        let (bus, _rx) = bus();

        let image = RawImage::prepare(
            &src,
            Compression::Zstd,
            Some(16384),
            dir.path(),
            4096,
            &CancelToken::new(),
            &bus,
        )
        .unwrap();

        let mut out = Vec::new();
        image.open().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, raw);
    }

    #[test]
    fn test_unaligned_decompressed_image_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("odd.img.gz");
        fs::write(&src, gzip(&patterned(1000))).unwrap();
        let (bus, _rx) = bus();

        let err = RawImage::prepare(
            &src,
            Compression::Gzip,
            None,
            dir.path(),
            4096,
            &CancelToken::new(),
            &bus,
        )
        .unwrap_err();
        assert_eq!(err, WriteError::InvalidImageSize { size: 1000 });

        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_corrupt_stream_is_extract_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("bad.img.gz");
        let mut data = gzip(&patterned(8192));
        // Break the CRC32 in the gzip trailer.
        let crc = data.len() - 8;
        data[crc] ^= 0xFF;
        fs::write(&src, data).unwrap();
        let (bus, _rx) = bus();

        let err = RawImage::prepare(
            &src,
            Compression::Gzip,
            None,
            dir.path(),
            4096,
            &CancelToken::new(),
            &bus,
        )
        .unwrap_err();
        assert!(matches!(err, WriteError::Extract(_)));
    }

    #[test]
    fn test_inspect_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = archive(dir.path(), &[("config.txt", b"arm_64bit=1\n"), ("overlays/a.dtbo", &[7u8; 100])]);

        let manifest = inspect_archive(&path).unwrap();
        assert_eq!(manifest.total, 112);
        let names: Vec<&str> = manifest.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["config.txt", "overlays/a.dtbo"]);
        assert!(manifest.required_capacity() > manifest.total);
    }

    #[test]
    fn test_fat_archive_written_and_verified() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = patterned(70_000);
        let path = archive(dir.path(), &[("kernel8.img", &kernel), ("overlays/a.dtbo", b"dtbo")]);
        let manifest = inspect_archive(&path).unwrap();

        let (dev_path, _) = crate::testutil::sparse_device(dir.path(), "card.img", 64 << 20);
        let file = fs::OpenOptions::new().read(true).write(true).open(&dev_path).unwrap();
        let mut disk = Disk::from_file(file, &dev_path);
        let (bus, _rx) = bus();

        let digests = write_fat_archive(
            &mut disk,
            &path,
            &manifest,
            64 << 20,
            4096,
            &CancelToken::new(),
            &bus,
        )
        .unwrap();
        assert_eq!(digests.len(), 2);
        assert_eq!(digests[0], ("kernel8.img".to_string(), Sha256Digest::of(&kernel)));

        verify_fat_archive(&mut disk, &digests, manifest.total, 4096, &CancelToken::new(), &bus).unwrap();
        assert_eq!(read_boot_file(&dev_path, "kernel8.img").unwrap(), kernel);
        assert_eq!(read_boot_file(&dev_path, "overlays/a.dtbo").unwrap(), b"dtbo");

        let wrong = vec![("kernel8.img".to_string(), Sha256Digest::of(b"other"))];
        assert!(matches!(
            verify_fat_archive(&mut disk, &wrong, manifest.total, 4096, &CancelToken::new(), &bus),
            Err(WriteError::VerifyFailed { .. })
        ));
    }

    #[test]
    fn test_missing_empty_file_fails_verify() {
        let dir = tempfile::tempdir().unwrap();
        let path = archive(dir.path(), &[("kernel8.img", b"kernel"), ("ssh", b"")]);
        let manifest = inspect_archive(&path).unwrap();

        let (dev_path, _) = crate::testutil::sparse_device(dir.path(), "card.img", 64 << 20);
        let file = fs::OpenOptions::new().read(true).write(true).open(&dev_path).unwrap();
        let mut disk = Disk::from_file(file, &dev_path);
        let (bus, _rx) = bus();
        let digests =
            write_fat_archive(&mut disk, &path, &manifest, 64 << 20, 4096, &CancelToken::new(), &bus).unwrap();
        assert!(digests.contains(&("ssh".to_string(), Sha256Digest::of(b""))));

        {
            let fs = disk.open_boot_filesystem().unwrap();
            fs.root_dir().remove("ssh").unwrap();
            fs.unmount().unwrap();
        }

        let result = verify_fat_archive(&mut disk, &digests, manifest.total, 4096, &CancelToken::new(), &bus);
        assert!(matches!(result, Err(WriteError::Device { .. })));
    }
}
