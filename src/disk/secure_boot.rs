// Secure-boot packaging: the boot partition's files are rolled into a FAT
// image (`boot.img`), signed with an RSA-2048 key (`boot.sig`), and the
// partition is replaced by just those two files.
//
// Nothing on the device is touched until both artifacts have been produced,
// read back and checked against the public key.

use super::{BootDir, Disk, create_file_at};
use crate::error::WriteError;
use crate::models::CancelToken;
use crate::utils::hashing::Sha256Digest;
use crate::utils::tracker::ProgressBus;
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::{Signature, SigningKey as Pkcs1SigningKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{Keypair, SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use sha2::Sha256;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

pub const BOOT_IMG: &str = "boot.img";
pub const BOOT_SIG: &str = "boot.sig";

/// Modulus size of an RSA-2048 key.
pub const RSA_KEY_BYTES: usize = 256;

const FILE_SLACK: u64 = 32 * 1024;
const IMAGE_SLACK: u64 = 2 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;
const COPY_CHUNK: usize = 64 * 1024;

fn invalid_key(path: &Path, reason: impl Into<String>) -> WriteError {
    WriteError::InvalidSigningKey {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// RSA-2048 private key used to sign `boot.img`.
#[derive(Debug, Clone)]
pub struct SigningKey {
    path: PathBuf,
    key: Pkcs1SigningKey<Sha256>,
}

impl SigningKey {
    /// Load the configured key. Fails before any work when no key is set.
    pub fn load(path: Option<&Path>) -> Result<Self, WriteError> {
        let path = path.ok_or(WriteError::NoSigningKeyConfigured)?;
        let pem = match fs::read_to_string(path) {
            Ok(pem) => pem,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(WriteError::SigningKeyNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(invalid_key(path, e.to_string())),
        };
        Self::from_pem(path, &pem)
    }

    /// Parse a PKCS#8 or PKCS#1 PEM private key.
    pub fn from_pem(path: &Path, pem: &str) -> Result<Self, WriteError> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| invalid_key(path, format!("not an RSA private key in PEM format: {}", e)))?;

        if key.size() != RSA_KEY_BYTES {
            return Err(invalid_key(
                path,
                format!("expected a 2048-bit key, got {} bits", key.size() * 8),
            ));
        }

        debug!("Loaded RSA-2048 signing key from {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            key: Pkcs1SigningKey::<Sha256>::new(key),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PKCS#1 v1.5 signature over the SHA-256 of `data`.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, WriteError> {
        let signature = self
            .key
            .try_sign(data)
            .map_err(|e| WriteError::secure_boot("Error signing boot image", e))?;
        Ok(signature.to_vec())
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), WriteError> {
        let signature = Signature::try_from(signature)
            .map_err(|e| WriteError::secure_boot("Invalid boot image signature", e))?;
        self.key
            .verifying_key()
            .verify(data, &signature)
            .map_err(|e| WriteError::secure_boot("Boot image signature does not verify", e))
    }
}

/// Text of `boot.sig`.
pub fn render_signature(digest: &Sha256Digest, timestamp: i64, signature: &[u8]) -> String {
    format!(
        "{}\nts: {}\nrsa2048: {}\n",
        digest,
        timestamp,
        hex::encode(signature)
    )
}

/// Fields of a `boot.sig` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignature {
    pub digest: Sha256Digest,
    pub timestamp: i64,
    pub signature: Vec<u8>,
}

pub fn parse_signature(text: &str) -> Option<ParsedSignature> {
    let mut lines = text.lines();
    let digest = lines.next()?.trim().parse().ok()?;
    let mut timestamp = None;
    let mut signature = None;
    for line in lines {
        if let Some(ts) = line.strip_prefix("ts: ") {
            timestamp = ts.trim().parse().ok();
        } else if let Some(sig) = line.strip_prefix("rsa2048: ") {
            signature = hex::decode(sig.trim()).ok();
        }
    }
    Some(ParsedSignature {
        digest,
        timestamp: timestamp?,
        signature: signature?,
    })
}

/// Working files of one packaging run. The directory is removed on drop.
#[derive(Debug)]
pub struct SecureBootArtifact {
    pub boot_image_path: PathBuf,
    pub signature_path: PathBuf,
    pub rsa_key_path: PathBuf,
    workdir: TempDir,
}

impl SecureBootArtifact {
    fn create(temp_root: &Path, key: &SigningKey) -> Result<Self, WriteError> {
        fs::create_dir_all(temp_root)
            .map_err(|e| WriteError::secure_boot("Error creating temporary directory", e))?;
        let workdir = tempfile::Builder::new()
            .prefix("secure-boot-")
            .tempdir_in(temp_root)
            .map_err(|e| WriteError::secure_boot("Error creating temporary directory", e))?;
        debug!("Secure boot working directory: {}", workdir.path().display());

        Ok(Self {
            boot_image_path: workdir.path().join(BOOT_IMG),
            signature_path: workdir.path().join(BOOT_SIG),
            rsa_key_path: key.path().to_path_buf(),
            workdir,
        })
    }

    fn files_dir(&self) -> PathBuf {
        self.workdir.path().join("files")
    }

    fn cleanup(self) {
        let path = self.workdir.path().to_path_buf();
        if let Err(e) = self.workdir.close() {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "Operation cancelled")
}

/// Copy `src` into `dst` one chunk at a time, stopping once `cancel` fires.
fn copy_chunked(src: &mut impl Read, dst: &mut impl Write, cancel: &CancelToken) -> io::Result<u64> {
    let mut buffer = vec![0u8; COPY_CHUNK];
    let mut copied = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let n = match src.read(&mut buffer) {
            Ok(0) => return Ok(copied),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        dst.write_all(&buffer[..n])?;
        copied += n as u64;
    }
}

fn is_signed_artifact(name: &str) -> bool {
    name.eq_ignore_ascii_case(BOOT_IMG) || name.eq_ignore_ascii_case(BOOT_SIG)
}

/// Copy every file below `dir` into `dest`, returning relative paths and sizes.
fn extract_dir(
    dir: &BootDir<'_>,
    prefix: &str,
    dest: &Path,
    out: &mut Vec<(String, u64)>,
    cancel: &CancelToken,
) -> io::Result<()> {
    for entry in dir.iter() {
        let entry = entry?;
        let name = entry.file_name();
        if name == "." || name == ".." {
            continue;
        }
        let rel = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };

        if entry.is_dir() {
            fs::create_dir_all(dest.join(&rel))?;
            extract_dir(&entry.to_dir(), &rel, dest, out, cancel)?;
        } else {
            if prefix.is_empty() && is_signed_artifact(&name) {
                debug!("Skipping existing {}", name);
                continue;
            }
            let mut src = entry.to_file();
            let mut dst = File::create(dest.join(&rel))?;
            let copied = copy_chunked(&mut src, &mut dst, cancel)?;
            out.push((rel, copied));
        }
    }
    Ok(())
}

/// Build a FAT image at `image_path` holding `files` from `source_root`.
fn build_boot_image(
    image_path: &Path,
    source_root: &Path,
    files: &[(String, u64)],
    cancel: &CancelToken,
) -> io::Result<u64> {
    let total: u64 = files.iter().map(|(_, size)| size).sum();
    let size = (total + files.len() as u64 * FILE_SLACK + IMAGE_SLACK).div_ceil(MIB) * MIB;

    let mut image = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(image_path)?;
    image.set_len(size)?;

    fatfs::format_volume(&mut image, fatfs::FormatVolumeOptions::new())?;
    image.rewind()?;
    {
        let fs = fatfs::FileSystem::new(&mut image, fatfs::FsOptions::new())?;
        for (name, _) in files {
            let mut src = File::open(source_root.join(name))?;
            let mut dst = create_file_at(&fs, name)?;
            copy_chunked(&mut src, &mut dst, cancel)?;
        }
        fs.unmount()?;
    }
    image.sync_all()?;
    Ok(size)
}

/// Delete everything in `dir`, depth first.
fn remove_all(dir: &BootDir<'_>) -> io::Result<()> {
    let entries: Vec<(String, bool)> = dir
        .iter()
        .map(|e| e.map(|e| (e.file_name(), e.is_dir())))
        .collect::<io::Result<_>>()?;

    for (name, is_dir) in entries {
        if name == "." || name == ".." {
            continue;
        }
        if is_dir {
            remove_all(&dir.open_dir(&name)?)?;
        }
        dir.remove(&name)?;
    }
    Ok(())
}

/// Package, sign and install `boot.img`/`boot.sig` on the boot partition.
/// Returns the digest of the installed `boot.img`.
pub fn package_and_sign(
    disk: &mut Disk,
    key: &SigningKey,
    temp_root: &Path,
    cancel: &CancelToken,
    bus: &ProgressBus,
) -> Result<Sha256Digest, WriteError> {
    cancel.check()?;
    let artifact = SecureBootArtifact::create(temp_root, key)?;
    let result = run(disk, key, &artifact, cancel, bus);
    artifact.cleanup();
    result
}

fn run(
    disk: &mut Disk,
    key: &SigningKey,
    artifact: &SecureBootArtifact,
    cancel: &CancelToken,
    bus: &ProgressBus,
) -> Result<Sha256Digest, WriteError> {
    bus.message("Extracting boot partition files...");
    let files_dir = artifact.files_dir();
    fs::create_dir_all(&files_dir)
        .map_err(|e| WriteError::secure_boot("Error creating temporary directory", e))?;

    let mut files = Vec::new();
    {
        let fs = disk.open_boot_filesystem()?;
        if let Err(e) = extract_dir(&fs.root_dir(), "", &files_dir, &mut files, cancel) {
            cancel.check()?;
            return Err(WriteError::secure_boot("Error extracting boot partition files", e));
        }
    }
    if files.is_empty() {
        return Err(WriteError::NoBootFilesFound);
    }
    info!("Extracted {} files from the boot partition", files.len());
    bus.report(1, Some(4));

    cancel.check()?;
    bus.message("Creating boot.img...");
    let image_size = match build_boot_image(&artifact.boot_image_path, &files_dir, &files, cancel) {
        Ok(size) => size,
        Err(e) => {
            cancel.check()?;
            return Err(WriteError::secure_boot("Error creating boot.img", e));
        }
    };
    debug!("boot.img is {} bytes", image_size);
    bus.report(2, Some(4));

    cancel.check()?;
    bus.message("Signing boot image...");
    let image = fs::read(&artifact.boot_image_path)
        .map_err(|e| WriteError::secure_boot("Error reading boot.img", e))?;
    let digest = Sha256Digest::of(&image);
    let signature = key.sign(&image)?;
    let sig_text = render_signature(&digest, chrono::Utc::now().timestamp(), &signature);
    fs::write(&artifact.signature_path, &sig_text)
        .map_err(|e| WriteError::secure_boot("Error writing boot.sig", e))?;

    // Both artifacts are read back and checked before the partition is touched.
    let image = fs::read(&artifact.boot_image_path)
        .map_err(|e| WriteError::secure_boot("Error reading boot.img", e))?;
    let sig_text = fs::read_to_string(&artifact.signature_path)
        .map_err(|e| WriteError::secure_boot("Error reading boot.sig", e))?;
    let parsed = parse_signature(&sig_text)
        .ok_or_else(|| WriteError::secure_boot("Error reading boot.sig", "malformed signature file"))?;
    if parsed.digest != Sha256Digest::of(&image) {
        return Err(WriteError::secure_boot(
            "Error validating boot.img",
            "digest changed after signing",
        ));
    }
    key.verify(&image, &parsed.signature)?;
    bus.report(3, Some(4));

    {
        let fs = disk.open_boot_filesystem()?;
        let stats = fs
            .stats()
            .map_err(|e| WriteError::secure_boot("Error reading boot partition", e))?;
        let capacity = stats.total_clusters() as u64 * stats.cluster_size() as u64;
        let needed = image.len() as u64 + sig_text.len() as u64 + 2 * stats.cluster_size() as u64;
        if needed > capacity {
            return Err(WriteError::secure_boot(
                "Error writing boot.img",
                format!("{} bytes needed, boot partition holds {}", needed, capacity),
            ));
        }
    }

    cancel.check()?;

    // From here on the partition is rewritten; cancellation is no longer honoured.
    bus.message("Cleaning up boot partition...");
    {
        let fs = disk.open_boot_filesystem()?;
        remove_all(&fs.root_dir())
            .map_err(|e| WriteError::secure_boot("Error cleaning up boot partition", e))?;
        fs.unmount()
            .map_err(|e| WriteError::secure_boot("Error cleaning up boot partition", e))?;
    }
    bus.message("Syncing deletions to disk...");
    disk.sync()?;

    bus.message("Writing signed boot files...");
    {
        let fs = disk.open_boot_filesystem()?;
        for (name, contents) in [(BOOT_IMG, image.as_slice()), (BOOT_SIG, sig_text.as_bytes())] {
            let mut file = create_file_at(&fs, name)
                .map_err(|e| WriteError::secure_boot("Error writing signed boot files", e))?;
            file.write_all(contents)
                .and_then(|_| file.flush())
                .map_err(|e| WriteError::secure_boot("Error writing signed boot files", e))?;
        }
        fs.unmount()
            .map_err(|e| WriteError::secure_boot("Error writing signed boot files", e))?;
    }
    disk.sync()?;
    bus.report(4, Some(4));

    info!("Installed signed boot image {} on {}", digest, disk.device().display());
    Ok(digest)
}

/// Read a file out of a FAT image held in memory.
pub fn read_image_file(image: &[u8], name: &str) -> io::Result<Vec<u8>> {
    let fs = fatfs::FileSystem::new(io::Cursor::new(image.to_vec()), fatfs::FsOptions::new())?;
    let mut file = fs.root_dir().open_file(name)?;
    let mut out = Vec::new();
    file.read_to_end(&mut out)?;
    Ok(out)
}
