// Shared fixtures for unit tests.

use crate::disk::common::PartitionFileProxy;
use crate::disk::partition;
use crate::models::DeviceHandle;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub const TEST_KEY_PEM: &str = include_str!("disk/testdata/secure_boot_test_key.pem");
pub const SMALL_KEY_PEM: &str = include_str!("disk/testdata/rsa1024_test_key.pem");

pub struct HttpResponse {
    status: u16,
    body: Vec<u8>,
    content_length: Option<usize>,
}

impl HttpResponse {
    pub fn ok(body: Vec<u8>) -> Self {
        let len = body.len();
        Self {
            status: 200,
            body,
            content_length: Some(len),
        }
    }

    /// Announces `declared` bytes but closes after sending `body`.
    pub fn truncated(body: Vec<u8>, declared: usize) -> Self {
        Self {
            status: 200,
            body,
            content_length: Some(declared),
        }
    }

    /// Chunked transfer encoding, no length announced.
    pub fn chunked(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            body,
            content_length: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            content_length: Some(0),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let reason = match self.status {
            200 => "OK",
            404 => "Not Found",
            500 => "Internal Server Error",
            _ => "Status",
        };
        let mut out = format!("HTTP/1.1 {} {}\r\nConnection: close\r\n", self.status, reason);
        match self.content_length {
            Some(len) => out.push_str(&format!("Content-Length: {}\r\n\r\n", len)),
            None => out.push_str("Transfer-Encoding: chunked\r\n\r\n"),
        }

        let mut bytes = out.into_bytes();
        match self.content_length {
            Some(_) => bytes.extend_from_slice(&self.body),
            None => {
                if !self.body.is_empty() {
                    bytes.extend_from_slice(format!("{:x}\r\n", self.body.len()).as_bytes());
                    bytes.extend_from_slice(&self.body);
                    bytes.extend_from_slice(b"\r\n");
                }
                bytes.extend_from_slice(b"0\r\n\r\n");
            }
        }
        bytes
    }
}

/// Serve `response` to every request on a local port. Returns the URL.
pub async fn serve(response: HttpResponse) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let payload = Arc::new(response.encode());

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let payload = payload.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            request.extend_from_slice(&buf[..n]);
                            if request.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                let _ = socket.write_all(&payload).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{}/images/os.img", addr)
}

/// Deterministic, non-repeating-looking test data.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64).wrapping_mul(2654435761) >> 7) as u8)
        .collect()
}

/// A sparse file standing in for a block device.
pub fn sparse_device(dir: &Path, name: &str, capacity: u64) -> (PathBuf, DeviceHandle) {
    let path = dir.join(name);
    let file = File::create(&path).unwrap();
    file.set_len(capacity).unwrap();
    (path.clone(), DeviceHandle::new(path, capacity))
}

/// Lay down an MBR with one FAT partition holding `files`.
pub fn bootable_device(path: &Path, files: &[(&str, &[u8])]) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let capacity = file.metadata().unwrap().len();
    let part = partition::write_single_partition_mbr(&mut file, capacity).unwrap();

    let proxy = PartitionFileProxy {
        file: file.try_clone().unwrap(),
        partition_offset: part.start,
        partition_size: part.size,
        current_position: 0,
    };
    fatfs::format_volume(proxy, fatfs::FormatVolumeOptions::new()).unwrap();

    let proxy = PartitionFileProxy {
        file,
        partition_offset: part.start,
        partition_size: part.size,
        current_position: 0,
    };
    let fs = fatfs::FileSystem::new(proxy, fatfs::FsOptions::new()).unwrap();
    for (name, contents) in files {
        let mut dir = fs.root_dir();
        let mut parts: Vec<&str> = name.split('/').collect();
        let file_name = parts.pop().unwrap();
        for component in parts {
            dir = match dir.open_dir(component) {
                Ok(d) => d,
                Err(_) => dir.create_dir(component).unwrap(),
            };
        }
        let mut f = dir.create_file(file_name).unwrap();
        f.truncate().unwrap();
        f.write_all(contents).unwrap();
    }
    fs.unmount().unwrap();
}

/// Read a file from the boot partition of a device image.
pub fn read_boot_file(path: &Path, name: &str) -> Option<Vec<u8>> {
    use std::io::Read;

    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let part = partition::read_partitions(&mut file)
        .unwrap()
        .into_iter()
        .next()?;
    let proxy = PartitionFileProxy {
        file,
        partition_offset: part.start,
        partition_size: part.size,
        current_position: 0,
    };
    let fs = fatfs::FileSystem::new(proxy, fatfs::FsOptions::new()).ok()?;
    let mut dir = fs.root_dir();
    let mut parts: Vec<&str> = name.split('/').collect();
    let file_name = parts.pop()?;
    for component in parts {
        dir = dir.open_dir(component).ok()?;
    }
    let mut f = dir.open_file(file_name).ok()?;
    let mut out = Vec::new();
    f.read_to_end(&mut out).ok()?;
    Some(out)
}

/// Root directory listing of the boot partition.
pub fn boot_root_names(path: &Path) -> Vec<String> {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let part = partition::read_partitions(&mut file).unwrap().remove(0);
    let proxy = PartitionFileProxy {
        file,
        partition_offset: part.start,
        partition_size: part.size,
        current_position: 0,
    };
    let fs = fatfs::FileSystem::new(proxy, fatfs::FsOptions::new()).unwrap();
    let mut names: Vec<String> = fs
        .root_dir()
        .iter()
        .flatten()
        .map(|e| e.file_name())
        .filter(|n| n != "." && n != "..")
        .collect();
    names.sort();
    names
}
