// Minimal partition-table handling: enough to find a FAT boot partition,
// count partitions after a clear, and lay down a single-partition MBR.

use super::common::DiskIo;
use gpt::GptConfig;
use gpt::disk::LogicalBlockSize;
use std::io::{self, Read, Seek, SeekFrom, Write};
use tracing::debug;
use uuid::Uuid;

pub const SECTOR_SIZE: u64 = 512;
/// First partition starts 4 MiB in, aligned for flash erase blocks.
pub const FIRST_PARTITION_LBA: u64 = 8192;

const TABLE_OFFSET: usize = 446;
const ENTRY_SIZE: usize = 16;
const GPT_PROTECTIVE: u8 = 0xEE;
const FAT32_LBA: u8 = 0x0C;
const FAT_TYPES: [u8; 6] = [0x01, 0x04, 0x06, 0x0B, 0x0C, 0x0E];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    Fat,
    EfiSystem,
    BasicData,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub index: u32,
    /// Byte offset of the first sector.
    pub start: u64,
    /// Length in bytes.
    pub size: u64,
    pub kind: PartitionKind,
}

impl PartitionEntry {
    pub fn may_hold_fat(&self) -> bool {
        matches!(
            self.kind,
            PartitionKind::Fat | PartitionKind::EfiSystem | PartitionKind::BasicData
        )
    }
}

/// Partitions listed by the MBR, or by the GPT behind a protective MBR.
pub fn read_partitions(dev: &mut dyn DiskIo) -> io::Result<Vec<PartitionEntry>> {
    let mut sector = [0u8; SECTOR_SIZE as usize];
    dev.seek(SeekFrom::Start(0))?;
    match dev.read_exact(&mut sector) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Vec::new()),
        Err(e) => return Err(e),
    }

    if sector[510..512] != [0x55, 0xAA] {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for i in 0..4 {
        let raw = &sector[TABLE_OFFSET + i * ENTRY_SIZE..TABLE_OFFSET + (i + 1) * ENTRY_SIZE];
        let part_type = raw[4];
        let first_lba = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]) as u64;
        let sectors = u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]) as u64;

        if part_type == GPT_PROTECTIVE {
            return read_gpt(dev);
        }
        if part_type == 0 || sectors == 0 {
            continue;
        }

        entries.push(PartitionEntry {
            index: i as u32 + 1,
            start: first_lba * SECTOR_SIZE,
            size: sectors * SECTOR_SIZE,
            kind: if FAT_TYPES.contains(&part_type) {
                PartitionKind::Fat
            } else {
                PartitionKind::Other
            },
        });
    }

    debug!("MBR lists {} partitions", entries.len());
    Ok(entries)
}

fn read_gpt(dev: &mut dyn DiskIo) -> io::Result<Vec<PartitionEntry>> {
    let cfg = GptConfig::new()
        .writable(false)
        .logical_block_size(LogicalBlockSize::Lb512);
    let disk = cfg
        .open_from_device(Box::new(dev.try_clone_io()?))
        .map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to parse GPT partition table: {}", e),
            )
        })?;

    let entries: Vec<PartitionEntry> = disk
        .partitions()
        .iter()
        .filter(|(_, part)| part.is_used())
        .map(|(id, part)| {
            let kind = if part.part_type_guid == gpt::partition_types::EFI {
                PartitionKind::EfiSystem
            } else if part.part_type_guid == gpt::partition_types::BASIC {
                PartitionKind::BasicData
            } else {
                PartitionKind::Other
            };
            PartitionEntry {
                index: *id,
                start: part.first_lba * SECTOR_SIZE,
                size: (part.last_lba.saturating_sub(part.first_lba) + 1) * SECTOR_SIZE,
                kind,
            }
        })
        .collect();

    debug!("GPT lists {} partitions", entries.len());
    Ok(entries)
}

/// Write an MBR describing one FAT32 (LBA) partition spanning the device.
pub fn write_single_partition_mbr(dev: &mut dyn DiskIo, capacity: u64) -> io::Result<PartitionEntry> {
    let total_sectors = capacity / SECTOR_SIZE;
    if total_sectors <= FIRST_PARTITION_LBA * 2 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("device of {} bytes is too small for a partition table", capacity),
        ));
    }
    let sectors = (total_sectors - FIRST_PARTITION_LBA).min(u32::MAX as u64);

    let mut sector = [0u8; SECTOR_SIZE as usize];
    sector[440..444].copy_from_slice(&Uuid::new_v4().as_bytes()[..4]);

    let entry = &mut sector[TABLE_OFFSET..TABLE_OFFSET + ENTRY_SIZE];
    entry[0] = 0x80;
    entry[1..4].copy_from_slice(&[0xFE, 0xFF, 0xFF]);
    entry[4] = FAT32_LBA;
    entry[5..8].copy_from_slice(&[0xFE, 0xFF, 0xFF]);
    entry[8..12].copy_from_slice(&(FIRST_PARTITION_LBA as u32).to_le_bytes());
    entry[12..16].copy_from_slice(&(sectors as u32).to_le_bytes());

    sector[510] = 0x55;
    sector[511] = 0xAA;

    dev.seek(SeekFrom::Start(0))?;
    dev.write_all(&sector)?;
    dev.flush()?;

    Ok(PartitionEntry {
        index: 1,
        start: FIRST_PARTITION_LBA * SECTOR_SIZE,
        size: sectors * SECTOR_SIZE,
        kind: PartitionKind::Fat,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn device(size: u64) -> File {
        let file = tempfile::tempfile().unwrap();
        file.set_len(size).unwrap();
        file
    }

    fn put_entry(sector: &mut [u8], slot: usize, part_type: u8, lba: u32, sectors: u32) {
        let off = TABLE_OFFSET + slot * ENTRY_SIZE;
        sector[off + 4] = part_type;
        sector[off + 8..off + 12].copy_from_slice(&lba.to_le_bytes());
        sector[off + 12..off + 16].copy_from_slice(&sectors.to_le_bytes());
    }

    #[test]
    fn test_blank_device_has_no_partitions() {
        let mut dev = device(1 << 20);
        assert!(read_partitions(&mut dev).unwrap().is_empty());

        let mut tiny = device(100);
        assert!(read_partitions(&mut tiny).unwrap().is_empty());
    }

    #[test]
    fn test_reads_mbr_entries() {
        let mut dev = device(64 << 20);
        let mut sector = [0u8; 512];
        put_entry(&mut sector, 0, 0x0C, 8192, 65536);
        put_entry(&mut sector, 1, 0x83, 73728, 1000);
        sector[510] = 0x55;
        sector[511] = 0xAA;
        dev.write_all(&sector).unwrap();

        let parts = read_partitions(&mut dev).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].start, 8192 * 512);
        assert_eq!(parts[0].size, 65536 * 512);
        assert_eq!(parts[0].kind, PartitionKind::Fat);
        assert_eq!(parts[1].kind, PartitionKind::Other);
        assert!(!parts[1].may_hold_fat());
    }

    #[test]
    fn test_reads_gpt_entries() {
        let capacity = 32u64 << 20;
        let mut dev = device(capacity);
        let mbr = gpt::mbr::ProtectiveMBR::with_lb_size((capacity / SECTOR_SIZE - 1) as u32);
        mbr.overwrite_lba0(&mut dev).unwrap();

        let mut disk = GptConfig::new()
            .initialized(false)
            .writable(true)
            .logical_block_size(LogicalBlockSize::Lb512)
            .create_from_device(Box::new(dev.try_clone().unwrap()), None)
            .unwrap();
        disk.update_partitions(std::collections::BTreeMap::new()).unwrap();
        disk.add_partition("boot", 8 << 20, gpt::partition_types::EFI, 0, None)
            .unwrap();
        disk.add_partition("root", 8 << 20, gpt::partition_types::LINUX_FS, 0, None)
            .unwrap();
        disk.write().unwrap();

        let parts = read_partitions(&mut dev).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].kind, PartitionKind::EfiSystem);
        assert_eq!(parts[0].size, 8 << 20);
        assert!(parts[0].may_hold_fat());
        assert_eq!(parts[1].kind, PartitionKind::Other);
    }

    #[test]
    fn test_single_partition_round_trip() {
        let capacity = 32u64 << 20;
        let mut dev = device(capacity);
        let written = write_single_partition_mbr(&mut dev, capacity).unwrap();
        assert_eq!(written.start, 4 << 20);
        assert_eq!(written.size, capacity - (4 << 20));

        let parts = read_partitions(&mut dev).unwrap();
        assert_eq!(parts, vec![written]);
    }

    #[test]
    fn test_single_partition_needs_room() {
        let mut dev = device(4 << 20);
        assert!(write_single_partition_mbr(&mut dev, 4 << 20).is_err());
    }
}
