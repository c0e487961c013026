// Applies a customisation payload to the boot partition of a written image.

use super::{BootFs, Disk, create_file_at};
use crate::error::{DeviceOperation, WriteError};
use crate::models::{CancelToken, CustomisationPayload};
use crate::utils::tracker::ProgressBus;
use std::io::{self, Read, Write};
use tracing::{debug, info};

pub const CONFIG_TXT: &str = "config.txt";
pub const CMDLINE_TXT: &str = "cmdline.txt";

fn customisation_error(e: WriteError) -> WriteError {
    match e {
        WriteError::DeviceRemoved(_) | WriteError::Cancelled | WriteError::Customisation(_) => e,
        other => WriteError::Customisation(other.to_string()),
    }
}

fn read_existing(fs: &BootFs, name: &str) -> io::Result<Option<String>> {
    match fs.root_dir().open_file(name) {
        Ok(mut file) => {
            let mut content = String::new();
            file.read_to_string(&mut content)?;
            Ok(Some(content))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn replace_file(fs: &BootFs, name: &str, contents: &[u8]) -> io::Result<()> {
    let mut file = create_file_at(fs, name)?;
    file.write_all(contents)?;
    file.flush()
}

/// `config.txt` lines are appended after the existing content.
fn append_config(existing: Option<String>, extra: &str) -> String {
    let mut out = existing.unwrap_or_default();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(extra);
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// `cmdline.txt` is a single line; extra parameters go on the end of it.
fn append_cmdline(existing: Option<String>, extra: &str) -> String {
    let base = existing.unwrap_or_default();
    let base = base.trim_end();
    let extra = extra.trim();
    if base.is_empty() {
        format!("{}\n", extra)
    } else {
        format!("{} {}\n", base, extra)
    }
}

/// Write `payload` into the FAT boot partition and sync it to the device.
pub fn apply_customisation(
    disk: &mut Disk,
    payload: &CustomisationPayload,
    cancel: &CancelToken,
    bus: &ProgressBus,
) -> Result<(), WriteError> {
    cancel.check()?;
    let fs = disk.open_boot_filesystem().map_err(customisation_error)?;
    let io_err = |disk: &Disk, name: &str, e: io::Error| match disk.fail(DeviceOperation::Write, 0, &e) {
        WriteError::DeviceRemoved(path) => WriteError::DeviceRemoved(path),
        _ => WriteError::Customisation(format!("{}: {}", name, e)),
    };

    let steps = payload.files.len() as u64
        + u64::from(payload.config_txt_append.is_some())
        + u64::from(payload.cmdline_append.is_some());
    let mut done = 0u64;

    for file in &payload.files {
        cancel.check()?;
        debug!("Writing {} ({} bytes) to boot partition", file.name, file.contents.len());
        replace_file(&fs, &file.name, &file.contents).map_err(|e| io_err(disk, &file.name, e))?;
        done += 1;
        bus.report(done, Some(steps));
    }

    if let Some(extra) = &payload.config_txt_append {
        cancel.check()?;
        let existing = read_existing(&fs, CONFIG_TXT).map_err(|e| io_err(disk, CONFIG_TXT, e))?;
        let updated = append_config(existing, extra);
        replace_file(&fs, CONFIG_TXT, updated.as_bytes()).map_err(|e| io_err(disk, CONFIG_TXT, e))?;
        done += 1;
        bus.report(done, Some(steps));
    }

    if let Some(extra) = &payload.cmdline_append {
        cancel.check()?;
        let existing = read_existing(&fs, CMDLINE_TXT).map_err(|e| io_err(disk, CMDLINE_TXT, e))?;
        let updated = append_cmdline(existing, extra);
        replace_file(&fs, CMDLINE_TXT, updated.as_bytes()).map_err(|e| io_err(disk, CMDLINE_TXT, e))?;
        done += 1;
        bus.report(done, Some(steps));
    }

    fs.unmount().map_err(|e| io_err(disk, "boot partition", e))?;
    disk.sync().map_err(customisation_error)?;

    info!("Applied {} customisation steps to {}", done, disk.device().display());
    Ok(())
}
