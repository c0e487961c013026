use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use os_imager::disk::{FileDevices, bytes_to_mb, list_devices};
use os_imager::utils::cache::ImageCache;
use os_imager::utils::customisation::CustomisationSettings;
use os_imager::utils::hashing::Sha256Digest;
use os_imager::{
    Compression, DeviceHandle, ImageKind, ImageSource, Imager, ImagerConfig, JobEvent, JobHandle, JobOutcome,
    RemoteImage, WriteJob, WriteOptions,
};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Write OS images to SD cards and USB drives
#[derive(Parser, Debug)]
#[clap(name = "os-imager", version)]
struct Args {
    /// Configuration file (defaults to the per-user imager.toml)
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `os_imager=trace` (overrides RUST_LOG)
    #[clap(long, global = true)]
    log_level: Option<String>,

    /// Append logs to this file instead of stderr
    #[clap(long, global = true)]
    log_file: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached drives
    List {
        /// Include system drives
        #[clap(long)]
        all: bool,
    },
    /// Write an image to a device
    Write(WriteArgs),
    /// Manage the download cache
    Cache {
        #[clap(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Remove partial files left by interrupted downloads
    Clean,
    /// Drop the cached copy of an image URL
    Remove { url: String },
}

#[derive(clap::Args, Debug)]
struct WriteArgs {
    /// Image URL (http/https) or local file
    source: String,

    /// Published SHA256 of the image file
    #[clap(long)]
    sha256: Option<Sha256Digest>,

    /// Image kind; local files are inspected when omitted, URLs default to raw
    #[clap(long, value_enum)]
    kind: Option<KindArg>,

    /// Size of the decompressed image, enables streaming extraction
    #[clap(long)]
    extract_size: Option<u64>,

    /// Target block device
    #[clap(short, long, conflicts_with = "to_file", required_unless_present = "to_file")]
    device: Option<PathBuf>,

    /// Write into a regular file instead of a device
    #[clap(long)]
    to_file: Option<PathBuf>,

    /// Size of the file created by --to-file when it does not exist yet
    #[clap(long, default_value_t = 8 << 30)]
    file_size: u64,

    /// Skip read-back verification
    #[clap(long)]
    no_verify: bool,

    /// Package the boot partition into a signed boot.img
    #[clap(long)]
    secure_boot: bool,

    /// Customisation settings (TOML)
    #[clap(long)]
    customisation: Option<PathBuf>,

    /// Override the hostname from the customisation settings
    #[clap(long)]
    hostname: Option<String>,

    /// Save performance data of the job as JSON
    #[clap(long)]
    perf_out: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Raw,
    Xz,
    Gzip,
    Zstd,
    FatArchive,
}

impl From<KindArg> for ImageKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Raw => ImageKind::Disk(Compression::None),
            KindArg::Xz => ImageKind::Disk(Compression::Xz),
            KindArg::Gzip => ImageKind::Disk(Compression::Gzip),
            KindArg::Zstd => ImageKind::Disk(Compression::Zstd),
            KindArg::FatArchive => ImageKind::FatArchive,
        }
    }
}

/// Install the subscriber. The returned guard flushes the log file on drop.
fn init_logging(level: Option<&str>, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).with_context(|| format!("Invalid log filter: {}", level))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            builder.with_ansi(false).with_writer(writer).init();
            Ok(Some(guard))
        }
        None => {
            builder.with_writer(std::io::stderr).init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(args.log_level.as_deref(), args.log_file.as_deref())?;

    let config = ImagerConfig::load(args.config.as_deref())?;
    debug!("Configuration: {:?}", config);

    match args.command {
        Command::List { all } => list(all),
        Command::Write(write) => run_write(config, write).await,
        Command::Cache { action } => cache(&config, action),
    }
}

fn list(all: bool) -> Result<()> {
    let devices = list_devices()?;
    let mut shown = 0;
    for device in devices.iter().filter(|d| all || !d.system) {
        let mut flags = Vec::new();
        if device.removable {
            flags.push("removable");
        }
        if device.read_only {
            flags.push("read-only");
        }
        if device.system {
            flags.push("system");
        }
        println!(
            "{:<20} {:>10.1} MB  {}  [{}]",
            device.path.display(),
            bytes_to_mb(device.capacity),
            device.description,
            flags.join(",")
        );
        for mp in &device.mountpoints {
            println!("{:<20} mounted at {}", "", mp.display());
        }
        shown += 1;
    }
    if shown == 0 {
        println!("No drives found");
    }
    Ok(())
}

fn cache(config: &ImagerConfig, action: CacheAction) -> Result<()> {
    let dir = config
        .effective_cache_dir()
        .ok_or_else(|| anyhow!("No cache directory available"))?;
    let cache = ImageCache::new(dir, config.cache_queue_depth);
    match action {
        CacheAction::Clean => {
            let removed = cache
                .clean_partials()
                .with_context(|| format!("Failed to clean {}", cache.dir().display()))?;
            println!("Removed {} partial files from {}", removed, cache.dir().display());
        }
        CacheAction::Remove { url } => {
            cache.remove(&url);
            println!("Removed cached copy of {}", url);
        }
    }
    Ok(())
}

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn load_customisation(args: &WriteArgs) -> Result<Option<CustomisationSettings>> {
    let mut settings = match &args.customisation {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read customisation file: {}", path.display()))?;
            toml::from_str::<CustomisationSettings>(&content)
                .with_context(|| format!("Failed to parse customisation file: {}", path.display()))?
        }
        None if args.hostname.is_some() => CustomisationSettings::default(),
        None => return Ok(None),
    };
    if let Some(hostname) = &args.hostname {
        settings.hostname = Some(hostname.clone());
    }
    Ok(Some(settings))
}

/// Use the given file, creating a sparse one of `size` bytes if needed.
fn file_target(path: &Path, size: u64) -> Result<DeviceHandle> {
    if !path.exists() {
        let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        file.set_len(size)
            .with_context(|| format!("Failed to size {}", path.display()))?;
        info!("Created {} ({:.1} MB)", path.display(), bytes_to_mb(size));
    }
    let capacity = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();
    Ok(DeviceHandle::new(path, capacity))
}

fn device_target(path: &Path) -> Result<DeviceHandle> {
    let devices = list_devices()?;
    let device = devices
        .into_iter()
        .find(|d| d.path == path)
        .ok_or_else(|| anyhow!("Device {} not found, see `os-imager list`", path.display()))?;
    if device.system {
        bail!("Refusing to write to system drive {}", path.display());
    }
    Ok(device)
}

async fn run_write(config: ImagerConfig, args: WriteArgs) -> Result<()> {
    let verify = config.verify && !args.no_verify;

    let customisation = match load_customisation(&args)? {
        Some(settings) => Some(settings.render()?),
        None => None,
    };

    let (source, kind) = if is_url(&args.source) {
        let mut remote = RemoteImage::new(args.source.clone());
        remote.sha256 = args.sha256;
        remote.extract_size = args.extract_size;
        let kind = args.kind.map(ImageKind::from).unwrap_or(ImageKind::Disk(Compression::None));
        (ImageSource::Network(remote), kind)
    } else {
        let path = PathBuf::from(&args.source);
        let kind = match args.kind {
            Some(kind) => kind.into(),
            None => ImageKind::sniff(&path).with_context(|| format!("Failed to inspect {}", path.display()))?,
        };
        info!("Image kind of {}: {:?}", path.display(), kind);
        let source = ImageSource::LocalFile {
            path,
            sha256: args.sha256,
        };
        (source, kind)
    };

    let options = WriteOptions {
        verify,
        secure_boot: args.secure_boot,
    };

    match &args.to_file {
        Some(path) => {
            let device = file_target(path, args.file_size)?;
            let imager = Imager::with_provider(config, FileDevices)?;
            let source = resolve(imager.cache(), source);
            let job = build_job(source, kind, device, customisation, options);
            let handle = imager.start_write(job)?;
            follow(handle, args.perf_out.as_deref()).await
        }
        None => {
            let path = args.device.as_deref().ok_or_else(|| anyhow!("No target device given"))?;
            let device = device_target(path)?;
            let imager = Imager::new(config)?;
            let source = resolve(imager.cache(), source);
            let job = build_job(source, kind, device, customisation, options);
            let handle = imager.start_write(job)?;
            follow(handle, args.perf_out.as_deref()).await
        }
    }
}

fn resolve(cache: Option<&ImageCache>, source: ImageSource) -> ImageSource {
    match (cache, source) {
        (Some(cache), ImageSource::Network(remote)) => {
            let resolved = cache.resolve_source(&remote);
            if let ImageSource::Cache { path, .. } = &resolved {
                info!("Using cached image {}", path.display());
            }
            resolved
        }
        (_, source) => source,
    }
}

fn build_job(
    source: ImageSource,
    kind: ImageKind,
    device: DeviceHandle,
    customisation: Option<os_imager::CustomisationPayload>,
    options: WriteOptions,
) -> WriteJob {
    let mut job = WriteJob::new(source, kind, device).with_options(options);
    if let Some(payload) = customisation {
        job = job.with_customisation(payload);
    }
    job
}

/// Print events until the job ends, cancelling on Ctrl-C.
async fn follow(mut handle: JobHandle, perf_out: Option<&Path>) -> Result<()> {
    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            cancel.cancel();
        }
    });

    while let Some(event) = handle.next_event().await {
        match event {
            JobEvent::Progress(p) => match p.percent {
                Some(percent) => println!("[{}] {:>3}% {}", p.stage, percent, p.message),
                None if p.bytes_done > 0 => {
                    println!("[{}] {:.1} MB {}", p.stage, bytes_to_mb(p.bytes_done), p.message)
                }
                None => println!("[{}] {}", p.stage, p.message),
            },
            JobEvent::CacheWriteFailed(message) => println!("Caching disabled: {}", message),
            JobEvent::CacheStored(path) => println!("Cached image at {}", path.display()),
            JobEvent::Finished(_) => {}
        }
    }

    let report = handle.wait().await;
    if let (Some(path), Some(perf)) = (perf_out, &report.performance) {
        perf.save(path)?;
        println!("Performance data saved to {}", path.display());
    }

    match report.outcome {
        JobOutcome::Success => {
            println!("Write successful");
            Ok(())
        }
        JobOutcome::Cancelled => bail!("Write cancelled"),
        JobOutcome::Failed(e) => Err(anyhow::Error::new(e).context("Write failed")),
    }
}
