// Public library interface for os-imager
//
// The pipeline writes OS images onto removable block devices. Front-ends
// (the bundled CLI, or anything else) build a `WriteJob`, start it on an
// `Imager` and consume the job's event stream.

pub mod config;
pub mod disk;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod utils;

#[cfg(test)]
mod testutil;

pub use config::ImagerConfig;
pub use error::{ErrorCategory, WriteError};
pub use models::{
    CancelToken, Compression, CustomisationPayload, DeviceHandle, ImageKind, ImageSource, JobEvent, JobOutcome,
    ProgressEvent, RemoteImage, Stage, WriteJob, WriteOptions,
};
pub use pipeline::{Imager, JobHandle, JobReport};
