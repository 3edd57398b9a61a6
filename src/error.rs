use std::path::PathBuf;

use thiserror::Error;

use crate::volume_io::VolumeIoError;
use crate::volume_loader::VolumeLoaderError;

/// Every failure the reconstruction can surface. None of them are retried.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot locate input stacks in {}: {reason}", path.display())]
    Input { path: PathBuf, reason: String },

    #[error("cannot read series from {}: {source}", path.display())]
    SeriesRead {
        path: PathBuf,
        #[source]
        source: VolumeLoaderError,
    },

    #[error("cannot read volume from {}: {source}", path.display())]
    VolumeRead {
        path: PathBuf,
        #[source]
        source: VolumeIoError,
    },

    #[error("degenerate geometry: {0}")]
    Geometry(String),

    #[error("fusion inputs are not on a common grid: {0}")]
    ShapeMismatch(String),

    #[error("cannot derive required tag: {0}")]
    MissingMetadata(&'static str),

    #[error("cannot write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: VolumeIoError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
