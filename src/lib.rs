//! # DICOM super-resolution library
//!
//! This crate reconstructs a single isotropic volume from three orthogonal,
//! anisotropic MR acquisitions of the same anatomy: a sagittal, a coronal and
//! an axial stack. Each stack is a DICOM series read with the dicom-rs
//! ecosystem.
//!
//! The reconstruction runs in four steps:
//!  - The sagittal stack is resampled onto an isotropic grid at its finest
//!    spacing. This grid is the common reference frame.
//!  - The coronal and axial stacks are resampled onto that grid with a
//!    quintic B-spline (in parallel using rayon if enabled).
//!  - The three views are combined voxel by voxel (mean, median, max or min).
//!  - The result is written as a MetaImage / NIfTI file, or cast to 16 bit and
//!    written as a new DICOM series with freshly generated identifiers.
//!
//!  No registration is performed: the stacks are assumed to already share a
//!  patient coordinate frame.
//!
//! # Examples
//!
//! ## Fusing three stacks into a DICOM series
//!
//! The input directory holds one subdirectory per stack, named so that it
//! contains "sag", "cor" or "axial".
//!
//! ```no_run
//! # use dicom_superres::{PipelineConfig, Statistic, run};
//! # use std::path::PathBuf;
//! let config = PipelineConfig {
//!     input: PathBuf::from("patient"),
//!     output: PathBuf::from("fused"),
//!     statistic: Statistic::Median,
//!     ..PipelineConfig::default()
//! };
//! let summary = run(&config).expect("should have reconstructed the volume");
//! println!("{:?}", summary.series_instance_uid);
//! ```
//!
//! ## Resampling a single series
//!
//! ```no_run
//! # use dicom_superres::{VolumeLoader, SortBy, resample, write_volume};
//! let (volume, _tags) = VolumeLoader::load_from_directory("dicom", SortBy::ImagePositionPatient)
//!     .expect("should have loaded files from directory");
//! let isotropic = resample(&volume, &volume).expect("should have resampled the volume");
//! write_volume(&isotropic, "isotropic.mha").expect("should have written the volume");
//! ```

pub mod enums;
pub mod error;
pub mod fuser;
mod interpolator;
pub mod metadata;
pub mod pipeline;
pub mod resampler;
pub mod series_writer;
pub mod volume;
pub mod volume_io;
pub mod volume_loader;

pub use enums::{CastPolicy, Orientation, OutputMode, PixelKind, SortBy, Statistic};
pub use error::{Error, Result};
pub use fuser::fuse;
pub use metadata::{GenerationClock, OutputSeries, SeriesSynthesizer, SliceRecord, SourceTags};
pub use pipeline::{
    DicomIo, ImagingIo, Pipeline, PipelineConfig, RunSummary, locate_stacks, run, to_series,
};
pub use resampler::resample;
pub use series_writer::write_series;
pub use volume::Volume;
pub use volume_io::{read_volume, write_volume};
pub use volume_loader::{VolumeLoader, load_series};
