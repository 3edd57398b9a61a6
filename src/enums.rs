use std::fmt;

use clap::ValueEnum;

/// Anatomical plane an input stack was acquired in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Orientation {
    Sagittal,
    Coronal,
    Axial,
}

impl Orientation {
    pub const ALL: [Orientation; 3] = [Self::Sagittal, Self::Coronal, Self::Axial];

    /// Case-insensitive substring identifying the stack's directory.
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Sagittal => "sag",
            Self::Coronal => "cor",
            Self::Axial => "axial",
        }
    }

    /// Stem used for intermediate artifacts (`resampled_sag.mha`, ...).
    pub fn artifact_stem(self) -> &'static str {
        match self {
            Self::Sagittal => "resampled_sag",
            Self::Coronal => "resampled_cor",
            Self::Axial => "resampled_axial",
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sagittal => "sagittal",
            Self::Coronal => "coronal",
            Self::Axial => "axial",
        };
        f.write_str(name)
    }
}

/// Per-voxel statistic used to combine the three views.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Statistic {
    #[default]
    Mean,
    Median,
    Max,
    Min,
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mean => "mean",
            Self::Median => "median",
            Self::Max => "max",
            Self::Min => "min",
        };
        f.write_str(name)
    }
}

/// Scalar representation the samples of a volume are valid in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelKind {
    #[default]
    U16,
    I16,
    F32,
}

impl PixelKind {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::U16 | Self::I16 => 2,
            Self::F32 => 4,
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, Self::F32)
    }
}

/// What happens to values outside the target integer range when casting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum CastPolicy {
    /// Clamp to the nearest representable value.
    #[default]
    Saturate,
    /// Keep the low 16 bits of the truncated integer.
    Wrap,
}

/// Artifact the pipeline emits for the fused volume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputMode {
    /// Floating point fused volume written to a single volume file.
    Raw,
    /// Fused volume cast to signed 16 bit, written to a single volume file.
    Volume,
    /// Fused volume cast to signed 16 bit, written as one DICOM file per slice.
    #[default]
    Series,
}

/// Order in which decoded slices are stacked along depth.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortBy {
    /// Projection of Image Position (Patient) onto the slice normal.
    #[default]
    ImagePositionPatient,
    InstanceNumber,
}
