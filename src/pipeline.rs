//! End-to-end reconstruction: three orthogonal stacks in, one fused volume or
//! DICOM series out.
//!
//! All file access goes through [`ImagingIo`]; [`DicomIo`] is the real
//! implementation backed by [`load_series`], [`write_volume`],
//! [`read_volume`] and [`write_series`].

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use tracing::{error, info, warn};
use web_time::Instant;

use crate::{
    enums::{CastPolicy, Orientation, OutputMode, PixelKind, Statistic},
    error::{Error, Result},
    fuser::fuse,
    metadata::{
        DEFAULT_DESCRIPTION, GenerationClock, OutputSeries, SeriesSynthesizer, SourceTags,
    },
    resampler::resample,
    series_writer::write_series,
    volume::Volume,
    volume_io::{read_volume, write_volume},
    volume_loader::load_series,
};

/// Reading and writing of imaging data, kept behind a trait so the driver can
/// run against in-memory fakes.
pub trait ImagingIo: Sync {
    fn read_series(&self, dir: &Path) -> Result<(Volume, SourceTags)>;

    fn read_volume(&self, path: &Path) -> Result<Volume>;

    fn write_volume(&self, volume: &Volume, path: &Path) -> Result<()>;

    fn write_series(&self, series: &OutputSeries, dir: &Path) -> Result<()>;
}

/// DICOM series on disk in, MetaImage / NIfTI / DICOM files out.
#[derive(Clone, Copy, Debug, Default)]
pub struct DicomIo;

impl ImagingIo for DicomIo {
    fn read_series(&self, dir: &Path) -> Result<(Volume, SourceTags)> {
        load_series(dir).map_err(|source| Error::SeriesRead {
            path: dir.to_path_buf(),
            source,
        })
    }

    fn read_volume(&self, path: &Path) -> Result<Volume> {
        read_volume(path).map_err(|source| Error::VolumeRead {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write_volume(&self, volume: &Volume, path: &Path) -> Result<()> {
        write_volume(volume, path).map_err(|source| Error::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write_series(&self, series: &OutputSeries, dir: &Path) -> Result<()> {
        write_series(series, dir).map(|_| ())
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Directory holding one subdirectory per stack.
    pub input: PathBuf,
    /// Volume file (`Raw`, `Volume`) or series directory (`Series`).
    pub output: PathBuf,
    pub mode: OutputMode,
    pub statistic: Statistic,
    pub cast_policy: CastPolicy,
    /// Where to drop the three resampled views, if anywhere.
    pub intermediates: Option<PathBuf>,
    /// Resample the coronal and axial stacks concurrently.
    pub parallel: bool,
    pub description: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("."),
            output: PathBuf::from("fused"),
            mode: OutputMode::default(),
            statistic: Statistic::default(),
            cast_policy: CastPolicy::default(),
            intermediates: None,
            parallel: true,
            description: DEFAULT_DESCRIPTION.to_owned(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    LoadSagittal,
    ResampleSagittal,
    ResampleCoronalAxial,
    Fuse,
    SynthesizeAndEmit,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LoadSagittal => "load sagittal",
            Self::ResampleSagittal => "resample sagittal",
            Self::ResampleCoronalAxial => "resample coronal and axial",
            Self::Fuse => "fuse",
            Self::SynthesizeAndEmit => "synthesize and emit",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

struct StageTimer {
    started: Instant,
    current: Stage,
}

impl StageTimer {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            current: Stage::LoadSagittal,
        }
    }

    fn enter(&mut self, stage: Stage) {
        self.current = stage;
        info!(
            %stage,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "entering stage"
        );
    }
}

/// What a finished run produced.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub output: PathBuf,
    /// Voxel counts ordered (x, y, z).
    pub size: [usize; 3],
    pub spacing: [f64; 3],
    pub pixel_kind: PixelKind,
    /// Set when a DICOM series was written.
    pub series_instance_uid: Option<String>,
}

/// Drives the reconstruction. Holds the clock so every series emitted by one
/// pipeline gets its own Series Instance UID.
pub struct Pipeline<I: ImagingIo> {
    io: I,
    clock: GenerationClock,
}

impl<I: ImagingIo> Pipeline<I> {
    pub fn new(io: I) -> Self {
        Self {
            io,
            clock: GenerationClock::new(),
        }
    }

    pub fn io(&self) -> &I {
        &self.io
    }

    /// Runs every stage in order, stopping at the first failure.
    pub fn run(&mut self, config: &PipelineConfig) -> Result<RunSummary> {
        let mut timer = StageTimer::new();
        let result = self.execute(config, &mut timer);
        match &result {
            Ok(summary) => {
                timer.enter(Stage::Done);
                info!(
                    output = %summary.output.display(),
                    size = ?summary.size,
                    "reconstruction finished"
                );
            }
            Err(e) => error!(stage = %timer.current, error = %e, "reconstruction failed"),
        }
        result
    }

    fn execute(
        &mut self,
        config: &PipelineConfig,
        timer: &mut StageTimer,
    ) -> Result<RunSummary> {
        timer.enter(Stage::LoadSagittal);
        let [sagittal_dir, coronal_dir, axial_dir] = locate_stacks(&config.input)?;
        let (sagittal, source_tags) = self.io.read_series(&sagittal_dir)?;

        timer.enter(Stage::ResampleSagittal);
        let reference = resample(&sagittal, &sagittal)?;
        drop(sagittal);

        timer.enter(Stage::ResampleCoronalAxial);
        let io = &self.io;
        let onto_reference = |dir: &Path| -> Result<Volume> {
            let (volume, _) = io.read_series(dir)?;
            resample(&volume, &reference)
        };
        let (coronal, axial) = if config.parallel {
            rayon::join(|| onto_reference(&coronal_dir), || onto_reference(&axial_dir))
        } else {
            (onto_reference(&coronal_dir), onto_reference(&axial_dir))
        };
        let views = [reference, coronal?, axial?];

        if let Some(dir) = &config.intermediates {
            for (orientation, view) in Orientation::ALL.iter().zip(&views) {
                let path = dir.join(format!("{}.mha", orientation.artifact_stem()));
                self.io.write_volume(view, &path)?;
            }
        }

        timer.enter(Stage::Fuse);
        let fused = fuse(&views, config.statistic)?;

        timer.enter(Stage::SynthesizeAndEmit);
        self.emit(fused, Some(&source_tags), config)
    }

    /// Reads a single volume file and writes it back out as a DICOM series,
    /// taking descriptive tags from `source_series` when given.
    pub fn to_series(
        &mut self,
        volume_path: &Path,
        out_dir: &Path,
        source_series: Option<&Path>,
        config: &PipelineConfig,
    ) -> Result<RunSummary> {
        let volume = self.io.read_volume(volume_path)?;
        let source_tags = source_series
            .map(|dir| self.io.read_series(dir).map(|(_, tags)| tags))
            .transpose()?;
        let config = PipelineConfig {
            output: out_dir.to_path_buf(),
            mode: OutputMode::Series,
            ..config.clone()
        };
        self.emit(volume, source_tags.as_ref(), &config)
    }

    fn emit(
        &mut self,
        fused: Volume,
        source_tags: Option<&SourceTags>,
        config: &PipelineConfig,
    ) -> Result<RunSummary> {
        let output = match config.mode {
            OutputMode::Raw => fused,
            OutputMode::Volume | OutputMode::Series => {
                fused.cast(PixelKind::I16, config.cast_policy)
            }
        };

        let series_instance_uid = if config.mode == OutputMode::Series {
            let series = SeriesSynthesizer::new(config.description.clone()).synthesize(
                &output,
                source_tags,
                Some(self.clock.now()),
            )?;
            self.io.write_series(&series, &config.output)?;
            series.series_instance_uid().map(str::to_owned)
        } else {
            self.io.write_volume(&output, &config.output)?;
            None
        };

        Ok(RunSummary {
            output: config.output.clone(),
            size: output.size(),
            spacing: output.spacing(),
            pixel_kind: output.pixel_kind(),
            series_instance_uid,
        })
    }
}

/// Runs the reconstruction against files on disk.
pub fn run(config: &PipelineConfig) -> Result<RunSummary> {
    Pipeline::new(DicomIo).run(config)
}

/// Converts a volume file on disk into a DICOM series.
pub fn to_series(
    volume_path: &Path,
    out_dir: &Path,
    config: &PipelineConfig,
) -> Result<RunSummary> {
    Pipeline::new(DicomIo).to_series(volume_path, out_dir, None, config)
}

/// Finds the sagittal, coronal and axial stack directories under `root`.
///
/// Each must be the only subdirectory whose name contains the stack's keyword
/// (`sag`, `cor`, `axial`), compared case-insensitively.
pub fn locate_stacks(root: &Path) -> Result<[PathBuf; 3]> {
    let input_error = |reason: String| Error::Input {
        path: root.to_path_buf(),
        reason,
    };

    let mut dirs: Vec<PathBuf> = fs::read_dir(root)
        .map_err(|e| input_error(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    let find = |orientation: Orientation| -> Result<PathBuf> {
        let keyword = orientation.keyword();
        let matches: Vec<&PathBuf> = dirs
            .iter()
            .filter(|dir| {
                dir.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.to_ascii_lowercase().contains(keyword))
            })
            .collect();
        match matches.as_slice() {
            [single] => Ok((*single).clone()),
            [] => Err(input_error(format!(
                "no {orientation} stack: no subdirectory contains \"{keyword}\""
            ))),
            many => Err(input_error(format!(
                "ambiguous {orientation} stack: {} subdirectories contain \"{keyword}\"",
                many.len()
            ))),
        }
    };

    let stacks = [
        find(Orientation::Sagittal)?,
        find(Orientation::Coronal)?,
        find(Orientation::Axial)?,
    ];
    for (i, first) in stacks.iter().enumerate() {
        if let Some(j) = (i + 1..3).find(|&j| stacks[j] == *first) {
            return Err(input_error(format!(
                "ambiguous stacks: {} is both the {} and the {} stack",
                first.display(),
                Orientation::ALL[i],
                Orientation::ALL[j]
            )));
        }
    }
    if dirs.len() > 3 {
        warn!(
            root = %root.display(),
            extra = dirs.len() - 3,
            "ignoring unrelated subdirectories"
        );
    }
    Ok(stacks)
}
