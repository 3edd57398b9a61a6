use std::{path::PathBuf, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use tracing::{Level, error};

use dicom_superres::{
    CastPolicy, DicomIo, OutputMode, Pipeline, PipelineConfig, Statistic,
    metadata::DEFAULT_DESCRIPTION,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fuse sagittal, coronal and axial stacks into one isotropic volume
    Fuse {
        /// Directory with one subdirectory per stack ("sag", "cor", "axial")
        #[arg(value_name = "DIR")]
        input: PathBuf,

        /// Output file (raw, volume) or series directory (series)
        #[arg(value_name = "PATH")]
        output: PathBuf,

        #[arg(short, long, value_enum, default_value_t = OutputMode::Series)]
        mode: OutputMode,

        #[arg(short, long, value_enum, default_value_t = Statistic::Mean)]
        statistic: Statistic,

        /// Directory for the resampled views (resampled_{sag,cor,axial}.mha)
        #[arg(long, value_name = "DIR")]
        intermediates: Option<PathBuf>,

        /// Resample the coronal and axial stacks one after the other
        #[arg(long)]
        sequential: bool,

        #[command(flatten)]
        series: SeriesArgs,
    },
    /// Write a volume file (.mha, .nii, .nii.gz) as a DICOM series
    ToSeries {
        #[arg(value_name = "FILE")]
        volume: PathBuf,

        #[arg(value_name = "DIR")]
        output: PathBuf,

        /// DICOM series to copy patient and study tags from
        #[arg(long, value_name = "DIR")]
        source: Option<PathBuf>,

        #[command(flatten)]
        series: SeriesArgs,
    },
}

#[derive(Args)]
struct SeriesArgs {
    /// Series Description marking the output as derived
    #[arg(short, long, default_value = DEFAULT_DESCRIPTION)]
    description: String,

    /// Handling of values outside the signed 16 bit range
    #[arg(long, value_enum, default_value_t = CastPolicy::Saturate)]
    cast_policy: CastPolicy,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut pipeline = Pipeline::new(DicomIo);
    let result = match cli.command {
        Command::Fuse {
            input,
            output,
            mode,
            statistic,
            intermediates,
            sequential,
            series,
        } => pipeline.run(&PipelineConfig {
            input,
            output,
            mode,
            statistic,
            cast_policy: series.cast_policy,
            intermediates,
            parallel: !sequential,
            description: series.description,
        }),
        Command::ToSeries {
            volume,
            output,
            source,
            series,
        } => {
            let config = PipelineConfig {
                cast_policy: series.cast_policy,
                description: series.description,
                ..PipelineConfig::default()
            };
            pipeline.to_series(&volume, &output, source.as_deref(), &config)
        }
    };

    match result {
        Ok(summary) => {
            println!("{}", summary.output.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
