use std::path::Path;

use chrono::NaiveDate;
use dicom_dictionary_std::tags;
use dicom_superres::{
    OutputMode, PipelineConfig, PixelKind, SeriesSynthesizer, SourceTags, Statistic, Volume,
    load_series, read_volume, run, write_series,
};
use nalgebra::Matrix3;

/// Row direction, column direction, slice normal (LPS), as matrix columns.
fn frame(row: [f64; 3], column: [f64; 3], normal: [f64; 3]) -> Matrix3<f64> {
    Matrix3::new(
        row[0], column[0], normal[0], row[1], column[1], normal[1], row[2], column[2], normal[2],
    )
}

fn write_stack(root: &Path, name: &str, direction: Matrix3<f64>, origin: [f64; 3], value: f32) {
    let volume = Volume::filled(
        [12, 12, 4],
        value,
        [1.0, 1.0, 3.0],
        origin,
        direction,
        PixelKind::I16,
    )
    .unwrap();
    let source = SourceTags::from([(tags::PATIENT_ID, "anon-7".to_owned())]);
    let time = NaiveDate::from_ymd_opt(2024, 6, 1)
        .unwrap()
        .and_hms_opt(12, 0, value as u32 / 100)
        .unwrap();
    let series = SeriesSynthesizer::new(name)
        .synthesize(&volume, Some(&source), Some(time))
        .unwrap();
    write_series(&series, root.join(name)).unwrap();
}

fn input() -> tempfile::TempDir {
    let root = tempfile::tempdir().unwrap();
    write_stack(
        root.path(),
        "t2_sag",
        frame([0.0, 1.0, 0.0], [0.0, 0.0, -1.0], [-1.0, 0.0, 0.0]),
        [11.0, 0.0, 11.0],
        100.0,
    );
    write_stack(
        root.path(),
        "t2_cor",
        frame([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
        [0.0, 0.0, 11.0],
        200.0,
    );
    write_stack(
        root.path(),
        "t2_axial",
        frame([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]),
        [0.0; 3],
        300.0,
    );
    root
}

#[test]
fn raw_fusion_lands_on_the_sagittal_isotropic_grid() {
    let root = input();
    let out = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        input: root.path().to_path_buf(),
        output: out.path().join("fused.mha"),
        mode: OutputMode::Raw,
        statistic: Statistic::Mean,
        intermediates: Some(out.path().join("work")),
        ..PipelineConfig::default()
    };
    let summary = run(&config).unwrap();
    assert_eq!(summary.size, [12, 12, 12]);

    let fused = read_volume(out.path().join("fused.mha")).unwrap();
    assert_eq!(fused.pixel_kind(), PixelKind::F32);
    assert_eq!(fused.spacing(), [1.0; 3]);
    assert_eq!(fused.origin(), [11.0, 0.0, 11.0]);
    assert_eq!(
        *fused.direction(),
        frame([0.0, 1.0, 0.0], [0.0, 0.0, -1.0], [-1.0, 0.0, 0.0])
    );

    let centre = fused.get([5, 5, 5]).unwrap();
    assert!((centre - 200.0).abs() <= 1.0, "centre voxel was {centre}");

    for stem in ["resampled_sag", "resampled_cor", "resampled_axial"] {
        let view = read_volume(out.path().join("work").join(format!("{stem}.mha"))).unwrap();
        assert_eq!(view.pixel_kind(), PixelKind::U16);
        assert!(view.geometry_mismatch(&fused).is_none());
    }
}

#[test]
fn series_output_reloads_as_one_consistent_series() {
    let root = input();
    let out = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        input: root.path().to_path_buf(),
        output: out.path().join("series"),
        mode: OutputMode::Series,
        statistic: Statistic::Max,
        ..PipelineConfig::default()
    };
    let summary = run(&config).unwrap();
    assert_eq!(summary.pixel_kind, PixelKind::I16);

    let (reloaded, tags) = load_series(out.path().join("series")).unwrap();
    assert_eq!(reloaded.size(), [12, 12, 12]);
    assert_eq!(reloaded.origin(), [11.0, 0.0, 11.0]);
    assert_eq!(reloaded.spacing(), [1.0; 3]);
    assert_eq!(tags.get(&tags::PATIENT_ID).map(String::as_str), Some("anon-7"));
    assert_eq!(
        tags.get(&tags::SERIES_DESCRIPTION).map(String::as_str),
        Some("t2_sag - Created-dicom-superres")
    );

    let centre = reloaded.get([5, 5, 5]).unwrap();
    assert!((centre - 300.0).abs() <= 1.0, "centre voxel was {centre}");
}
