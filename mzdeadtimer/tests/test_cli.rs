use std::{error::Error, fs, path::PathBuf, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;

use mzdata::prelude::*;
use mzdata::{MGFReader, MzMLReader};

use mzdeadtime::{
    apply_dead_time, DeadTimeCorrector, DeadTimeParams, InstrumentConstants, MassPoint, Scan,
    Spectrum,
};
use mzdeadtimer::cluster::{corrected_path, read_cluster_file, write_cluster_file};

const PATTERN: [f64; 8] = [0.3, 1.0, 0.8, 0.5, 0.3, 0.15, 0.07, 0.03];

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mzdeadtimer-{}-{name}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn eluting_cluster(base_mz: f64, apex: f64, n_scans: usize) -> Spectrum {
    let middle = (n_scans as f64 - 1.0) / 2.0;
    (0..n_scans)
        .map(|i| {
            let time = 600.0 + i as f64 * 0.25;
            let scale = apex * (-((i as f64 - middle) / 3.0).powi(2) / 2.0).exp();
            let points = PATTERN
                .iter()
                .enumerate()
                .map(|(k, w)| MassPoint::new(base_mz + 0.05 * k as f64, w * scale))
                .collect();
            Scan::new(time, i, points)
        })
        .collect()
}

/// Write clusters as a detector with the given dead times would have measured them
fn write_measured_clusters(dir: &PathBuf, params: DeadTimeParams) -> Vec<PathBuf> {
    let model = InstrumentConstants::default().build().unwrap();
    [(450.2, 700.0, 15), (601.7, 900.0, 17), (803.4, 500.0, 13)]
        .into_iter()
        .enumerate()
        .map(|(i, (mz, apex, n))| {
            let measured = apply_dead_time(model, params, &eluting_cluster(mz, apex, n)).unwrap();
            let path = dir.join(format!("{i:06}.clust"));
            write_cluster_file(&path, &measured).unwrap();
            path
        })
        .collect()
}

#[test]
fn test_file_missing() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("mzdeadtimer")?;
    cmd.args(["correct", "not_real.clust"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read cluster file not_real.clust"));
    Ok(())
}

#[test]
fn test_no_inputs() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("mzdeadtimer")?;
    cmd.args(["calibrate"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("No input cluster files were given"));
    Ok(())
}

#[test]
fn test_malformed_time_range() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("mzdeadtimer")?;
    cmd.args(["correct", "not_real.clust", "-r", "a-z"]);
    cmd.assert().failure().stderr(predicate::str::contains(
        "Failed to parse time range start invalid float literal",
    ));
    Ok(())
}

#[test]
fn test_correct_clusters() -> Result<(), Box<dyn Error>> {
    let dir = scratch_dir("correct");
    let params = DeadTimeParams::new(5.0, 2.0);
    let paths = write_measured_clusters(&dir, params);
    let list_file = dir.join("clusters.txt");
    fs::write(
        &list_file,
        paths
            .iter()
            .skip(1)
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join("\n"),
    )?;

    let mut cmd = Command::cargo_bin("mzdeadtimer")?;
    cmd.env("RUST_LOG", "info")
        .arg("correct")
        .arg(&paths[0])
        .arg("-f")
        .arg(&list_file)
        .args(["-D", "5", "-d", "2", "-t", "2"]);
    cmd.assert()
        .success()
        .stderr(predicate::str::contains("Corrected 3 files"));

    for path in paths.iter() {
        let mut corrected_name = path.clone().into_os_string();
        corrected_name.push(".corr");
        let measured = read_cluster_file(path)?;
        let corrected = read_cluster_file(PathBuf::from(corrected_name))?;
        assert_eq!(measured.len(), corrected.len());
        assert!(corrected.total_intensity() > measured.total_intensity());
    }
    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn test_correct_saturated_cluster() -> Result<(), Box<dyn Error>> {
    let dir = scratch_dir("saturated");
    let path = dir.join("saturated.clust");
    fs::write(&path, "1 600.000 500.000 6000.000\n1 600.000 500.050 10.000\n")?;

    let mut cmd = Command::cargo_bin("mzdeadtimer")?;
    cmd.arg("correct").arg(&path);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains(
            "Invalid input for dead time correction at scan time 600, m/z 500",
        ));
    let mut corrected_name = path.clone().into_os_string();
    corrected_name.push(".corr");
    assert!(!PathBuf::from(corrected_name).exists());
    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn test_correct_fails_without_partial_output() -> Result<(), Box<dyn Error>> {
    let dir = scratch_dir("partial");
    let mut paths = write_measured_clusters(&dir, DeadTimeParams::new(5.0, 2.0));
    let saturated = dir.join("saturated.clust");
    fs::write(&saturated, "1 600.000 500.000 6000.000\n1 600.000 500.050 10.000\n")?;
    paths.push(saturated);

    let mut cmd = Command::cargo_bin("mzdeadtimer")?;
    cmd.arg("correct").args(&paths).args(["-D", "5", "-d", "2"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Invalid input for dead time correction"));
    for path in paths.iter() {
        assert!(!corrected_path(path).exists(), "{}", path.display());
    }
    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn test_calibrate_grid() -> Result<(), Box<dyn Error>> {
    let dir = scratch_dir("calibrate");
    let paths = write_measured_clusters(&dir, DeadTimeParams::new(5.0, 2.0));
    let output = dir.join("calibrated.toml");

    let mut cmd = Command::cargo_bin("mzdeadtimer")?;
    cmd.arg("calibrate")
        .args(&paths)
        .args(["-m", "grid", "--grid-points", "11", "-D", "5", "-d", "2", "-o"])
        .arg(&output);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Non-extending DT: 5.000 ns"))
        .stdout(predicate::str::contains("Extending DT: 2.000 ns"))
        .stdout(predicate::str::contains("minimum:"));

    let written = fs::read_to_string(&output)?;
    assert!(written.contains("[dead_time]"), "{written}");
    assert!(written.contains("non_extending = 5.0"), "{written}");
    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn test_curvature_report() -> Result<(), Box<dyn Error>> {
    let dir = scratch_dir("curvature");
    let paths = write_measured_clusters(&dir, DeadTimeParams::new(5.0, 2.0));

    let mut cmd = Command::cargo_bin("mzdeadtimer")?;
    cmd.arg("curvature").args(&paths);
    let mut assertion = cmd.assert().success();
    for path in paths.iter() {
        assertion = assertion.stdout(predicate::str::contains(format!("{}: ", path.display())));
    }
    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn test_curvature_filters_before_correcting() -> Result<(), Box<dyn Error>> {
    let dir = scratch_dir("curvature-filter");
    let paths = write_measured_clusters(&dir, DeadTimeParams::new(5.0, 2.0));

    // A sparse scan that could not be corrected, dropped by the point count filter
    let mut text = fs::read_to_string(&paths[0])?;
    text.push_str("99 700.000 500.000 6000.000\n");
    fs::write(&paths[0], text)?;

    let short = dir.join("short.clust");
    let mut short_text = String::new();
    for scan in eluting_cluster(450.2, 700.0, 15).iter().take(3) {
        for point in scan.iter() {
            short_text.push_str(&format!(
                "{} {:.3} {:.3} {:.3}\n",
                scan.index, scan.time, point.mz, point.intensity
            ));
        }
    }
    fs::write(&short, short_text)?;

    let mut cmd = Command::cargo_bin("mzdeadtimer")?;
    cmd.args(["curvature", "--correct", "-D", "5", "-d", "2"])
        .arg(&paths[0])
        .arg(&short);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains(format!("{}: ", paths[0].display())))
        .stdout(predicate::str::contains(format!("{}: ", short.display())).not());
    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn test_correct_mgf() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("mzdeadtimer")?;
    cmd.env("RUST_LOG", "info")
        .args(["correct-ms", "./tests/data/small.mgf", "-o", "-"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("<mzML"))
        .stdout(predicate::str::contains("mzdeadtimer"))
        .stderr(predicate::str::contains("Spectra: 2 corrected of 2"));
    Ok(())
}

#[test]
fn test_correct_mgf_intensities() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("mzdeadtimer")?;
    cmd.args(["correct-ms", "./tests/data/small.mgf", "-o", "-", "-D", "5", "-d", "1"]);
    let output = cmd.output()?;
    assert!(output.status.success());

    let corrector = DeadTimeCorrector::new(
        InstrumentConstants::default().build()?,
        DeadTimeParams::new(5.0, 1.0),
    );
    let inputs: Vec<_> = MGFReader::new(fs::File::open("./tests/data/small.mgf")?).collect();
    let written: Vec<_> = MzMLReader::new(output.stdout.as_slice()).collect();
    assert_eq!(inputs.len(), 2);
    assert_eq!(written.len(), inputs.len());

    for (mut input, mut written) in inputs.into_iter().zip(written) {
        let before = input.try_build_centroids()?.clone();
        let after = written.try_build_centroids()?.clone();
        let scan = Scan::new(
            input.start_time(),
            input.index(),
            before
                .iter()
                .map(|p| MassPoint::new(p.mz, p.intensity as f64))
                .collect(),
        );
        let expected = corrector.correct_scan(&scan)?;

        assert_eq!(after.len(), expected.len());
        for (peak, point) in after.iter().zip(expected.iter()) {
            assert!((peak.mz - point.mz).abs() < 1e-6, "{} {}", peak.mz, point.mz);
            let tolerance = point.intensity * 1e-5;
            assert!(
                (peak.intensity as f64 - point.intensity).abs() <= tolerance,
                "{}: {} != {}",
                peak.mz,
                peak.intensity,
                point.intensity
            );
        }
        let gained: f32 = after.iter().map(|p| p.intensity).sum::<f32>()
            - before.iter().map(|p| p.intensity).sum::<f32>();
        assert!(gained > 0.0);
    }
    Ok(())
}
