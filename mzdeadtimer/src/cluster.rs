//! Reading and writing peak cluster files.
//!
//! A cluster file holds the points of one isotopic cluster across its elution, one
//! whitespace separated `scan_index scan_time mz intensity` record per line. Lines that
//! do not start with such a record are ignored.
use std::ffi::OsString;
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use mzdeadtime::Spectrum;

/// The suffix appended to a cluster file's name for its corrected copy
pub const CORRECTED_SUFFIX: &str = ".corr";

#[derive(Debug, Error)]
pub enum ClusterParseError {
    #[error("Failed to read cluster file {}: {source}", path.display())]
    IOError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("No `scan_index scan_time mz intensity` records were found in {}", path.display())]
    Empty { path: PathBuf },
}

/// Parse the leading `scan_index scan_time mz intensity` record of a line
pub fn parse_record(line: &str) -> Option<(usize, f64, f64, f64)> {
    let mut tokens = line.split_whitespace();
    let index = tokens.next()?.parse().ok()?;
    let time = tokens.next()?.parse().ok()?;
    let mz = tokens.next()?.parse().ok()?;
    let intensity = tokens.next()?.parse().ok()?;
    Some((index, time, mz, intensity))
}

/// Read every record from `reader` into a [`Spectrum`], grouping points by scan time.
///
/// A later record for the same scan time and m/z replaces an earlier one.
pub fn read_cluster<R: BufRead>(reader: R) -> io::Result<Spectrum> {
    let mut spectrum = Spectrum::default();
    let mut skipped = 0usize;
    for line in reader.lines() {
        let line = line?;
        match parse_record(&line) {
            Some((index, time, mz, intensity)) => spectrum.add_point(index, time, mz, intensity),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!("Skipped {skipped} lines without a point record");
    }
    Ok(spectrum)
}

pub fn read_cluster_file<P: AsRef<Path>>(path: P) -> Result<Spectrum, ClusterParseError> {
    let path = path.as_ref();
    let wrap = |source| ClusterParseError::IOError {
        path: path.to_path_buf(),
        source,
    };
    let handle = fs::File::open(path).map_err(wrap)?;
    let spectrum = read_cluster(io::BufReader::new(handle)).map_err(wrap)?;
    if spectrum.is_empty() {
        return Err(ClusterParseError::Empty {
            path: path.to_path_buf(),
        });
    }
    debug!(
        "Read {} points in {} scans from {}",
        spectrum.point_count(),
        spectrum.len(),
        path.display()
    );
    Ok(spectrum)
}

/// Write `spectrum` as `scan_index scan_time mz intensity` records, ordered by time then
/// m/z, with three decimals.
pub fn write_cluster<W: Write>(mut writer: W, spectrum: &Spectrum) -> io::Result<()> {
    for scan in spectrum.iter() {
        for point in scan.iter() {
            writeln!(
                writer,
                "{} {:.3} {:.3} {:.3}",
                scan.index, scan.time, point.mz, point.intensity
            )?;
        }
    }
    writer.flush()
}

pub fn write_cluster_file<P: AsRef<Path>>(path: P, spectrum: &Spectrum) -> io::Result<()> {
    let handle = io::BufWriter::new(fs::File::create(path)?);
    write_cluster(handle, spectrum)
}

/// The path the corrected copy of the cluster at `path` is written to
pub fn corrected_path<P: AsRef<Path>>(path: P) -> PathBuf {
    let mut name: OsString = path.as_ref().as_os_str().to_owned();
    name.push(CORRECTED_SUFFIX);
    PathBuf::from(name)
}

/// Read whitespace separated paths
pub fn read_list<R: Read>(mut reader: R) -> io::Result<Vec<PathBuf>> {
    let mut buffer = String::new();
    reader.read_to_string(&mut buffer)?;
    Ok(buffer.split_whitespace().map(PathBuf::from).collect())
}

pub fn read_list_file<P: AsRef<Path>>(path: P) -> io::Result<Vec<PathBuf>> {
    read_list(fs::File::open(path)?)
}

#[cfg(test)]
mod test {
    use super::*;

    const CLUSTER: &str = "\
# scan time mz intensity
12 600.230 450.250 101.5
12 600.230 450.200 40.25
11 600.000 450.200 30.0
11 600.000 450.250 80.125
not a record
11 600.000 450.250 81.0 trailing text
";

    #[test]
    fn test_read_cluster() -> io::Result<()> {
        let spectrum = read_cluster(CLUSTER.as_bytes())?;
        assert_eq!(spectrum.len(), 2);
        assert_eq!(spectrum.point_count(), 4);

        let first = &spectrum.scans()[0];
        assert_eq!(first.index, 11);
        assert_eq!(first.time, 600.0);
        assert_eq!(first.mzs().collect::<Vec<_>>(), vec![450.2, 450.25]);
        assert_eq!(first.get(450.25), Some(81.0));

        let second = &spectrum.scans()[1];
        assert_eq!(second.index, 12);
        assert_eq!(second.get(450.2), Some(40.25));
        Ok(())
    }

    #[test]
    fn test_parse_record() {
        assert_eq!(
            parse_record("  7\t1.5  300.0 2e3"),
            Some((7, 1.5, 300.0, 2000.0))
        );
        assert_eq!(parse_record("7 1.5 300.0"), None);
        assert_eq!(parse_record("7.5 1.5 300.0 10.0"), None);
        assert_eq!(parse_record(""), None);
    }

    #[test]
    fn test_write_cluster() -> io::Result<()> {
        let spectrum = read_cluster(CLUSTER.as_bytes())?;
        let mut buffer = Vec::new();
        write_cluster(&mut buffer, &spectrum)?;
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "11 600.000 450.200 30.000",
                "11 600.000 450.250 81.000",
                "12 600.230 450.200 40.250",
                "12 600.230 450.250 101.500",
            ]
        );

        let reread = read_cluster(text.as_bytes())?;
        assert_eq!(reread, spectrum);
        Ok(())
    }

    #[test]
    fn test_corrected_path() {
        assert_eq!(
            corrected_path("data/000123.clust"),
            PathBuf::from("data/000123.clust.corr")
        );
    }

    #[test]
    fn test_read_list() -> io::Result<()> {
        let paths = read_list("a.clust b.clust\n\n  c.clust\n".as_bytes())?;
        assert_eq!(
            paths,
            vec![
                PathBuf::from("a.clust"),
                PathBuf::from("b.clust"),
                PathBuf::from("c.clust")
            ]
        );
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            read_cluster_file("does/not/exist.clust"),
            Err(ClusterParseError::IOError { .. })
        ));
    }
}
