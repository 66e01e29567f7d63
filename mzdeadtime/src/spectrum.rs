//! Scan and spectrum containers holding measured intensities keyed by m/z and scan time.
use std::cmp::Ordering;
use std::slice;

/// A single m/z and intensity measurement within a scan
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MassPoint {
    pub mz: f64,
    pub intensity: f64,
}

impl MassPoint {
    pub fn new(mz: f64, intensity: f64) -> Self {
        Self { mz, intensity }
    }
}

impl From<(f64, f64)> for MassPoint {
    fn from(value: (f64, f64)) -> Self {
        Self::new(value.0, value.1)
    }
}

/// All the points recorded at a single scan time, kept sorted by ascending m/z
/// with unique m/z keys.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Scan {
    /// The scan (retention) time
    pub time: f64,
    /// The instrument's scan number
    pub index: usize,
    points: Vec<MassPoint>,
}

impl Scan {
    /// Create a new scan from an arbitrary sequence of points.
    ///
    /// Points are sorted by m/z. When the same m/z occurs more than once, the
    /// last occurrence wins.
    pub fn new(time: f64, index: usize, mut points: Vec<MassPoint>) -> Self {
        points.sort_by(|a, b| a.mz.total_cmp(&b.mz));
        points.dedup_by(|later, earlier| {
            if later.mz == earlier.mz {
                earlier.intensity = later.intensity;
                true
            } else {
                false
            }
        });
        Self {
            time,
            index,
            points,
        }
    }

    pub fn empty(time: f64, index: usize) -> Self {
        Self {
            time,
            index,
            points: Vec::new(),
        }
    }

    fn find(&self, mz: f64) -> Result<usize, usize> {
        self.points.binary_search_by(|p| p.mz.total_cmp(&mz))
    }

    /// Set the intensity at `mz`, replacing any prior value
    pub fn insert(&mut self, mz: f64, intensity: f64) {
        match self.find(mz) {
            Ok(i) => self.points[i].intensity = intensity,
            Err(i) => self.points.insert(i, MassPoint::new(mz, intensity)),
        }
    }

    pub fn get(&self, mz: f64) -> Option<f64> {
        self.find(mz).ok().map(|i| self.points[i].intensity)
    }

    pub fn points(&self) -> &[MassPoint] {
        &self.points
    }

    pub fn iter(&self) -> slice::Iter<'_, MassPoint> {
        self.points.iter()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn mzs(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|p| p.mz)
    }

    pub fn intensities(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|p| p.intensity)
    }

    /// The largest intensity in the scan, or `None` if the scan is empty
    pub fn max_intensity(&self) -> Option<f64> {
        self.intensities().max_by(|a, b| a.total_cmp(b))
    }

    pub fn total_intensity(&self) -> f64 {
        self.intensities().sum()
    }

    /// The intensity-weighted mean m/z of the scan.
    ///
    /// Returns `None` when the total intensity is zero, including when the scan is empty.
    pub fn centroid(&self) -> Option<f64> {
        let total = self.total_intensity();
        if total == 0.0 || !total.is_finite() {
            return None;
        }
        let weighted: f64 = self.points.iter().map(|p| p.mz * p.intensity).sum();
        Some(weighted / total)
    }

    /// Build a scan with the same time, index and m/z keys but new intensities.
    ///
    /// `intensities` must be in the same order as [`Scan::points`].
    pub(crate) fn with_intensities(&self, intensities: Vec<f64>) -> Self {
        debug_assert_eq!(intensities.len(), self.points.len());
        let points = self
            .points
            .iter()
            .zip(intensities)
            .map(|(p, intensity)| MassPoint::new(p.mz, intensity))
            .collect();
        Self {
            time: self.time,
            index: self.index,
            points,
        }
    }
}

impl<'a> IntoIterator for &'a Scan {
    type Item = &'a MassPoint;

    type IntoIter = slice::Iter<'a, MassPoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// A collection of [`Scan`]s of a single peak cluster, kept sorted by ascending
/// scan time with unique scan times.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Spectrum {
    scans: Vec<Scan>,
}

impl Spectrum {
    pub fn new(mut scans: Vec<Scan>) -> Self {
        scans.sort_by(|a, b| a.time.total_cmp(&b.time));
        let mut merged: Vec<Scan> = Vec::with_capacity(scans.len());
        for scan in scans {
            if let Some(last) = merged
                .last_mut()
                .filter(|last| last.time.total_cmp(&scan.time) == Ordering::Equal)
            {
                last.index = scan.index;
                for p in scan.points {
                    last.insert(p.mz, p.intensity);
                }
                continue;
            }
            merged.push(scan);
        }
        Self { scans: merged }
    }

    fn find(&self, time: f64) -> Result<usize, usize> {
        self.scans.binary_search_by(|s| s.time.total_cmp(&time))
    }

    /// Record a single measurement, creating the scan at `time` if it does not exist yet.
    pub fn add_point(&mut self, index: usize, time: f64, mz: f64, intensity: f64) {
        let i = match self.find(time) {
            Ok(i) => {
                self.scans[i].index = index;
                i
            }
            Err(i) => {
                self.scans.insert(i, Scan::empty(time, index));
                i
            }
        };
        self.scans[i].insert(mz, intensity);
    }

    pub fn get(&self, time: f64) -> Option<&Scan> {
        self.find(time).ok().map(|i| &self.scans[i])
    }

    pub fn scans(&self) -> &[Scan] {
        &self.scans
    }

    pub fn iter(&self) -> slice::Iter<'_, Scan> {
        self.scans.iter()
    }

    pub fn len(&self) -> usize {
        self.scans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scans.is_empty()
    }

    pub fn times(&self) -> impl Iterator<Item = f64> + '_ {
        self.scans.iter().map(|s| s.time)
    }

    /// The number of points across all scans
    pub fn point_count(&self) -> usize {
        self.scans.iter().map(|s| s.len()).sum()
    }

    pub fn total_intensity(&self) -> f64 {
        self.scans.iter().map(|s| s.total_intensity()).sum()
    }

    /// The largest m/z in any scan
    pub fn max_mz(&self) -> Option<f64> {
        self.scans
            .iter()
            .filter_map(|s| s.points().last().map(|p| p.mz))
            .max_by(|a, b| a.total_cmp(b))
    }

    pub fn retain_scans<F: FnMut(&Scan) -> bool>(&mut self, predicate: F) {
        self.scans.retain(predicate)
    }
}

impl FromIterator<Scan> for Spectrum {
    fn from_iter<T: IntoIterator<Item = Scan>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Spectrum {
    type Item = &'a Scan;

    type IntoIter = slice::Iter<'a, Scan>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl IntoIterator for Spectrum {
    type Item = Scan;

    type IntoIter = std::vec::IntoIter<Scan>;

    fn into_iter(self) -> Self::IntoIter {
        self.scans.into_iter()
    }
}

/// Quality thresholds for scans and spectra used for calibration
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct ScanFilter {
    /// The minimum number of points a scan must have
    pub min_points: usize,
    /// The minimum value the most intense point of a scan must reach
    pub min_intensity: f64,
    /// The minimum number of accepted scans a spectrum must have
    pub min_scans: usize,
}

impl Default for ScanFilter {
    fn default() -> Self {
        Self {
            min_points: 4,
            min_intensity: 1.0,
            min_scans: 5,
        }
    }
}

impl ScanFilter {
    pub fn new(min_points: usize, min_intensity: f64, min_scans: usize) -> Self {
        Self {
            min_points,
            min_intensity,
            min_scans,
        }
    }

    pub fn accepts(&self, scan: &Scan) -> bool {
        scan.len() >= self.min_points
            && scan
                .max_intensity()
                .is_some_and(|i| i >= self.min_intensity)
    }

    /// Remove all scans that fail the point count or intensity thresholds
    pub fn filter_scans(&self, spectrum: &mut Spectrum) {
        spectrum.retain_scans(|s| self.accepts(s))
    }

    /// Apply [`ScanFilter::filter_scans`] and then check the scan count, returning
    /// `None` if too few scans remain.
    pub fn apply(&self, mut spectrum: Spectrum) -> Option<Spectrum> {
        self.filter_scans(&mut spectrum);
        if spectrum.len() >= self.min_scans {
            Some(spectrum)
        } else {
            None
        }
    }
}
