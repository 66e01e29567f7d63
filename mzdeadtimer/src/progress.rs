use std::ops::{Add, AddAssign};

/// Running totals of a correction run, summed across worker threads
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CorrectionRecord {
    pub files: usize,
    pub spectra: usize,
    pub scans: usize,
    pub points: usize,
    pub intensity_before: f64,
    pub intensity_after: f64,
}

impl CorrectionRecord {
    pub fn sum(self, other: Self) -> Self {
        self + other
    }

    /// How much intensity the correction added, as a fraction of the measured intensity
    pub fn gain(&self) -> f64 {
        if self.intensity_before > 0.0 {
            self.intensity_after / self.intensity_before - 1.0
        } else {
            0.0
        }
    }
}

impl Add for CorrectionRecord {
    type Output = CorrectionRecord;

    fn add(self, rhs: Self) -> Self::Output {
        let mut dup = self;
        dup += rhs;
        dup
    }
}

impl AddAssign for CorrectionRecord {
    fn add_assign(&mut self, rhs: Self) {
        self.files += rhs.files;
        self.spectra += rhs.spectra;
        self.scans += rhs.scans;
        self.points += rhs.points;
        self.intensity_before += rhs.intensity_before;
        self.intensity_after += rhs.intensity_after;
    }
}
