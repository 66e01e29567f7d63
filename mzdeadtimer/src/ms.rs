//! The `correct-ms` command: dead time correction of every spectrum in an mzML or MGF
//! file, treating each spectrum as a single scan.
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Instant;

use flate2::write::GzEncoder;
use flate2::Compression;
use itertools::Itertools;
use rayon::prelude::*;
use tracing::{debug, info, trace};

use mzdata::io::{
    infer_format, infer_from_path,
    mgf::MGFReaderType,
    mzml::{MzMLReaderType, MzMLWriterType},
    MassSpectrometryFormat, RestartableGzDecoder, StreamingSpectrumIterator,
};
use mzdata::meta::{custom_software_name, DataProcessing, ProcessingMethod, Software};
use mzdata::params::Param;
use mzdata::prelude::*;
use mzdata::spectrum::{MultiLayerSpectrum, SignalContinuity};
use mzpeaks::{CentroidPeak, DeconvolutedPeak, PeakSet};

use mzdeadtime::{CorrectionError, DeadTimeCorrector, MassPoint, Scan};

use crate::args::CorrectMSArgs;
use crate::driver::{MZDeadTimer, MZDeadTimerError};
use crate::progress::CorrectionRecord;
use crate::time_range::TimeRange;

pub(crate) type CPeak = CentroidPeak;
pub(crate) type DPeak = DeconvolutedPeak;
pub(crate) type SpectrumType = MultiLayerSpectrum<CPeak, DPeak>;

/// The number of spectra read before a batch is corrected in parallel
pub(crate) const BATCH_SIZE: usize = 500;

const SOFTWARE_ID: &str = "mzdeadtimer";

/// Centroid `spectrum` if needed, then replace its peaks with their dead time corrected
/// intensities. Spectra outside of `time_range` are left untouched.
pub(crate) fn correct_spectrum(
    corrector: &DeadTimeCorrector,
    spectrum: &mut SpectrumType,
    time_range: Option<TimeRange>,
    signal_to_noise: f32,
) -> Result<CorrectionRecord, MZDeadTimerError> {
    let time = spectrum.start_time();
    if let Some(time_range) = time_range {
        if !time_range.contains(time) {
            return Ok(CorrectionRecord::default());
        }
    }
    let id = spectrum.id().to_string();

    match spectrum.signal_continuity() {
        SignalContinuity::Profile => {
            trace!("Picking peaks for {id}");
            spectrum
                .pick_peaks(signal_to_noise)
                .map_err(|e| MZDeadTimerError::CentroidingError(id.clone(), e.to_string()))?;
            spectrum.description_mut().signal_continuity = SignalContinuity::Centroid;
        }
        _ => {
            if spectrum.peaks.is_none() {
                spectrum
                    .try_build_centroids()
                    .map_err(|e| MZDeadTimerError::CentroidingError(id.clone(), e.to_string()))?;
            }
        }
    }

    let Some(peaks) = spectrum.peaks.as_ref() else {
        return Ok(CorrectionRecord::default());
    };
    let (corrected, record) = correct_peaks(corrector, time, spectrum.index(), peaks)
        .map_err(|source| MZDeadTimerError::SpectrumCorrectionError {
            id,
            params: *corrector.params(),
            source,
        })?;
    spectrum.peaks = Some(corrected);
    Ok(record)
}

/// Correct a centroid peak list acquired at `time` as a single scan
pub(crate) fn correct_peaks(
    corrector: &DeadTimeCorrector,
    time: f64,
    index: usize,
    peaks: &PeakSet,
) -> Result<(PeakSet, CorrectionRecord), CorrectionError> {
    let scan = Scan::new(
        time,
        index,
        peaks
            .iter()
            .map(|p| MassPoint::new(p.mz, p.intensity as f64))
            .collect(),
    );
    let corrected = corrector.correct_scan(&scan)?;
    let record = CorrectionRecord {
        files: 0,
        spectra: 1,
        scans: 1,
        points: corrected.len(),
        intensity_before: scan.total_intensity(),
        intensity_after: corrected.total_intensity(),
    };
    let peaks: Vec<CentroidPeak> = corrected
        .iter()
        .enumerate()
        .map(|(i, p)| CentroidPeak::new(p.mz, p.intensity as f32, i as u32))
        .collect();
    Ok((PeakSet::new(peaks), record))
}

impl MZDeadTimer {
    fn make_software(&self) -> Software {
        let mut sw = Software::default();
        sw.add_param(custom_software_name(SOFTWARE_ID));
        sw.id = SOFTWARE_ID.to_string();
        sw.version = option_env!("CARGO_PKG_VERSION")
            .unwrap_or("unknown")
            .to_string();
        sw
    }

    fn make_processing_method(&self, args: &CorrectMSArgs) -> ProcessingMethod {
        let mut processing = ProcessingMethod::default();
        processing.software_reference = SOFTWARE_ID.to_string();
        let dead_time = &self.config.dead_time;
        let instrument = &self.config.instrument;
        for (name, value) in [
            ("non_extending_dead_time", dead_time.non_extending),
            ("extending_dead_time", dead_time.extending),
            ("scan_time", instrument.scan_time),
            ("cycle_time", instrument.cycle_time),
            ("path_length", instrument.path_length),
            ("voltage", instrument.voltage),
            ("signal_to_noise", args.signal_to_noise),
        ] {
            processing.add_param(Param::new_key_value(name, value.to_string()));
        }
        processing
    }

    /// Register this program as the latest processing step of `source`
    fn update_data_processing<T: MSDataFileMetadata>(
        &self,
        source: &mut T,
        args: &CorrectMSArgs,
    ) {
        let sw_id = {
            let mut sw = self.make_software();
            let mut i = 0;
            let mut query = SOFTWARE_ID.to_string();
            while source.softwares().iter().any(|s| s.id == query) {
                i += 1;
                query = format!("{SOFTWARE_ID}_{i}");
            }
            sw.id = query.clone();
            source.softwares_mut().push(sw);
            query
        };
        if source.data_processings().is_empty() {
            let mut method = self.make_processing_method(args);
            method.order = 0;
            method.software_reference = sw_id;
            let mut dp = DataProcessing::default();
            let dp_id = format!("DP1_{SOFTWARE_ID}");
            dp.id = dp_id.clone();
            dp.push(method);
            source.data_processings_mut().push(dp);
            if let Some(descr) = source.run_description_mut() {
                descr.default_data_processing_id = Some(dp_id);
            }
        } else {
            for dp in source.data_processings_mut().iter_mut() {
                let last_step = dp.iter().map(|m| m.order).max().unwrap_or(-1);
                let mut method = self.make_processing_method(args);
                method.order = last_step.saturating_add(1);
                method.software_reference = sw_id.clone();
                dp.push(method)
            }
        }
    }

    pub(crate) fn correct_ms(&self, args: &CorrectMSArgs) -> Result<(), MZDeadTimerError> {
        info!("Input: {}", args.input_file);
        info!("Output: {}", args.output_file.display());
        let (ms_format, compressed) = infer_format(&args.input_file)?;
        debug!("Detected {ms_format:?} from path (compressed? {compressed})");
        match ms_format {
            MassSpectrometryFormat::MGF => {
                if compressed {
                    let fh = RestartableGzDecoder::new(io::BufReader::new(fs::File::open(
                        &args.input_file,
                    )?));
                    let reader = StreamingSpectrumIterator::new(MGFReaderType::new(fh));
                    self.writer_then(reader, None, args)
                } else {
                    let reader = MGFReaderType::open_path(args.input_file.clone())?;
                    let spectrum_count = Some(reader.len() as u64);
                    self.writer_then(reader, spectrum_count, args)
                }
            }
            MassSpectrometryFormat::MzML => {
                if compressed {
                    let fh = RestartableGzDecoder::new(io::BufReader::new(fs::File::open(
                        &args.input_file,
                    )?));
                    let reader = StreamingSpectrumIterator::new(MzMLReaderType::new(fh));
                    self.writer_then(reader, None, args)
                } else {
                    let reader = MzMLReaderType::open_path(args.input_file.clone())?;
                    let spectrum_count = Some(reader.len() as u64);
                    self.writer_then(reader, spectrum_count, args)
                }
            }
            _ => Err(MZDeadTimerError::FormatUnknownOrNotSupportedError(
                args.input_file.clone(),
                ms_format,
            )),
        }
    }

    fn writer_then<
        R: RandomAccessSpectrumIterator<CPeak, DPeak, SpectrumType> + MSDataFileMetadata + Send,
    >(
        &self,
        reader: R,
        spectrum_count: Option<u64>,
        args: &CorrectMSArgs,
    ) -> Result<(), MZDeadTimerError> {
        if args.output_file == PathBuf::from("-") {
            let mut writer = MzMLWriterType::<_, CPeak, DPeak>::new(io::stdout());
            writer.copy_metadata_from(&reader);
            self.update_data_processing(&mut writer, args);
            if let Some(spectrum_count) = spectrum_count {
                writer.set_spectrum_count(spectrum_count);
            }
            return self.run_workflow(reader, writer, args);
        }
        let (ms_format, compressed) = infer_from_path(&args.output_file);
        match ms_format {
            MassSpectrometryFormat::MzML => {
                let handle = io::BufWriter::new(fs::File::create(&args.output_file)?);
                if compressed {
                    let encoder = GzEncoder::new(handle, Compression::best());
                    let mut writer = MzMLWriterType::new(encoder);
                    writer.copy_metadata_from(&reader);
                    self.update_data_processing(&mut writer, args);
                    if let Some(spectrum_count) = spectrum_count {
                        writer.set_spectrum_count(spectrum_count);
                    }
                    self.run_workflow(reader, writer, args)
                } else {
                    let mut writer = MzMLWriterType::new(handle);
                    writer.copy_metadata_from(&reader);
                    self.update_data_processing(&mut writer, args);
                    if let Some(spectrum_count) = spectrum_count {
                        writer.set_spectrum_count(spectrum_count);
                    }
                    self.run_workflow(reader, writer, args)
                }
            }
            _ => Err(MZDeadTimerError::OutputFormatUnknownOrNotSupportedError(
                args.output_file.to_string_lossy().to_string(),
                ms_format,
            )),
        }
    }

    fn run_workflow<
        R: RandomAccessSpectrumIterator<CPeak, DPeak, SpectrumType> + Send,
        W: SpectrumWriter<CPeak, DPeak>,
    >(
        &self,
        reader: R,
        mut writer: W,
        args: &CorrectMSArgs,
    ) -> Result<(), MZDeadTimerError> {
        let model = self.instrument_model()?;
        let corrector = DeadTimeCorrector::new(model, self.config.dead_time);
        let time_range = args.time_range;
        let signal_to_noise = args.signal_to_noise as f32;
        info!("Correcting spectra with {}", self.config.dead_time);

        let start = Instant::now();
        let mut record = CorrectionRecord {
            files: 1,
            ..Default::default()
        };
        let mut written = 0usize;
        let batches = reader.chunks(BATCH_SIZE);
        for batch in &batches {
            let mut batch: Vec<SpectrumType> = batch.collect();
            record += batch
                .par_iter_mut()
                .map(|spectrum| {
                    correct_spectrum(&corrector, spectrum, time_range, signal_to_noise)
                })
                .try_reduce(CorrectionRecord::default, |a, b| Ok(a + b))?;
            self.check_cycle_time(
                &model,
                batch
                    .iter()
                    .filter_map(|s| s.peaks.as_ref())
                    .flat_map(|peaks| peaks.iter().map(|p| p.mz))
                    .max_by(|a, b| a.total_cmp(b)),
            );
            for spectrum in batch.iter() {
                writer.write(spectrum)?;
            }
            written += batch.len();
            if let Some(last) = batch.last() {
                info!(
                    "Completed Spectrum {written} | Time={:0.3}",
                    last.start_time()
                );
            }
        }
        writer.close()?;

        info!(
            "Spectra: {} corrected of {written} | Points={} | Intensity gained {:0.2}%",
            record.spectra,
            record.points,
            record.gain() * 100.0
        );
        info!("Elapsed Time: {:0.3?}", start.elapsed());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use mzdeadtime::{DeadTimeParams, InstrumentModel};

    fn corrector() -> DeadTimeCorrector {
        DeadTimeCorrector::new(
            InstrumentModel::new(5000.0, 1.0e-6).unwrap(),
            DeadTimeParams::new(5.0, 2.0),
        )
    }

    fn peak_set(peaks: &[(f64, f32)]) -> PeakSet {
        PeakSet::new(
            peaks
                .iter()
                .enumerate()
                .map(|(i, (mz, int))| CentroidPeak::new(*mz, *int, i as u32))
                .collect(),
        )
    }

    #[test]
    fn test_correct_peaks() {
        let corrector = corrector();
        let peaks = peak_set(&[(500.02, 300.0), (500.0, 400.0)]);
        let (corrected, record) = correct_peaks(&corrector, 12.5, 6, &peaks).unwrap();
        assert_eq!(record.spectra, 1);
        assert_eq!(record.points, 2);
        assert_eq!(record.intensity_before, 700.0);
        assert!(record.intensity_after > record.intensity_before);

        let expected = corrector
            .correct_scan(&Scan::new(
                12.5,
                6,
                vec![MassPoint::new(500.0, 400.0), MassPoint::new(500.02, 300.0)],
            ))
            .unwrap();
        assert_eq!(corrected.len(), 2);
        for (i, (peak, point)) in corrected.iter().zip(expected.iter()).enumerate() {
            assert_eq!(peak.mz, point.mz);
            assert_eq!(peak.index, i as u32);
            assert!((peak.intensity as f64 - point.intensity).abs() < 1e-2);
        }
    }

    #[test]
    fn test_correct_saturated_peaks() {
        let peaks = peak_set(&[(500.0, 5000.0)]);
        let err = correct_peaks(&corrector(), 12.5, 0, &peaks).unwrap_err();
        assert_eq!(err.mz(), 500.0);
        assert_eq!(err.scan_time(), 12.5);
    }

    #[test]
    fn test_correct_empty_peaks() {
        let (corrected, record) = correct_peaks(&corrector(), 1.0, 0, &peak_set(&[])).unwrap();
        assert_eq!(corrected.len(), 0);
        assert_eq!(record.points, 0);
    }
}
