use mzdeadtime::{
    apply_dead_time, correct_dead_time, CurvatureObjective, DeadTimeParams, GridSearch,
    InstrumentConstants, InstrumentModel, MassPoint, Minimizer, ParameterSpace, Scan,
    ScanFilter, SimulatedAnnealing, Spectrum,
};

const PATTERN: [f64; 8] = [0.3, 1.0, 0.8, 0.5, 0.3, 0.15, 0.07, 0.03];

fn instrument() -> InstrumentModel {
    InstrumentConstants::default().build().unwrap()
}

/// An isotopic cluster eluting with a Gaussian profile. The relative intensities are
/// fixed, so the true intensity-weighted centroid does not move.
fn eluting_cluster(base_mz: f64, apex: f64, n_scans: usize) -> Spectrum {
    let middle = (n_scans as f64 - 1.0) / 2.0;
    (0..n_scans)
        .map(|i| {
            let time = 600.0 + i as f64 * 0.23;
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

fn truth() -> Vec<Spectrum> {
    vec![
        eluting_cluster(450.2, 700.0, 15),
        eluting_cluster(601.7, 900.0, 17),
        eluting_cluster(803.4, 500.0, 13),
    ]
}

fn measured(params: DeadTimeParams) -> Vec<Spectrum> {
    truth()
        .iter()
        .map(|s| apply_dead_time(instrument(), params, s).unwrap())
        .collect()
}

#[test_log::test]
fn test_grid_recovers_dead_times() {
    let params = DeadTimeParams::new(5.0, 2.0);
    let model = instrument();
    let objective = CurvatureObjective::with_filter(
        measured(params),
        ParameterSpace::DeadTime { model },
        &ScanFilter::default(),
    )
    .with_parallelism(true);
    assert_eq!(objective.len(), 3);

    let uncorrected = objective.evaluate(&[0.0, 0.0]);
    let bounds = objective
        .space()
        .default_bounds(&model, &DeadTimeParams::default())
        .unwrap();
    assert_eq!(bounds.upper(), &[10.0, 4.0]);

    let result = GridSearch::new(11)
        .minimize(|x| objective.evaluate(x), &[0.0, 0.0], &bounds)
        .unwrap();
    assert_eq!(result.evaluations, 121);
    assert!(result.value < 1e-6, "{result:?}");
    assert!(uncorrected > 1e3 * result.value.max(1e-9), "{uncorrected}");

    let found = DeadTimeParams::new(result.x[0], result.x[1]);
    assert!(found.is_physical(), "{found}");
    for (observed, expected) in measured(params).iter().zip(truth().iter()) {
        let corrected = correct_dead_time(model, found, observed).unwrap();
        for (a, b) in corrected.iter().zip(expected.iter()) {
            for (p, q) in a.iter().zip(b.iter()) {
                assert_eq!(p.mz, q.mz);
                assert!(
                    (p.intensity - q.intensity).abs() < 1e-6 * q.intensity.max(1.0),
                    "{} {} at {}",
                    p.intensity,
                    q.intensity,
                    p.mz
                );
            }
        }
    }
}

#[test_log::test]
fn test_annealing_improves_on_start() {
    let model = instrument();
    let objective = CurvatureObjective::new(
        measured(DeadTimeParams::new(6.0, 1.5)),
        ParameterSpace::DeadTime { model },
    );
    let bounds = objective
        .space()
        .default_bounds(&model, &DeadTimeParams::new(5.0, 2.0))
        .unwrap();
    let start = objective.evaluate(&[0.0, 0.0]);
    let mut annealer = SimulatedAnnealing::new(11, 400);
    let result = annealer
        .minimize(|x| objective.evaluate(x), &[0.0, 0.0], &bounds)
        .unwrap();
    assert!(result.value < start, "{} vs {start}", result.value);
    assert!(bounds.contains(&result.x));
    assert!(result.evaluations <= 400);
}

#[test_log::test]
fn test_fitting_instrument_parameters() {
    let model = instrument();
    let params = DeadTimeParams::new(5.0, 2.0);
    let objective =
        CurvatureObjective::new(measured(params), ParameterSpace::DeadTimeAndInstrument);
    let x = objective.space().encode(&model, &params);
    let bounds = objective.space().default_bounds(&model, &params).unwrap();
    assert!(bounds.contains(&x));
    assert!(objective.evaluate(&x) < 1e-6);

    // Fewer pulses per scan makes the same counts look more saturated
    let mut fewer = x.clone();
    fewer[2] *= 0.9;
    assert!(objective.evaluate(&fewer) > objective.evaluate(&x));
}
