//! Estimator Covariance Property Tests
//!
//! Whatever sequence of predictions and measurements the filter sees, its
//! covariance must stay symmetric and positive semi-definite, and a rejected
//! update must leave the prior estimate untouched.

use avbus::estimator::*;
use avbus::protocol::{Confidence, MissionTime, TopicId};
use avbus::BusError;
use nalgebra::{DMatrix, DVector};
use proptest::prelude::*;

const POSITION: TopicId = TopicId(1);
const TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone)]
enum Step {
    Predict(f64),
    Update(f64, f64),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0.001f64..0.5).prop_map(Step::Predict),
        (-1.0e4f64..1.0e4, -1.0e4f64..1.0e4).prop_map(|(x, y)| Step::Update(x, y)),
    ]
}

fn filter(initial_variance: f64, measurement_noise: f64) -> StateEstimator<ConstantVelocity> {
    let dynamics = ConstantVelocity {
        axes: 2,
        process_noise: 0.5,
    };
    let mut estimator = StateEstimator::new(
        dynamics,
        DVector::zeros(4),
        DMatrix::identity(4, 4) * initial_variance,
        TOLERANCE,
    )
    .unwrap();
    estimator
        .add_measurement(MeasurementModel {
            topic: POSITION,
            h: DMatrix::from_row_slice(2, 4, &[1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0]),
            r: DMatrix::identity(2, 2) * measurement_noise,
        })
        .unwrap();
    estimator
}

fn assert_symmetric_psd(p: &DMatrix<f64>) {
    let scale = p.amax().max(1.0);
    for i in 0..p.nrows() {
        for j in 0..p.ncols() {
            assert!((p[(i, j)] - p[(j, i)]).abs() <= 1e-9 * scale);
        }
    }
    let min_eigenvalue = p
        .clone()
        .symmetric_eigenvalues()
        .iter()
        .copied()
        .fold(f64::INFINITY, f64::min);
    assert!(min_eigenvalue >= -TOLERANCE * scale);
}

proptest! {
    #[test]
    fn prop_covariance_stays_symmetric_psd(
        initial_variance in 0.01f64..1.0e3,
        measurement_noise in 0.01f64..10.0,
        steps in prop::collection::vec(step(), 1..60),
    ) {
        let mut estimator = filter(initial_variance, measurement_noise);
        for step in steps {
            match step {
                Step::Predict(dt) => estimator.predict(dt).unwrap(),
                Step::Update(x, y) => estimator
                    .update(POSITION, &[x, y], MissionTime::EPOCH)
                    .unwrap(),
            }
            assert_symmetric_psd(estimator.covariance());
        }
        prop_assert_eq!(estimator.confidence(), Confidence::Nominal);
    }

    #[test]
    fn prop_update_never_increases_position_variance(
        initial_variance in 0.01f64..1.0e3,
        z in -1.0e3f64..1.0e3,
    ) {
        let mut estimator = filter(initial_variance, 1.0);
        let before = estimator.covariance()[(0, 0)];
        estimator.update(POSITION, &[z, z], MissionTime::EPOCH).unwrap();
        prop_assert!(estimator.covariance()[(0, 0)] <= before + 1e-9);
    }
}

#[test]
fn test_non_finite_measurement_keeps_prior() {
    let mut estimator = filter(10.0, 1.0);
    estimator.update(POSITION, &[3.0, 4.0], MissionTime::EPOCH).unwrap();
    let state = estimator.state().clone();
    let covariance = estimator.covariance().clone();

    assert!(matches!(
        estimator.update(POSITION, &[f64::NAN, 0.0], MissionTime::EPOCH),
        Err(BusError::NumericalDivergence(_))
    ));
    assert_eq!(estimator.state(), &state);
    assert_eq!(estimator.covariance(), &covariance);
    assert_eq!(estimator.confidence(), Confidence::Degraded);
    assert_eq!(estimator.get_stats().divergences, 1);

    // The next good measurement restores confidence
    estimator.update(POSITION, &[3.0, 4.0], MissionTime::EPOCH).unwrap();
    assert_eq!(estimator.confidence(), Confidence::Nominal);
}

#[test]
fn test_indefinite_innovation_covariance_diverges() {
    let dynamics = ConstantVelocity {
        axes: 1,
        process_noise: 0.1,
    };
    let mut estimator = StateEstimator::new(
        dynamics,
        DVector::from_column_slice(&[0.0, 0.0]),
        DMatrix::identity(2, 2),
        TOLERANCE,
    )
    .unwrap();
    estimator
        .add_measurement(MeasurementModel {
            topic: POSITION,
            h: DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
            r: DMatrix::from_element(1, 1, -10.0),
        })
        .unwrap();

    assert!(matches!(
        estimator.update(POSITION, &[1.0], MissionTime::EPOCH),
        Err(BusError::NumericalDivergence(_))
    ));
    assert_eq!(estimator.state(), &DVector::from_column_slice(&[0.0, 0.0]));
    assert_eq!(estimator.confidence(), Confidence::Degraded);
}
