//! Kalman-filter fusion of authoritative sensor topics.

use crate::error::{BusError, BusResult};
use crate::node::{FlightNode, NodeContext};
use crate::protocol::{decode_components, Confidence, FaultClass, HealthStatus, MissionTime, Payload, TopicId};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Largest state whose fused snapshot fits in one payload.
pub const MAX_STATE_DIM: usize = 7;
const MAX_MEASUREMENT_MODELS: usize = 8;

/// Output of one propagation step.
#[derive(Debug, Clone)]
pub struct Propagation {
    pub state: DVector<f64>,
    pub transition: DMatrix<f64>,
    pub process_noise: DMatrix<f64>,
}

/// Dynamics collaborator. The estimator asks it once per frame how the state
/// evolves over `dt_s` seconds.
pub trait DynamicsModel: Send {
    fn dimension(&self) -> usize;
    fn propagate(&self, state: &DVector<f64>, dt_s: f64) -> Propagation;
}

/// Position/velocity per axis; state is `[p_0..p_n, v_0..v_n]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConstantVelocity {
    pub axes: usize,
    pub process_noise: f64,
}

impl DynamicsModel for ConstantVelocity {
    fn dimension(&self) -> usize {
        2 * self.axes
    }

    fn propagate(&self, state: &DVector<f64>, dt_s: f64) -> Propagation {
        let n = self.dimension();
        let mut transition = DMatrix::identity(n, n);
        for axis in 0..self.axes {
            transition[(axis, self.axes + axis)] = dt_s;
        }
        Propagation {
            state: &transition * state,
            process_noise: DMatrix::identity(n, n) * (self.process_noise * dt_s),
            transition,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementModel {
    pub topic: TopicId,
    /// Observation matrix, `m x n`.
    pub h: DMatrix<f64>,
    /// Measurement noise covariance, `m x m`.
    pub r: DMatrix<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EstimatorStats {
    pub predictions: u64,
    pub updates: u64,
    pub divergences: u64,
}

/// Snapshot of the estimate. The covariance is stored row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedState {
    pub state: alloc::vec::Vec<f64>,
    pub covariance: alloc::vec::Vec<f64>,
    pub timestamp: MissionTime,
    pub confidence: Confidence,
}

impl FusedState {
    pub fn dimension(&self) -> usize {
        self.state.len()
    }

    /// Euclidean norm of the listed state components.
    pub fn speed(&self, velocity_components: &[usize]) -> f64 {
        velocity_components
            .iter()
            .filter_map(|index| self.state.get(*index))
            .map(|v| v * v)
            .sum::<f64>()
            .sqrt()
    }

    /// `dim u8 | confidence u8 | x[dim] f64 | P[dim*dim] f64`, little-endian.
    pub fn encode(&self) -> BusResult<Payload> {
        let dim = self.state.len();
        if dim > MAX_STATE_DIM || self.covariance.len() != dim * dim {
            return Err(BusError::MalformedFrame("fused state dimension"));
        }
        let mut payload = Payload::new();
        let confidence = match self.confidence {
            Confidence::Nominal => 0u8,
            Confidence::Degraded => 1u8,
        };
        payload
            .extend_from_slice(&[dim as u8, confidence])
            .map_err(|()| BusError::PayloadTooLarge(2))?;
        for value in self.state.iter().chain(self.covariance.iter()) {
            payload
                .extend_from_slice(&value.to_le_bytes())
                .map_err(|()| BusError::PayloadTooLarge(2 + 8 * (dim + dim * dim)))?;
        }
        Ok(payload)
    }

    pub fn decode(payload: &[u8], timestamp: MissionTime) -> BusResult<Self> {
        let (&dim, rest) = payload
            .split_first()
            .ok_or(BusError::MalformedFrame("empty fused state"))?;
        let (&confidence, body) = rest
            .split_first()
            .ok_or(BusError::MalformedFrame("fused state without confidence"))?;
        let dim = dim as usize;
        if dim > MAX_STATE_DIM {
            return Err(BusError::MalformedFrame("fused state dimension"));
        }
        let confidence = match confidence {
            0 => Confidence::Nominal,
            1 => Confidence::Degraded,
            _ => return Err(BusError::MalformedFrame("fused state confidence")),
        };
        let values = decode_components(body)?;
        if values.len() != dim + dim * dim {
            return Err(BusError::MalformedFrame("fused state length"));
        }
        Ok(Self {
            state: values[..dim].to_vec(),
            covariance: values[dim..].to_vec(),
            timestamp,
            confidence,
        })
    }
}

pub struct StateEstimator<D: DynamicsModel> {
    dynamics: D,
    x: DVector<f64>,
    p: DMatrix<f64>,
    measurements: heapless::Vec<MeasurementModel, MAX_MEASUREMENT_MODELS>,
    estimate_time: MissionTime,
    latest_measurement: MissionTime,
    confidence: Confidence,
    psd_tolerance: f64,
    stats: EstimatorStats,
}

impl<D: DynamicsModel> StateEstimator<D> {
    pub fn new(dynamics: D, x0: DVector<f64>, p0: DMatrix<f64>, psd_tolerance: f64) -> BusResult<Self> {
        let n = dynamics.dimension();
        if n == 0 || n > MAX_STATE_DIM {
            return Err(BusError::config(alloc::format!(
                "state dimension {} outside 1..={}",
                n,
                MAX_STATE_DIM
            )));
        }
        if x0.len() != n || p0.nrows() != n || p0.ncols() != n {
            return Err(BusError::config("initial state does not match dynamics dimension"));
        }
        if !psd_tolerance.is_finite() || psd_tolerance < 0.0 {
            return Err(BusError::config("psd tolerance must be finite and non-negative"));
        }
        check_estimate(&x0, &p0, psd_tolerance).map_err(|_| BusError::config("initial covariance is not PSD"))?;

        Ok(Self {
            dynamics,
            x: x0,
            p: p0,
            measurements: heapless::Vec::new(),
            estimate_time: MissionTime::EPOCH,
            latest_measurement: MissionTime::EPOCH,
            confidence: Confidence::Nominal,
            psd_tolerance,
            stats: EstimatorStats::default(),
        })
    }

    pub fn add_measurement(&mut self, model: MeasurementModel) -> BusResult<()> {
        let n = self.x.len();
        let m = model.h.nrows();
        if m == 0 || model.h.ncols() != n || model.r.nrows() != m || model.r.ncols() != m {
            return Err(BusError::config(alloc::format!(
                "measurement model for {} has inconsistent dimensions",
                model.topic
            )));
        }
        self.measurements
            .push(model)
            .map_err(|_| BusError::RegistryFull("measurement models"))
    }

    pub fn measures(&self, topic: TopicId) -> bool {
        self.measurements.iter().any(|model| model.topic == topic)
    }

    /// Propagates the estimate by `dt_s` seconds.
    pub fn predict(&mut self, dt_s: f64) -> BusResult<()> {
        let propagation = self.dynamics.propagate(&self.x, dt_s);
        let n = self.x.len();
        if propagation.state.len() != n
            || propagation.transition.shape() != (n, n)
            || propagation.process_noise.shape() != (n, n)
        {
            return self.diverged("dynamics returned wrong dimensions");
        }

        let f = &propagation.transition;
        let p = symmetrize(f * &self.p * f.transpose() + &propagation.process_noise);
        if let Err(reason) = check_estimate(&propagation.state, &p, self.psd_tolerance) {
            return self.diverged(reason);
        }

        self.x = propagation.state;
        self.p = p;
        self.stats.predictions += 1;
        Ok(())
    }

    /// Propagates to `now`; a no-op if the estimate is already there.
    pub fn predict_to(&mut self, now: MissionTime) -> BusResult<()> {
        let dt_us = now.micros_since(self.estimate_time);
        if dt_us == 0 {
            return Ok(());
        }
        self.predict(dt_us as f64 / 1_000_000.0)?;
        self.estimate_time = now;
        Ok(())
    }

    /// Incorporates measurement `z` from `topic` using the Joseph-form update.
    pub fn update(&mut self, topic: TopicId, z: &[f64], timestamp: MissionTime) -> BusResult<()> {
        let (h, r) = self
            .measurements
            .iter()
            .find(|model| model.topic == topic)
            .map(|model| (model.h.clone(), model.r.clone()))
            .ok_or(BusError::UnknownTopic(topic))?;
        if z.len() != h.nrows() {
            return Err(BusError::MalformedFrame("measurement dimension"));
        }

        let h = &h;
        let s = h * &self.p * h.transpose() + &r;
        let Some(cholesky) = s.cholesky() else {
            return self.diverged("innovation covariance not positive definite");
        };

        // K = P Hᵀ S⁻¹, solved as Sᵀ Kᵀ = H Pᵀ with S symmetric.
        let pht = &self.p * h.transpose();
        let k = cholesky.solve(&pht.transpose()).transpose();

        let innovation = DVector::from_column_slice(z) - h * &self.x;
        let x = &self.x + &k * innovation;

        let n = self.x.len();
        let i_kh = DMatrix::<f64>::identity(n, n) - &k * h;
        let joseph = &i_kh * &self.p * i_kh.transpose() + &k * &r * k.transpose();
        let p = symmetrize(joseph);

        if let Err(reason) = check_estimate(&x, &p, self.psd_tolerance) {
            return self.diverged(reason);
        }

        self.x = x;
        self.p = p;
        self.confidence = Confidence::Nominal;
        self.latest_measurement = self.latest_measurement.max(timestamp);
        self.stats.updates += 1;
        Ok(())
    }

    pub fn fused_state(&self) -> FusedState {
        FusedState {
            state: self.x.iter().copied().collect(),
            covariance: self.p.transpose().iter().copied().collect(),
            timestamp: self.estimate_time.max(self.latest_measurement),
            confidence: self.confidence,
        }
    }

    /// Puts the filter back to a given estimate, as after a node restart.
    pub fn reset(&mut self, x0: DVector<f64>, p0: DMatrix<f64>) -> BusResult<()> {
        if x0.len() != self.x.len() || p0.shape() != self.p.shape() {
            return Err(BusError::config("reset estimate does not match dimension"));
        }
        self.x = x0;
        self.p = p0;
        self.confidence = Confidence::Nominal;
        Ok(())
    }

    pub fn state(&self) -> &DVector<f64> {
        &self.x
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.p
    }

    pub fn confidence(&self) -> Confidence {
        self.confidence
    }

    pub fn get_stats(&self) -> &EstimatorStats {
        &self.stats
    }

    fn diverged(&mut self, reason: &'static str) -> BusResult<()> {
        self.confidence = Confidence::Degraded;
        self.stats.divergences += 1;
        warn!(reason, "estimator update rejected, keeping prior estimate");
        Err(BusError::NumericalDivergence(reason))
    }
}

fn symmetrize(p: DMatrix<f64>) -> DMatrix<f64> {
    (&p + p.transpose()) * 0.5
}

fn check_estimate(x: &DVector<f64>, p: &DMatrix<f64>, tolerance: f64) -> Result<(), &'static str> {
    if x.iter().chain(p.iter()).any(|v| !v.is_finite()) {
        return Err("non-finite value in estimate");
    }
    let min_eigenvalue = p
        .clone()
        .symmetric_eigenvalues()
        .iter()
        .copied()
        .fold(f64::INFINITY, f64::min);
    if min_eigenvalue < -tolerance {
        return Err("covariance lost positive semi-definiteness");
    }
    Ok(())
}

/// Scheduled node wrapping a [`StateEstimator`]: predicts to the frame time,
/// folds in every measurement delivered since the last frame, then publishes
/// the fused state.
pub struct EstimatorNode<D: DynamicsModel> {
    estimator: StateEstimator<D>,
    output: TopicId,
    initial: (DVector<f64>, DMatrix<f64>),
}

impl<D: DynamicsModel> EstimatorNode<D> {
    pub fn new(estimator: StateEstimator<D>, output: TopicId) -> Self {
        let initial = (estimator.state().clone(), estimator.covariance().clone());
        Self {
            estimator,
            output,
            initial,
        }
    }

    pub fn estimator(&self) -> &StateEstimator<D> {
        &self.estimator
    }
}

impl<D: DynamicsModel> FlightNode for EstimatorNode<D> {
    fn step(&mut self, ctx: &mut NodeContext<'_>) -> BusResult<()> {
        let mut diverged = false;
        if let Err(error) = self.estimator.predict_to(ctx.now()) {
            debug!(%error, "prediction rejected");
            diverged = true;
        }

        let mut measurements = alloc::vec::Vec::new();
        for delivery in ctx.deliveries() {
            let message = &delivery.message;
            // Last-known-good republications carry no new information.
            if delivery.confidence == Confidence::Degraded || !self.estimator.measures(message.topic()) {
                continue;
            }
            match decode_components(message.payload()) {
                Ok(z) => measurements.push((message.topic(), z, message.timestamp())),
                Err(error) => debug!(topic = %message.topic(), %error, "undecodable measurement"),
            }
        }

        for (topic, z, timestamp) in measurements {
            match self.estimator.update(topic, &z, timestamp) {
                Ok(()) => {}
                Err(BusError::NumericalDivergence(_)) => diverged = true,
                Err(error) => debug!(topic = %topic, %error, "measurement skipped"),
            }
        }

        if diverged {
            ctx.report_health(HealthStatus::Degraded, Some(FaultClass::NumericalDivergence));
        }

        let fused = self.estimator.fused_state();
        ctx.publish(self.output, &fused.encode()?)?;
        ctx.heartbeat();
        Ok(())
    }

    fn restart(&mut self) {
        let (x0, p0) = self.initial.clone();
        if let Err(error) = self.estimator.reset(x0, p0) {
            warn!(%error, "estimator reset failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn altitude_filter() -> StateEstimator<ConstantVelocity> {
        let dynamics = ConstantVelocity {
            axes: 1,
            process_noise: 0.01,
        };
        let mut estimator = StateEstimator::new(
            dynamics,
            DVector::from_vec(alloc::vec![100.0, 0.0]),
            DMatrix::identity(2, 2) * 100.0,
            1e-9,
        )
        .unwrap();
        estimator
            .add_measurement(MeasurementModel {
                topic: TopicId(1),
                h: DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
                r: DMatrix::from_element(1, 1, 4.0),
            })
            .unwrap();
        estimator
    }

    #[test]
    fn test_update_pulls_toward_measurement() {
        let mut estimator = altitude_filter();
        estimator.predict(0.1).unwrap();
        estimator.update(TopicId(1), &[110.0], MissionTime::from_micros(100_000)).unwrap();
        let altitude = estimator.state()[0];
        assert!(altitude > 100.0 && altitude < 110.0);
        assert!(estimator.covariance()[(0, 0)] < 100.0);
        assert_eq!(estimator.fused_state().timestamp, MissionTime::from_micros(100_000));
    }

    #[test]
    fn test_non_finite_measurement_is_rejected() {
        let mut estimator = altitude_filter();
        let prior = estimator.state().clone();
        let result = estimator.update(TopicId(1), &[f64::NAN], MissionTime::EPOCH);
        assert!(matches!(result, Err(BusError::NumericalDivergence(_))));
        assert_eq!(estimator.state(), &prior);
        assert_eq!(estimator.confidence(), Confidence::Degraded);
    }

    #[test]
    fn test_unknown_topic() {
        let mut estimator = altitude_filter();
        assert_eq!(
            estimator.update(TopicId(9), &[1.0], MissionTime::EPOCH),
            Err(BusError::UnknownTopic(TopicId(9)))
        );
    }

    #[test]
    fn test_fused_state_payload_layout() {
        let fused = altitude_filter().fused_state();
        let payload = fused.encode().unwrap();
        assert_eq!(payload.len(), 2 + 8 * (2 + 4));
        assert_eq!(payload[0], 2);
        let decoded = FusedState::decode(&payload, fused.timestamp).unwrap();
        assert_eq!(decoded, fused);
    }
}
