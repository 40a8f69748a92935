use super::{core_accessors, ConnectionCore, PoseReader, TrackerConnection};
use crate::types::{DeviceKind, LibMode, PoseFrame, RawPoseSample};
use crate::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const POSITION_RANGE: f64 = 30.0;
const ANGLE_RANGE: f64 = 180.0;
const DEBUG_BODIES: usize = 5;
/// Fraction of the remaining distance covered per read by the approach tracker.
const APPROACH_RATE: f64 = 0.05;
/// Maximum goal drift per read, in mm and degrees.
const GOAL_DRIFT: f64 = 0.5;

fn random_pose(rng: &mut StdRng) -> [f64; 6] {
    [
        rng.gen_range(-POSITION_RANGE..POSITION_RANGE),
        rng.gen_range(-POSITION_RANGE..POSITION_RANGE),
        rng.gen_range(-POSITION_RANGE..POSITION_RANGE),
        rng.gen_range(-ANGLE_RANGE..ANGLE_RANGE),
        rng.gen_range(-ANGLE_RANGE..ANGLE_RANGE),
        rng.gen_range(-ANGLE_RANGE..ANGLE_RANGE),
    ]
}

/// Simulated tracker for running without hardware. Always connects in `debug` mode.
pub struct DebugConnection {
    core: ConnectionCore,
    n_bodies: usize,
}

impl DebugConnection {
    pub fn new(kind: DeviceKind, n_coils: usize) -> Self {
        Self {
            core: ConnectionCore::new(kind),
            n_bodies: DEBUG_BODIES.max(2 + n_coils),
        }
    }
}

impl TrackerConnection for DebugConnection {
    core_accessors!();

    fn configure(&mut self) -> bool {
        self.core.mark_configured();
        true
    }

    fn connect(&mut self) {
        self.core.release();
        let reader: Box<dyn PoseReader> = match self.core.kind {
            DeviceKind::DebugApproach => Box::new(DebugApproachReader::new(self.n_bodies)),
            _ => Box::new(DebugRandomReader::new(self.n_bodies)),
        };
        self.core.attach(reader, LibMode::Debug);
    }
}

/// Independent uniform poses for every body, all visible.
pub struct DebugRandomReader {
    rng: StdRng,
    n_bodies: usize,
}

impl DebugRandomReader {
    pub fn new(n_bodies: usize) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            n_bodies,
        }
    }

    pub fn with_seed(n_bodies: usize, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            n_bodies,
        }
    }
}

impl PoseReader for DebugRandomReader {
    fn read_frame(&mut self) -> Result<PoseFrame> {
        let bodies = (0..self.n_bodies)
            .map(|_| RawPoseSample::from_array(random_pose(&mut self.rng), true))
            .collect();
        Ok(PoseFrame::new(bodies))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Bodies that glide toward slowly drifting goals, for exercising target approach.
pub struct DebugApproachReader {
    rng: StdRng,
    current: Vec<[f64; 6]>,
    goals: Vec<[f64; 6]>,
}

impl DebugApproachReader {
    pub fn new(n_bodies: usize) -> Self {
        Self::from_rng(n_bodies, StdRng::from_entropy())
    }

    pub fn with_seed(n_bodies: usize, seed: u64) -> Self {
        Self::from_rng(n_bodies, StdRng::seed_from_u64(seed))
    }

    fn from_rng(n_bodies: usize, mut rng: StdRng) -> Self {
        let current = (0..n_bodies).map(|_| random_pose(&mut rng)).collect();
        let goals = (0..n_bodies).map(|_| random_pose(&mut rng)).collect();
        Self { rng, current, goals }
    }

    /// Distance in position space between body `i` and its goal.
    pub fn remaining(&self, i: usize) -> f64 {
        (0..3)
            .map(|k| (self.goals[i][k] - self.current[i][k]).powi(2))
            .sum::<f64>()
            .sqrt()
    }
}

impl PoseReader for DebugApproachReader {
    fn read_frame(&mut self) -> Result<PoseFrame> {
        for (pose, goal) in self.current.iter_mut().zip(self.goals.iter_mut()) {
            for value in goal.iter_mut() {
                *value += self.rng.gen_range(-GOAL_DRIFT..GOAL_DRIFT);
            }
            for (c, g) in pose.iter_mut().zip(goal.iter()) {
                *c += (g - *c) * APPROACH_RATE;
            }
        }
        let bodies = self
            .current
            .iter()
            .map(|pose| RawPoseSample::from_array(*pose, true))
            .collect();
        Ok(PoseFrame::new(bodies))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_reader_stays_in_range() {
        let mut reader = DebugRandomReader::with_seed(5, 7);
        for _ in 0..50 {
            let frame = reader.read_frame().unwrap();
            assert_eq!(frame.bodies.len(), 5);
            for body in &frame.bodies {
                assert!(body.visible);
                assert!(body.position.iter().all(|v| v.abs() <= POSITION_RANGE));
                assert!(body.orientation.iter().all(|v| v.abs() <= ANGLE_RANGE));
            }
        }
    }

    #[test]
    fn test_approach_reader_closes_distance() {
        let mut reader = DebugApproachReader::with_seed(3, 11);
        let before = reader.remaining(0);
        for _ in 0..60 {
            reader.read_frame().unwrap();
        }
        assert!(reader.remaining(0) < before * 0.5 + 5.0);
    }

    #[test]
    fn test_frames_grow_with_coil_count() {
        let mut conn = DebugConnection::new(DeviceKind::DebugRandom, 6);
        conn.connect();
        let frame = conn.connection().unwrap().read_frame().unwrap();
        assert_eq!(frame.bodies.len(), 8);
    }
}
