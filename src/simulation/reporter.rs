//! Position broadcasts of one simulation.
//!
//! Each report is one published message of three frames: the simulation id
//! as text, the frame number as an f64, then either the explicit atom
//! positions or the `err` marker.

use std::sync::Arc;

use super::CancellationToken;
use super::system::explicit_positions;
use crate::engine::Context;
use crate::payload::encode_positions;
use crate::topology::Topology;
use crate::transport::{self, Frame, Publisher};

/// Marker sent instead of positions once the run is in error.
pub const ERROR_MARKER: &[u8] = b"err";

pub struct Reporter {
    simulation_id: i64,
    interval: u32,
    frame: u64,
    failed: bool,
    topology: Arc<Topology>,
    publisher: Arc<dyn Publisher>,
    token: CancellationToken,
}

impl Reporter {
    pub fn new(simulation_id: i64, interval: u32, topology: Arc<Topology>, publisher: Arc<dyn Publisher>, token: CancellationToken) -> Self {
        Self {
            simulation_id,
            interval: interval.max(1),
            frame: 0,
            failed: false,
            topology,
            publisher,
            token,
        }
    }

    /// Whether a report is due once `steps_done` steps have run.
    pub fn is_due(&self, steps_done: u64) -> bool {
        steps_done % u64::from(self.interval) == 0
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Publishes one frame. The first NaN, infinite or missing position turns the
    /// reporter into error state, publishes the marker and cancels the run.
    /// Later calls only advance the frame counter.
    pub fn report(&mut self, context: &dyn Context) -> Result<(), transport::Error> {
        self.frame += 1;
        if self.failed {
            return Ok(());
        }

        let body = match explicit_positions(&self.topology, &context.positions()) {
            Some(positions) if positions.iter().flatten().all(|coordinate| coordinate.is_finite()) => encode_positions(&positions),
            _ => {
                self.failed = true;
                ERROR_MARKER.to_vec()
            }
        };
        let frames: Vec<Frame> = vec![
            transport::text(self.simulation_id.to_string()),
            (self.frame as f64).to_le_bytes().to_vec(),
            body,
        ];
        self.publisher.publish(frames)?;

        if self.failed && self.token.cancel_once() {
            log::warn!("Aborted simulation because system failed to calculate particles positions");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Backend, NonbondedParameters, ReferenceBackend, SystemDescription};
    use crate::payload::records::tests::{water_header, water_topology};
    use crate::transport::MemoryPublisher;
    use glam::DVec3;

    fn water_context(positions: &[DVec3]) -> Box<dyn Context> {
        let mut system = SystemDescription::default();
        for _ in 0..positions.len() {
            system.add_particle(1.0, NonbondedParameters::NONE);
        }
        let mut context = ReferenceBackend::new(Some(1)).create(&system).unwrap();
        context.set_positions(positions).unwrap();
        context
    }

    fn reporter(publisher: &Arc<MemoryPublisher>, token: &CancellationToken) -> Reporter {
        let topology = Arc::new(Topology::from_records(&water_header(), &water_topology()).unwrap());
        Reporter::new(12, 10, topology, publisher.clone(), token.clone())
    }

    #[test]
    fn publishes_id_frame_and_positions() {
        let publisher = Arc::new(MemoryPublisher::new());
        let token = CancellationToken::new();
        let mut reporter = reporter(&publisher, &token);
        // a fourth helper particle is not reported
        let context = water_context(&[DVec3::ZERO, DVec3::X, DVec3::Y, DVec3::Z]);

        assert!(!reporter.is_due(5));
        assert!(reporter.is_due(10));
        reporter.report(context.as_ref()).unwrap();

        let messages = publisher.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0][0], b"12".to_vec());
        assert_eq!(messages[0][1], 1.0f64.to_le_bytes().to_vec());
        assert_eq!(messages[0][2], encode_positions(&[[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn nan_position_sends_one_error_and_cancels_once() {
        let publisher = Arc::new(MemoryPublisher::new());
        let token = CancellationToken::new();
        let mut reporter = reporter(&publisher, &token);
        let context = water_context(&[DVec3::ZERO, DVec3::new(0.0, f64::NAN, 0.0), DVec3::Y]);

        for _ in 0..3 {
            reporter.report(context.as_ref()).unwrap();
        }

        let messages = publisher.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0][2], ERROR_MARKER.to_vec());
        assert!(token.is_cancelled());
        assert!(reporter.has_failed());
        assert_eq!(reporter.frame(), 3);
    }

    #[test]
    fn missing_particles_are_an_error() {
        let publisher = Arc::new(MemoryPublisher::new());
        let token = CancellationToken::new();
        let mut reporter = reporter(&publisher, &token);
        let context = water_context(&[DVec3::ZERO, DVec3::X]);
        reporter.report(context.as_ref()).unwrap();
        assert_eq!(publisher.messages()[0][2], ERROR_MARKER.to_vec());
        assert!(token.is_cancelled());
    }
}
