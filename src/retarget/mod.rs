pub mod calibration;
pub mod engine;
pub mod ground;
pub mod math;
pub mod store;

pub use calibration::{Calibration, CalibrationError, CalibrationRecord, SpineChain};
pub use engine::{RetargetEngine, TickOutcome};
pub use ground::{FlatGround, GroundProbe};
pub use store::{CalibrationStore, JsonCalibrationStore, StoredCalibration};
