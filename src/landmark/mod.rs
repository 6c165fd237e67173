pub mod point;
pub mod receiver;

pub use point::{reference_pose, Landmark, LandmarkFrame, TrackedPoint, END_OF_MESSAGE};
pub use receiver::LandmarkReceiver;
