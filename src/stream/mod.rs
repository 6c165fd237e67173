pub mod capture;
pub mod frame;
pub mod pull;
pub mod push;

pub use capture::{CaptureOutcome, CapturePipeline, FrameSource, TestPattern};
pub use frame::{clamp_quality, FrameBuffer, StatusDocument, StreamState};
pub use pull::PullServer;
pub use push::{FrameSender, PushChannel, Session, SessionState};
