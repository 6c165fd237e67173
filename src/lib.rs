pub mod config;
pub mod landmark;
pub mod retarget;
pub mod runtime;
pub mod skeleton;
pub mod stream;
