pub mod config;
pub mod coordinator;
pub mod error;
pub mod matcher;
pub mod operator;
pub mod poller;
pub mod session;
pub mod storage;

// Re-export sensor types for convenience
pub use fingate_sensor::{
    capture, source, BitwiseMatcher, Capture, CaptureImage, CaptureSource, Matcher, Score, SpoolSource,
};

pub use coordinator::{CancelToken, Coordinator, Mode, Outcome, Settings};
pub use error::Error;
