pub mod capture;
pub mod matcher;
pub mod source;

// Re-export commonly used types
pub use capture::{Capture, CaptureImage};
pub use matcher::{BitwiseMatcher, Matcher, Score};
pub use source::{CaptureSource, SpoolSource};
