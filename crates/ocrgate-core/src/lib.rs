pub mod error;
pub mod types;

pub use error::{FrameError, OcrError, Result};
pub use types::*;
