//! Data models

pub mod identifiers;
pub mod job;
pub mod parameter_set;
pub mod recording;
pub mod sort_result;

pub use identifiers::*;
pub use job::*;
pub use parameter_set::*;
pub use recording::*;
pub use sort_result::*;
