pub mod midi;
pub mod performance;
pub mod storage;
pub mod types;

pub use midi::*;
pub use performance::*;
pub use storage::*;
pub use types::*;
