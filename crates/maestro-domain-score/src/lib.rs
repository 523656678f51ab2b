pub mod chord;
pub mod model;
pub mod moment;
pub mod options;
pub mod schedule;
pub mod seq;
pub mod trk;

pub use chord::*;
pub use model::*;
pub use moment::*;
pub use options::*;
pub use schedule::*;
pub use seq::*;
pub use trk::*;
