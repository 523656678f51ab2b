pub mod clock;
pub mod dispatcher;
pub mod events;
pub mod input;
pub mod performer;
pub mod track_worker;

pub use clock::*;
pub use dispatcher::*;
pub use events::*;
pub use input::*;
pub use performer::*;
pub use track_worker::*;
