pub mod heartbeat;
pub mod jobs;
pub mod session;
pub mod team;

pub use heartbeat::*;
pub use jobs::*;
pub use session::*;
pub use team::*;
