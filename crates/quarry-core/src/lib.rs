pub mod config;
pub mod engine;
pub mod gate;
pub mod worker;

pub use config::*;
pub use engine::*;
pub use gate::*;
pub use worker::*;
