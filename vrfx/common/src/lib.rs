#[macro_use]
pub mod logging;
pub use logging::StrResult;

pub mod data;
pub mod resolution;
