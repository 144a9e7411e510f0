pub mod classifier;
pub mod foveation;
pub mod graphics;
pub mod hooks;
pub mod injector;
pub mod logging_backend;
pub mod postprocess;
pub mod runtimes;

#[cfg(windows)]
mod platform;
