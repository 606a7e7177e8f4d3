// src/lib.rs
pub mod config;
pub mod utils;
pub mod pipelines;
pub mod cli;
pub use cli::Arguments;
pub use config::RunConfig;
pub use config::defs::PipelineError;
pub use pipelines::driver::Pipeline;
