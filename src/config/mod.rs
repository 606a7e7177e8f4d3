pub mod defs;
pub mod settings;

pub use settings::RunConfig;
