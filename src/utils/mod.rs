pub mod command;
pub mod discovery;
pub mod file;
pub mod system;
