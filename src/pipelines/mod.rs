pub mod consensus_assembly;
pub mod driver;
pub mod predicate;
pub mod report;
pub mod stage;
