pub mod lease;
pub mod queue;
pub mod run_store;
pub mod runner;
