pub mod condition;
pub mod dependency;
pub mod deployment;
pub mod group;
pub mod instance;
pub mod path;
pub mod run_spec;
