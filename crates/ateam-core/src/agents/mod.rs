//! Agent profiles and the manager that resolves `@Name` tags against them

pub mod manager;
pub mod profile;

pub use manager::AgentManager;
pub use profile::AgentProfile;
