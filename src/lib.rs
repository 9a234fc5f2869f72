pub mod collaborators;
pub mod config;
pub mod supervisor_bridge;
