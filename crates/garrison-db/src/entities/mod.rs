pub mod agents;
pub mod servers;
