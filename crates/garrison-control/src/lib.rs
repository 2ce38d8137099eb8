pub mod agent_tunnel;
pub mod audit;
pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod ledger;
pub mod lifecycle;
pub mod logs;
pub mod ports;
pub mod reconcile;
pub mod routes;
pub mod state;

#[cfg(test)]
mod test_support;
