pub mod acp;
pub mod admission;
pub mod config;
pub mod filewatcher;
pub mod ingclass;
pub mod leader_election;
pub mod platform;
pub mod quota;
pub mod reconcile;
pub mod types;
pub mod util;
