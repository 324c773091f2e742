pub mod alias;
pub mod config;
pub mod cycle;
pub mod database;
pub mod inbound;
pub mod loops;
pub mod registry;
pub mod runtime;
pub mod sender;
pub mod supervisor;
pub mod telegram;
pub mod tracker;
pub mod transport;
