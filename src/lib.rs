pub mod config;
pub mod errors;
pub mod types;
pub mod structured_logging;
pub mod wallet;
pub mod rpc_manager;
pub mod tx_sender;
pub mod swap_client;
pub mod compression;
pub mod light_instructions;
pub mod tx_builder;
pub mod setup;
pub mod swap_engine;
