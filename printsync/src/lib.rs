#![doc = "printsync: CLI and transport glue around printsync-core."]

//! The binary crate wires the engine to the outside world: argument parsing,
//! YAML configuration loading, the HTTP supplier/quota/relay clients and the
//! `lp`-based print backend. All engine logic lives in `printsync-core`.

pub mod backend;
pub mod cli;
pub mod load_config;
pub mod sim;
pub mod supplier;
