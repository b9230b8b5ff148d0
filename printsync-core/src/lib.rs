#![doc = "printsync-core: core engine library for printsync."]

//! This crate contains the engine logic for the printsync daemon: collaborator
//! contracts, the page chunker, the cost allocator, the cluster router, the
//! print dispatcher, the completion monitor, the status reporter and the
//! orchestrating poll loop. Transport concerns (HTTP clients, spool commands,
//! CLI glue) live in the `printsync` binary crate.
//!
//! # Usage
//! Add this as a dependency and implement the traits in [`contract`] for the
//! supplier, print backend, quota backend, directory and ledger store your
//! deployment talks to, then drive everything through [`orchestrate::Engine`].

pub mod allocate;
pub mod chunker;
pub mod cluster;
pub mod config;
pub mod contract;
pub mod dispatch;
pub mod error;
pub mod monitor;
pub mod orchestrate;
pub mod report;
pub mod store;
