//! tus Server Library
//!
//! Server side of the tus 1.0.0 resumable upload protocol. The protocol
//! engine in [`upload`] is transport independent; [`routes`] binds it to
//! HTTP with axum.
//!
//! # Modules
//!
//! - `upload`: protocol engine, state machine, blob store, checksums
//! - `db`: SQLite upload record repository
//! - `routes`: axum handlers and router
//! - `config`: environment configuration

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod upload;
