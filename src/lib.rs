//! Task marketplace backend
//!
//! Users post tasks, others bid, the owner accepts one bid and the task
//! moves through OPEN, IN_PROGRESS, DELIVERED and DONE before both parties
//! rate each other. Persistence, the change feed and object storage sit
//! behind the traits in [`store`]; [`sync`] keeps live views of the store
//! current; [`services`] holds the marketplace rules; [`routes`] exposes
//! them over HTTP.

pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod logging;
pub mod routes;
pub mod services;
pub mod store;
pub mod sync;
