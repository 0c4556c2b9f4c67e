//! Job-driven web data extraction: a bounded job scheduler, an egress proxy
//! pool, browser sessions with challenge negotiation, and a table-driven
//! extraction pipeline shared by every target site.

pub mod challenge;
pub mod config;
pub mod db;
pub mod error;
pub mod extractors;
pub mod models;
pub mod pipeline;
pub mod proxy_pool;
pub mod routes;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod testing;
