//! On-demand image resizing service.
//!
//! Requests for an uncached size queue a resize job in Redis and block on a
//! completion bus until a worker has written the variant to the cache
//! directory; later requests are served straight from disk.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
