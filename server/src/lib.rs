//! Realtime board rooms: presence, event fan-out, and a shared document.
//!
//! ARCHITECTURE
//! ============
//! - `routes` exposes the grant API and the websocket endpoint
//! - `services::room` runs one actor per live board
//! - `services::access` authenticates sessions and issues room tickets
//! - `rate_limit` bounds mutations per connection and globally

pub mod config;
pub mod db;
pub mod rate_limit;
pub mod routes;
pub mod services;
pub mod state;
