//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own room state and access control so route handlers can
//! stay focused on protocol translation and auth plumbing.

pub mod access;
pub mod memory;
pub mod room;
pub mod sweeper;
