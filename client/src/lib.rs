//! Client coordination layer for board rooms.
//!
//! ARCHITECTURE
//! ============
//! - `auth` trades a session for a one-time room grant
//! - `session` owns the socket: presence throttling, event routing, the
//!   optimistic shared document, and reconnect
//! - `indicators` derives "who is doing what" from a presence snapshot
//! - `refresh` turns room events into cache-refresh callbacks
//!
//! ```no_run
//! # async fn demo() -> Result<(), room_client::ClientError> {
//! use std::sync::Arc;
//! use room_client::{ClientConfig, HttpAuthProvider, connect, indicators};
//!
//! let config = ClientConfig::new("http://127.0.0.1:3000");
//! let auth = Arc::new(HttpAuthProvider::new(config.clone(), "session-token"));
//! let session = connect(config, "board-id", auth).await?;
//!
//! session.start_editing("card-1", "title");
//! if indicators::is_editing_by_others(&session.others(), "card-2") {
//!     println!("card-2 is being edited");
//! }
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod indicators;
pub mod refresh;
pub mod session;

pub use auth::{AuthProvider, HttpAuthProvider, RoomGrant, StaticTicket};
pub use config::{ClientConfig, ReconnectPolicy};
pub use error::ClientError;
pub use refresh::{CallbackId, RefreshCause, RefreshRequest, RefreshRouter};
pub use session::{RoomSession, SessionEvent, connect};
