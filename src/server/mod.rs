//! Stdio front end of the engine.
//!
//! ## Architecture
//!
//! ```text
//! stdin ──► Dispatcher::serve ──► route ──┬─► JobScheduler ──► worker pool
//!                │                        ├─► Cache                │
//!                │                        └─► ResourceManager ◄────┘
//!                ▼                                                  │
//!          Outbound channel ◄──────────── job events ◄──────────────┘
//!                │
//!                ▼
//!          writer thread ──► stdout (one JSON object per line)
//! ```
//!
//! Logs never go to stdout; see [`crate::logging`].

pub mod core;
pub mod protocol;

pub use self::core::{Dispatcher, VERSION};
pub use protocol::{ErrorCode, Outbound, Request, Response, RpcError, parse_request, spawn_writer};
