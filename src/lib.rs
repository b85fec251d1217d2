#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! paneld library: the core building blocks behind the `paneld` daemon.
//!
//! - `sessions`: pane-keyed shell session registry, replay buffer, idle reaper
//! - `permissions`: permission broker between task runners and the UI
//! - `events`: the UI event channel both of them publish on
//! - `shell`: process spawning and PTY management
//! - `ws`: WebSocket protocol for the UI
//! - `routes`: HTTP handlers for health and the task-runner API
//! - `auth`: API key authentication middleware
//! - `config`: configuration loading

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod permissions;
pub mod routes;
pub mod sessions;
pub mod shell;
pub mod state;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use config::Config;
pub use permissions::PermissionBroker;
pub use sessions::SessionRegistry;
pub use state::AppState;
