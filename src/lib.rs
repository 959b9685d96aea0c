//! # vigil
//!
//! Continuous synthetic monitoring: a multi-tenant registry of end-to-end
//! tests, a scheduler that keeps them running on their own cadence, a
//! sandboxed runner that executes each one in an isolated child process,
//! a built-in uptime watch over a small set of first-party domains, and a
//! debounced state/alert engine tying them all together.
//!
//! ## Architecture
//!
//! ### Registry API ([`api`])
//!
//! The tenant-facing REST surface: upload and manage tests, trigger runs,
//! fetch run history and artifacts. Bearer tokens resolve to a scope via
//! [`api::auth::authenticate`].
//!
//! ### Scheduler ([`scheduler`])
//!
//! A single cooperative loop that decides which tests are due and enqueues
//! them, respecting global and per-tenant concurrency caps.
//!
//! ### Runner Pool ([`runner`])
//!
//! Worker tasks that claim queue entries, spawn sandboxed child processes
//! ([`runner::child`]), and persist the resulting [`model::Run`].
//!
//! ### Domain Monitor ([`domain`])
//!
//! A periodic HTTP + optional browser probe over a static, file-configured
//! list of domains, feeding the same debounce engine as tenant tests.
//!
//! ### State & Alert Engine ([`state`], [`alert`])
//!
//! [`state::observe`] is the pure debounce state machine; [`alert`] carries
//! transitions and heartbeats out over a configurable transport, with an
//! optional escalation dispatcher for DOWN transitions.
//!
//! ### Ambient services
//!
//! [`heartbeat`] sends a periodic roll-up regardless of transitions;
//! [`retention`] prunes old runs and artifacts; [`store`] and [`artifact`]
//! are the durable backing stores; [`bundled`] carries the sandbox wrapper
//! scripts embedded in the binary; [`config`] is the TOML configuration
//! schema.

pub mod alert;
pub mod api;
pub mod artifact;
pub mod bundled;
pub mod config;
pub mod domain;
pub mod heartbeat;
pub mod model;
pub mod retention;
pub mod runner;
pub mod scheduler;
pub mod state;
pub mod store;

pub use alert::{AlertSink, NullAlertSink};
pub use config::{Config, load_config};
pub use store::Store;
