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
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! dialback library: a relay that brings reverse SSH tunnels from devices
//! behind NAT up on demand.
//!
//! - `sessions`: port pair allocation and the session registry
//! - `activation`: start/stop commands and the poll-until-connected workflow
//! - `backend`: command service and actor credential collaborators
//! - `ssh`: device and operator SSH endpoints
//! - `terminal`: browser terminal over WebSocket
//! - `proxy`: HTTP proxy to a device's web server
//! - `routes`: HTTP API and router
//! - `audit`: session audit records

pub mod activation;
pub mod audit;
pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod proxy;
pub mod routes;
pub mod sessions;
pub mod ssh;
pub mod state;
pub mod terminal;
pub mod util;

pub use config::Config;
pub use error::{ErrorKind, TunnelError};
pub use sessions::{Session, SessionRegistry};
pub use state::AppState;
