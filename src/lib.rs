// Copyright the pgrelay authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # pgrelay
//!
//! The router and pool core of a PostgreSQL-protocol connection pooler:
//! many short-lived client sessions are multiplexed over a smaller
//! population of long-lived backend connections, under per-tenant routing
//! and admission rules.
//!
//! This crate is the engine, not the daemon. It owns the shared mutable
//! state (rules, routes, client and server pools) and the state machines
//! that move a client through admission, attachment, detachment, and
//! cancellation. The wire protocol, TLS, authentication, the io reactor,
//! and configuration parsing live in the embedding pooler and reach the
//! core only through the [`PoolerHooks`] trait and the opaque io slot on
//! each [`Server`].
//!
//! ## Concepts
//!
//! ### Rules
//! A [`Rule`] matches clients by database/user pattern and carries the pool
//! policy for matched traffic: server pool size and idle TTL, a per-route
//! client cap, and the backend storage address. Rules are immutable once
//! published; a reload ([`Router::reconfigure`]) marks superseded rules
//! obsolete and lets garbage collection retire them once unreferenced.
//!
//! ### Routes
//! A route binds one `(database, user)` pair (its [`RouteId`], after any
//! per-rule rewrite) to one rule version, with its own client and server
//! pools. Routes appear on demand as clients are admitted and disappear via
//! [`Router::gc`] once empty.
//!
//! ### Sessions
//! A session calls [`Router::route`] once at startup, then
//! [`Router::attach`]/[`Router::detach`] around every transaction (or once
//! for session pooling), and [`Router::unroute`] on disconnect.
//! [`Router::expire`] and [`Router::gc`] run on a one-second tick.
//!
//! ## Example
//! ```
//! use std::sync::Arc;
//!
//! use pgrelay::{
//!     CancelKey, Client, IdGenerator, NoopHooks, PoolerConfig, Router, Rule, RuleSet, Startup,
//! };
//!
//! let mut rules = RuleSet::new();
//! rules.add(Rule::new("*", "*").with_pool_size(8).with_pool_ttl(60));
//!
//! let router = Router::new(Box::new(NoopHooks));
//! router.reconfigure(rules);
//!
//! let ids = IdGenerator::new();
//! let config = PoolerConfig::new();
//!
//! let client = Arc::new(Client::new(
//!     ids.generate('c'),
//!     Startup::new("app", "alice"),
//!     CancelKey::generate(),
//! ));
//! router.route(&config, &client)?;
//! let server = router.attach(&config, &ids, &client)?;
//! assert!(server.client().is_some());
//!
//! // ... the session pumps bytes between the two connections ...
//!
//! router.detach(&config, &client);
//! router.unroute(&client);
//! # Ok::<(), pgrelay::RouterError>(())
//! ```

mod config;
mod error;
mod hooks;
mod ident;
mod key;
pub mod router;

pub use config::PoolerConfig;
pub use error::{Result, RouterError};
pub use hooks::{NoopHooks, PoolerHooks};
pub use ident::{IdGenerator, SessionId};
pub use key::CancelKey;
pub use router::{
    Cancel, Client, ClientState, RouteId, Router, RouteStats, Rule, RuleSet, RuleStorage, Server,
    ServerState, Startup,
};
