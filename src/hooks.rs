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

use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

use crate::router::{Client, Server};

/// Collaborator surface the embedding pooler provides to the router.
///
/// The router owns admission and pool state; everything that touches a
/// socket or a session's control flow goes through here. `kill_client` is
/// invoked with router (and route) locks held and must only flag the session
/// and return; the actual teardown happens at the session's next safe point.
#[cfg_attr(test, automock)]
pub trait PoolerHooks: Send + Sync {
    /// Attach the server's io handle to the calling worker's reactor.
    /// Called after `attach`, outside any lock, on multi-worker configs.
    fn io_attach(&self, server: &Server) {
        let _ = server;
    }

    /// Detach the server's io handle from the current worker's reactor.
    /// Called before `detach` takes the route lock, on multi-worker configs.
    fn io_detach(&self, server: &Server) {
        let _ = server;
    }

    /// Close the backend connection. Must leave the server's io slot empty.
    fn close_connection(&self, server: &Server) {
        drop(server.take_io());
    }

    /// Request that a client session terminates at its next safe point.
    fn kill_client(&self, client: &Arc<Client>) {
        let _ = client;
    }
}

/// Hooks for embedders that run a single worker and manage io out of band.
#[derive(Debug, Default)]
pub struct NoopHooks;

impl PoolerHooks for NoopHooks {}
