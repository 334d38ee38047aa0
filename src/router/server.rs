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

use std::any::Any;
use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use parking_lot::Mutex;

use super::client::Client;
use super::route::Route;
use crate::ident::SessionId;
use crate::key::CancelKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerState {
    #[default]
    Undef,
    /// In the server pool, no client.
    Idle,
    /// Bound to a client.
    Active,
    /// Transient, held by backend code via [`Router::hold_server`]:
    /// being evicted.
    ///
    /// [`Router::hold_server`]: crate::Router::hold_server
    Expire,
    /// Transient, held by backend code: dialing the backend. Fresh servers
    /// built by `attach` also pass through this state.
    Connect,
    /// Transient, held by backend code: between-session reset.
    Reset,
}

impl ServerState {
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, Self::Expire | Self::Connect | Self::Reset)
    }
}

/// A backend connection handle.
///
/// Owned by exactly one route. `key` is the secret the backend issued for
/// this connection; `key_client` is a copy of the forged key of whichever
/// client currently holds the server, kept so a later cancel request can
/// find it. The io slot is opaque to the core and owned by the embedder's
/// backend code; only the worker running the attached session may touch it.
pub struct Server {
    id: SessionId,
    key: CancelKey,
    io: Mutex<Option<Box<dyn Any + Send>>>,
    link: AtomicRefCell<ServerLink>,
}

#[derive(Default)]
struct ServerLink {
    state: ServerState,
    key_client: CancelKey,
    idle_time: u64,
    route: Option<Arc<Route>>,
    client: Option<Arc<Client>>,
    last_client_id: Option<SessionId>,
}

impl Debug for Server {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server").field("id", &self.id).finish()
    }
}

impl Server {
    pub(crate) fn new(id: SessionId, key: CancelKey) -> Self {
        Self {
            id,
            key,
            io: Mutex::new(None),
            link: AtomicRefCell::new(ServerLink::default()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The backend-issued cancellation secret.
    pub fn key(&self) -> CancelKey {
        self.key
    }

    pub fn state(&self) -> ServerState {
        self.link.borrow().state
    }

    /// Seconds this server has spent idle since it was last detached.
    pub fn idle_time(&self) -> u64 {
        self.link.borrow().idle_time
    }

    pub fn last_client_id(&self) -> Option<SessionId> {
        self.link.borrow().last_client_id
    }

    /// The attached client; `Some` iff the server is `Active`.
    pub fn client(&self) -> Option<Arc<Client>> {
        self.link.borrow().client.clone()
    }

    pub(crate) fn route(&self) -> Option<Arc<Route>> {
        self.link.borrow().route.clone()
    }

    pub(crate) fn set_route(&self, route: Option<Arc<Route>>) {
        self.link.borrow_mut().route = route;
    }

    pub(crate) fn key_client(&self) -> CancelKey {
        self.link.borrow().key_client
    }

    /// Start serving a client: reset the idle clock and remember its forged
    /// key for cancel matching.
    pub(crate) fn begin_session(&self, key_client: CancelKey) {
        let mut link = self.link.borrow_mut();
        link.idle_time = 0;
        link.key_client = key_client;
    }

    pub(crate) fn set_client(&self, client: Option<Arc<Client>>) {
        self.link.borrow_mut().client = client;
    }

    pub(crate) fn set_last_client_id(&self, id: SessionId) {
        self.link.borrow_mut().last_client_id = Some(id);
    }

    fn set_state(&self, state: ServerState) {
        self.link.borrow_mut().state = state;
    }

    /// Park the embedder's io handle on this server.
    pub fn put_io(&self, io: Box<dyn Any + Send>) {
        *self.io.lock() = Some(io);
    }

    pub fn take_io(&self) -> Option<Box<dyn Any + Send>> {
        self.io.lock().take()
    }

    pub fn has_io(&self) -> bool {
        self.io.lock().is_some()
    }
}

/// Per-route set of servers partitioned by state, plus a reservation count
/// for servers under construction outside the route mutex.
///
/// The idle partition is a FIFO so a detached server is the next one
/// reused, keeping its backend session warm. `reserved` is what stops a
/// bounded pool from overshooting `pool_size` while an attacher builds a
/// server with the lock dropped, and what stops GC from collecting the
/// route out from under that attacher.
#[derive(Debug, Default)]
pub(crate) struct ServerPool {
    idle: VecDeque<Arc<Server>>,
    active: Vec<Arc<Server>>,
    transient: Vec<Arc<Server>>,
    reserved: usize,
}

impl ServerPool {
    /// Move a server into `state`, updating partitions and the server's own
    /// link record. `Undef` removes the server from the pool.
    pub(crate) fn set(&mut self, server: &Arc<Server>, state: ServerState) {
        let prev = server.state();
        if prev == state {
            return;
        }
        match prev {
            ServerState::Undef => {}
            ServerState::Idle => {
                let pos = self
                    .idle
                    .iter()
                    .position(|s| s.id() == server.id())
                    .expect("server missing from idle partition");
                let _ = self.idle.remove(pos);
            }
            ServerState::Active => remove_from(&mut self.active, server),
            _ => remove_from(&mut self.transient, server),
        }
        match state {
            ServerState::Undef => {}
            ServerState::Idle => self.idle.push_back(Arc::clone(server)),
            ServerState::Active => self.active.push(Arc::clone(server)),
            _ => self.transient.push(Arc::clone(server)),
        }
        server.set_state(state);
    }

    /// Oldest idle server, left in place; `set(.., Active)` claims it.
    pub(crate) fn next_idle(&self) -> Option<Arc<Server>> {
        self.idle.front().map(Arc::clone)
    }

    pub(crate) fn idle(&self) -> usize {
        self.idle.len()
    }

    pub(crate) fn active(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn transient(&self) -> usize {
        self.transient.len()
    }

    pub(crate) fn total(&self) -> usize {
        self.idle.len() + self.active.len() + self.transient.len()
    }

    /// Pool occupancy as counted against `pool_size`: every server in the
    /// pool plus every reservation in flight.
    pub(crate) fn occupancy(&self) -> usize {
        self.total() + self.reserved
    }

    pub(crate) fn reserve(&mut self) {
        self.reserved += 1;
    }

    pub(crate) fn unreserve(&mut self) {
        assert!(self.reserved > 0, "server reservation underflow");
        self.reserved -= 1;
    }

    /// Obsolete-rule eviction: hand every idle server to the caller,
    /// removing them from the pool but leaving the state `Idle` (transient
    /// references the caller closes outside any lock).
    pub(crate) fn drain_idle(&mut self, out: &mut Vec<Arc<Server>>) -> usize {
        let count = self.idle.len();
        out.extend(self.idle.drain(..));
        count
    }

    /// One-second TTL tick over the idle partition: age every server and
    /// evict the ones whose idle time reached `ttl` as `Undef`.
    pub(crate) fn tick_idle(&mut self, ttl: u64, out: &mut Vec<Arc<Server>>) -> usize {
        let mut count = 0;
        let mut kept = VecDeque::with_capacity(self.idle.len());
        while let Some(server) = self.idle.pop_front() {
            let expired = {
                let mut link = server.link.borrow_mut();
                link.idle_time += 1;
                link.idle_time >= ttl
            };
            if expired {
                server.set_state(ServerState::Undef);
                out.push(server);
                count += 1;
            } else {
                kept.push_back(server);
            }
        }
        self.idle = kept;
        count
    }

    pub(crate) fn find_active(&self, pred: impl Fn(&Server) -> bool) -> Option<Arc<Server>> {
        self.active.iter().find(|s| pred(s)).map(Arc::clone)
    }
}

fn remove_from(partition: &mut Vec<Arc<Server>>, server: &Arc<Server>) {
    let pos = partition
        .iter()
        .position(|s| s.id() == server.id())
        .expect("server missing from its state partition");
    partition.swap_remove(pos);
}
