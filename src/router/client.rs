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

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use atomic_refcell::AtomicRefCell;

use super::route::Route;
use super::rules::Rule;
use super::server::Server;
use crate::ident::SessionId;
use crate::key::CancelKey;

/// The startup record a client presented: which database and user it wants.
/// Equality is bytewise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Startup {
    database: String,
    user: String,
}

impl Startup {
    pub fn new(database: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            user: user.into(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn user(&self) -> &str {
        &self.user
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    #[default]
    Undef,
    /// Admitted to a route, no server attached.
    Pending,
    /// Holding a server.
    Active,
    /// Waiting in line for a saturated server pool.
    Queue,
}

/// A client session handle.
///
/// Owned by exactly one route while admitted. The link record (state, rule,
/// route, and server back-references) is mutated only under the owning
/// route's mutex; the `AtomicRefCell` turns a violation of that protocol
/// into a panic instead of a data race.
pub struct Client {
    id: SessionId,
    startup: Startup,
    key: CancelKey,
    disconnected: AtomicBool,
    link: AtomicRefCell<ClientLink>,
}

#[derive(Default)]
struct ClientLink {
    state: ClientState,
    rule: Option<Arc<Rule>>,
    route: Option<Arc<Route>>,
    server: Option<Arc<Server>>,
}

impl Debug for Client {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("startup", &self.startup)
            .finish()
    }
}

impl Client {
    /// `key` is the forged cancellation key handed to this client during
    /// startup negotiation.
    pub fn new(id: SessionId, startup: Startup, key: CancelKey) -> Self {
        Self {
            id,
            startup,
            key,
            disconnected: AtomicBool::new(false),
            link: AtomicRefCell::new(ClientLink::default()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn startup(&self) -> &Startup {
        &self.startup
    }

    pub fn key(&self) -> CancelKey {
        self.key
    }

    pub fn state(&self) -> ClientState {
        self.link.borrow().state
    }

    pub fn rule(&self) -> Option<Arc<Rule>> {
        self.link.borrow().rule.clone()
    }

    /// The attached server; `Some` iff the client is `Active`.
    pub fn server(&self) -> Option<Arc<Server>> {
        self.link.borrow().server.clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub(crate) fn set_disconnected(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    pub(crate) fn route(&self) -> Option<Arc<Route>> {
        self.link.borrow().route.clone()
    }

    pub(crate) fn bind_route(&self, rule: Arc<Rule>, route: Arc<Route>) {
        let mut link = self.link.borrow_mut();
        link.rule = Some(rule);
        link.route = Some(route);
    }

    pub(crate) fn clear_route(&self) {
        let mut link = self.link.borrow_mut();
        link.rule = None;
        link.route = None;
    }

    pub(crate) fn set_server(&self, server: Option<Arc<Server>>) {
        self.link.borrow_mut().server = server;
    }

    fn set_state(&self, state: ClientState) {
        self.link.borrow_mut().state = state;
    }
}

/// Per-route set of clients partitioned by state. Lives behind the route
/// mutex; the queue partition is the FIFO for pool-saturation waiters.
#[derive(Debug, Default)]
pub(crate) struct ClientPool {
    pending: Vec<Arc<Client>>,
    active: Vec<Arc<Client>>,
    queue: VecDeque<Arc<Client>>,
}

impl ClientPool {
    /// Move a client into `state`, updating partitions and the client's own
    /// link record. `Undef` removes the client from the pool.
    pub(crate) fn set(&mut self, client: &Arc<Client>, state: ClientState) {
        let prev = client.state();
        if prev == state {
            return;
        }
        match prev {
            ClientState::Undef => {}
            ClientState::Pending => remove_from(&mut self.pending, client),
            ClientState::Active => remove_from(&mut self.active, client),
            ClientState::Queue => {
                let pos = self
                    .queue
                    .iter()
                    .position(|c| c.id() == client.id())
                    .expect("client missing from queue partition");
                let _ = self.queue.remove(pos);
            }
        }
        match state {
            ClientState::Undef => {}
            ClientState::Pending => self.pending.push(Arc::clone(client)),
            ClientState::Active => self.active.push(Arc::clone(client)),
            ClientState::Queue => self.queue.push_back(Arc::clone(client)),
        }
        client.set_state(state);
    }

    pub(crate) fn total(&self) -> usize {
        self.pending.len() + self.active.len() + self.queue.len()
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn active(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn queue_head(&self) -> Option<&Arc<Client>> {
        self.queue.front()
    }

    pub(crate) fn find(&self, id: SessionId) -> Option<Arc<Client>> {
        self.iter().find(|c| c.id() == id).map(Arc::clone)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Client>> {
        self.pending
            .iter()
            .chain(self.active.iter())
            .chain(self.queue.iter())
    }
}

fn remove_from(partition: &mut Vec<Arc<Client>>, client: &Arc<Client>) {
    let pos = partition
        .iter()
        .position(|c| c.id() == client.id())
        .expect("client missing from its state partition");
    partition.swap_remove(pos);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::IdGenerator;

    fn client(ids: &IdGenerator) -> Arc<Client> {
        Arc::new(Client::new(
            ids.generate('c'),
            Startup::new("app", "alice"),
            CancelKey::generate(),
        ))
    }

    #[test]
    fn set_moves_between_partitions() {
        let ids = IdGenerator::new();
        let mut pool = ClientPool::default();
        let c = client(&ids);

        pool.set(&c, ClientState::Pending);
        assert_eq!(c.state(), ClientState::Pending);
        assert_eq!((pool.pending(), pool.active(), pool.queued()), (1, 0, 0));

        pool.set(&c, ClientState::Active);
        assert_eq!(c.state(), ClientState::Active);
        assert_eq!((pool.pending(), pool.active(), pool.queued()), (0, 1, 0));

        pool.set(&c, ClientState::Undef);
        assert_eq!(c.state(), ClientState::Undef);
        assert_eq!(pool.total(), 0);
    }

    #[test]
    fn queue_preserves_arrival_order() {
        let ids = IdGenerator::new();
        let mut pool = ClientPool::default();
        let a = client(&ids);
        let b = client(&ids);
        pool.set(&a, ClientState::Queue);
        pool.set(&b, ClientState::Queue);
        assert_eq!(pool.queue_head().unwrap().id(), a.id());
        pool.set(&a, ClientState::Pending);
        assert_eq!(pool.queue_head().unwrap().id(), b.id());
    }

    #[test]
    fn find_searches_every_partition() {
        let ids = IdGenerator::new();
        let mut pool = ClientPool::default();
        let a = client(&ids);
        let b = client(&ids);
        let c = client(&ids);
        pool.set(&a, ClientState::Pending);
        pool.set(&b, ClientState::Active);
        pool.set(&c, ClientState::Queue);
        for needle in [&a, &b, &c] {
            assert_eq!(pool.find(needle.id()).unwrap().id(), needle.id());
        }
        assert!(pool.find(ids.generate('c')).is_none());
    }
}
