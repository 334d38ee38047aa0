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

//! The router: admission, server attachment, cancellation, reload, and the
//! periodic expire/GC passes over the shared route state.
//!
//! Locking is two-level. The router mutex serialises structural changes
//! (rule set, route pool, the global client counter); each route's mutex
//! serialises its client and server pools. To take both, the router lock is
//! taken first and released as soon as the route lock is held; a route lock
//! is never held while acquiring the router lock.

mod client;
mod route;
mod route_pool;
mod rules;
mod server;

use std::sync::Arc;

use itertools::Itertools;
use log::{debug, info};
use parking_lot::Mutex;

pub use client::{Client, ClientState, Startup};
pub use route::RouteId;
pub use rules::{Rule, RuleSet, RuleStorage};
pub use server::{Server, ServerState};

use crate::config::PoolerConfig;
use crate::error::{Result, RouterError};
use crate::hooks::PoolerHooks;
use crate::ident::{IdGenerator, SessionId};
use crate::key::CancelKey;
use route_pool::RoutePool;

/// Everything a cancel connection needs to reach the right backend:
/// the target server's id, its backend-issued secret, and a copy of the
/// rule's storage address, detached from all router state.
#[derive(Debug, Clone)]
pub struct Cancel {
    pub server_id: SessionId,
    pub key: CancelKey,
    pub storage: RuleStorage,
}

/// Pool counters for one route, as reported by [`Router::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteStats {
    pub clients_pending: usize,
    pub clients_active: usize,
    pub clients_queued: usize,
    pub servers_idle: usize,
    pub servers_active: usize,
    pub servers_transient: usize,
}

struct RouterInner {
    rules: RuleSet,
    routes: RoutePool,
    clients: usize,
}

/// The top-level facade over rules, routes, and pools.
///
/// One instance is shared by every worker thread; embedders pass it around
/// explicitly rather than stashing it in a global. All operations return in
/// bounded time except [`Router::attach`], which may block while a bounded
/// server pool is saturated (cancellable via [`Router::disconnect`]).
pub struct Router {
    inner: Mutex<RouterInner>,
    hooks: Box<dyn PoolerHooks>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new(Box::new(crate::hooks::NoopHooks))
    }
}

impl Router {
    pub fn new(hooks: Box<dyn PoolerHooks>) -> Self {
        Self {
            inner: Mutex::new(RouterInner {
                rules: RuleSet::new(),
                routes: RoutePool::default(),
                clients: 0,
            }),
            hooks,
        }
    }

    /// Number of admitted clients across all routes.
    pub fn clients(&self) -> usize {
        self.inner.lock().clients
    }

    /// Number of live routes.
    pub fn routes(&self) -> usize {
        self.inner.lock().routes.len()
    }

    /// Admit a client: match a rule, find or create the route, and place the
    /// client in the route's pool as `Pending`.
    pub fn route(&self, config: &PoolerConfig, client: &Arc<Client>) -> Result<()> {
        let startup = client.startup();
        assert!(
            !startup.database().is_empty() && !startup.user().is_empty(),
            "client startup record is incomplete"
        );

        let mut inner = self.inner.lock();

        let rule = inner
            .rules
            .forward(startup.database(), startup.user())
            .ok_or_else(|| RouterError::NoRule {
                database: startup.database().to_owned(),
                user: startup.user().to_owned(),
            })?;

        let id = RouteId::resolve(startup, &rule);

        if let Some(limit) = config.client_max() {
            if inner.clients >= limit {
                return Err(RouterError::ClientLimit { limit });
            }
        }

        let route = match inner.routes.matching(&id, &rule) {
            Some(route) => route,
            None => inner.routes.create(id, Arc::clone(&rule), true),
        };

        inner.clients += 1;
        rule.incref();

        // hand-off: take the route lock, then let go of the router lock
        let mut pools = route.lock();
        drop(inner);

        if let Some(limit) = rule.client_max() {
            if pools.clients.total() >= limit {
                drop(pools);
                let mut inner = self.inner.lock();
                assert!(inner.clients > 0, "router client counter underflow");
                inner.clients -= 1;
                rule.decref();
                drop(inner);
                return Err(RouterError::RouteClientLimit { limit });
            }
        }

        pools.clients.set(client, ClientState::Pending);
        client.bind_route(Arc::clone(&rule), Arc::clone(&route));
        Ok(())
    }

    /// Remove a disconnecting client from its route. The client must have
    /// detached (or closed) its server first.
    pub fn unroute(&self, client: &Arc<Client>) {
        let route = client.route().expect("unroute requires a routed client");
        assert!(
            client.server().is_none(),
            "unroute with a server still attached"
        );
        let rule = client.rule().expect("routed client without a rule");

        {
            let mut inner = self.inner.lock();
            assert!(inner.clients > 0, "router client counter underflow");
            inner.clients -= 1;
            rule.decref();
        }

        let mut pools = route.lock();
        pools.clients.set(client, ClientState::Undef);
        client.clear_route();
    }

    /// Lend the client a server from its route's pool.
    ///
    /// Takes the oldest idle server when one exists. Otherwise, while the
    /// pool has spare capacity (or is unbounded), a fresh server is built
    /// with the route lock dropped, under a reservation so concurrent
    /// attachers cannot overshoot `pool_size`. At capacity the client moves
    /// to the `Queue` partition and waits on the route condvar until
    /// `detach`/`close` frees a server, in arrival order.
    pub fn attach(
        &self,
        config: &PoolerConfig,
        ids: &IdGenerator,
        client: &Arc<Client>,
    ) -> Result<Arc<Server>> {
        let route = client.route().expect("attach requires a routed client");
        let pool_size = route.rule().pool_size();

        let mut pools = route.lock();
        let server = loop {
            if let Some(server) = pools.servers.next_idle() {
                break server;
            }

            if pool_size == 0 || pools.servers.occupancy() < pool_size {
                pools.servers.reserve();
                drop(pools);
                let fresh = Arc::new(Server::new(ids.generate('s'), CancelKey::generate()));
                fresh.set_route(Some(Arc::clone(&route)));
                pools = route.lock();
                pools.servers.unreserve();
                // another session may have detached meanwhile; its server
                // is warm, prefer it
                match pools.servers.next_idle() {
                    Some(server) => break server,
                    None => {
                        // a new connection enters the pool dialing
                        pools.servers.set(&fresh, ServerState::Connect);
                        break fresh;
                    }
                }
            }

            // pool saturated: wait in line
            pools.clients.set(client, ClientState::Queue);
            loop {
                if client.is_disconnected() {
                    pools.clients.set(client, ClientState::Pending);
                    return Err(RouterError::WaitCancelled);
                }
                let at_head = pools
                    .clients
                    .queue_head()
                    .map_or(false, |head| head.id() == client.id());
                if at_head
                    && (pools.servers.idle() > 0 || pools.servers.occupancy() < pool_size)
                {
                    pools.clients.set(client, ClientState::Pending);
                    break;
                }
                route.wait(&mut pools);
            }
        };

        pools.servers.set(&server, ServerState::Active);
        pools.clients.set(client, ClientState::Active);
        client.set_server(Some(Arc::clone(&server)));
        server.set_client(Some(Arc::clone(client)));
        server.begin_session(client.key());
        drop(pools);

        if config.is_multi_worker() {
            self.hooks.io_attach(&server);
        }
        Ok(server)
    }

    /// Return the client's server to the route pool as idle and wake the
    /// head of the saturation queue, if any.
    pub fn detach(&self, config: &PoolerConfig, client: &Arc<Client>) {
        let server = client.server().expect("detach requires an attached server");
        if config.is_multi_worker() {
            self.hooks.io_detach(&server);
        }

        let route = client.route().expect("detach requires a routed client");
        let mut pools = route.lock();
        client.set_server(None);
        server.set_client(None);
        server.set_last_client_id(client.id());
        pools.servers.set(&server, ServerState::Idle);
        pools.clients.set(client, ClientState::Pending);
        route.notify();
    }

    /// Discard an unusable server connection. The backend hook closes the
    /// connection (and must empty the io slot) before the server leaves the
    /// pool; the freed capacity wakes queued attachers.
    pub fn close(&self, client: &Arc<Client>) {
        let server = client.server().expect("close requires an attached server");
        self.hooks.close_connection(&server);
        assert!(
            !server.has_io(),
            "close_connection must release the server io handle"
        );

        let route = client.route().expect("close requires a routed client");
        let mut pools = route.lock();
        pools.clients.set(client, ClientState::Pending);
        pools.servers.set(&server, ServerState::Undef);
        client.set_server(None);
        server.set_client(None);
        server.set_last_client_id(client.id());
        server.set_route(None);
        route.notify();
    }

    /// Take an idle server out of circulation for a backend-owned phase:
    /// re-dialing it (`Connect`), running a between-session reset (`Reset`),
    /// or evicting it (`Expire`). The server stays in its route's pool and
    /// keeps counting toward `pool_size` occupancy until it is released or
    /// discarded. Returns `false` when an attacher claimed the server first.
    ///
    /// The caller owns the server while it is held and must finish with
    /// [`Router::release_server`] or [`Router::discard_server`].
    pub fn hold_server(&self, server: &Arc<Server>, state: ServerState) -> bool {
        assert!(
            state.is_transient(),
            "hold_server takes a Connect, Reset, or Expire state"
        );
        let route = server.route().expect("held server must belong to a route");
        let mut pools = route.lock();
        if server.state() != ServerState::Idle {
            return false;
        }
        pools.servers.set(server, state);
        true
    }

    /// Return a held server to the idle pool, waking queued attachers.
    pub fn release_server(&self, server: &Arc<Server>) {
        let route = server.route().expect("held server must belong to a route");
        let mut pools = route.lock();
        assert!(
            server.state().is_transient(),
            "release_server requires a held server"
        );
        pools.servers.set(server, ServerState::Idle);
        route.notify();
    }

    /// Close a held server and drop it from its route's pool. The backend
    /// hook must empty the io slot; the freed capacity wakes queued
    /// attachers, and the route itself is left for [`Router::gc`].
    pub fn discard_server(&self, server: &Arc<Server>) {
        assert!(
            server.state().is_transient(),
            "discard_server requires a held server"
        );
        self.hooks.close_connection(server);
        assert!(
            !server.has_io(),
            "close_connection must release the server io handle"
        );

        let route = server.route().expect("held server must belong to a route");
        let mut pools = route.lock();
        pools.servers.set(server, ServerState::Undef);
        server.set_route(None);
        route.notify();
    }

    /// Locate the active server a forged cancellation key points at.
    pub fn cancel(&self, key: &CancelKey) -> Result<Cancel> {
        let inner = self.inner.lock();
        for route in inner.routes.iter() {
            let pools = route.lock();
            let found = pools
                .servers
                .find_active(|server| server.key_client().ct_eq(key));
            if let Some(server) = found {
                return Ok(Cancel {
                    server_id: server.id(),
                    key: server.key(),
                    storage: route.rule().storage().clone(),
                });
            }
        }
        Err(RouterError::UnknownCancelKey)
    }

    /// Merge a freshly parsed rule set into the live one. Clients of routes
    /// whose rule became obsolete are flagged for termination through the
    /// `kill_client` hook; routes and rules themselves are reclaimed later
    /// by [`Router::gc`].
    pub fn reconfigure(&self, rules: RuleSet) -> usize {
        let mut inner = self.inner.lock();
        let updates = inner.rules.merge(rules);
        if updates > 0 {
            info!("configuration reloaded: {} rule update(s)", updates);
            for route in inner.routes.iter() {
                if !route.rule().is_obsolete() {
                    continue;
                }
                let pools = route.lock();
                for client in pools.clients.iter() {
                    self.hooks.kill_client(client);
                }
            }
        }
        updates
    }

    /// One-hertz idle pass. Appends evicted servers to `expire_list` so the
    /// caller can close their io outside any lock; returns how many.
    ///
    /// Routes of an obsolete rule with no clients left surrender all their
    /// idle servers at once; everywhere else idle servers age by one second
    /// and leave once they reach the rule's `pool_ttl`.
    pub fn expire(&self, expire_list: &mut Vec<Arc<Server>>) -> usize {
        let inner = self.inner.lock();
        let mut count = 0;
        for route in inner.routes.iter() {
            let mut pools = route.lock();

            if route.rule().is_obsolete() && pools.clients.total() == 0 {
                count += pools.servers.drain_idle(expire_list);
                continue;
            }

            let ttl = route.rule().pool_ttl();
            if ttl == 0 {
                continue;
            }
            let expired = pools.servers.tick_idle(ttl, expire_list);
            if expired > 0 {
                debug!("route {}: {} idle server(s) expired", route.id(), expired);
                route.notify();
            }
            count += expired;
        }
        count
    }

    /// Drop empty routes that are dynamic or whose rule is obsolete,
    /// releasing the rule reference each route holds. Runs on the expire
    /// cadence; a route emptied by one tick is reaped by a later one.
    pub fn gc(&self) {
        let mut inner = self.inner.lock();
        inner.routes.retain(|route| {
            {
                let pools = route.lock();
                // occupancy, not total: a reservation means an attacher is
                // mid-allocation and still holds a pointer to this route
                if pools.clients.total() > 0 || pools.servers.occupancy() > 0 {
                    return true;
                }
                if !route.is_dynamic() && !route.rule().is_obsolete() {
                    return true;
                }
            }
            route.rule().decref();
            debug!("gc: dropping route {}", route.id());
            false
        });
    }

    /// Flag the client session with `id` for termination via the
    /// `kill_client` hook. Returns whether the client was found.
    pub fn kill(&self, id: SessionId) -> bool {
        let inner = self.inner.lock();
        for route in inner.routes.iter() {
            let pools = route.lock();
            if let Some(client) = pools.clients.find(id) {
                self.hooks.kill_client(&client);
                return true;
            }
        }
        false
    }

    /// Signal that a client's connection is gone. A queued attach on this
    /// client unblocks with [`RouterError::WaitCancelled`]; the session then
    /// runs its normal unroute path.
    pub fn disconnect(&self, client: &Arc<Client>) {
        client.set_disconnected();
        let inner = self.inner.lock();
        for route in inner.routes.iter() {
            // taking the route lock serialises this with a waiter between
            // its disconnect check and its wait, so no wakeup is lost
            drop(route.lock());
            route.notify();
        }
    }

    /// Invoke `callback` once per route, in route-id order, with that
    /// route's pool counters.
    pub fn stat(&self, mut callback: impl FnMut(&RouteId, &RouteStats)) {
        let inner = self.inner.lock();
        for route in inner
            .routes
            .iter()
            .sorted_unstable_by_key(|route| route.id().clone())
        {
            let stats = {
                let pools = route.lock();
                RouteStats {
                    clients_pending: pools.clients.pending(),
                    clients_active: pools.clients.active(),
                    clients_queued: pools.clients.queued(),
                    servers_idle: pools.servers.idle(),
                    servers_active: pools.servers.active(),
                    servers_transient: pools.servers.transient(),
                }
            };
            callback(route.id(), &stats);
        }
    }

    /// Provision a static route for `(database, user)` under the currently
    /// matching rule. Static routes survive GC while their rule is current;
    /// admission only ever creates dynamic ones.
    pub fn assure_route(&self, database: &str, user: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let rule = inner
            .rules
            .forward(database, user)
            .ok_or_else(|| RouterError::NoRule {
                database: database.to_owned(),
                user: user.to_owned(),
            })?;
        let id = RouteId::resolve(&Startup::new(database, user), &rule);
        if inner.routes.matching(&id, &rule).is_none() {
            inner.routes.create(id, Arc::clone(&rule), false);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::hooks::{MockPoolerHooks, NoopHooks};

    fn router_with(rules: Vec<Rule>) -> Router {
        let _ = env_logger::builder().is_test(true).try_init();
        let router = Router::new(Box::new(NoopHooks));
        let mut set = RuleSet::new();
        for rule in rules {
            set.add(rule);
        }
        router.reconfigure(set);
        router
    }

    fn make_client(ids: &IdGenerator, database: &str, user: &str) -> Arc<Client> {
        Arc::new(Client::new(
            ids.generate('c'),
            Startup::new(database, user),
            CancelKey::generate(),
        ))
    }

    fn queued_clients(router: &Router) -> usize {
        let mut queued = 0;
        router.stat(|_, stats| queued += stats.clients_queued);
        queued
    }

    fn assert_client_counter_invariant(router: &Router) {
        let mut sum = 0;
        router.stat(|_, stats| {
            sum += stats.clients_pending + stats.clients_active + stats.clients_queued
        });
        assert_eq!(router.clients(), sum);
    }

    fn wait_until(what: &str, mut pred: impl FnMut() -> bool) {
        for _ in 0..5000 {
            if pred() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("timed out waiting for {}", what);
    }

    #[test]
    fn admission_under_global_limit() {
        let router = router_with(vec![Rule::new("app", "*")]);
        let config = PoolerConfig::new().with_client_max(2);
        let ids = IdGenerator::new();

        let c1 = make_client(&ids, "app", "u");
        let c2 = make_client(&ids, "app", "u");
        let c3 = make_client(&ids, "app", "u");
        router.route(&config, &c1).unwrap();
        router.route(&config, &c2).unwrap();
        let err = router.route(&config, &c3).unwrap_err();
        assert!(matches!(err, RouterError::ClientLimit { limit: 2 }));

        router.unroute(&c1);
        let c4 = make_client(&ids, "app", "u");
        router.route(&config, &c4).unwrap();
        assert_eq!(router.clients(), 2);
        assert_client_counter_invariant(&router);
    }

    #[test]
    fn route_without_matching_rule_is_rejected() {
        let router = router_with(vec![Rule::new("app", "alice")]);
        let ids = IdGenerator::new();
        let client = make_client(&ids, "app", "bob");
        let err = router.route(&PoolerConfig::new(), &client).unwrap_err();
        assert!(matches!(err, RouterError::NoRule { .. }));
        assert_eq!(router.clients(), 0);
        assert_eq!(router.routes(), 0);
    }

    #[test]
    fn per_route_limit_with_storage_override() {
        let router = router_with(vec![Rule::new("app", "*")
            .with_storage_db("pg")
            .with_client_max(1)]);
        let config = PoolerConfig::new();
        let ids = IdGenerator::new();

        let c1 = make_client(&ids, "app", "u");
        let c2 = make_client(&ids, "app", "u");
        router.route(&config, &c1).unwrap();
        let err = router.route(&config, &c2).unwrap_err();
        assert!(matches!(err, RouterError::RouteClientLimit { limit: 1 }));

        let mut seen = Vec::new();
        router.stat(|id, _| seen.push(id.clone()));
        assert_eq!(seen, vec![RouteId::new("pg", "u")]);
        assert_eq!(router.clients(), 1);
        assert_client_counter_invariant(&router);
    }

    #[test]
    fn attach_detach_reuses_the_idle_server() {
        let router = router_with(vec![Rule::new("app", "*").with_pool_size(1)]);
        let config = PoolerConfig::new();
        let ids = IdGenerator::new();

        let a = make_client(&ids, "app", "u");
        router.route(&config, &a).unwrap();
        let sa = router.attach(&config, &ids, &a).unwrap();
        assert_eq!(a.state(), ClientState::Active);
        assert_eq!(sa.state(), ServerState::Active);
        assert_eq!(sa.client().unwrap().id(), a.id());

        router.detach(&config, &a);
        assert_eq!(a.state(), ClientState::Pending);
        assert_eq!(sa.state(), ServerState::Idle);
        assert!(a.server().is_none());

        let b = make_client(&ids, "app", "u");
        router.route(&config, &b).unwrap();
        let sb = router.attach(&config, &ids, &b).unwrap();
        assert_eq!(sb.id(), sa.id());
        assert_eq!(sb.last_client_id(), Some(a.id()));
        assert_client_counter_invariant(&router);
    }

    #[test]
    fn bounded_pool_grows_up_to_pool_size() {
        let router = router_with(vec![Rule::new("app", "*").with_pool_size(2)]);
        let config = PoolerConfig::new();
        let ids = IdGenerator::new();

        let a = make_client(&ids, "app", "u");
        let b = make_client(&ids, "app", "u");
        router.route(&config, &a).unwrap();
        router.route(&config, &b).unwrap();
        let sa = router.attach(&config, &ids, &a).unwrap();
        let sb = router.attach(&config, &ids, &b).unwrap();
        assert_ne!(sa.id(), sb.id());

        let mut active = 0;
        router.stat(|_, stats| active += stats.servers_active);
        assert_eq!(active, 2);
    }

    #[test]
    fn unbounded_pool_allocates_per_client() {
        let router = router_with(vec![Rule::new("app", "*")]);
        let config = PoolerConfig::new();
        let ids = IdGenerator::new();

        let a = make_client(&ids, "app", "u");
        let b = make_client(&ids, "app", "u");
        router.route(&config, &a).unwrap();
        router.route(&config, &b).unwrap();
        let sa = router.attach(&config, &ids, &a).unwrap();
        let sb = router.attach(&config, &ids, &b).unwrap();
        assert_ne!(sa.id(), sb.id());
    }

    #[test]
    fn idle_expiration_then_gc_reclaims_the_route() {
        let router = router_with(vec![Rule::new("app", "*")
            .with_pool_size(1)
            .with_pool_ttl(2)]);
        let config = PoolerConfig::new();
        let ids = IdGenerator::new();

        let a = make_client(&ids, "app", "u");
        router.route(&config, &a).unwrap();
        let sa = router.attach(&config, &ids, &a).unwrap();
        router.detach(&config, &a);
        router.unroute(&a);

        let mut expire_list = Vec::new();
        assert_eq!(router.expire(&mut expire_list), 0);
        assert_eq!(sa.idle_time(), 1);
        assert_eq!(router.expire(&mut expire_list), 1);
        assert_eq!(expire_list.len(), 1);
        assert_eq!(expire_list[0].id(), sa.id());
        assert_eq!(sa.state(), ServerState::Undef);

        assert_eq!(router.routes(), 1);
        router.gc();
        assert_eq!(router.routes(), 0);
    }

    #[test]
    fn expire_is_a_noop_without_pool_ttl() {
        let router = router_with(vec![Rule::new("app", "*").with_pool_size(1)]);
        let config = PoolerConfig::new();
        let ids = IdGenerator::new();

        let a = make_client(&ids, "app", "u");
        router.route(&config, &a).unwrap();
        let sa = router.attach(&config, &ids, &a).unwrap();
        router.detach(&config, &a);

        let mut expire_list = Vec::new();
        assert_eq!(router.expire(&mut expire_list), 0);
        assert!(expire_list.is_empty());
        assert_eq!(sa.state(), ServerState::Idle);
        assert_eq!(sa.idle_time(), 0);
    }

    #[test]
    fn reconfigure_drops_obsolete_tenants() {
        let mut hooks = MockPoolerHooks::new();
        hooks.expect_kill_client().times(1).returning(|_| ());
        let router = Router::new(Box::new(hooks));
        let mut set = RuleSet::new();
        set.add(Rule::new("app", "*").with_pool_size(1));
        router.reconfigure(set);

        let config = PoolerConfig::new();
        let ids = IdGenerator::new();
        let a = make_client(&ids, "app", "u");
        router.route(&config, &a).unwrap();
        router.attach(&config, &ids, &a).unwrap();
        let rule = a.rule().unwrap();

        let mut replacement = RuleSet::new();
        replacement.add(Rule::new("other", "*"));
        let updates = router.reconfigure(replacement);
        assert!(updates >= 1);
        assert!(rule.is_obsolete());

        // the route and rule survive until the client leaves and gc runs
        assert_eq!(router.routes(), 1);
        assert_eq!(rule.refs(), 2);

        router.detach(&config, &a);
        router.unroute(&a);
        let mut expire_list = Vec::new();
        assert_eq!(router.expire(&mut expire_list), 1);
        assert_eq!(expire_list[0].state(), ServerState::Idle);
        router.gc();
        assert_eq!(router.routes(), 0);
        assert_eq!(rule.refs(), 0);
    }

    #[test]
    fn reconfigure_with_identical_rules_changes_nothing() {
        let rules = || {
            let mut set = RuleSet::new();
            set.add(Rule::new("app", "*").with_pool_size(4).with_pool_ttl(60));
            set.add(Rule::new("*", "*"));
            set
        };
        let router = Router::new(Box::new(NoopHooks));
        router.reconfigure(rules());

        let config = PoolerConfig::new();
        let ids = IdGenerator::new();
        let a = make_client(&ids, "app", "u");
        router.route(&config, &a).unwrap();

        let mut before = Vec::new();
        router.stat(|id, stats| before.push((id.clone(), *stats)));

        assert_eq!(router.reconfigure(rules()), 0);

        let mut after = Vec::new();
        router.stat(|id, stats| after.push((id.clone(), *stats)));
        assert_eq!(before, after);
    }

    #[test]
    fn cancel_by_forged_key() {
        let router = router_with(vec![Rule::new("app", "*")
            .with_pool_size(1)
            .with_storage(RuleStorage::new("pg1", 6432))]);
        let config = PoolerConfig::new();
        let ids = IdGenerator::new();

        let a = Arc::new(Client::new(
            ids.generate('c'),
            Startup::new("app", "u"),
            CancelKey::new(7, 7),
        ));
        router.route(&config, &a).unwrap();
        let sa = router.attach(&config, &ids, &a).unwrap();

        let cancel = router.cancel(&a.key()).unwrap();
        assert_eq!(cancel.server_id, sa.id());
        assert_eq!(cancel.key, sa.key());
        assert_eq!(cancel.storage, RuleStorage::new("pg1", 6432));

        let err = router.cancel(&CancelKey::new(8, 8)).unwrap_err();
        assert!(matches!(err, RouterError::UnknownCancelKey));

        // a detached server is no longer cancellable
        router.detach(&config, &a);
        assert!(router.cancel(&a.key()).is_err());
    }

    #[test]
    fn route_then_unroute_restores_counters() {
        let router = router_with(vec![Rule::new("app", "*")]);
        let config = PoolerConfig::new();
        let ids = IdGenerator::new();

        // materialize the route so its own rule reference is in place
        let warmup = make_client(&ids, "app", "u");
        router.route(&config, &warmup).unwrap();
        let rule = warmup.rule().unwrap();
        router.unroute(&warmup);

        let clients_before = router.clients();
        let refs_before = rule.refs();

        let c = make_client(&ids, "app", "u");
        router.route(&config, &c).unwrap();
        router.unroute(&c);

        assert_eq!(router.clients(), clients_before);
        assert_eq!(rule.refs(), refs_before);
        assert_eq!(c.state(), ClientState::Undef);
        assert!(c.rule().is_none());
    }

    #[test]
    fn attach_then_detach_preserves_pool_shape() {
        let router = router_with(vec![Rule::new("app", "*").with_pool_size(1)]);
        let config = PoolerConfig::new();
        let ids = IdGenerator::new();

        let a = make_client(&ids, "app", "u");
        router.route(&config, &a).unwrap();
        let sa = router.attach(&config, &ids, &a).unwrap();
        router.detach(&config, &a);

        let mut before = Vec::new();
        router.stat(|id, stats| before.push((id.clone(), *stats)));

        router.attach(&config, &ids, &a).unwrap();
        router.detach(&config, &a);

        let mut after = Vec::new();
        router.stat(|id, stats| after.push((id.clone(), *stats)));
        assert_eq!(before, after);
        assert_eq!(sa.last_client_id(), Some(a.id()));
    }

    #[test]
    fn close_discards_the_server() {
        let router = router_with(vec![Rule::new("app", "*").with_pool_size(1)]);
        let config = PoolerConfig::new();
        let ids = IdGenerator::new();

        let a = make_client(&ids, "app", "u");
        router.route(&config, &a).unwrap();
        let sa = router.attach(&config, &ids, &a).unwrap();
        sa.put_io(Box::new(17_u8));

        router.close(&a);
        assert!(a.server().is_none());
        assert_eq!(a.state(), ClientState::Pending);
        assert_eq!(sa.state(), ServerState::Undef);
        assert!(sa.route().is_none());
        assert!(!sa.has_io());

        // the next attach builds a fresh server
        let sb = router.attach(&config, &ids, &a).unwrap();
        assert_ne!(sb.id(), sa.id());
    }

    #[test]
    fn held_server_counts_toward_occupancy() {
        let router = Arc::new(router_with(vec![Rule::new("app", "*").with_pool_size(1)]));
        let config = PoolerConfig::new();
        let ids = Arc::new(IdGenerator::new());

        let a = make_client(&ids, "app", "u");
        router.route(&config, &a).unwrap();
        let sa = router.attach(&config, &ids, &a).unwrap();
        router.detach(&config, &a);

        assert!(router.hold_server(&sa, ServerState::Reset));
        assert_eq!(sa.state(), ServerState::Reset);

        let mut transient = 0;
        router.stat(|_, stats| transient += stats.servers_transient);
        assert_eq!(transient, 1);

        // the pool is full even though nothing is idle or active
        let b = make_client(&ids, "app", "u");
        router.route(&config, &b).unwrap();
        let waiter = {
            let router = Arc::clone(&router);
            let config = config.clone();
            let ids = Arc::clone(&ids);
            let b = Arc::clone(&b);
            thread::spawn(move || router.attach(&config, &ids, &b))
        };
        wait_until("the second client to be queued", || {
            queued_clients(&router) == 1
        });

        router.release_server(&sa);
        let sb = waiter.join().unwrap().unwrap();
        assert_eq!(sb.id(), sa.id());
    }

    #[test]
    fn hold_server_loses_the_race_to_an_attacher() {
        let router = router_with(vec![Rule::new("app", "*").with_pool_size(1)]);
        let config = PoolerConfig::new();
        let ids = IdGenerator::new();

        let a = make_client(&ids, "app", "u");
        router.route(&config, &a).unwrap();
        let sa = router.attach(&config, &ids, &a).unwrap();
        router.detach(&config, &a);

        let b = make_client(&ids, "app", "u");
        router.route(&config, &b).unwrap();
        router.attach(&config, &ids, &b).unwrap();

        assert!(!router.hold_server(&sa, ServerState::Reset));
        assert_eq!(sa.state(), ServerState::Active);
    }

    #[test]
    fn discarded_server_is_closed_and_leaves_the_pool() {
        let router = router_with(vec![Rule::new("app", "*").with_pool_size(1)]);
        let config = PoolerConfig::new();
        let ids = IdGenerator::new();

        let a = make_client(&ids, "app", "u");
        router.route(&config, &a).unwrap();
        let sa = router.attach(&config, &ids, &a).unwrap();
        sa.put_io(Box::new(3_u8));
        router.detach(&config, &a);

        assert!(router.hold_server(&sa, ServerState::Expire));
        router.discard_server(&sa);
        assert_eq!(sa.state(), ServerState::Undef);
        assert!(!sa.has_io());
        assert!(sa.route().is_none());

        let mut servers = 0;
        router.stat(|_, stats| {
            servers += stats.servers_idle + stats.servers_active + stats.servers_transient
        });
        assert_eq!(servers, 0);

        // the capacity is back: the next attach dials a fresh server
        let sb = router.attach(&config, &ids, &a).unwrap();
        assert_ne!(sb.id(), sa.id());
    }

    #[test]
    fn multi_worker_hands_io_between_workers() {
        let mut hooks = MockPoolerHooks::new();
        hooks.expect_io_attach().times(1).returning(|_| ());
        hooks.expect_io_detach().times(1).returning(|_| ());
        let router = Router::new(Box::new(hooks));
        let mut set = RuleSet::new();
        set.add(Rule::new("app", "*").with_pool_size(1));
        router.reconfigure(set);

        let config = PoolerConfig::new().with_workers(4);
        let ids = IdGenerator::new();
        let a = make_client(&ids, "app", "u");
        router.route(&config, &a).unwrap();
        router.attach(&config, &ids, &a).unwrap();
        router.detach(&config, &a);
    }

    #[test]
    fn kill_finds_the_client_by_id() {
        let router = router_with(vec![Rule::new("app", "*")]);
        let config = PoolerConfig::new();
        let ids = IdGenerator::new();

        let a = make_client(&ids, "app", "u");
        router.route(&config, &a).unwrap();
        assert!(router.kill(a.id()));
        assert!(!router.kill(ids.generate('c')));
    }

    #[test]
    fn assure_route_survives_gc_until_its_rule_is_gone() {
        let router = router_with(vec![Rule::new("app", "*")]);
        router.assure_route("app", "u").unwrap();
        assert_eq!(router.routes(), 1);

        router.gc();
        assert_eq!(router.routes(), 1);

        let mut replacement = RuleSet::new();
        replacement.add(Rule::new("other", "*"));
        router.reconfigure(replacement);
        router.gc();
        assert_eq!(router.routes(), 0);
    }

    #[test]
    fn saturated_pool_queues_until_detach() {
        let router = Arc::new(router_with(vec![Rule::new("app", "*").with_pool_size(1)]));
        let config = PoolerConfig::new();
        let ids = Arc::new(IdGenerator::new());

        let a = make_client(&ids, "app", "u");
        router.route(&config, &a).unwrap();
        let sa = router.attach(&config, &ids, &a).unwrap();

        let b = make_client(&ids, "app", "u");
        router.route(&config, &b).unwrap();

        let waiter = {
            let router = Arc::clone(&router);
            let config = config.clone();
            let ids = Arc::clone(&ids);
            let b = Arc::clone(&b);
            thread::spawn(move || router.attach(&config, &ids, &b))
        };

        wait_until("the second client to be queued", || {
            queued_clients(&router) == 1
        });
        assert_eq!(b.state(), ClientState::Queue);
        assert_client_counter_invariant(&router);

        router.detach(&config, &a);
        let sb = waiter.join().unwrap().unwrap();
        assert_eq!(sb.id(), sa.id());
        assert_eq!(sb.last_client_id(), Some(a.id()));
        assert_eq!(b.state(), ClientState::Active);
    }

    #[test]
    fn disconnect_cancels_a_queued_attach() {
        let router = Arc::new(router_with(vec![Rule::new("app", "*").with_pool_size(1)]));
        let config = PoolerConfig::new();
        let ids = Arc::new(IdGenerator::new());

        let a = make_client(&ids, "app", "u");
        router.route(&config, &a).unwrap();
        router.attach(&config, &ids, &a).unwrap();
        let rule = a.rule().unwrap();

        let b = make_client(&ids, "app", "u");
        router.route(&config, &b).unwrap();
        let clients_before = router.clients();
        let refs_before = rule.refs();

        let waiter = {
            let router = Arc::clone(&router);
            let config = config.clone();
            let ids = Arc::clone(&ids);
            let b = Arc::clone(&b);
            thread::spawn(move || router.attach(&config, &ids, &b))
        };

        wait_until("the second client to be queued", || {
            queued_clients(&router) == 1
        });
        router.disconnect(&b);

        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, RouterError::WaitCancelled));
        assert_eq!(b.state(), ClientState::Pending);

        router.unroute(&b);
        assert_eq!(router.clients(), clients_before - 1);
        assert_eq!(rule.refs(), refs_before - 1);
        assert_client_counter_invariant(&router);
    }
}
