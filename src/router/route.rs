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

use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::client::{ClientPool, Startup};
use super::rules::Rule;
use super::server::ServerPool;

/// The `(database, user)` a route serves, after any per-rule storage
/// overrides. Equality is bytewise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId {
    database: String,
    user: String,
}

impl RouteId {
    pub fn new(database: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            user: user.into(),
        }
    }

    /// Build the route id for a startup record under `rule`, applying the
    /// rule's storage overrides.
    pub(crate) fn resolve(startup: &Startup, rule: &Rule) -> Self {
        Self {
            database: rule
                .storage_db()
                .unwrap_or(startup.database())
                .to_owned(),
            user: rule.storage_user().unwrap_or(startup.user()).to_owned(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn user(&self) -> &str {
        &self.user
    }
}

impl Display for RouteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.user)
    }
}

#[derive(Debug, Default)]
pub(crate) struct RoutePools {
    pub(crate) clients: ClientPool,
    pub(crate) servers: ServerPool,
}

/// A route: one route id bound to one rule version, with its client and
/// server pools behind the route mutex.
///
/// Dynamic routes are created on demand by admission and reclaimed by GC
/// once empty; static routes are provisioned up front and survive while
/// their rule stays current. The condvar carries pool-saturation waiters;
/// it is notified whenever an idle server or spare capacity appears.
pub struct Route {
    id: RouteId,
    rule: Arc<Rule>,
    dynamic: bool,
    pools: Mutex<RoutePools>,
    waiters: Condvar,
}

impl Debug for Route {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("dynamic", &self.dynamic)
            .finish()
    }
}

impl Route {
    pub(crate) fn new(id: RouteId, rule: Arc<Rule>, dynamic: bool) -> Self {
        Self {
            id,
            rule,
            dynamic,
            pools: Mutex::new(RoutePools::default()),
            waiters: Condvar::new(),
        }
    }

    pub fn id(&self) -> &RouteId {
        &self.id
    }

    pub(crate) fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    pub(crate) fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RoutePools> {
        self.pools.lock()
    }

    /// Block on the route condvar; the guard is atomically released for the
    /// duration of the wait.
    pub(crate) fn wait(&self, pools: &mut MutexGuard<'_, RoutePools>) {
        self.waiters.wait(pools);
    }

    pub(crate) fn notify(&self) {
        self.waiters.notify_all();
    }
}
