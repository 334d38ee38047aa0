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

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use log::info;

/// Where a rule's traffic is sent; duplicated into the cancel output so the
/// cancel connection can be dialed after all router locks are gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleStorage {
    pub host: String,
    pub port: u16,
}

impl Default for RuleStorage {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: 5432,
        }
    }
}

impl RuleStorage {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// A routing rule: matching patterns plus the pool policy for matched routes.
///
/// Immutable once published into a [`RuleSet`]. A reload never mutates a
/// published rule; it marks it obsolete and installs a successor. Routes and
/// admitted clients keep the obsolete rule alive through their `Arc` until
/// the last of them is gone.
pub struct Rule {
    db_pattern: String,
    user_pattern: String,
    storage_db: Option<String>,
    storage_user: Option<String>,
    storage: RuleStorage,
    pool_size: usize,
    pool_ttl: u64,
    client_max: Option<usize>,
    obsolete: AtomicBool,
    // admission reference count; mutated only under the router lock
    refs: AtomicUsize,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("db_pattern", &self.db_pattern)
            .field("user_pattern", &self.user_pattern)
            .field("obsolete", &self.is_obsolete())
            .finish()
    }
}

impl Rule {
    /// A pattern is a literal database/user name or `"*"` for any.
    pub fn new(db_pattern: impl Into<String>, user_pattern: impl Into<String>) -> Self {
        Self {
            db_pattern: db_pattern.into(),
            user_pattern: user_pattern.into(),
            storage_db: None,
            storage_user: None,
            storage: RuleStorage::default(),
            pool_size: 0,
            pool_ttl: 0,
            client_max: None,
            obsolete: AtomicBool::new(false),
            refs: AtomicUsize::new(0),
        }
    }

    /// Max concurrent servers per route; 0 means unbounded.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Idle seconds before a server is expired; 0 means never.
    pub fn with_pool_ttl(mut self, pool_ttl: u64) -> Self {
        self.pool_ttl = pool_ttl;
        self
    }

    /// Per-route client cap.
    pub fn with_client_max(mut self, client_max: usize) -> Self {
        self.client_max = Some(client_max);
        self
    }

    /// Rewrite the routed database name.
    pub fn with_storage_db(mut self, storage_db: impl Into<String>) -> Self {
        self.storage_db = Some(storage_db.into());
        self
    }

    /// Rewrite the routed user name.
    pub fn with_storage_user(mut self, storage_user: impl Into<String>) -> Self {
        self.storage_user = Some(storage_user.into());
        self
    }

    pub fn with_storage(mut self, storage: RuleStorage) -> Self {
        self.storage = storage;
        self
    }

    pub fn db_pattern(&self) -> &str {
        &self.db_pattern
    }

    pub fn user_pattern(&self) -> &str {
        &self.user_pattern
    }

    pub fn storage_db(&self) -> Option<&str> {
        self.storage_db.as_deref()
    }

    pub fn storage_user(&self) -> Option<&str> {
        self.storage_user.as_deref()
    }

    pub fn storage(&self) -> &RuleStorage {
        &self.storage
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn pool_ttl(&self) -> u64 {
        self.pool_ttl
    }

    pub fn client_max(&self) -> Option<usize> {
        self.client_max
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    pub(crate) fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    pub(crate) fn matches(&self, database: &str, user: &str) -> bool {
        pattern_match(&self.db_pattern, database) && pattern_match(&self.user_pattern, user)
    }

    pub(crate) fn incref(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decref(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "rule reference count underflow");
    }

    pub(crate) fn refs(&self) -> usize {
        self.refs.load(Ordering::Relaxed)
    }

    /// Two rules with equal patterns are the same rule iff their policy is
    /// unchanged; otherwise a reload replaces one with the other.
    fn same_policy(&self, other: &Rule) -> bool {
        self.storage_db == other.storage_db
            && self.storage_user == other.storage_user
            && self.storage == other.storage
            && self.pool_size == other.pool_size
            && self.pool_ttl == other.pool_ttl
            && self.client_max == other.client_max
    }
}

fn pattern_match(pattern: &str, name: &str) -> bool {
    pattern == "*" || pattern == name
}

/// Ordered set of routing rules. All mutation happens under the router lock.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rule: Rule) {
        self.rules.push(Arc::new(rule));
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule matching `(database, user)` in set order.
    pub(crate) fn forward(&self, database: &str, user: &str) -> Option<Arc<Rule>> {
        self.rules
            .iter()
            .find(|rule| rule.matches(database, user))
            .map(Arc::clone)
    }

    fn find(&self, db_pattern: &str, user_pattern: &str) -> Option<&Arc<Rule>> {
        self.rules
            .iter()
            .find(|rule| rule.db_pattern == db_pattern && rule.user_pattern == user_pattern)
    }

    /// Reconcile the live set with a freshly parsed one.
    ///
    /// Rules that vanished or changed policy are marked obsolete and dropped
    /// from the set (their `Arc`s keep backing live routes and clients).
    /// Unchanged rules survive with their reference counts intact. Returns
    /// the number of obsoleted, replaced, and added rules.
    pub(crate) fn merge(&mut self, incoming: RuleSet) -> usize {
        let mut updates = 0;

        for old in &self.rules {
            match incoming.find(&old.db_pattern, &old.user_pattern) {
                None => {
                    old.mark_obsolete();
                    updates += 1;
                    info!(
                        "rule {:?}.{:?} removed from configuration",
                        old.db_pattern, old.user_pattern
                    );
                }
                Some(new) if !old.same_policy(new) => {
                    old.mark_obsolete();
                    updates += 1;
                    info!(
                        "rule {:?}.{:?} changed, superseding",
                        old.db_pattern, old.user_pattern
                    );
                }
                Some(_) => {}
            }
        }

        let mut next = Vec::with_capacity(incoming.rules.len());
        for new in incoming.rules {
            match self.find(&new.db_pattern, &new.user_pattern) {
                // unchanged: keep the published rule and its references
                Some(old) if !old.is_obsolete() => next.push(Arc::clone(old)),
                // changed: the old one was counted above
                Some(_) => next.push(new),
                None => {
                    updates += 1;
                    next.push(new);
                }
            }
        }
        self.rules = next;
        updates
    }
}
