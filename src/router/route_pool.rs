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

use std::slice;
use std::sync::Arc;

use super::route::{Route, RouteId};
use super::rules::Rule;

/// The collection of live routes, keyed by `(route id, rule identity)`.
///
/// Two routes may share a route id while they point at different rule
/// versions during a reload transition. Structural changes and iteration
/// happen under the router lock, so a linear walk is race-free.
#[derive(Debug, Default)]
pub(crate) struct RoutePool {
    routes: Vec<Arc<Route>>,
}

impl RoutePool {
    /// Find the route bound to exactly this rule version with an equal id.
    pub(crate) fn matching(&self, id: &RouteId, rule: &Arc<Rule>) -> Option<Arc<Route>> {
        self.routes
            .iter()
            .find(|route| route.id() == id && Arc::ptr_eq(route.rule(), rule))
            .map(Arc::clone)
    }

    /// Allocate and link a new route. The route takes one reference on its
    /// rule, held until GC unlinks it.
    pub(crate) fn create(&mut self, id: RouteId, rule: Arc<Rule>, dynamic: bool) -> Arc<Route> {
        rule.incref();
        let route = Arc::new(Route::new(id, rule, dynamic));
        self.routes.push(Arc::clone(&route));
        route
    }

    pub(crate) fn len(&self) -> usize {
        self.routes.len()
    }

    pub(crate) fn iter(&self) -> slice::Iter<'_, Arc<Route>> {
        self.routes.iter()
    }

    pub(crate) fn retain(&mut self, keep: impl FnMut(&Arc<Route>) -> bool) {
        self.routes.retain(keep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_requires_equal_id_and_same_rule_version() {
        let mut pool = RoutePool::default();
        let rule_v1 = Arc::new(Rule::new("app", "*"));
        let rule_v2 = Arc::new(Rule::new("app", "*"));

        let id = RouteId::new("app", "alice");
        let route = pool.create(id.clone(), Arc::clone(&rule_v1), true);

        assert!(Arc::ptr_eq(
            &pool.matching(&id, &rule_v1).unwrap(),
            &route
        ));
        // same id, different rule version: no match
        assert!(pool.matching(&id, &rule_v2).is_none());
        assert!(pool
            .matching(&RouteId::new("app", "bob"), &rule_v1)
            .is_none());
    }

    #[test]
    fn routes_for_both_rule_versions_coexist() {
        let mut pool = RoutePool::default();
        let rule_v1 = Arc::new(Rule::new("app", "*"));
        let rule_v2 = Arc::new(Rule::new("app", "*"));

        let id = RouteId::new("app", "alice");
        pool.create(id.clone(), Arc::clone(&rule_v1), true);
        pool.create(id.clone(), Arc::clone(&rule_v2), true);

        assert_eq!(pool.len(), 2);
        assert_eq!(rule_v1.refs(), 1);
        assert_eq!(rule_v2.refs(), 1);
    }

    #[test]
    fn create_takes_a_rule_reference() {
        let mut pool = RoutePool::default();
        let rule = Arc::new(Rule::new("*", "*"));
        pool.create(RouteId::new("app", "alice"), Arc::clone(&rule), true);
        assert_eq!(rule.refs(), 1);
    }
}
