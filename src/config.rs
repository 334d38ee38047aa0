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

/// Global pooler configuration consumed by the router.
///
/// Parsing a configuration file into this struct is the embedder's business;
/// the router only reads the admission limit and the worker count.
#[derive(Debug, Clone)]
pub struct PoolerConfig {
    pub(crate) client_max: Option<usize>,
    pub(crate) workers: usize,
}

impl Default for PoolerConfig {
    fn default() -> Self {
        Self {
            client_max: None,
            workers: 1,
        }
    }
}

impl PoolerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of admitted clients across all routes.
    pub fn with_client_max(mut self, client_max: usize) -> Self {
        self.client_max = Some(client_max);
        self
    }

    pub fn without_client_max(mut self) -> Self {
        self.client_max = None;
        self
    }

    /// Number of worker threads the embedder runs its reactors on.
    /// With more than one, server io handles are handed between workers on
    /// attach/detach.
    pub fn with_workers(mut self, workers: usize) -> Self {
        assert!(workers > 0, "at least one worker is required");
        self.workers = workers;
        self
    }

    pub(crate) fn client_max(&self) -> Option<usize> {
        self.client_max
    }

    pub(crate) fn is_multi_worker(&self) -> bool {
        self.workers > 1
    }
}
