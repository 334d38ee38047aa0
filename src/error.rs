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

use thiserror::Error;

/// Errors surfaced by the router to the embedding pooler.
///
/// The router never logs or retries on these; it reports them and leaves the
/// reaction (error packet, backoff, disconnect) to the session code.
/// Invariant violations, on the other hand, are programmer errors and panic.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RouterError {
    /// used when
    ///  * no routing rule matches the client's startup record
    #[error("no matching rule for database {database:?} and user {user:?}")]
    NoRule { database: String, user: String },
    /// used when
    ///  * admitting the client would exceed the global `client_max`
    #[error("global client limit reached ({limit})")]
    ClientLimit { limit: usize },
    /// used when
    ///  * admitting the client would exceed the matched rule's `client_max`
    #[error("route client limit reached ({limit})")]
    RouteClientLimit { limit: usize },
    /// used when
    ///  * the client disconnected while queued for a saturated server pool
    #[error("client disconnected while waiting for a server")]
    WaitCancelled,
    /// used when
    ///  * a cancellation key matches no active server
    #[error("no active server matches the cancellation key")]
    UnknownCancelKey,
}

pub type Result<T> = std::result::Result<T, RouterError>;
