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

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable identifier of a client or server session, unique per generator.
///
/// The tag tells sessions of different kinds apart in logs and admin output
/// (`c` for clients, `s` for servers by convention).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    tag: char,
    serial: u64,
}

impl SessionId {
    pub fn tag(&self) -> char {
        self.tag
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.tag, self.serial)
    }
}

/// Process-wide id source, shared by all workers.
#[derive(Debug)]
pub struct IdGenerator {
    serial: AtomicU64,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            serial: AtomicU64::new(1),
        }
    }

    pub fn generate(&self, tag: char) -> SessionId {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        SessionId { tag, serial }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_monotonic() {
        let ids = IdGenerator::new();
        let a = ids.generate('c');
        let b = ids.generate('c');
        let c = ids.generate('s');
        assert_ne!(a, b);
        assert!(b.serial() > a.serial());
        assert_eq!(c.tag(), 's');
    }

    #[test]
    fn display_is_tag_then_serial() {
        let ids = IdGenerator::new();
        assert_eq!(ids.generate('c').to_string(), "c1");
        assert_eq!(ids.generate('s').to_string(), "s2");
    }
}
