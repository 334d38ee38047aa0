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

use rand::Rng;

/// A PostgreSQL cancellation key, the shape of BackendKeyData.
///
/// The pooler forges one of these per client and hands it out during startup;
/// a later cancel request carries it back and is matched against the key the
/// active server recorded. The server's own key (issued by the backend) is
/// kept separately and is what actually reaches the backend on cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CancelKey {
    pid: u32,
    key: u32,
}

impl CancelKey {
    pub fn new(pid: u32, key: u32) -> Self {
        Self { pid, key }
    }

    /// Forge a fresh key.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            pid: rng.gen(),
            key: rng.gen(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    /// Constant-time equality over all eight bytes: a single fused
    /// accumulator, no data-dependent branch.
    pub fn ct_eq(&self, other: &CancelKey) -> bool {
        let diff = (self.pid ^ other.pid) | (self.key ^ other.key);
        diff == 0
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(CancelKey::new(1, 2), CancelKey::new(1, 2), true)]
    #[case(CancelKey::new(1, 2), CancelKey::new(1, 3), false)]
    #[case(CancelKey::new(9, 2), CancelKey::new(1, 2), false)]
    #[case(CancelKey::new(0, 0), CancelKey::new(0, 0), true)]
    fn ct_eq_matches_plain_equality(
        #[case] a: CancelKey,
        #[case] b: CancelKey,
        #[case] equal: bool,
    ) {
        assert_eq!(a.ct_eq(&b), equal);
        assert_eq!(a == b, equal);
    }

    #[test]
    fn generated_keys_differ() {
        let a = CancelKey::generate();
        let b = CancelKey::generate();
        // 64 bits of entropy; a collision here means the rng is broken
        assert_ne!(a, b);
    }
}
