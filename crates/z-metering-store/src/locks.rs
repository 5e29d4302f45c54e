//! Per-user write serialization.
//!
//! `RocksDB` has no row locks on a plain database handle, so read-modify-write
//! of an account goes through one of a fixed set of mutex stripes chosen by
//! hashing the user ID. Two users may share a stripe; one user never maps to
//! two stripes.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use parking_lot::{Mutex, MutexGuard};
use z_metering_core::UserId;

/// Default number of lock stripes.
pub const DEFAULT_STRIPES: usize = 64;

/// A fixed array of mutexes indexed by user.
pub struct UserLocks {
    stripes: Vec<Mutex<()>>,
}

impl UserLocks {
    /// Create a lock table with `stripes` stripes (at least one).
    #[must_use]
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Lock the stripe owning `user_id`.
    pub fn lock(&self, user_id: &UserId) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_of(user_id)].lock()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn stripe_of(&self, user_id: &UserId) -> usize {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }
}

impl Default for UserLocks {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_user_maps_to_same_stripe() {
        let locks = UserLocks::new(8);
        let user = UserId::generate();
        assert_eq!(locks.stripe_of(&user), locks.stripe_of(&user));
    }

    #[test]
    fn zero_stripes_is_clamped() {
        let locks = UserLocks::new(0);
        let _guard = locks.lock(&UserId::generate());
    }
}
