use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, error};

use crate::models::{QuotaUsage, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    #[error("Quota exceeded: requested {requested} bytes, {available} bytes available")]
    Exceeded { requested: u64, available: u64 },

    #[error("Unknown user: {0}")]
    UnknownUser(UserId),

    #[error("Account already exists: {0}")]
    AccountExists(UserId),
}

/// A successful reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub new_used: u64,
    /// Per-user admission order, strictly increasing across grants.
    pub sequence: u64,
}

/// Per-user byte accounting and the admission decision for uploads.
///
/// Every mutation for one user is serialized; different users never contend.
#[cfg_attr(test, mockall::automock)]
pub trait QuotaLedger: Send + Sync {
    fn open_account(&self, user_id: UserId, quota_bytes: u64) -> Result<(), QuotaError>;

    /// Charges `delta` bytes if they fit under the quota. A zero delta is
    /// always granted and still consumes a sequence number.
    fn try_reserve(&self, user_id: UserId, delta: u64) -> Result<Grant, QuotaError>;

    /// Returns `delta` bytes, clamping at zero. Yields the new used total.
    fn release(&self, user_id: UserId, delta: u64) -> Result<u64, QuotaError>;

    fn usage(&self, user_id: UserId) -> Result<QuotaUsage, QuotaError>;

    fn remaining(&self, user_id: UserId) -> Result<u64, QuotaError> {
        self.usage(user_id).map(|usage| usage.remaining_bytes)
    }
}

#[derive(Debug)]
struct Account {
    quota_bytes: u64,
    used_bytes: u64,
    next_sequence: u64,
}

#[derive(Debug, Default)]
pub struct InMemoryQuotaLedger {
    accounts: DashMap<UserId, Arc<Mutex<Account>>>,
}

impl InMemoryQuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn account(&self, user_id: UserId) -> Result<Arc<Mutex<Account>>, QuotaError> {
        // Clone the handle out so the shard lock is gone before the account lock is taken.
        self.accounts
            .get(&user_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(QuotaError::UnknownUser(user_id))
    }
}

// Account updates are single assignments, so a poisoned lock still guards consistent state.
fn lock(account: &Mutex<Account>) -> MutexGuard<'_, Account> {
    account.lock().unwrap_or_else(PoisonError::into_inner)
}

impl QuotaLedger for InMemoryQuotaLedger {
    fn open_account(&self, user_id: UserId, quota_bytes: u64) -> Result<(), QuotaError> {
        match self.accounts.entry(user_id) {
            Entry::Occupied(_) => Err(QuotaError::AccountExists(user_id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(Account {
                    quota_bytes,
                    used_bytes: 0,
                    next_sequence: 1,
                })));
                debug!(%user_id, quota_bytes, "Opened quota account");
                Ok(())
            }
        }
    }

    fn try_reserve(&self, user_id: UserId, delta: u64) -> Result<Grant, QuotaError> {
        let account = self.account(user_id)?;
        let mut account = lock(&account);

        let available = account.quota_bytes.saturating_sub(account.used_bytes);
        if delta > available {
            debug!(%user_id, requested = delta, available, "Reservation rejected");
            return Err(QuotaError::Exceeded {
                requested: delta,
                available,
            });
        }

        account.used_bytes += delta;
        let sequence = account.next_sequence;
        account.next_sequence += 1;

        debug!(%user_id, delta, used = account.used_bytes, sequence, "Reservation granted");

        Ok(Grant {
            new_used: account.used_bytes,
            sequence,
        })
    }

    fn release(&self, user_id: UserId, delta: u64) -> Result<u64, QuotaError> {
        let account = self.account(user_id)?;
        let mut account = lock(&account);

        if delta > account.used_bytes {
            error!(
                %user_id,
                delta,
                used = account.used_bytes,
                "Release exceeds used bytes; clamping to zero"
            );
            account.used_bytes = 0;
        } else {
            account.used_bytes -= delta;
        }

        debug!(%user_id, delta, used = account.used_bytes, "Reservation released");
        Ok(account.used_bytes)
    }

    fn usage(&self, user_id: UserId) -> Result<QuotaUsage, QuotaError> {
        let account = self.account(user_id)?;
        let account = lock(&account);
        Ok(QuotaUsage::new(account.quota_bytes, account.used_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn ledger_with(quota: u64, used: u64) -> (InMemoryQuotaLedger, UserId) {
        let ledger = InMemoryQuotaLedger::new();
        let user = UserId::new();
        ledger.open_account(user, quota).unwrap();
        if used > 0 {
            ledger.try_reserve(user, used).unwrap();
        }
        (ledger, user)
    }

    #[test]
    fn test_reserve_within_and_over_quota() {
        let (ledger, user) = ledger_with(100, 0);

        let grant = ledger.try_reserve(user, 60).unwrap();
        assert_eq!(grant.new_used, 60);

        let err = ledger.try_reserve(user, 41).unwrap_err();
        assert_eq!(
            err,
            QuotaError::Exceeded {
                requested: 41,
                available: 40
            }
        );

        // Exactly filling the quota is allowed.
        assert_eq!(ledger.try_reserve(user, 40).unwrap().new_used, 100);
        assert_eq!(ledger.remaining(user).unwrap(), 0);
    }

    #[test]
    fn test_sequence_increases_per_grant() {
        let (ledger, user) = ledger_with(100, 0);

        let first = ledger.try_reserve(user, 10).unwrap();
        let second = ledger.try_reserve(user, 0).unwrap();
        let _ = ledger.try_reserve(user, 1000).unwrap_err();
        let third = ledger.try_reserve(user, 5).unwrap();

        assert!(first.sequence < second.sequence);
        assert_eq!(third.sequence, second.sequence + 1);
    }

    #[test]
    fn test_release_clamps_at_zero() {
        let (ledger, user) = ledger_with(100, 30);

        assert_eq!(ledger.release(user, 10).unwrap(), 20);
        assert_eq!(ledger.release(user, 50).unwrap(), 0);
        assert_eq!(ledger.usage(user).unwrap(), QuotaUsage::new(100, 0));
    }

    #[test]
    fn test_unknown_user() {
        let ledger = InMemoryQuotaLedger::new();
        let stranger = UserId::new();

        assert_eq!(
            ledger.try_reserve(stranger, 1).unwrap_err(),
            QuotaError::UnknownUser(stranger)
        );
        assert!(ledger.release(stranger, 1).is_err());
        assert!(ledger.usage(stranger).is_err());
    }

    #[test]
    fn test_open_account_twice() {
        let (ledger, user) = ledger_with(100, 0);
        assert_eq!(
            ledger.open_account(user, 200).unwrap_err(),
            QuotaError::AccountExists(user)
        );
        assert_eq!(ledger.usage(user).unwrap().quota_bytes, 100);
    }

    #[test]
    fn test_concurrent_pair_admits_only_what_fits() {
        for _ in 0..50 {
            let (ledger, user) = ledger_with(100, 90);
            let barrier = Barrier::new(2);

            let (big, small) = thread::scope(|scope| {
                let big = scope.spawn(|| {
                    barrier.wait();
                    ledger.try_reserve(user, 15)
                });
                let small = scope.spawn(|| {
                    barrier.wait();
                    ledger.try_reserve(user, 5)
                });
                (big.join().unwrap(), small.join().unwrap())
            });

            assert!(big.is_err());
            assert_eq!(small.unwrap().new_used, 95);
            assert_eq!(ledger.usage(user).unwrap().used_bytes, 95);
        }
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_quota() {
        let (ledger, user) = ledger_with(1_000, 0);

        let granted: u64 = thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    scope.spawn(|| {
                        (0..50)
                            .filter_map(|_| ledger.try_reserve(user, 7).ok())
                            .map(|_| 7u64)
                            .sum::<u64>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        let used = ledger.usage(user).unwrap().used_bytes;
        assert_eq!(used, granted);
        assert!(used <= 1_000);
        assert!(1_000 - used < 7);
    }
}
