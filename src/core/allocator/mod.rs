//! Block address allocation
//!
//! Layers, bottom up:
//! - [`AddressMap`]: one bit per address
//! - [`AddressSpace`]: the map plus a replenishing cache of free addresses
//! - [`TurnQueue`]: FIFO turns so multi-step work sees a consistent space
//!
//! [`Allocator`] ties them together. Any sequence of allocator calls that must
//! not interleave with another caller's (allocate several addresses, free a
//! whole chain) runs inside one [`AllocatorTurn`].
//!
//! Addresses can also be lent out: a lent address is reclaimed automatically
//! by the time wheel unless it is claimed before the lease expires.

pub mod bitmap;
pub mod queue;
pub mod space;

pub use bitmap::AddressMap;
pub use queue::{Turn, TurnQueue};
pub use space::{AddressSpace, SpaceStats};

use crate::encryption::BlockCipher;
use crate::error::{Result, VaultError};
use crate::timewheel::{LeaseId, TimeWheel};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const LEASE_PENDING: u8 = 0;
const LEASE_CLAIMED: u8 = 1;
const LEASE_REVOKED: u8 = 2;

pub struct Allocator {
    space: Mutex<AddressSpace>,
    queue: TurnQueue,
    turn_timeout: Duration,
}

impl Allocator {
    pub fn new(space: AddressSpace, turn_timeout: Duration) -> Self {
        Allocator {
            space: Mutex::new(space),
            queue: TurnQueue::new(),
            turn_timeout,
        }
    }

    pub fn turn_timeout(&self) -> Duration {
        self.turn_timeout
    }

    /// Wait for an exclusive turn with the default timeout
    pub fn turn(&self) -> AllocatorTurn<'_> {
        self.turn_with_timeout(self.turn_timeout)
    }

    pub fn turn_with_timeout(&self, timeout: Duration) -> AllocatorTurn<'_> {
        AllocatorTurn {
            allocator: self,
            turn: self.queue.new_turn(timeout),
        }
    }

    /// Allocate one address in its own turn
    pub fn alloc(&self) -> Result<u64> {
        let turn = self.turn();
        let address = turn.alloc()?;
        turn.end();
        Ok(address)
    }

    /// Free one address in its own turn
    pub fn free(&self, address: u64) -> Result<()> {
        let turn = self.turn();
        turn.free(address)?;
        turn.end();
        Ok(())
    }

    pub fn is_taken(&self, address: u64) -> Result<bool> {
        self.space.lock().is_taken(address)
    }

    pub fn stats(&self) -> SpaceStats {
        self.space.lock().stats()
    }

    /// Turns released by timeout instead of by their holder
    pub fn forced_releases(&self) -> u64 {
        self.queue.forced_releases()
    }

    /// Run `hook` whenever the turn queue drains
    ///
    /// The hook runs outside any turn and must not take one.
    pub fn on_idle<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.queue.on_idle(hook);
    }

    /// Bitmap with cached, never handed out, addresses cleared
    pub fn space_snapshot(&self) -> Result<AddressMap> {
        self.space.lock().snapshot()
    }

    /// Persist the bitmap; safe to call from an idle hook
    pub fn save_bitmap<P: AsRef<Path>>(
        &self,
        path: P,
        cipher: &BlockCipher,
        volume_id: &[u8],
    ) -> Result<()> {
        self.space.lock().save_bitmap(path, cipher, volume_id)
    }

    /// Allocate an address that is reclaimed unless claimed within `timeout`
    pub fn lend(self: &Arc<Self>, wheel: &TimeWheel, timeout: Duration) -> Result<AddressLease> {
        let address = self.alloc()?;
        let state = Arc::new(AtomicU8::new(LEASE_PENDING));

        let revoke_state = Arc::clone(&state);
        let allocator = Arc::downgrade(self);
        let lease_id = wheel.add(timeout, move || {
            if revoke_state
                .compare_exchange(
                    LEASE_PENDING,
                    LEASE_REVOKED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                return;
            }
            if let Some(allocator) = allocator.upgrade() {
                match allocator.free(address) {
                    Ok(()) => debug!("Lease on address {} expired, address reclaimed", address),
                    Err(e) => warn!("Failed to reclaim lent address {}: {}", address, e),
                }
            }
        });

        debug!("Lent address {} for {:?} (lease {})", address, timeout, lease_id);
        Ok(AddressLease {
            address,
            lease_id,
            state,
        })
    }

    /// Take ownership of a lent address before its lease expires
    pub fn claim(&self, wheel: &TimeWheel, lease: AddressLease) -> Result<u64> {
        match lease.state.compare_exchange(
            LEASE_PENDING,
            LEASE_CLAIMED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                wheel.cancel(lease.lease_id);
                Ok(lease.address)
            }
            Err(_) => Err(VaultError::LeaseExpired {
                address: lease.address,
            }),
        }
    }

    /// Give a lent address back early
    pub fn release(&self, wheel: &TimeWheel, lease: AddressLease) -> Result<()> {
        let address = self.claim(wheel, lease)?;
        self.free(address)
    }
}

/// An exclusive turn on an [`Allocator`]
pub struct AllocatorTurn<'a> {
    allocator: &'a Allocator,
    turn: Turn<'a>,
}

impl<'a> AllocatorTurn<'a> {
    pub fn alloc(&self) -> Result<u64> {
        self.allocator.space.lock().alloc()
    }

    /// Allocate `count` addresses, or none if the space runs out part way
    pub fn alloc_many(&self, count: usize) -> Result<Vec<u64>> {
        let mut space = self.allocator.space.lock();
        let mut addresses = Vec::with_capacity(count);
        for _ in 0..count {
            match space.alloc() {
                Ok(address) => addresses.push(address),
                Err(e) => {
                    for &address in &addresses {
                        space.free(address)?;
                    }
                    return Err(e);
                }
            }
        }
        Ok(addresses)
    }

    pub fn free(&self, address: u64) -> Result<()> {
        self.allocator.space.lock().free(address)
    }

    pub fn is_taken(&self, address: u64) -> Result<bool> {
        self.allocator.space.lock().is_taken(address)
    }

    /// Whether this turn still holds the queue
    pub fn is_current(&self) -> bool {
        self.turn.is_current()
    }

    pub fn end(self) -> bool {
        self.turn.end()
    }
}

/// An address lent out with an expiry
#[derive(Debug)]
pub struct AddressLease {
    address: u64,
    lease_id: LeaseId,
    state: Arc<AtomicU8>,
}

impl AddressLease {
    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    /// The wheel already reclaimed the address
    pub fn is_revoked(&self) -> bool {
        self.state.load(Ordering::Acquire) == LEASE_REVOKED
    }
}
