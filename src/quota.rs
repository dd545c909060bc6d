//! In-memory route quota with two-phase reservations.
//!
//! A review reserves the number of routes an object needs with [`Quotas::tx`], then either
//! commits or rolls back the returned [`Reservation`]. Dropping a reservation without calling
//! either rolls it back: an admission review that bails out early with `?` never leaks
//! capacity.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("quota exceeded: {requested} routes requested for {resource_id}, {available} available")]
    Exceeded {
        resource_id: String,
        requested: usize,
        available: usize,
    },
}

#[derive(Debug, Default)]
struct Ledger {
    max: usize,
    next_tx: u64,
    /// Committed amount per resource.
    committed: HashMap<String, usize>,
    /// In-flight reservations per resource, keyed by transaction id.
    pending: HashMap<String, Vec<(u64, usize)>>,
}

impl Ledger {
    /// Capacity held by a resource: its committed amount, or a larger in-flight reservation.
    fn held(&self, resource_id: &str) -> usize {
        let committed = self.committed.get(resource_id).copied().unwrap_or_default();
        let pending = self
            .pending
            .get(resource_id)
            .and_then(|txs| txs.iter().map(|(_, amount)| *amount).max())
            .unwrap_or_default();
        committed.max(pending)
    }

    fn used_by_others(&self, resource_id: &str) -> usize {
        self.committed
            .keys()
            .chain(self.pending.keys())
            .filter(|id| id.as_str() != resource_id)
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .map(|id| self.held(id))
            .sum()
    }

    fn remove_pending(&mut self, resource_id: &str, tx_id: u64) {
        if let Some(txs) = self.pending.get_mut(resource_id) {
            txs.retain(|(id, _)| *id != tx_id);
            if txs.is_empty() {
                self.pending.remove(resource_id);
            }
        }
    }
}

/// Shared route ledger, bounded by a fixed capacity.
#[derive(Clone, Debug)]
pub struct Quotas {
    ledger: Arc<Mutex<Ledger>>,
}

impl Quotas {
    pub fn new(max: usize) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(Ledger {
                max,
                ..Default::default()
            })),
        }
    }

    /// Reserves `amount` routes for `resource_id`, replacing what it currently holds once
    /// committed.
    pub fn tx(&self, resource_id: &str, amount: usize) -> Result<Reservation, Error> {
        let mut ledger = self.ledger.lock();

        let used = ledger.used_by_others(resource_id);
        let available = ledger.max.saturating_sub(used);
        if amount > available {
            return Err(Error::Exceeded {
                resource_id: resource_id.to_string(),
                requested: amount,
                available,
            });
        }

        ledger.next_tx += 1;
        let tx_id = ledger.next_tx;
        ledger
            .pending
            .entry(resource_id.to_string())
            .or_default()
            .push((tx_id, amount));

        Ok(Reservation {
            ledger: self.ledger.clone(),
            resource_id: resource_id.to_string(),
            tx_id,
            amount,
            done: false,
        })
    }

    /// Total committed routes across all resources.
    pub fn used(&self) -> usize {
        self.ledger.lock().committed.values().sum()
    }

    /// Committed routes for a single resource.
    pub fn used_by(&self, resource_id: &str) -> usize {
        self.ledger
            .lock()
            .committed
            .get(resource_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn max(&self) -> usize {
        self.ledger.lock().max
    }
}

/// An in-flight quota reservation.
///
/// Dropping a reservation that was neither committed nor rolled back rolls it back.
#[derive(Debug)]
#[must_use = "a reservation is rolled back when dropped"]
pub struct Reservation {
    ledger: Arc<Mutex<Ledger>>,
    resource_id: String,
    tx_id: u64,
    amount: usize,
    done: bool,
}

impl Reservation {
    /// Makes the reserved amount the resource's committed usage.
    pub fn commit(mut self) {
        let mut ledger = self.ledger.lock();
        ledger.remove_pending(&self.resource_id, self.tx_id);
        if self.amount == 0 {
            ledger.committed.remove(&self.resource_id);
        } else {
            ledger
                .committed
                .insert(self.resource_id.clone(), self.amount);
        }
        self.done = true;
    }

    /// Discards the reservation, leaving the committed usage untouched.
    pub fn rollback(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.done {
            self.ledger
                .lock()
                .remove_pending(&self.resource_id, self.tx_id);
            self.done = true;
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release();
    }
}
