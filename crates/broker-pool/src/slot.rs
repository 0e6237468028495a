//! Slot table shared by checkout, release and housekeeping.
//!
//! Every read and write of a slot's status goes through the single
//! [`SlotTable`] held behind the pool-wide mutex. Network I/O never happens
//! while that mutex is held: a handle is moved out of its slot (with the slot
//! marked [`SlotStatus::InUse`] or [`SlotStatus::HousekeepingLocked`]) before
//! anything is awaited on it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::time::Instant;

use crate::driver::DriverConnection;

/// Status of a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// Available for checkout.
    Free,
    /// Checked out by a caller.
    InUse,
    /// Taken offline for a health check, recycle or reopen.
    HousekeepingLocked,
}

/// A checked-out handle, shared between the slot and the caller.
///
/// The caller runs statements through the handle mutex. The pool revokes the
/// lease when it takes a connection back (leak reclaim, forced shutdown) and
/// then waits on the same mutex to close the handle.
pub(crate) struct Lease {
    revoked: AtomicBool,
    handle: tokio::sync::Mutex<Option<Box<dyn DriverConnection>>>,
}

impl Lease {
    fn new(handle: Box<dyn DriverConnection>) -> Self {
        Self {
            revoked: AtomicBool::new(false),
            handle: tokio::sync::Mutex::new(Some(handle)),
        }
    }

    pub(crate) fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
    }

    pub(crate) fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    pub(crate) fn handle(&self) -> &tokio::sync::Mutex<Option<Box<dyn DriverConnection>>> {
        &self.handle
    }

    /// Take the handle back, waiting for a running statement to finish.
    pub(crate) async fn reclaim(&self) -> Option<Box<dyn DriverConnection>> {
        self.handle.lock().await.take()
    }

    /// Take the handle if nobody is using it.
    fn try_take(&self) -> Option<Box<dyn DriverConnection>> {
        self.handle.try_lock().ok()?.take()
    }
}

/// One managed connection and its metadata.
pub(crate) struct Slot {
    pub(crate) status: SlotStatus,
    /// `None` while checked out, while being probed, or after a failed reopen.
    pub(crate) handle: Option<Box<dyn DriverConnection>>,
    pub(crate) identity: Option<String>,
    pub(crate) checkout_time: Option<Instant>,
    pub(crate) created_time: Instant,
    pub(crate) lease: Option<Arc<Lease>>,
}

impl Slot {
    pub(crate) fn new(handle: Box<dyn DriverConnection>) -> Self {
        Self {
            status: SlotStatus::Free,
            identity: Some(handle.identity()),
            handle: Some(handle),
            checkout_time: None,
            created_time: Instant::now(),
            lease: None,
        }
    }

    /// Install a freshly opened handle and mark the slot free.
    pub(crate) fn install(&mut self, handle: Box<dyn DriverConnection>) {
        self.identity = Some(handle.identity());
        self.handle = Some(handle);
        self.created_time = Instant::now();
        self.checkout_time = None;
        self.lease = None;
        self.status = SlotStatus::Free;
    }

    /// Leave the slot free and empty so a later checkout reopens it.
    pub(crate) fn vacate(&mut self) {
        self.identity = None;
        self.handle = None;
        self.checkout_time = None;
        self.lease = None;
        self.status = SlotStatus::Free;
    }

    fn is_live(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_closed())
    }
}

/// A handle moved out of the table for a caller, carried by its lease.
pub(crate) struct Checkout {
    pub(crate) index: usize,
    pub(crate) identity: String,
    pub(crate) lease: Arc<Lease>,
    pub(crate) checkout_time: Instant,
}

/// Outcome of one round-robin scan.
pub(crate) enum Scan {
    /// A live free slot was found and handed out.
    Found(Checkout),
    /// No live free slot, but this free slot has no handle and has been
    /// locked so the caller can reopen it.
    Reopen(usize),
    /// Nothing usable.
    Empty,
}

/// Pool-wide slot state.
pub(crate) struct SlotTable {
    slots: Vec<Slot>,
    capacity: usize,
    /// Last slot handed out.
    cursor: usize,
}

impl SlotTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            cursor: 0,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn has_room(&self) -> bool {
        self.slots.len() < self.capacity
    }

    pub(crate) fn use_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.status == SlotStatus::InUse)
            .count()
    }

    pub(crate) fn free_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.status == SlotStatus::Free && s.is_live())
            .count()
    }

    pub(crate) fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> Option<&mut Slot> {
        self.slots.get_mut(index)
    }

    pub(crate) fn slots_mut(&mut self) -> std::slice::IterMut<'_, Slot> {
        self.slots.iter_mut()
    }

    /// Append a populated slot. Returns its index, or hands the connection
    /// back if the table is full.
    pub(crate) fn push(
        &mut self,
        handle: Box<dyn DriverConnection>,
    ) -> Result<usize, Box<dyn DriverConnection>> {
        if !self.has_room() {
            return Err(handle);
        }
        self.slots.push(Slot::new(handle));
        Ok(self.slots.len() - 1)
    }

    /// Round-robin scan starting after the cursor, visiting each slot once.
    pub(crate) fn scan(&mut self) -> Scan {
        let size = self.slots.len();
        if size == 0 {
            return Scan::Empty;
        }

        let start = (self.cursor + 1) % size;
        let mut empty = None;

        for step in 0..size {
            let index = (start + step) % size;
            let slot = &self.slots[index];
            if slot.status != SlotStatus::Free {
                continue;
            }
            if slot.is_live() {
                return self.hand_out(index).map_or(Scan::Empty, Scan::Found);
            }
            if slot.handle.is_none() && empty.is_none() {
                empty = Some(index);
            }
        }

        match empty {
            Some(index) => {
                self.slots[index].status = SlotStatus::HousekeepingLocked;
                Scan::Reopen(index)
            }
            None => Scan::Empty,
        }
    }

    /// Mark a slot in use and move its handle out.
    fn hand_out(&mut self, index: usize) -> Option<Checkout> {
        let slot = self.slots.get_mut(index)?;
        let handle = slot.handle.take()?;
        let now = Instant::now();
        let identity = slot
            .identity
            .clone()
            .unwrap_or_else(|| handle.identity());
        let lease = Arc::new(Lease::new(handle));

        slot.status = SlotStatus::InUse;
        slot.checkout_time = Some(now);
        slot.lease = Some(Arc::clone(&lease));
        slot.identity = Some(identity.clone());
        self.cursor = index;

        Some(Checkout {
            index,
            identity,
            lease,
            checkout_time: now,
        })
    }

    /// Install a reopened handle into a locked slot and hand it out directly.
    pub(crate) fn reopened(
        &mut self,
        index: usize,
        handle: Box<dyn DriverConnection>,
    ) -> Option<Checkout> {
        self.slots.get_mut(index)?.install(handle);
        self.hand_out(index)
    }

    /// Index of the slot currently tracking `identity`.
    pub(crate) fn index_of(&self, identity: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.identity.as_deref() == Some(identity))
    }

    /// Put a checked-out handle back.
    ///
    /// Fails when the connection is no longer tracked: unknown identity,
    /// slot not in use, or a lease that was replaced or revoked. The error
    /// carries the handle if the pool has not already taken it back.
    pub(crate) fn release(
        &mut self,
        identity: &str,
        lease: &Arc<Lease>,
    ) -> Result<usize, Option<Box<dyn DriverConnection>>> {
        let tracked = self.index_of(identity).filter(|&index| {
            let slot = &self.slots[index];
            slot.status == SlotStatus::InUse
                && slot.lease.as_ref().is_some_and(|l| Arc::ptr_eq(l, lease))
        });
        let (Some(index), false) = (tracked, lease.is_revoked()) else {
            return Err(lease.try_take());
        };
        let Some(handle) = lease.try_take() else {
            return Err(None);
        };

        let slot = &mut self.slots[index];
        slot.handle = Some(handle);
        slot.status = SlotStatus::Free;
        slot.checkout_time = None;
        slot.lease = None;
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Rows;
    use crate::error::DriverError;
    use async_trait::async_trait;

    struct StubConnection {
        id: String,
        closed: bool,
    }

    fn stub(id: &str) -> Box<dyn DriverConnection> {
        Box::new(StubConnection {
            id: id.to_string(),
            closed: false,
        })
    }

    #[async_trait]
    impl DriverConnection for StubConnection {
        fn identity(&self) -> String {
            self.id.clone()
        }

        fn is_closed(&self) -> bool {
            self.closed
        }

        fn take_warnings(&mut self) -> Vec<String> {
            Vec::new()
        }

        async fn ping(&mut self) -> Result<(), DriverError> {
            Ok(())
        }

        async fn execute(&mut self, _sql: &str) -> Result<u64, DriverError> {
            Ok(0)
        }

        async fn query(&mut self, _sql: &str) -> Result<Rows, DriverError> {
            Ok(Rows::default())
        }

        async fn close(&mut self) -> Result<(), DriverError> {
            self.closed = true;
            Ok(())
        }
    }

    fn table(ids: &[&str], capacity: usize) -> SlotTable {
        let mut table = SlotTable::new(capacity);
        for id in ids {
            assert!(table.push(stub(id)).is_ok());
        }
        table
    }

    fn found(scan: Scan) -> Checkout {
        match scan {
            Scan::Found(c) => c,
            _ => panic!("expected a free slot"),
        }
    }

    #[test]
    fn test_round_robin_hands_out_distinct_slots() {
        let mut table = table(&["a", "b", "c"], 3);

        let first = found(table.scan());
        let second = found(table.scan());
        let third = found(table.scan());

        assert_eq!(first.index, 1);
        assert_eq!(second.index, 2);
        assert_eq!(third.index, 0);
        assert_eq!(table.use_count(), 3);
        assert!(matches!(table.scan(), Scan::Empty));
    }

    #[test]
    fn test_release_returns_slot() {
        let mut table = table(&["a"], 1);
        let checkout = found(table.scan());
        assert_eq!(table.use_count(), 1);
        assert!(table.slot(0).unwrap().checkout_time.is_some());

        let index = table
            .release(&checkout.identity, &checkout.lease)
            .ok()
            .unwrap();
        assert_eq!(index, 0);
        assert_eq!(table.use_count(), 0);
        assert!(table.slot(0).unwrap().checkout_time.is_none());
    }

    #[test]
    fn test_release_with_revoked_lease_is_rejected() {
        let mut table = table(&["a"], 1);
        let checkout = found(table.scan());
        checkout.lease.revoke();

        let rejected = table.release(&checkout.identity, &checkout.lease);
        assert!(matches!(rejected, Err(Some(_))));
        assert_eq!(table.use_count(), 1);
    }

    #[test]
    fn test_reclaimed_handle_is_not_returned_to_caller() {
        let mut table = table(&["a"], 1);
        let checkout = found(table.scan());
        checkout.lease.revoke();

        let reclaimed = tokio_test::block_on(checkout.lease.reclaim());
        assert_eq!(reclaimed.map(|h| h.identity()).as_deref(), Some("a"));
        assert!(matches!(
            table.release(&checkout.identity, &checkout.lease),
            Err(None)
        ));
    }

    #[test]
    fn test_release_unknown_identity_is_rejected() {
        let mut table = table(&["a"], 1);
        let lease = Arc::new(Lease::new(stub("zzz")));
        assert!(matches!(table.release("zzz", &lease), Err(Some(_))));
    }

    #[test]
    fn test_scan_skips_locked_and_closed() {
        let mut table = table(&["a", "b"], 2);
        table.slot_mut(1).unwrap().status = SlotStatus::HousekeepingLocked;
        table.slot_mut(0).unwrap().handle = Some(Box::new(StubConnection {
            id: "a".into(),
            closed: true,
        }));
        assert!(matches!(table.scan(), Scan::Empty));
    }

    #[test]
    fn test_scan_offers_empty_slot_for_reopen() {
        let mut table = table(&["a", "b"], 2);
        let _held = found(table.scan());
        table.slot_mut(0).unwrap().vacate();

        let index = match table.scan() {
            Scan::Reopen(i) => i,
            _ => panic!("expected reopen"),
        };
        assert_eq!(index, 0);
        assert_eq!(
            table.slot(0).unwrap().status,
            SlotStatus::HousekeepingLocked
        );

        let checkout = table.reopened(index, stub("a2")).unwrap();
        assert_eq!(checkout.identity, "a2");
        assert_eq!(table.use_count(), 2);
    }

    #[test]
    fn test_push_respects_capacity() {
        let mut table = table(&["a"], 1);
        assert!(!table.has_room());
        assert!(table.push(stub("b")).is_err());
        assert_eq!(table.size(), 1);
        assert_eq!(table.capacity(), 1);
    }
}
