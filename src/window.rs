use crate::Slot;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// Buffers chosen slots until every slot before them has been released.
pub struct SlotWindow {
    /// Next slot that will be released. Every slot below it has been
    /// released exactly once.
    next: Slot,
    /// Chosen slots >= next, waiting for the gap before them to close
    pending: BTreeMap<Slot, Bytes>,
}

impl SlotWindow {
    /// New window releasing from `first`
    pub fn new(first: Slot) -> SlotWindow {
        SlotWindow { next: first, pending: BTreeMap::new() }
    }

    /// Next slot awaiting release
    pub fn next_slot(&self) -> Slot {
        self.next
    }

    /// Records a chosen value. Returns `false` if the slot was already
    /// released or buffered.
    pub fn insert(&mut self, slot: Slot, value: Bytes) -> bool {
        if slot < self.next || self.pending.contains_key(&slot) {
            return false;
        }
        self.pending.insert(slot, value);
        true
    }

    /// Removes the contiguous run of values starting at the next slot.
    pub fn drain_ready(&mut self) -> impl Iterator<Item = (Slot, Bytes)> + '_ {
        std::iter::from_fn(move || {
            let value = self.pending.remove(&self.next)?;
            let slot = self.next;
            self.next += 1;
            Some((slot, value))
        })
    }

    /// Number of buffered slots behind a gap
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

struct Output {
    window: SlotWindow,
    // None once closed
    sender: Option<mpsc::UnboundedSender<Bytes>>,
}

/// Releases chosen values to the application in slot order.
///
/// Insertion and draining happen in a single critical section, so two
/// slots chosen concurrently are never released twice or out of order.
pub struct DeliveryQueue {
    output: Mutex<Output>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl DeliveryQueue {
    pub fn new(first: Slot) -> DeliveryQueue {
        let (sender, receiver) = mpsc::unbounded_channel();
        DeliveryQueue {
            output: Mutex::new(Output { window: SlotWindow::new(first), sender: Some(sender) }),
            receiver: AsyncMutex::new(receiver),
        }
    }

    /// Stores a chosen value and releases every value that is now contiguous.
    pub fn deliver(&self, slot: Slot, value: Bytes) {
        let mut output = match self.output.lock() {
            Ok(output) => output,
            Err(poisoned) => poisoned.into_inner(),
        };

        if !output.window.insert(slot, value) {
            warn!("Slot {} delivered more than once", slot);
            return;
        }

        let Output { window, sender } = &mut *output;
        for (slot, value) in window.drain_ready() {
            trace!("Releasing slot {}", slot);
            if let Some(sender) = sender {
                // the receiver lives as long as the queue
                let _ = sender.send(value);
            }
        }

        if window.buffered() > 0 {
            debug!("Waiting on slot {} with {} slots buffered", window.next_slot(), window.buffered());
        }
    }

    /// Waits for the next value in slot order. Returns `None` once the
    /// queue is closed and every released value has been taken.
    pub async fn take(&self) -> Option<Bytes> {
        self.receiver.lock().await.recv().await
    }

    /// Stops releasing values and wakes every waiting `take`.
    pub fn close(&self) {
        match self.output.lock() {
            Ok(mut output) => output.sender = None,
            Err(poisoned) => poisoned.into_inner().sender = None,
        }
    }
}
