use crate::err::*;
use std::collections::HashMap;
use std::hash::Hash;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub(crate) type Waiter<T> = oneshot::Sender<RpcResult<T>>;

/// A locally issued request awaiting its answer. Every waiter is resolved exactly once, by
/// `resolve`, and the timer is cancelled when the entry goes away.
pub(crate) struct PendingRequest<A, T> {
    pub(crate) peer: A,
    pub(crate) serial: u64,
    pub(crate) cancel_remote: bool,
    waiters: Vec<Waiter<T>>,
    timeout_handle: Option<JoinHandle<()>>,
}

impl<A, T: Clone> PendingRequest<A, T> {
    pub(crate) fn new(peer: A, serial: u64, cancel_remote: bool, waiter: Waiter<T>) -> Self {
        PendingRequest {
            peer,
            serial,
            cancel_remote,
            waiters: vec![waiter],
            timeout_handle: None,
        }
    }

    pub(crate) fn set_timeout_handle(&mut self, handle: JoinHandle<()>) {
        self.timeout_handle = Some(handle);
    }

    pub(crate) fn resolve(mut self, result: RpcResult<T>) {
        for waiter in self.waiters.drain(..) {
            // the caller isn't obliged to wait for the result and may have dropped the channel
            let _ = waiter.send(result.clone());
        }
    }
}

impl<A, T> Drop for PendingRequest<A, T> {
    fn drop(&mut self) {
        if let Some(handle) = self.timeout_handle.take() {
            handle.abort();
        }
    }
}

/// Outstanding requests keyed by correlation key. Removal from the table is what decides which
/// of the competing outcomes (answer, timeout, teardown) resolves an entry.
pub(crate) struct PendingTable<K, A, T> {
    entries: HashMap<K, PendingRequest<A, T>>,
}

impl<K: Eq + Hash, A, T: Clone> PendingTable<K, A, T> {
    pub(crate) fn new() -> Self {
        PendingTable {
            entries: HashMap::new(),
        }
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a new entry. Hands the request back if the key is pending already.
    pub(crate) fn insert(
        &mut self,
        key: K,
        request: PendingRequest<A, T>,
    ) -> Result<(), PendingRequest<A, T>> {
        if self.entries.contains_key(&key) {
            return Err(request);
        }
        self.entries.insert(key, request);
        Ok(())
    }

    /// Add another waiter to an existing entry. Hands the waiter back if nothing is pending.
    pub(crate) fn attach(&mut self, key: &K, waiter: Waiter<T>) -> Result<(), Waiter<T>> {
        match self.entries.get_mut(key) {
            Some(request) => {
                request.waiters.push(waiter);
                Ok(())
            }
            None => Err(waiter),
        }
    }

    pub(crate) fn take(&mut self, key: &K) -> Option<PendingRequest<A, T>> {
        self.entries.remove(key)
    }

    /// Remove the entry only if it is the one the expired timer was started for.
    pub(crate) fn take_expired(&mut self, key: &K, serial: u64) -> Option<PendingRequest<A, T>> {
        match self.entries.get(key) {
            Some(request) if request.serial == serial => self.entries.remove(key),
            _ => None,
        }
    }

    /// Remove every entry whose callers have all stopped waiting. Without a timer such an
    /// entry would otherwise stay until teardown.
    pub(crate) fn take_abandoned(&mut self) -> Vec<(K, PendingRequest<A, T>)>
    where
        K: Clone,
    {
        let abandoned: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, request)| request.waiters.iter().all(|waiter| waiter.is_closed()))
            .map(|(key, _)| key.clone())
            .collect();

        abandoned
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|request| (key, request)))
            .collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<PendingRequest<A, T>> {
        self.entries.drain().map(|(_, request)| request).collect()
    }
}

#[cfg(test)]
fn table() -> PendingTable<u32, &'static str, u32> {
    PendingTable::new()
}

#[tokio::test]
async fn test_take_resolves_once() {
    let mut pending = table();
    let (sender, receiver) = oneshot::channel();
    assert!(pending
        .insert(1, PendingRequest::new("peer", 0, false, sender))
        .is_ok());
    assert!(pending.contains(&1));

    let request = pending.take(&1).unwrap();
    assert_eq!("peer", request.peer);
    request.resolve(Ok(5));

    assert_eq!(Ok(5), receiver.await.unwrap());
    assert!(pending.take(&1).is_none());
    assert!(pending.is_empty());
}

#[tokio::test]
async fn test_insert_rejects_duplicate_key() {
    let mut pending = table();
    let (a, _a) = oneshot::channel();
    let (b, _b) = oneshot::channel();
    assert!(pending.insert(1, PendingRequest::new("peer", 0, false, a)).is_ok());
    assert!(pending.insert(1, PendingRequest::new("peer", 1, false, b)).is_err());
    assert_eq!(1, pending.len());
}

#[tokio::test]
async fn test_stale_expiry_is_ignored() {
    let mut pending = table();
    let (sender, _receiver) = oneshot::channel();
    assert!(pending
        .insert(1, PendingRequest::new("peer", 7, true, sender))
        .is_ok());

    assert!(pending.take_expired(&1, 6).is_none());
    assert!(pending.contains(&1));

    let request = pending.take_expired(&1, 7).unwrap();
    assert!(request.cancel_remote);
    assert!(pending.take_expired(&1, 7).is_none());
}

#[tokio::test]
async fn test_attached_waiters_share_the_result() {
    let mut pending = table();
    let (first, first_receiver) = oneshot::channel();
    let (second, second_receiver) = oneshot::channel();
    let (orphan, _orphan_receiver) = oneshot::channel();

    assert!(pending.attach(&1, orphan).is_err());

    assert!(pending
        .insert(1, PendingRequest::new("peer", 0, false, first))
        .is_ok());
    assert!(pending.attach(&1, second).is_ok());

    pending.take(&1).unwrap().resolve(Err(RpcError::Timeout));
    assert_eq!(Err(RpcError::Timeout), first_receiver.await.unwrap());
    assert_eq!(Err(RpcError::Timeout), second_receiver.await.unwrap());
}

#[tokio::test]
async fn test_drop_aborts_timer() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    let mut pending = table();
    let (sender, _receiver) = oneshot::channel();
    let mut request = PendingRequest::new("peer", 0, false, sender);

    let fired = Arc::new(AtomicBool::new(false));
    let timer = {
        let fired = fired.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            fired.store(true, Ordering::SeqCst);
        })
    };
    request.set_timeout_handle(timer);
    assert!(pending.insert(1, request).is_ok());

    pending.take(&1).unwrap().resolve(Ok(1));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!fired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_drain_empties_table() {
    let mut pending = table();
    let mut receivers = vec![];
    for key in 0..3 {
        let (sender, receiver) = oneshot::channel();
        assert!(pending
            .insert(key, PendingRequest::new("peer", key as u64, false, sender))
            .is_ok());
        receivers.push(receiver);
    }

    for request in pending.drain() {
        request.resolve(Err(RpcError::EndpointClosed));
    }
    assert!(pending.is_empty());
    for receiver in receivers {
        assert_eq!(Err(RpcError::EndpointClosed), receiver.await.unwrap());
    }
}

#[tokio::test]
async fn test_take_abandoned() {
    let mut pending = table();
    let (kept, _kept_receiver) = oneshot::channel();
    let (dropped, dropped_receiver) = oneshot::channel();
    let (half, half_receiver) = oneshot::channel();
    let (other_half, other_half_receiver) = oneshot::channel();

    assert!(pending.insert(1, PendingRequest::new("peer", 0, false, kept)).is_ok());
    assert!(pending.insert(2, PendingRequest::new("peer", 1, true, dropped)).is_ok());
    assert!(pending.insert(3, PendingRequest::new("peer", 2, false, half)).is_ok());
    assert!(pending.attach(&3, other_half).is_ok());

    drop(dropped_receiver);
    drop(half_receiver);

    let abandoned = pending.take_abandoned();
    assert_eq!(1, abandoned.len());
    assert_eq!(2, abandoned[0].0);
    assert!(abandoned[0].1.cancel_remote);
    assert!(pending.contains(&1));
    assert!(pending.contains(&3));
    assert_eq!(2, pending.len());

    drop(other_half_receiver);
    assert_eq!(3, pending.take_abandoned()[0].0);
    assert!(pending.take_abandoned().is_empty());
}
