//! Fan-out of committed changes to registered listeners.

use crate::notify::change::{ChangeKind, CollectionChange, DocumentChange};
use crate::notify::executor::Executor;
use crate::transaction;
use crate::types::{CollectionId, SequenceNumber};
use parking_lot::{ReentrantMutex, RwLock};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

type DocumentCallback = dyn Fn(&DocumentChange) + Send + Sync;
type CollectionCallback = dyn Fn(&CollectionChange) + Send + Sync;

enum Callback {
    Document(Box<DocumentCallback>),
    Collection(Box<CollectionCallback>),
}

enum Event {
    Document(DocumentChange),
    Collection(CollectionChange),
}

/// One registration.
///
/// `gate` is held for the whole callback. Removal takes it too, so it waits
/// for a callback running on another thread and re-enters from the
/// listener's own thread.
struct Listener {
    executor: Arc<dyn Executor>,
    callback: Callback,
    gate: ReentrantMutex<()>,
    active: AtomicBool,
}

impl Listener {
    fn deliver(&self, event: &Event) {
        let _gate = self.gate.lock();
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match (&self.callback, event) {
            (Callback::Document(cb), Event::Document(change)) => cb(change),
            (Callback::Collection(cb), Event::Collection(change)) => cb(change),
            _ => {}
        }));
        if outcome.is_err() {
            warn!("change listener panicked");
        }
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        if !transaction::holds_writer() {
            drop(self.gate.lock());
            return;
        }
        // A running callback may itself be waiting for the writer lock this
        // thread holds.
        if self.gate.try_lock().is_none() {
            warn!("listener removed while its callback runs on another thread; not waiting for it");
        }
    }
}

#[derive(Default)]
struct CollectionListeners {
    scope: String,
    name: String,
    collection: Vec<(u64, Arc<Listener>)>,
    documents: HashMap<String, Vec<(u64, Arc<Listener>)>>,
}

#[derive(Default)]
struct Registry {
    collections: HashMap<CollectionId, CollectionListeners>,
    locations: HashMap<u64, (CollectionId, Option<String>)>,
    next_id: u64,
    closed: bool,
}

impl Registry {
    fn take(&mut self, id: u64) -> Option<Arc<Listener>> {
        let (cid, doc) = self.locations.remove(&id)?;
        let group = self.collections.get_mut(&cid)?;
        let list = match &doc {
            Some(doc_id) => group.documents.get_mut(doc_id)?,
            None => &mut group.collection,
        };
        let pos = list.iter().position(|(lid, _)| *lid == id)?;
        let (_, listener) = list.remove(pos);
        if let Some(doc_id) = doc {
            if group.documents.get(&doc_id).is_some_and(Vec::is_empty) {
                group.documents.remove(&doc_id);
            }
        }
        if group.collection.is_empty() && group.documents.is_empty() {
            self.collections.remove(&cid);
        }
        Some(listener)
    }
}

/// Handle to one registered listener.
///
/// Dropping the token leaves the listener registered; call
/// [`remove`](Self::remove) to stop deliveries.
#[must_use = "a listener stays registered until its token is removed"]
pub struct ListenerToken {
    id: u64,
    registry: Weak<RwLock<Registry>>,
}

impl ListenerToken {
    /// Unregisters the listener.
    ///
    /// When this returns no callback of the listener is running on another
    /// thread and none will start. Calling it from inside the listener's own
    /// callback is allowed.
    ///
    /// Inside a batch the call does not wait for a callback already running
    /// on another thread, since that callback may be blocked on the batch;
    /// no further callback starts.
    pub fn remove(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let listener = registry.write().take(self.id);
        if let Some(listener) = listener {
            listener.deactivate();
        }
    }
}

impl std::fmt::Debug for ListenerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerToken").field("id", &self.id).finish()
    }
}

/// Where to register a listener.
pub(crate) struct Target<'a> {
    pub collection: CollectionId,
    pub scope: &'a str,
    pub name: &'a str,
    pub document: Option<&'a str>,
}

/// The notification bus of one database.
pub(crate) struct ChangeBus {
    registry: Arc<RwLock<Registry>>,
}

impl ChangeBus {
    pub(crate) fn new() -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
        }
    }

    pub(crate) fn add_document_listener(
        &self,
        target: Target<'_>,
        executor: Arc<dyn Executor>,
        callback: Box<DocumentCallback>,
    ) -> ListenerToken {
        self.register(target, executor, Callback::Document(callback))
    }

    pub(crate) fn add_collection_listener(
        &self,
        target: Target<'_>,
        executor: Arc<dyn Executor>,
        callback: Box<CollectionCallback>,
    ) -> ListenerToken {
        self.register(target, executor, Callback::Collection(callback))
    }

    fn register(
        &self,
        target: Target<'_>,
        executor: Arc<dyn Executor>,
        callback: Callback,
    ) -> ListenerToken {
        let listener = Arc::new(Listener {
            executor,
            callback,
            gate: ReentrantMutex::new(()),
            active: AtomicBool::new(true),
        });
        let mut registry = self.registry.write();
        registry.next_id += 1;
        let id = registry.next_id;
        let group = registry.collections.entry(target.collection).or_default();
        group.scope = target.scope.to_owned();
        group.name = target.name.to_owned();
        match target.document {
            Some(doc) => group
                .documents
                .entry(doc.to_owned())
                .or_default()
                .push((id, listener)),
            None => group.collection.push((id, listener)),
        }
        registry.locations.insert(
            id,
            (target.collection, target.document.map(str::to_owned)),
        );
        ListenerToken {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Hands one commit's changes to the listeners' executors.
    ///
    /// Called with the writer lock held, so serial executors observe commits
    /// in commit order.
    pub(crate) fn publish(
        &self,
        sequence: SequenceNumber,
        changes: &[(CollectionId, String, ChangeKind)],
    ) {
        let mut deliveries: Vec<(Arc<Listener>, Event)> = Vec::new();
        {
            let registry = self.registry.read();
            if registry.closed || registry.collections.is_empty() {
                return;
            }
            let mut grouped: Vec<(CollectionId, Vec<(&str, ChangeKind)>)> = Vec::new();
            for (cid, id, kind) in changes {
                match grouped.iter_mut().find(|(c, _)| c == cid) {
                    Some((_, docs)) => docs.push((id, *kind)),
                    None => grouped.push((*cid, vec![(id, *kind)])),
                }
            }
            for (cid, docs) in grouped {
                let Some(group) = registry.collections.get(&cid) else {
                    continue;
                };
                for (doc_id, kind) in &docs {
                    for (_, listener) in group.documents.get(*doc_id).into_iter().flatten() {
                        deliveries.push((
                            Arc::clone(listener),
                            Event::Document(DocumentChange {
                                sequence: sequence.as_u64(),
                                scope: group.scope.clone(),
                                collection: group.name.clone(),
                                document_id: (*doc_id).to_owned(),
                                kind: *kind,
                            }),
                        ));
                    }
                }
                if !group.collection.is_empty() {
                    let change = CollectionChange {
                        sequence: sequence.as_u64(),
                        scope: group.scope.clone(),
                        collection: group.name.clone(),
                        document_ids: docs.iter().map(|(id, _)| (*id).to_owned()).collect(),
                    };
                    for (_, listener) in &group.collection {
                        deliveries.push((Arc::clone(listener), Event::Collection(change.clone())));
                    }
                }
            }
        }
        for (listener, event) in deliveries {
            let executor = Arc::clone(&listener.executor);
            executor.execute(Box::new(move || listener.deliver(&event)));
        }
    }

    /// Drops the listeners of a deleted collection.
    pub(crate) fn forget_collection(&self, collection: CollectionId) {
        let mut registry = self.registry.write();
        if let Some(group) = registry.collections.remove(&collection) {
            let ids = group
                .collection
                .iter()
                .chain(group.documents.values().flatten())
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            for id in ids {
                registry.locations.remove(&id);
            }
        }
    }

    /// Stops accepting commits and drops every listener.
    pub(crate) fn close(&self) {
        let listeners: Vec<Arc<Listener>> = {
            let mut registry = self.registry.write();
            registry.closed = true;
            registry.locations.clear();
            registry
                .collections
                .drain()
                .flat_map(|(_, g)| {
                    g.collection
                        .into_iter()
                        .chain(g.documents.into_values().flatten())
                        .map(|(_, l)| l)
                })
                .collect()
        };
        for listener in listeners {
            listener.deactivate();
        }
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.registry.read().locations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::executor::{DispatchQueue, InlineExecutor};
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use std::time::Duration;

    const C: CollectionId = CollectionId(1);

    fn target(document: Option<&str>) -> Target<'_> {
        Target {
            collection: C,
            scope: "_default",
            name: "coll",
            document,
        }
    }

    fn inline() -> Arc<dyn Executor> {
        Arc::new(InlineExecutor)
    }

    fn changes(ids: &[&str]) -> Vec<(CollectionId, String, ChangeKind)> {
        ids.iter().map(|id| (C, (*id).to_string(), ChangeKind::Updated)).collect()
    }

    #[test]
    fn collection_listener_gets_one_change_per_commit() {
        let bus = ChangeBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _token = bus.add_collection_listener(
            target(None),
            inline(),
            Box::new(move |c: &CollectionChange| s.lock().push(c.document_ids.clone())),
        );
        bus.publish(SequenceNumber(1), &changes(&["a", "b", "c"]));
        assert_eq!(*seen.lock(), vec![vec!["a", "b", "c"]]);
    }

    #[test]
    fn document_listener_only_sees_its_document() {
        let bus = ChangeBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _token = bus.add_document_listener(
            target(Some("b")),
            inline(),
            Box::new(move |c: &DocumentChange| s.lock().push((c.document_id.clone(), c.sequence))),
        );
        bus.publish(SequenceNumber(4), &changes(&["a", "b"]));
        bus.publish(SequenceNumber(5), &changes(&["a"]));
        assert_eq!(*seen.lock(), vec![("b".to_string(), 4)]);
    }

    #[test]
    fn removed_listener_gets_nothing() {
        let bus = ChangeBus::new();
        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        let token = bus.add_collection_listener(
            target(None),
            inline(),
            Box::new(move |_: &CollectionChange| *h.lock() += 1),
        );
        bus.publish(SequenceNumber(1), &changes(&["a"]));
        token.remove();
        bus.publish(SequenceNumber(2), &changes(&["a"]));
        assert_eq!(*hits.lock(), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn queued_delivery_is_skipped_after_removal() {
        let bus = ChangeBus::new();
        let queue = Arc::new(DispatchQueue::new("bus-test").unwrap());
        let (block_tx, block_rx) = mpsc::channel::<()>();
        queue.execute(Box::new(move || {
            let _ = block_rx.recv_timeout(Duration::from_secs(5));
        }));

        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        let token = bus.add_collection_listener(
            target(None),
            queue.clone(),
            Box::new(move |_: &CollectionChange| *h.lock() += 1),
        );
        bus.publish(SequenceNumber(1), &changes(&["a"]));
        token.remove();
        block_tx.send(()).unwrap();
        queue.shutdown();
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn listener_can_remove_itself() {
        let bus = ChangeBus::new();
        let slot: Arc<Mutex<Option<ListenerToken>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(Mutex::new(0));
        let (s, h) = (Arc::clone(&slot), Arc::clone(&hits));
        let token = bus.add_collection_listener(
            target(None),
            inline(),
            Box::new(move |_: &CollectionChange| {
                *h.lock() += 1;
                if let Some(token) = s.lock().take() {
                    token.remove();
                }
            }),
        );
        *slot.lock() = Some(token);
        bus.publish(SequenceNumber(1), &changes(&["a"]));
        bus.publish(SequenceNumber(2), &changes(&["a"]));
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let bus = ChangeBus::new();
        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        let _bad = bus.add_collection_listener(
            target(None),
            inline(),
            Box::new(|_: &CollectionChange| panic!("listener bug")),
        );
        let _good = bus.add_collection_listener(
            target(None),
            inline(),
            Box::new(move |_: &CollectionChange| *h.lock() += 1),
        );
        bus.publish(SequenceNumber(1), &changes(&["a"]));
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn closed_bus_delivers_nothing() {
        let bus = ChangeBus::new();
        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        let _token = bus.add_collection_listener(
            target(None),
            inline(),
            Box::new(move |_: &CollectionChange| *h.lock() += 1),
        );
        bus.close();
        bus.publish(SequenceNumber(1), &changes(&["a"]));
        assert_eq!(*hits.lock(), 0);
    }
}
