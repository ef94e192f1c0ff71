//! Async driver for a [`LiveCollection`].

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{LiveCollection, LiveEntity};
use crate::error::{MarketError, MarketResult};
use crate::store::{ChangeEvent, ChangeStream, Query, Store, StoreExt, SubscriptionGuard};

struct ViewState {
    /// Events held back while a resync fetch is in flight
    buffering: Option<Vec<ChangeEvent>>,
    resyncing: bool,
    stale: bool,
    closed: bool,
}

struct Shared<T> {
    collection: Mutex<LiveCollection<T>>,
    state: Mutex<ViewState>,
    revision: watch::Sender<u64>,
}

impl<T: LiveEntity> Shared<T> {
    fn notify(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    /// Run `f` against the collection and publish a revision if it changed.
    fn mutate<R>(&self, f: impl FnOnce(&mut LiveCollection<T>) -> (bool, R)) -> R {
        let (changed, out) = f(&mut self.collection.lock());
        if changed && !self.state.lock().closed {
            self.notify();
        }
        out
    }

    fn handle(&self, event: ChangeEvent) {
        let changed = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if let Some(buffer) = state.buffering.as_mut() {
                buffer.push(event);
                return;
            }
            self.collection.lock().apply(&event)
        };
        if changed {
            self.notify();
        }
    }

    fn mark_stale(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.stale = true;
        }
        tracing::warn!(collection = %T::COLLECTION, "Change stream closed, live view is stale");
        self.notify();
    }
}

fn spawn_pump<T: LiveEntity>(
    shared: Arc<Shared<T>>,
    mut events: mpsc::UnboundedReceiver<ChangeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            shared.handle(event);
        }
        shared.mark_stale();
    })
}

struct Link {
    guard: Option<SubscriptionGuard>,
    pump: Option<JoinHandle<()>>,
}

impl Link {
    fn release(&mut self) {
        self.guard.take();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// A live, ordered view over one entity collection.
///
/// Dropping the view (or calling [`LiveView::close`]) releases the
/// subscription immediately. Optimistic commits already started keep running
/// to completion.
pub struct LiveView<T: LiveEntity> {
    shared: Arc<Shared<T>>,
    link: Mutex<Link>,
    store: Arc<dyn Store>,
    changes: Arc<dyn ChangeStream>,
    query: Query,
}

impl<T: LiveEntity> LiveView<T> {
    /// Subscribe, fetch the baseline, then start applying events.
    ///
    /// Events published between the subscription and the end of the fetch
    /// are buffered in the subscription and applied after the baseline.
    pub async fn open(
        store: Arc<dyn Store>,
        changes: Arc<dyn ChangeStream>,
        query: Query,
    ) -> MarketResult<Self> {
        if query.collection != T::COLLECTION {
            return Err(MarketError::internal(format!(
                "live view of {} queried {}",
                T::COLLECTION,
                query.collection
            )));
        }

        let subscription = changes
            .subscribe(T::COLLECTION, query.filter.clone())
            .await?;
        let (guard, events) = subscription.into_parts();

        let baseline: Vec<T> = store.fetch(&query).await?;
        let mut collection = LiveCollection::from_query(&query);
        collection.install_baseline(baseline);

        let (revision, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            collection: Mutex::new(collection),
            state: Mutex::new(ViewState {
                buffering: None,
                resyncing: false,
                stale: false,
                closed: false,
            }),
            revision,
        });
        let pump = spawn_pump(shared.clone(), events);

        tracing::debug!(collection = %T::COLLECTION, "Live view opened");

        Ok(Self {
            shared,
            link: Mutex::new(Link {
                guard: Some(guard),
                pump: Some(pump),
            }),
            store,
            changes,
            query,
        })
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.shared.collection.lock().items()
    }

    pub fn get(&self, id: Uuid) -> Option<T> {
        self.shared.collection.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.shared.collection.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_stale(&self) -> bool {
        self.shared.state.lock().stale
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Revision counter bumped on every visible change.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    /// Re-run the baseline fetch. Events arriving meanwhile are replayed on
    /// top of it; pending optimistic entries are kept. A stale view is
    /// resubscribed first. Only one resync runs at a time; a second call
    /// while one is in flight is refused with `Conflict`.
    pub async fn resync(&self) -> MarketResult<()> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(MarketError::conflict("live view is closed"));
            }
            if state.resyncing {
                return Err(MarketError::conflict("live view is already resyncing"));
            }
            state.resyncing = true;
        }
        let result = self.refetch().await;
        self.shared.state.lock().resyncing = false;
        result
    }

    async fn refetch(&self) -> MarketResult<()> {
        let resubscribe = self.is_stale();
        if resubscribe {
            let subscription = self
                .changes
                .subscribe(T::COLLECTION, self.query.filter.clone())
                .await?;
            let (guard, events) = subscription.into_parts();
            {
                let mut state = self.shared.state.lock();
                state.buffering = Some(Vec::new());
                state.stale = false;
            }
            let pump = spawn_pump(self.shared.clone(), events);
            let mut link = self.link.lock();
            link.release();
            link.guard = Some(guard);
            link.pump = Some(pump);
        } else {
            self.shared.state.lock().buffering = Some(Vec::new());
        }

        let fetched = self.store.fetch::<T>(&self.query).await;

        {
            let mut state = self.shared.state.lock();
            let buffered = state.buffering.take().unwrap_or_default();
            let mut collection = self.shared.collection.lock();
            match &fetched {
                Ok(rows) => collection.install_baseline(rows.clone()),
                // subscribed but without a baseline: still out of date
                Err(_) if resubscribe => state.stale = true,
                Err(_) => {}
            }
            for event in &buffered {
                collection.apply(event);
            }
        }
        self.shared.notify();

        fetched.map(|_| ()).map_err(MarketError::from)
    }

    /// Show `provisional` immediately and commit it in the background.
    ///
    /// `provisional` must carry a correlation key. The commit runs on its own
    /// task, so the view is reconciled even if the caller stops waiting.
    pub async fn insert_optimistic<F>(&self, provisional: T, commit: F) -> MarketResult<T>
    where
        F: Future<Output = MarketResult<T>> + Send + 'static,
    {
        let client_ref = provisional
            .client_ref()
            .map(str::to_string)
            .ok_or_else(|| MarketError::validation("optimistic inserts need a client_ref"))?;

        self.shared.mutate(|c| (c.insert_pending(provisional), ()));

        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            let result = commit.await;
            match &result {
                Ok(confirmed) => {
                    let confirmed = confirmed.clone();
                    shared.mutate(|c| (c.confirm_pending(&client_ref, confirmed), ()));
                }
                Err(e) => {
                    tracing::debug!(client_ref = %client_ref, error = %e, "Optimistic insert rolled back");
                    shared.mutate(|c| (c.discard_pending(&client_ref), ()));
                }
            }
            result
        });
        join(task).await
    }

    /// Show `edited` immediately and commit it in the background, restoring
    /// the previous version on failure unless the server sent a newer one.
    pub async fn update_optimistic<F>(&self, edited: T, commit: F) -> MarketResult<T>
    where
        F: Future<Output = MarketResult<T>> + Send + 'static,
    {
        let id = edited.id();
        let staged = self
            .shared
            .mutate(|c| {
                let staged = c.stage_update(edited);
                (staged.is_some(), staged)
            })
            .ok_or_else(|| MarketError::not_found(format!("{} {id} is not in the view", T::COLLECTION)))?;

        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            let result = commit.await;
            match &result {
                Ok(confirmed) => {
                    let confirmed = confirmed.clone();
                    shared.mutate(|c| (c.confirm_update(staged, confirmed), ()));
                }
                Err(_) => {
                    shared.mutate(|c| (c.rollback_update(staged), ()));
                }
            }
            result
        });
        join(task).await
    }

    /// Hide the entity immediately and commit its removal in the background.
    pub async fn remove_optimistic<F>(&self, id: Uuid, commit: F) -> MarketResult<()>
    where
        F: Future<Output = MarketResult<()>> + Send + 'static,
    {
        let staged = self
            .shared
            .mutate(|c| {
                let staged = c.stage_remove(id);
                (staged.is_some(), staged)
            })
            .ok_or_else(|| MarketError::not_found(format!("{} {id} is not in the view", T::COLLECTION)))?;

        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            let result = commit.await;
            match &result {
                Ok(()) => shared.mutate(|c| (c.confirm_remove(staged), ())),
                Err(_) => shared.mutate(|c| (c.rollback_remove(staged), ())),
            }
            result
        });
        join(task).await
    }

    /// Stop applying events and release the subscription.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.link.lock().release();
        tracing::debug!(collection = %T::COLLECTION, "Live view closed");
    }
}

impl<T: LiveEntity> Drop for LiveView<T> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn join<R>(task: JoinHandle<MarketResult<R>>) -> MarketResult<R> {
    match task.await {
        Ok(result) => result,
        Err(e) => Err(MarketError::Internal(anyhow::Error::new(e).context("optimistic commit panicked"))),
    }
}
