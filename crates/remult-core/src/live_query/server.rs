//! The live-query subscription server.
//!
//! Committed writes are queued to a single dispatch task, so subscribers see
//! changes in commit order while writers never wait for delivery. Each change
//! is diffed against every live stored query of its entity by evaluating the
//! query's filter against the changed row in memory; limit and page windows
//! are not re-applied.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::{
    entity::EntityRow,
    error::Result,
    field::metadata::id_key,
    filter::operators::matches_filter,
    repository::{FindOptions, Repository},
};

use super::{
    emitter::{EventEmitter, ListenerId},
    now_iso,
    storage::LiveQueryStorage,
    ItemChange, LiveQueryChange, LiveQueryMessage, LiveQueryState, StoredQuery,
};

/// Result of [`LiveQuerySubscriptionServer::subscribe`].
#[derive(Debug)]
pub struct LiveQuerySubscription {
    pub query_id: String,
    /// Initial result set, in wire form.
    pub items: Vec<Value>,
    /// Changes to the result set, one batch per write.
    pub receiver: mpsc::UnboundedReceiver<Vec<LiveQueryChange>>,
}

impl LiveQuerySubscription {
    /// The subscribe response sent to clients.
    pub fn response(&self) -> Value {
        json!({ "queryId": self.query_id, "items": self.items })
    }
}

enum Job {
    Change(ItemChange),
    /// Completed once every job queued before it was handled.
    Barrier(oneshot::Sender<()>),
}

struct Dispatcher {
    storage: Arc<dyn LiveQueryStorage>,
    channels: Mutex<HashMap<String, mpsc::UnboundedSender<Vec<LiveQueryChange>>>>,
    emitter: EventEmitter<LiveQueryMessage>,
}

pub struct LiveQuerySubscriptionServer {
    dispatcher: Arc<Dispatcher>,
    queue: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

impl std::fmt::Debug for LiveQuerySubscriptionServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQuerySubscriptionServer")
            .field("subscriptions", &self.dispatcher.channels.lock().len())
            .field("listeners", &self.dispatcher.emitter.len())
            .finish()
    }
}

impl LiveQuerySubscriptionServer {
    pub fn new(storage: Arc<dyn LiveQueryStorage>) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher {
                storage,
                channels: Mutex::new(HashMap::new()),
                emitter: EventEmitter::new(),
            }),
            queue: Mutex::new(None),
        }
    }

    pub fn storage(&self) -> &Arc<dyn LiveQueryStorage> {
        &self.dispatcher.storage
    }

    /// Run `options` against `repo` and keep the result set current.
    pub async fn subscribe(
        &self,
        repo: &Repository,
        options: FindOptions,
    ) -> Result<LiveQuerySubscription> {
        let rows = repo.find(options.clone()).await?;
        let items = rows
            .iter()
            .map(|row| repo.to_json(row))
            .collect::<Result<Vec<_>>>()?;
        let state = LiveQueryState {
            filter: options.filter,
            order_by: options.order_by.unwrap_or_default(),
            limit: options.limit,
            page: options.page,
            ids: rows.iter().map(EntityRow::id).collect(),
        };

        let query_id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.dispatcher
            .channels
            .lock()
            .insert(query_id.clone(), sender);

        let stored = StoredQuery {
            id: query_id.clone(),
            entity_key: repo.metadata().key.clone(),
            data: serde_json::to_value(&state)?,
            last_used_iso: now_iso(),
        };
        if let Err(e) = self.dispatcher.storage.add(stored).await {
            self.dispatcher.channels.lock().remove(&query_id);
            return Err(e);
        }
        tracing::debug!(query_id = %query_id, entity = %repo.metadata().key, items = items.len(), "live query subscribed");

        Ok(LiveQuerySubscription {
            query_id,
            items,
            receiver,
        })
    }

    pub async fn unsubscribe(&self, query_id: &str) -> Result<()> {
        self.dispatcher.channels.lock().remove(query_id);
        self.dispatcher.storage.remove(query_id).await
    }

    /// Queue a committed write for dispatch. Requires a Tokio runtime; without
    /// one the change is dropped with a warning.
    pub fn item_changed(&self, change: ItemChange) {
        let mut queue = self.queue.lock();
        if queue.as_ref().map_or(true, |q| q.is_closed()) {
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                tracing::warn!(entity = %change.entity_key, "no runtime for live query dispatch, change dropped");
                return;
            };
            let (sender, jobs) = mpsc::unbounded_channel();
            handle.spawn(run_dispatch(self.dispatcher.clone(), jobs));
            *queue = Some(sender);
        }
        if let Some(sender) = queue.as_ref() {
            if sender.send(Job::Change(change)).is_err() {
                tracing::warn!("live query dispatch task stopped, change dropped");
            }
        }
    }

    /// Wait until every change queued so far was dispatched.
    pub async fn wait_for_dispatch(&self) {
        let done = {
            let queue = self.queue.lock();
            let Some(sender) = queue.as_ref() else {
                return;
            };
            let (done, wait) = oneshot::channel();
            if sender.send(Job::Barrier(done)).is_err() {
                return;
            }
            wait
        };
        let _ = done.await;
    }

    /// Refresh `query_ids` and return the ones the storage does not know.
    /// Storage faults report every id as unknown.
    pub async fn keep_alive(&self, query_ids: &[String]) -> Vec<String> {
        let unknown = match self
            .dispatcher
            .storage
            .keep_alive_and_return_unknown_query_ids(query_ids)
            .await
        {
            Ok(unknown) => unknown,
            Err(e) => {
                tracing::warn!(error = %e, "live query keep-alive failed");
                query_ids.to_vec()
            }
        };
        let mut channels = self.dispatcher.channels.lock();
        for id in &unknown {
            channels.remove(id);
        }
        unknown
    }

    /// Observe every dispatched message, e.g. to forward it over a transport.
    pub fn on_message(
        &self,
        listener: impl Fn(&LiveQueryMessage) + Send + Sync + 'static,
    ) -> ListenerId {
        self.dispatcher.emitter.on(listener)
    }

    pub fn off_message(&self, id: ListenerId) {
        self.dispatcher.emitter.off(id);
    }
}

async fn run_dispatch(dispatcher: Arc<Dispatcher>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        match job {
            Job::Change(change) => {
                if let Err(e) = dispatcher.dispatch(&change).await {
                    tracing::warn!(entity = %change.entity_key, error = %e, "live query dispatch failed");
                }
            }
            Job::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}

impl Dispatcher {
    async fn dispatch(&self, change: &ItemChange) -> Result<()> {
        let queries = self.storage.live_queries(&change.entity_key).await?;
        for query in queries {
            let mut state: LiveQueryState = match serde_json::from_value(query.data.clone()) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(query_id = %query.id, error = %e, "unreadable live query state");
                    continue;
                }
            };
            let Some(diff) = diff_change(&mut state, change) else {
                continue;
            };
            if let Err(e) = self
                .storage
                .set_data(&query.id, serde_json::to_value(&state)?)
                .await
            {
                tracing::warn!(query_id = %query.id, error = %e, "failed to persist live query state");
            }
            tracing::debug!(query_id = %query.id, entity = %change.entity_key, "live query change");
            self.publish(LiveQueryMessage {
                query_id: query.id,
                changes: vec![diff],
            });
        }
        Ok(())
    }

    fn publish(&self, message: LiveQueryMessage) {
        {
            let mut channels = self.channels.lock();
            if let Some(sender) = channels.get(&message.query_id) {
                if sender.send(message.changes.clone()).is_err() {
                    channels.remove(&message.query_id);
                }
            }
        }
        self.emitter.emit(&message);
    }
}

/// Apply `change` to the id snapshot of `state`, returning the event for the
/// subscriber when its result set is affected.
fn diff_change(state: &mut LiveQueryState, change: &ItemChange) -> Option<LiveQueryChange> {
    let old_key = id_key(&change.old_id);
    let position = state.ids.iter().position(|id| id_key(id) == old_key);
    let matches = match (&change.values, &change.item) {
        (Some(values), Some(_)) if !change.deleted => match &state.filter {
            None => true,
            Some(filter) => match matches_filter(&Value::Object(values.clone()), filter) {
                Ok(matches) => matches,
                Err(e) => {
                    tracing::warn!(error = %e, "live query filter failed");
                    false
                }
            },
        },
        _ => false,
    };
    let item = change.item.clone().unwrap_or(Value::Null);

    match (position, matches) {
        (Some(index), true) => {
            state.ids[index] = change.id.clone();
            Some(LiveQueryChange::Replaced {
                id: change.id.clone(),
                old_id: change.old_id.clone(),
                item,
            })
        }
        (None, true) => {
            state.ids.push(change.id.clone());
            Some(LiveQueryChange::Added {
                id: change.id.clone(),
                item,
            })
        }
        (Some(index), false) => {
            let removed = state.ids.remove(index);
            Some(LiveQueryChange::Removed { id: removed })
        }
        (None, false) => None,
    }
}
