//! Remult: the context that owns a data provider and hands out repositories.
//!
//! Entity metadata and repositories are built on first use and memoized per
//! context by entity key. Repositories refer back to their context weakly, so
//! the `Remult` value must outlive work that resolves relations.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

use crate::{
    entity::{EntityDefinition, EntityMetadata},
    error::Result,
    live_query::{ItemChange, LiveQuerySubscriptionServer},
    provider::{BoxFuture, DataProvider},
    repository::Repository,
};

#[derive(Clone)]
pub struct RemultOptions {
    /// Backend contexts run provider-backed validators (unique, relation
    /// exists); other contexts treat them as passing.
    pub backend: bool,
    /// Server notified of every committed write.
    pub live_query: Option<Arc<LiveQuerySubscriptionServer>>,
}

impl Default for RemultOptions {
    fn default() -> Self {
        Self {
            backend: true,
            live_query: None,
        }
    }
}

impl std::fmt::Debug for RemultOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemultOptions")
            .field("backend", &self.backend)
            .field("live_query", &self.live_query.is_some())
            .finish()
    }
}

pub(crate) struct RemultInner {
    provider: Arc<dyn DataProvider>,
    pub(crate) options: RemultOptions,
    metadata: Mutex<HashMap<String, Arc<EntityMetadata>>>,
    repositories: Mutex<HashMap<String, Repository>>,
    /// Changes held back while a transaction is open.
    pending_changes: Mutex<Option<Vec<ItemChange>>>,
}

impl RemultInner {
    /// Report a write to the live-query server, or hold it until the open
    /// transaction commits.
    pub(crate) fn item_changed(&self, change: ItemChange) {
        let Some(server) = &self.options.live_query else {
            return;
        };
        if let Some(pending) = self.pending_changes.lock().as_mut() {
            pending.push(change);
            return;
        }
        server.item_changed(change);
    }
}

/// Cloning yields another handle to the same context.
#[derive(Clone)]
pub struct Remult {
    inner: Arc<RemultInner>,
}

impl std::fmt::Debug for Remult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remult")
            .field("options", &self.inner.options)
            .field("entities", &self.inner.metadata.lock().len())
            .finish()
    }
}

impl Remult {
    pub fn new(provider: impl DataProvider + 'static) -> Self {
        Self::with_options(Arc::new(provider), RemultOptions::default())
    }

    pub fn with_options(provider: Arc<dyn DataProvider>, options: RemultOptions) -> Self {
        Self {
            inner: Arc::new(RemultInner {
                provider,
                options,
                metadata: Mutex::new(HashMap::new()),
                repositories: Mutex::new(HashMap::new()),
                pending_changes: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<RemultInner>) -> Self {
        Self { inner }
    }

    pub fn provider(&self) -> &Arc<dyn DataProvider> {
        &self.inner.provider
    }

    pub fn is_backend(&self) -> bool {
        self.inner.options.backend
    }

    pub fn live_query(&self) -> Option<&Arc<LiveQuerySubscriptionServer>> {
        self.inner.options.live_query.as_ref()
    }

    /// Metadata of `definition`, built on first use. Definitions sharing an
    /// entity key share the metadata built from the first of them.
    pub fn metadata(&self, definition: &EntityDefinition) -> Result<Arc<EntityMetadata>> {
        if let Some(metadata) = self.inner.metadata.lock().get(definition.key()) {
            return Ok(metadata.clone());
        }
        // Built without the lock held: field configuration may call back
        // into this context.
        let built = Arc::new(EntityMetadata::build(definition, self)?);
        Ok(self
            .inner
            .metadata
            .lock()
            .entry(definition.key().to_string())
            .or_insert(built)
            .clone())
    }

    /// Repository of `definition`, created on first use.
    pub fn repo(&self, definition: &EntityDefinition) -> Result<Repository> {
        if let Some(repo) = self.inner.repositories.lock().get(definition.key()) {
            return Ok(repo.clone());
        }
        let metadata = self.metadata(definition)?;
        let repo = Repository::new(
            metadata,
            self.inner.provider.clone(),
            self.downgrade(),
        );
        Ok(self
            .inner
            .repositories
            .lock()
            .entry(definition.key().to_string())
            .or_insert(repo)
            .clone())
    }

    pub(crate) fn downgrade(&self) -> Weak<RemultInner> {
        Arc::downgrade(&self.inner)
    }

    /// Run `action` inside a provider transaction. Providers that support it
    /// discard the action's writes when it fails.
    ///
    /// Live-query changes raised by the action are sent only once it
    /// commits. On failure every identity cache of this context is cleared.
    pub async fn transaction<F, Fut>(&self, action: F) -> Result<()>
    where
        F: FnOnce(Remult) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        // Nested transactions share the outermost buffer; `mark` is where
        // this one's changes start.
        let (outermost, mark) = {
            let mut pending = self.inner.pending_changes.lock();
            match pending.as_ref() {
                Some(changes) => (false, changes.len()),
                None => {
                    *pending = Some(Vec::new());
                    (true, 0)
                }
            }
        };

        let remult = self.clone();
        let result = self
            .inner
            .provider
            .transaction(Box::new(move || -> BoxFuture<'static, Result<()>> {
                Box::pin(action(remult))
            }))
            .await;

        let changes = {
            let mut pending = self.inner.pending_changes.lock();
            if outermost {
                pending.take().unwrap_or_default()
            } else {
                pending
                    .as_mut()
                    .map(|changes| changes.split_off(mark.min(changes.len())))
                    .unwrap_or_default()
            }
        };
        match &result {
            Ok(()) => {
                for change in changes {
                    self.inner.item_changed(change);
                }
            }
            Err(e) => {
                tracing::debug!(
                    error = %e,
                    dropped = changes.len(),
                    "transaction failed, clearing identity caches"
                );
                self.clear_caches();
            }
        }
        result
    }

    /// Empty the identity cache of every repository of this context.
    pub fn clear_caches(&self) {
        let repositories: Vec<Repository> =
            self.inner.repositories.lock().values().cloned().collect();
        for repo in repositories {
            repo.clear_cache();
        }
    }

    /// Create provider storage for every entity in `definitions`.
    pub async fn ensure_schema(&self, definitions: &[Arc<EntityDefinition>]) -> Result<()> {
        let entities = definitions
            .iter()
            .map(|d| self.metadata(d))
            .collect::<Result<Vec<_>>>()?;
        self.inner.provider.ensure_schema(&entities).await
    }
}
