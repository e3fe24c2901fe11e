use crate::{
    host::BrowserHost,
    protocol::{Directive, TabId},
};
use std::{
    collections::HashMap,
    fmt::Display,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle, time};

const DIRECTIVE_BUFFER: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("no observer loaded in tab {0}")]
    NotLoaded(TabId),
    #[error("observer in tab {0} is not draining directives")]
    Backlogged(TabId),
}

/// Bounded retry with a fixed spacing between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Runs `op` until it succeeds or the attempts are used up, returning the
    /// last error.
    pub async fn run<T, E: Display>(
        &self,
        label: &str,
        mut op: impl FnMut() -> Result<T, E>,
    ) -> Result<T, E> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.max_attempts => return Err(err),
                Err(err) => {
                    tracing::debug!(%label, attempt, error = %err, "attempt failed, retrying");
                    attempt += 1;
                    time::sleep(self.delay).await;
                }
            }
        }
    }
}

struct TabSlot {
    url: Option<String>,
    observer: Option<(u64, mpsc::Sender<Directive>)>,
}

/// Known tabs: their last reported URL and, when an observer is loaded,
/// the channel its directives travel on.
#[derive(Clone, Default)]
pub struct TabRegistry {
    inner: Arc<Mutex<HashMap<TabId, TabSlot>>>,
    generations: Arc<AtomicU64>,
}

/// Keeps a tab's directive channel registered; dropping it detaches the
/// observer unless a newer one has attached since.
pub struct ObserverLease {
    registry: TabRegistry,
    tab_id: TabId,
    generation: u64,
}

impl Drop for ObserverLease {
    fn drop(&mut self) {
        self.registry.detach(self.tab_id, self.generation);
    }
}

impl TabRegistry {
    pub fn attach(&self, tab_id: TabId) -> (ObserverLease, mpsc::Receiver<Directive>) {
        let (tx, rx) = mpsc::channel(DIRECTIVE_BUFFER);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let mut guard = self.inner.lock().expect("tab registry lock poisoned");
        let slot = guard.entry(tab_id).or_insert(TabSlot {
            url: None,
            observer: None,
        });
        slot.observer = Some((generation, tx));
        tracing::debug!(tab_id, generation, "observer attached");
        (
            ObserverLease {
                registry: self.clone(),
                tab_id,
                generation,
            },
            rx,
        )
    }

    fn detach(&self, tab_id: TabId, generation: u64) {
        let mut guard = self.inner.lock().expect("tab registry lock poisoned");
        if let Some(slot) = guard.get_mut(&tab_id) {
            if matches!(slot.observer, Some((current, _)) if current == generation) {
                slot.observer = None;
                tracing::debug!(tab_id, generation, "observer detached");
            }
        }
    }

    pub fn note_url(&self, tab_id: TabId, url: &str) {
        let mut guard = self.inner.lock().expect("tab registry lock poisoned");
        guard
            .entry(tab_id)
            .or_insert(TabSlot {
                url: None,
                observer: None,
            })
            .url = Some(url.to_string());
    }

    pub fn url(&self, tab_id: TabId) -> Option<String> {
        let guard = self.inner.lock().expect("tab registry lock poisoned");
        guard.get(&tab_id).and_then(|slot| slot.url.clone())
    }

    pub fn forget(&self, tab_id: TabId) {
        let mut guard = self.inner.lock().expect("tab registry lock poisoned");
        guard.remove(&tab_id);
    }

    pub fn is_loaded(&self, tab_id: TabId) -> bool {
        let guard = self.inner.lock().expect("tab registry lock poisoned");
        guard
            .get(&tab_id)
            .is_some_and(|slot| slot.observer.is_some())
    }

    pub fn send(&self, tab_id: TabId, directive: Directive) -> Result<(), DeliveryError> {
        let mut guard = self.inner.lock().expect("tab registry lock poisoned");
        let Some(slot) = guard.get_mut(&tab_id) else {
            return Err(DeliveryError::NotLoaded(tab_id));
        };
        let Some((_, tx)) = slot.observer.as_ref() else {
            return Err(DeliveryError::NotLoaded(tab_id));
        };
        match tx.try_send(directive) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(DeliveryError::Backlogged(tab_id)),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                slot.observer = None;
                Err(DeliveryError::NotLoaded(tab_id))
            }
        }
    }
}

/// Delivers directives to tab observers without blocking the coordinator.
#[derive(Clone)]
pub struct DirectiveSender {
    registry: TabRegistry,
    host: Arc<dyn BrowserHost>,
    policy: RetryPolicy,
    reinject_settle: Duration,
}

impl DirectiveSender {
    pub fn new(
        registry: TabRegistry,
        host: Arc<dyn BrowserHost>,
        policy: RetryPolicy,
        reinject_settle: Duration,
    ) -> Self {
        Self {
            registry,
            host,
            policy,
            reinject_settle,
        }
    }

    pub fn registry(&self) -> &TabRegistry {
        &self.registry
    }

    pub fn host(&self) -> &Arc<dyn BrowserHost> {
        &self.host
    }

    /// Spawns the retry/reinject sequence. The returned flag reports whether
    /// the directive was eventually handed to an observer; a miss is not an
    /// error because observers reconcile on their own ticks.
    pub fn dispatch(&self, tab_id: TabId, directive: Directive) -> JoinHandle<bool> {
        let this = self.clone();
        tokio::spawn(async move { this.deliver(tab_id, directive).await })
    }

    async fn deliver(&self, tab_id: TabId, directive: Directive) -> bool {
        let label = format!("{directive:?} -> tab {tab_id}");
        if self
            .policy
            .run(&label, || self.registry.send(tab_id, directive))
            .await
            .is_ok()
        {
            return true;
        }

        tracing::debug!(tab_id, ?directive, "observer unresponsive, requesting reinjection");
        if let Err(err) = self.host.inject_observer(tab_id) {
            tracing::debug!(tab_id, error = %err, "reinjection unavailable, dropping directive");
            return false;
        }
        time::sleep(self.reinject_settle).await;

        match self.registry.send(tab_id, directive) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(tab_id, error = %err, "directive dropped after reinjection");
                false
            }
        }
    }
}
