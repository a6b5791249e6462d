//! Invalidation coalescer: debounced, region-deduplicated cache refreshes.
//!
//! Entity tags enqueued within one debounce window collapse into a single
//! flush, and each flush refreshes every affected cache region once. Flushes
//! run inline on the coalescer task, so they never overlap; tags arriving
//! while a flush is in flight wait for the next one.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use kaji_core::{CacheRegion, EntityTag};

/// The two operations the sync engine needs from the surrounding query cache.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    /// Mark one region stale and trigger its background refetch.
    async fn invalidate(&self, region: CacheRegion);

    /// Mark every tracked region stale.
    async fn invalidate_all(&self);
}

/// What one flush will refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshPlan {
    All,
    Regions(BTreeSet<CacheRegion>),
}

impl RefreshPlan {
    /// `None` for an empty tag set.
    pub fn for_tags(tags: &BTreeSet<EntityTag>) -> Option<Self> {
        if tags.is_empty() {
            return None;
        }
        if tags.iter().any(|tag| tag.requires_full_refresh()) {
            return Some(RefreshPlan::All);
        }
        let regions: BTreeSet<CacheRegion> = tags
            .iter()
            .flat_map(|tag| tag.dependent_regions().iter().copied())
            .collect();
        if regions.is_empty() {
            Some(RefreshPlan::All)
        } else {
            Some(RefreshPlan::Regions(regions))
        }
    }

    pub async fn apply(&self, cache: &dyn CacheInvalidator) {
        match self {
            RefreshPlan::All => cache.invalidate_all().await,
            RefreshPlan::Regions(regions) => {
                for region in regions {
                    cache.invalidate(*region).await;
                }
            }
        }
    }
}

/// Deduplicating set of tags waiting for the next flush.
#[derive(Debug, Default)]
pub struct PendingInvalidations {
    tags: BTreeSet<EntityTag>,
}

impl PendingInvalidations {
    /// Returns `true` if the tag was not already pending.
    pub fn insert(&mut self, tag: EntityTag) -> bool {
        self.tags.insert(tag)
    }

    /// Take every pending tag, leaving the set empty.
    pub fn take(&mut self) -> BTreeSet<EntityTag> {
        std::mem::take(&mut self.tags)
    }

    pub fn clear(&mut self) {
        self.tags.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }
}

enum Command {
    Enqueue(EntityTag),
    ResyncAll,
    Flush(oneshot::Sender<()>),
    Clear,
    Shutdown,
}

/// Cheap, cloneable sender side of a running [`Coalescer`].
#[derive(Clone)]
pub struct CoalescerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl CoalescerHandle {
    /// Add a tag; starts the debounce window if none is running.
    pub fn enqueue(&self, tag: EntityTag) {
        self.send(Command::Enqueue(tag));
    }

    /// Discard pending tags and refresh everything now.
    pub fn resync_all(&self) {
        self.send(Command::ResyncAll);
    }

    /// Discard pending tags and cancel the debounce window.
    pub fn clear(&self) {
        self.send(Command::Clear);
    }

    /// Flush pending tags now; resolves once the flush finished.
    pub async fn flush_now(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(Command::Flush(ack_tx));
        let _ = ack_rx.await;
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            tracing::debug!("coalescer already stopped; command dropped");
        }
    }
}

/// Owner of the coalescer task.
pub struct Coalescer {
    handle: CoalescerHandle,
    join: Option<JoinHandle<()>>,
}

impl Coalescer {
    pub fn spawn(cache: Arc<dyn CacheInvalidator>, window: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(coalescer_task(cache, window, rx));
        Self {
            handle: CoalescerHandle { tx },
            join: Some(join),
        }
    }

    pub fn handle(&self) -> CoalescerHandle {
        self.handle.clone()
    }

    /// Stop the task, discarding pending tags. Safe to call repeatedly.
    pub async fn shutdown(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        self.handle.send(Command::Shutdown);
        if let Err(err) = join.await {
            tracing::warn!(error = %err, "coalescer task join failure");
        }
    }
}

impl Drop for Coalescer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

async fn coalescer_task(
    cache: Arc<dyn CacheInvalidator>,
    window: Duration,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut pending = PendingInvalidations::default();
    let mut deadline: Option<Instant> = None;

    loop {
        let command = match deadline {
            Some(at) => tokio::select! {
                command = rx.recv() => command,
                () = tokio::time::sleep_until(at) => {
                    deadline = None;
                    flush(&mut pending, cache.as_ref()).await;
                    continue;
                }
            },
            None => rx.recv().await,
        };
        let Some(command) = command else { break };

        match command {
            Command::Enqueue(tag) => {
                pending.insert(tag);
                if deadline.is_none() {
                    deadline = Some(Instant::now() + window);
                }
            }
            Command::ResyncAll => {
                let discarded = pending.take();
                deadline = None;
                tracing::info!(discarded = ?discarded, "full resync requested");
                cache.invalidate_all().await;
            }
            Command::Flush(ack) => {
                deadline = None;
                flush(&mut pending, cache.as_ref()).await;
                let _ = ack.send(());
            }
            Command::Clear => {
                pending.clear();
                deadline = None;
            }
            Command::Shutdown => break,
        }
    }
}

async fn flush(pending: &mut PendingInvalidations, cache: &dyn CacheInvalidator) {
    let tags = pending.take();
    let Some(plan) = RefreshPlan::for_tags(&tags) else {
        return;
    };
    tracing::debug!(tags = ?tags, plan = ?plan, "flushing coalesced invalidations");
    plan.apply(cache).await;
}
