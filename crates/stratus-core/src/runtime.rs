//! Runtime facade: wires stores, sync components and the fan-in
//! coordinator, and exposes the API the presentation layer consumes.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::{Backend, Presence};
use crate::config::CoreConfig;
use crate::errors::SyncError;
use crate::events::CoreEvent;
use crate::models::{
    ConversationRef, Message, SendReceipt, Surface, UnreadSummary, UserId,
};
use crate::store::{ConversationRegistry, UnreadAggregator, WatermarkStore};
use crate::sync::{FanInCoordinator, ProfileEnricher, PushReconciler, SendCoordinator};

pub struct CoreRuntime {
    user: UserId,
    backend: Arc<dyn Backend>,
    registry: Arc<ConversationRegistry>,
    watermarks: Arc<WatermarkStore>,
    unread: Arc<UnreadAggregator>,
    enricher: Arc<ProfileEnricher>,
    sender: SendCoordinator,
    coordinator: Arc<FanInCoordinator>,
    events: broadcast::Sender<CoreEvent>,
    focus: Arc<Mutex<Option<ConversationRef>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl CoreRuntime {
    /// Build the sync core and bring up the always-on surfaces: the
    /// direct-message inbox and one subscription per group membership.
    pub async fn start(
        backend: Arc<dyn Backend>,
        user: UserId,
        config: CoreConfig,
    ) -> Result<Self, SyncError> {
        let (events, _) = broadcast::channel(256);
        let registry = Arc::new(ConversationRegistry::new());
        let watermarks = Arc::new(WatermarkStore::new(user.clone(), backend.clone()));
        watermarks.load().await?;
        let unread = Arc::new(UnreadAggregator::new(
            user.clone(),
            backend.clone(),
            watermarks.clone(),
        ));
        let enricher = Arc::new(ProfileEnricher::new(
            backend.clone(),
            config.enrichment_attempts,
        ));
        let focus: Arc<Mutex<Option<ConversationRef>>> = Arc::new(Mutex::new(None));

        let reconciler = Arc::new(PushReconciler::new(
            user.clone(),
            backend.clone(),
            registry.clone(),
            unread.clone(),
            enricher.clone(),
            focus.clone(),
            events.clone(),
        ));

        let sender = SendCoordinator::new(
            user.clone(),
            backend.clone(),
            registry.clone(),
            events.clone(),
            config.send_timeout,
        );
        match backend.get_profile(&user).await {
            Ok(profile) => sender.set_own_profile(profile),
            Err(err) => warn!(%err, "own profile unavailable at startup"),
        }

        let coordinator = Arc::new(FanInCoordinator::new(
            user.clone(),
            backend.clone(),
            reconciler,
            unread.clone(),
            registry.clone(),
            events.clone(),
            &config,
        ));
        coordinator.subscribe(Surface::DirectInbox);
        coordinator.wait_settled(&Surface::DirectInbox).await;
        coordinator.sync_group_memberships().await?;

        let runtime = Self {
            user,
            backend,
            registry,
            watermarks,
            unread,
            enricher,
            sender,
            coordinator,
            events,
            focus,
            background: Mutex::new(Vec::new()),
        };
        runtime.spawn_membership_watcher();
        runtime.spawn_counts_forwarder();
        runtime.spawn_drift_task(config.drift_interval);
        info!(user = %runtime.user, "sync core started");
        Ok(runtime)
    }

    /// Open a conversation: focus it, make sure its surface is live, load
    /// history, and mark it read. Returns the ordered message log.
    pub async fn open_conversation(
        &self,
        conversation: ConversationRef,
    ) -> Result<Vec<Message>, SyncError> {
        *self.focus.lock() = Some(conversation.clone());

        if let Surface::Sector(_) = conversation.surface() {
            // At most one sector is open at a time.
            for surface in self.coordinator.surfaces() {
                if matches!(surface, Surface::Sector(_)) && surface != conversation.surface() {
                    self.coordinator.unsubscribe(&surface);
                }
            }
            self.coordinator.subscribe(conversation.surface());
        }

        let history = self
            .backend
            .fetch_history(&self.user, &conversation)
            .await?;
        self.registry.replace_all(&conversation, history);
        let _ = self
            .events
            .send(CoreEvent::MessagesChanged(conversation.clone()));

        self.mark_read(&conversation).await;
        Ok(self.registry.snapshot(&conversation))
    }

    /// Tear down a conversation's view state. An in-flight send completes
    /// in the background and reconciles again if the user returns.
    pub fn close_conversation(&self, conversation: &ConversationRef) {
        let mut focus = self.focus.lock();
        if focus.as_ref() == Some(conversation) {
            *focus = None;
        }
        drop(focus);

        self.registry.remove(conversation);
        self.enricher.clear();
        if let Surface::Sector(_) = conversation.surface() {
            self.coordinator.unsubscribe(&conversation.surface());
        }
    }

    /// Optimistic send. Permission is decided by the external collaborator;
    /// the core only consults it.
    pub async fn send(
        &self,
        conversation: ConversationRef,
        content: impl Into<String>,
    ) -> Result<SendReceipt, SyncError> {
        if !self.backend.can_send(&self.user, &conversation).await? {
            return Err(SyncError::PermissionDenied(conversation));
        }
        self.sender.send(conversation, content.into()).await
    }

    /// Explicit read acknowledgement: advances the watermark (monotonic)
    /// and zeroes the cached unread count. A failed persistence write only
    /// degrades durability, never the view the user is looking at.
    pub async fn mark_read(&self, conversation: &ConversationRef) -> i64 {
        let watermark = self.watermarks.mark_read(conversation).await;
        self.unread.clear(conversation);
        watermark
    }

    /// Live `{direct, group, external, total}` snapshots.
    pub fn subscribe_counts(&self) -> watch::Receiver<UnreadSummary> {
        self.unread.subscribe()
    }

    pub fn unread_summary(&self) -> UnreadSummary {
        self.unread.summary()
    }

    /// Merge a count owned by an out-of-scope collaborator (announcements,
    /// generic notifications) into the badge total.
    pub fn set_external_count(&self, source: impl Into<String>, count: u64) {
        self.unread.set_external_count(source, count);
    }

    /// Ordered snapshot of one conversation's log. `CoreEvent::
    /// MessagesChanged` signals when to re-read.
    pub fn messages(&self, conversation: &ConversationRef) -> Vec<Message> {
        self.registry.snapshot(conversation)
    }

    pub fn events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Read-only presence pass-through, merged into UI only.
    pub async fn presence(&self, user: &UserId) -> Result<Presence, SyncError> {
        self.backend.get_presence(user).await
    }

    pub fn coordinator(&self) -> &FanInCoordinator {
        &self.coordinator
    }

    pub fn shutdown(&self) {
        for task in self.background.lock().drain(..) {
            task.abort();
        }
        self.coordinator.shutdown();
    }

    fn spawn_membership_watcher(&self) {
        let coordinator = Arc::clone(&self.coordinator);
        let user = self.user.clone();
        let mut rx = self.backend.membership_changes();
        let task = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if event.user_id != user {
                    continue;
                }
                if let Err(err) = coordinator.sync_group_memberships().await {
                    warn!(%err, "membership resync failed");
                }
            }
        });
        self.background.lock().push(task);
    }

    /// Mirror unread summary changes onto the event broadcast so consumers
    /// that only follow `events()` still see badge updates.
    fn spawn_counts_forwarder(&self) {
        let mut counts = self.unread.subscribe();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            while counts.changed().await.is_ok() {
                let summary = *counts.borrow();
                let _ = events.send(CoreEvent::CountsChanged(summary));
            }
        });
        self.background.lock().push(task);
    }

    /// Periodic full recompute over every tracked conversation to correct
    /// drift from missed deltas.
    fn spawn_drift_task(&self, interval: std::time::Duration) {
        let unread = Arc::clone(&self.unread);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                for conversation in unread.tracked() {
                    let _ = unread.recompute(&conversation).await;
                }
            }
        });
        self.background.lock().push(task);
    }
}

impl Drop for CoreRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
