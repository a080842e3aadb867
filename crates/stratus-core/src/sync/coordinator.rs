//! One live push subscription per open surface, with reconnect and
//! post-reconnect drift repair.
//!
//! Subscriptions live in an explicit registry keyed by surface so teardown
//! and reconnection are deterministic. Re-subscribing always tears down the
//! prior handle first, which is what keeps each conversation store on a
//! single writer.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::config::CoreConfig;
use crate::errors::SyncError;
use crate::events::CoreEvent;
use crate::models::{ConversationRef, Surface, UserId};
use crate::store::{ConversationRegistry, UnreadAggregator};
use crate::sync::reconcile::PushReconciler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Active,
    Error,
    Reconnecting,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unsubscribed => "unsubscribed",
            Self::Subscribing => "subscribing",
            Self::Active => "active",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

struct SubscriptionHandle {
    state: watch::Receiver<SubscriptionState>,
    task: JoinHandle<()>,
}

/// Everything a subscription pump task needs, cloned out of the coordinator
/// so the task owns its context.
#[derive(Clone)]
struct PumpContext {
    user: UserId,
    backend: Arc<dyn Backend>,
    reconciler: Arc<PushReconciler>,
    unread: Arc<UnreadAggregator>,
    registry: Arc<ConversationRegistry>,
    events: broadcast::Sender<CoreEvent>,
    subscribe_timeout: Duration,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl PumpContext {
    fn set_state(
        &self,
        surface: &Surface,
        state_tx: &watch::Sender<SubscriptionState>,
        state: SubscriptionState,
    ) {
        state_tx.send_replace(state);
        let _ = self.events.send(CoreEvent::SubscriptionState {
            surface: surface.clone(),
            state,
        });
    }

    /// Conversations whose rows arrive over `surface`: everything we hold a
    /// store or a cached unread count for.
    fn owned_conversations(&self, surface: &Surface) -> Vec<ConversationRef> {
        let mut owned: BTreeSet<ConversationRef> = BTreeSet::new();
        for conversation in self.registry.tracked() {
            if surface.owns(&conversation) {
                owned.insert(conversation);
            }
        }
        for conversation in self.unread.tracked() {
            if surface.owns(&conversation) {
                owned.insert(conversation);
            }
        }
        owned.into_iter().collect()
    }
}

/// Pump loop for one surface. State machine:
/// `Unsubscribed → Subscribing → Active → (Error → Reconnecting → …) `.
/// Teardown aborts the task, which is the `→ Unsubscribed` edge.
async fn run_subscription(
    ctx: PumpContext,
    surface: Surface,
    state_tx: watch::Sender<SubscriptionState>,
) {
    let mut backoff = ctx.backoff_base;
    loop {
        ctx.set_state(&surface, &state_tx, SubscriptionState::Subscribing);
        let subscribed = tokio::time::timeout(
            ctx.subscribe_timeout,
            ctx.backend.subscribe(&ctx.user, &surface),
        )
        .await;

        match subscribed {
            Ok(Ok(mut subscription)) => {
                ctx.set_state(&surface, &state_tx, SubscriptionState::Active);
                backoff = ctx.backoff_base;
                // Rows can land between subscribe being requested and the
                // stream going live (and, after a drop, while it was down).
                // Every activation repairs the owned conversations.
                for conversation in ctx.owned_conversations(&surface) {
                    ctx.reconciler.resync(&conversation).await;
                }
                info!(%surface, "subscription active");
                while let Some(row) = subscription.rows.recv().await {
                    ctx.reconciler.on_row(row).await;
                }
                warn!(%surface, "push stream ended");
            }
            Ok(Err(err)) => {
                warn!(%surface, %err, "subscribe failed");
            }
            Err(_) => {
                warn!(%surface, timeout_ms = ctx.subscribe_timeout.as_millis() as u64, "subscribe timed out");
            }
        }

        ctx.set_state(&surface, &state_tx, SubscriptionState::Error);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(ctx.backoff_cap);
        ctx.set_state(&surface, &state_tx, SubscriptionState::Reconnecting);
    }
}

pub struct FanInCoordinator {
    ctx: PumpContext,
    subs: Mutex<HashMap<Surface, SubscriptionHandle>>,
}

impl FanInCoordinator {
    pub fn new(
        user: UserId,
        backend: Arc<dyn Backend>,
        reconciler: Arc<PushReconciler>,
        unread: Arc<UnreadAggregator>,
        registry: Arc<ConversationRegistry>,
        events: broadcast::Sender<CoreEvent>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            ctx: PumpContext {
                user,
                backend,
                reconciler,
                unread,
                registry,
                events,
                subscribe_timeout: config.subscribe_timeout,
                backoff_base: config.reconnect_backoff,
                backoff_cap: config.reconnect_backoff_cap,
            },
            subs: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or restart) the subscription for one surface. Any prior
    /// handle is torn down first.
    pub fn subscribe(&self, surface: Surface) {
        self.unsubscribe(&surface);
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Unsubscribed);
        let task = tokio::spawn(run_subscription(
            self.ctx.clone(),
            surface.clone(),
            state_tx,
        ));
        self.subs.lock().insert(
            surface,
            SubscriptionHandle {
                state: state_rx,
                task,
            },
        );
    }

    /// Immediate teardown; safe to call for surfaces that were never
    /// subscribed.
    pub fn unsubscribe(&self, surface: &Surface) {
        if let Some(handle) = self.subs.lock().remove(surface) {
            handle.task.abort();
            let _ = self.ctx.events.send(CoreEvent::SubscriptionState {
                surface: surface.clone(),
                state: SubscriptionState::Unsubscribed,
            });
        }
    }

    pub fn state(&self, surface: &Surface) -> SubscriptionState {
        self.subs
            .lock()
            .get(surface)
            .map(|h| *h.state.borrow())
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    /// Watch a surface's state transitions (None when not subscribed).
    pub fn state_watch(&self, surface: &Surface) -> Option<watch::Receiver<SubscriptionState>> {
        self.subs.lock().get(surface).map(|h| h.state.clone())
    }

    /// Wait until a surface's first subscribe attempt settles, so callers
    /// can rely on the stream being live (or reconnection already underway)
    /// before issuing writes they expect echoed back.
    pub async fn wait_settled(&self, surface: &Surface) {
        let Some(mut rx) = self.state_watch(surface) else {
            return;
        };
        loop {
            match *rx.borrow() {
                SubscriptionState::Active | SubscriptionState::Error => return,
                _ => {}
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn surfaces(&self) -> Vec<Surface> {
        self.subs.lock().keys().cloned().collect()
    }

    /// Align group subscriptions with the membership list: subscribe joined
    /// groups (and prime their unread counts), tear down left ones.
    pub async fn sync_group_memberships(&self) -> Result<(), SyncError> {
        let groups = self.ctx.backend.groups_for_user(&self.ctx.user).await?;
        let desired: HashSet<Surface> = groups
            .iter()
            .map(|g| Surface::Group(g.clone()))
            .collect();

        let current: Vec<Surface> = self
            .surfaces()
            .into_iter()
            .filter(|s| matches!(s, Surface::Group(_)))
            .collect();

        for surface in &current {
            if !desired.contains(surface) {
                self.unsubscribe(surface);
                if let Surface::Group(g) = surface {
                    self.ctx.unread.remove(&ConversationRef::group(g.clone()));
                    self.ctx.registry.remove(&ConversationRef::group(g.clone()));
                }
            }
        }

        for group in groups {
            let surface = Surface::Group(group.clone());
            if !current.contains(&surface) {
                self.subscribe(surface);
                let _ = self
                    .ctx
                    .unread
                    .recompute(&ConversationRef::group(group))
                    .await;
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        let mut subs = self.subs.lock();
        for (_, handle) in subs.drain() {
            handle.task.abort();
        }
    }
}

impl Drop for FanInCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, NewMessage};
    use crate::store::WatermarkStore;
    use crate::sync::profiles::ProfileEnricher;

    struct Fixture {
        backend: Arc<MemoryBackend>,
        registry: Arc<ConversationRegistry>,
        unread: Arc<UnreadAggregator>,
        coordinator: FanInCoordinator,
        events: broadcast::Receiver<CoreEvent>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let registry = Arc::new(ConversationRegistry::new());
        let watermarks = Arc::new(WatermarkStore::new("alice".to_string(), backend.clone()));
        let unread = Arc::new(UnreadAggregator::new(
            "alice".to_string(),
            backend.clone(),
            watermarks,
        ));
        let enricher = Arc::new(ProfileEnricher::new(backend.clone(), 3));
        let focus = Arc::new(Mutex::new(None));
        let (events, _) = broadcast::channel(256);
        let reconciler = Arc::new(PushReconciler::new(
            "alice".to_string(),
            backend.clone(),
            registry.clone(),
            unread.clone(),
            enricher,
            focus,
            events.clone(),
        ));
        let config = CoreConfig {
            subscribe_timeout: Duration::from_millis(200),
            reconnect_backoff: Duration::from_millis(20),
            reconnect_backoff_cap: Duration::from_millis(100),
            ..CoreConfig::default()
        };
        let events_rx = events.subscribe();
        let coordinator = FanInCoordinator::new(
            "alice".to_string(),
            backend.clone(),
            reconciler,
            unread.clone(),
            registry.clone(),
            events,
            &config,
        );
        Fixture {
            backend,
            registry,
            unread,
            coordinator,
            events: events_rx,
        }
    }

    async fn wait_for_state(
        rx: &mut watch::Receiver<SubscriptionState>,
        want: SubscriptionState,
    ) {
        while *rx.borrow() != want {
            rx.changed().await.expect("state channel closed");
        }
    }

    async fn seed(backend: &MemoryBackend, sender: &str, conv: ConversationRef, content: &str, at: i64) {
        backend
            .insert_message(NewMessage {
                conversation: conv,
                sender_id: sender.to_string(),
                content: content.to_string(),
                created_at: at,
                client_tag: format!("tag-{sender}-{at}"),
            })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_reaches_active_and_routes_rows() {
        let f = fixture();
        let surface = Surface::Group("eng".to_string());
        let conv = ConversationRef::group("eng");

        f.coordinator.subscribe(surface.clone());
        let mut state = f.coordinator.state_watch(&surface).unwrap();
        wait_for_state(&mut state, SubscriptionState::Active).await;

        seed(&f.backend, "bob", conv.clone(), "hello team", 1_000).await;

        // The pump task delivers asynchronously.
        for _ in 0..100 {
            if !f.registry.snapshot(&conv).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(f.registry.snapshot(&conv).len(), 1);
        assert_eq!(f.unread.count(&conv), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_reconnect_repairs_missed_rows() {
        let f = fixture();
        let surface = Surface::Group("eng".to_string());
        let conv = ConversationRef::group("eng");

        f.coordinator.subscribe(surface.clone());
        let mut state = f.coordinator.state_watch(&surface).unwrap();
        wait_for_state(&mut state, SubscriptionState::Active).await;

        seed(&f.backend, "bob", conv.clone(), "one", 1_000).await;
        seed(&f.backend, "bob", conv.clone(), "two", 2_000).await;
        for _ in 0..100 {
            if f.unread.count(&conv) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(f.unread.count(&conv), 2);

        // Drop the stream; two more rows land unseen.
        f.backend.drop_surface(&surface);
        wait_for_state(&mut state, SubscriptionState::Error).await;
        seed(&f.backend, "bob", conv.clone(), "three", 3_000).await;
        seed(&f.backend, "bob", conv.clone(), "four", 4_000).await;

        // Reconnect repairs the store and the count.
        wait_for_state(&mut state, SubscriptionState::Active).await;
        for _ in 0..100 {
            if f.unread.count(&conv) == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(f.unread.count(&conv), 4, "recompute must repair drift");
        assert_eq!(f.registry.snapshot(&conv).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_backs_off_then_recovers() {
        let mut f = fixture();
        f.backend.set_refuse_subscribe(true);
        let surface = Surface::DirectInbox;
        f.coordinator.subscribe(surface.clone());

        // The watch channel coalesces, so transient states are observed via
        // the event broadcast, which delivers every transition.
        let mut saw_error = false;
        let mut saw_reconnecting = false;
        loop {
            let event = f.events.recv().await.expect("event channel closed");
            let CoreEvent::SubscriptionState { surface: s, state } = event else {
                continue;
            };
            if s != surface {
                continue;
            }
            match state {
                SubscriptionState::Error => {
                    saw_error = true;
                    // Let the next attempt succeed.
                    f.backend.set_refuse_subscribe(false);
                }
                SubscriptionState::Reconnecting => saw_reconnecting = true,
                SubscriptionState::Active => break,
                _ => {}
            }
        }
        assert!(saw_error, "refused subscribe must surface as Error");
        assert!(saw_reconnecting, "recovery must pass through Reconnecting");
        assert_eq!(f.coordinator.state(&surface), SubscriptionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rows_before_activation_are_repaired() {
        let f = fixture();
        let surface = Surface::Group("eng".to_string());
        let conv = ConversationRef::group("eng");

        // The conversation is tracked, but the row lands before any
        // subscriber is registered.
        f.unread.recompute(&conv).await.unwrap();
        seed(&f.backend, "bob", conv.clone(), "early", 1_000).await;

        f.coordinator.subscribe(surface.clone());
        let mut state = f.coordinator.state_watch(&surface).unwrap();
        wait_for_state(&mut state, SubscriptionState::Active).await;

        for _ in 0..100 {
            if f.unread.count(&conv) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(f.registry.snapshot(&conv).len(), 1);
        assert_eq!(f.unread.count(&conv), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_removes_registry_entry() {
        let f = fixture();
        let surface = Surface::DirectInbox;
        f.coordinator.subscribe(surface.clone());
        assert_eq!(f.coordinator.surfaces(), vec![surface.clone()]);

        f.coordinator.unsubscribe(&surface);
        assert!(f.coordinator.surfaces().is_empty());
        assert_eq!(
            f.coordinator.state(&surface),
            SubscriptionState::Unsubscribed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_replaces_prior_handle() {
        let f = fixture();
        let surface = Surface::Group("eng".to_string());
        f.coordinator.subscribe(surface.clone());
        f.coordinator.subscribe(surface.clone());
        assert_eq!(f.coordinator.surfaces().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_membership_sync_subscribes_and_tears_down() {
        let f = fixture();
        f.backend.set_groups("alice", vec!["eng".to_string(), "ops".to_string()]);
        f.coordinator.sync_group_memberships().await.unwrap();

        let mut surfaces = f.coordinator.surfaces();
        surfaces.sort_by_key(|s| format!("{s}"));
        assert_eq!(surfaces.len(), 2);

        // Leaving a group tears its subscription and count down.
        seed(&f.backend, "bob", ConversationRef::group("ops"), "bye", 1_000).await;
        f.unread.recompute(&ConversationRef::group("ops")).await.unwrap();
        assert_eq!(f.unread.count(&ConversationRef::group("ops")), 1);

        f.backend.set_groups("alice", vec!["eng".to_string()]);
        f.coordinator.sync_group_memberships().await.unwrap();
        assert_eq!(f.coordinator.surfaces(), vec![Surface::Group("eng".to_string())]);
        assert_eq!(f.unread.count(&ConversationRef::group("ops")), 0);
    }
}
