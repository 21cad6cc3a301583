//! Discovery controller: feeds the graph cache from liveliness tokens.
//!
//! Construction is two-phase. [`DiscoveryController::bootstrap`] collects
//! every token that is already live and applies it; only afterwards does
//! [`DiscoveryController::activate`] declare the live subscription. An event
//! can therefore be seen twice (once in the snapshot, once live) but never
//! missed, and the cache's idempotent insert absorbs the duplicate.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, info_span, trace, warn};

use crate::error::{Error, Result};
use crate::graph_cache::GraphCache;
use crate::liveliness::{self, Entity};
use crate::transport::{Declaration, Reply, Sample, SampleCallback, SampleKind, Session};
use crate::wait_set::GuardCondition;

const EVENT_CAPACITY: usize = 256;

/// Lifecycle of a [`DiscoveryController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Created, nothing collected yet.
    Uninitialized,
    /// Bootstrap applied, live subscription not yet declared.
    Subscribing,
    /// Live subscription running.
    Active,
    /// Shutdown in progress.
    ShuttingDown,
    /// Shut down.
    Shutdown,
}

impl DiscoveryState {
    fn as_str(self) -> &'static str {
        match self {
            DiscoveryState::Uninitialized => "uninitialized",
            DiscoveryState::Subscribing => "subscribing",
            DiscoveryState::Active => "active",
            DiscoveryState::ShuttingDown => "shutting down",
            DiscoveryState::Shutdown => "shut down",
        }
    }

    fn is_shutting_down(self) -> bool {
        matches!(self, DiscoveryState::ShuttingDown | DiscoveryState::Shutdown)
    }
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A graph change applied from the live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphEvent {
    /// An entity appeared.
    Put(Entity),
    /// An entity went away.
    Delete(Entity),
}

impl GraphEvent {
    /// The entity the event is about.
    pub fn entity(&self) -> &Entity {
        match self {
            GraphEvent::Put(e) | GraphEvent::Delete(e) => e,
        }
    }
}

/// Stream of graph events.
pub type GraphEventStream = Pin<Box<dyn Stream<Item = GraphEvent> + Send>>;

// Everything the live callback touches. The subscriber handle lives on the
// controller so the callback does not keep its own subscription alive.
struct DiscoveryShared {
    state: Mutex<DiscoveryState>,
    graph_cache: Arc<GraphCache>,
    graph_guard: Arc<GuardCondition>,
    events: broadcast::Sender<GraphEvent>,
}

impl DiscoveryShared {
    fn handle_sample(&self, sample: Sample) {
        let state = self.state.lock();
        if state.is_shutting_down() {
            trace!(key_expr = %sample.key_expr, "discovery shutting down, dropping event");
            return;
        }

        let event = match sample.kind() {
            Some(SampleKind::Put) => match self.graph_cache.parse_put(&sample.key_expr, false) {
                Ok(Some(entity)) => GraphEvent::Put(entity),
                Ok(None) => return,
                Err(e) => {
                    warn!(key_expr = %sample.key_expr, error = %e, "dropping malformed liveliness token");
                    return;
                }
            },
            Some(SampleKind::Delete) => match self.graph_cache.parse_delete(&sample.key_expr) {
                Ok(entity) => GraphEvent::Delete(entity),
                Err(e) => {
                    warn!(key_expr = %sample.key_expr, error = %e, "dropping malformed liveliness token");
                    return;
                }
            },
            None => {
                debug!(key_expr = %sample.key_expr, kind = sample.kind, "ignoring unknown sample kind");
                return;
            }
        };

        self.graph_guard.trigger();
        let _ = self.events.send(event);
        drop(state);
    }
}

/// Owns the session's discovery subscription and feeds the graph cache.
pub struct DiscoveryController {
    session: Arc<dyn Session>,
    domain_id: usize,
    shared: Arc<DiscoveryShared>,
    subscriber: Mutex<Option<Box<dyn Declaration>>>,
}

impl fmt::Debug for DiscoveryController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryController")
            .field("session", &self.session.id())
            .field("domain_id", &self.domain_id)
            .field("state", &self.state())
            .finish()
    }
}

impl DiscoveryController {
    /// Create a controller in [`DiscoveryState::Uninitialized`].
    pub fn new(
        session: Arc<dyn Session>,
        domain_id: usize,
        graph_cache: Arc<GraphCache>,
        graph_guard: Arc<GuardCondition>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            session,
            domain_id,
            shared: Arc::new(DiscoveryShared {
                state: Mutex::new(DiscoveryState::Uninitialized),
                graph_cache,
                graph_guard,
                events,
            }),
            subscriber: Mutex::new(None),
        }
    }

    /// Current state.
    pub fn state(&self) -> DiscoveryState {
        *self.shared.state.lock()
    }

    /// The cache this controller feeds.
    pub fn graph_cache(&self) -> &Arc<GraphCache> {
        &self.shared.graph_cache
    }

    fn expect_state(state: DiscoveryState, expected: DiscoveryState) -> Result<()> {
        if state != expected {
            return Err(Error::InvalidState {
                expected: expected.as_str(),
                found: state.as_str(),
            });
        }
        Ok(())
    }

    /// Collect every live token in the domain and apply it to the cache.
    ///
    /// Blocks until the transport signals that the collection is complete.
    /// Tokens from this session are skipped.
    ///
    /// On a multi-thread tokio runtime the wait runs under
    /// [`tokio::task::block_in_place`]. On a current-thread runtime it fails
    /// with [`Error::BlockingInRuntime`] and the state is left unchanged.
    pub fn bootstrap(&self) -> Result<()> {
        match tokio::runtime::Handle::try_current() {
            Err(_) => self.collect_existing(),
            Ok(handle) => match handle.runtime_flavor() {
                RuntimeFlavor::MultiThread => {
                    tokio::task::block_in_place(|| self.collect_existing())
                }
                _ => Err(Error::BlockingInRuntime("graph bootstrap")),
            },
        }
    }

    fn collect_existing(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        Self::expect_state(*state, DiscoveryState::Uninitialized)?;

        let _span = info_span!("bootstrap", domain_id = self.domain_id).entered();
        let keyexpr = liveliness::subscription_keyexpr(self.domain_id);
        let mut replies = self.session.liveliness_get(&keyexpr)?;

        let mut applied = 0usize;
        while let Some(reply) = replies.blocking_recv() {
            match reply {
                Reply::Ok(sample) => match self.shared.graph_cache.parse_put(&sample.key_expr, true) {
                    Ok(Some(_)) => applied += 1,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(key_expr = %sample.key_expr, error = %e, "dropping malformed liveliness token");
                    }
                },
                Reply::Err(payload) => {
                    warn!(
                        error = %String::from_utf8_lossy(&payload),
                        "error reply while collecting liveliness tokens"
                    );
                }
            }
        }

        *state = DiscoveryState::Subscribing;
        info!(applied, "graph bootstrap complete");
        Ok(())
    }

    /// Declare the live subscription.
    ///
    /// On failure the controller stays in [`DiscoveryState::Subscribing`]
    /// and the error is returned; the caller may retry.
    pub fn activate(&self) -> Result<()> {
        Self::expect_state(self.state(), DiscoveryState::Subscribing)?;

        let _span = info_span!("activate", domain_id = self.domain_id).entered();
        let keyexpr = liveliness::subscription_keyexpr(self.domain_id);
        let shared = Arc::clone(&self.shared);
        let callback: SampleCallback = Arc::new(move |sample| shared.handle_sample(sample));

        // Declared without the state lock held: a transport may deliver the
        // first event before this call returns.
        let subscriber = self
            .session
            .declare_liveliness_subscriber(&keyexpr, callback)
            .map_err(|e| {
                warn!(%keyexpr, error = %e, "failed to declare liveliness subscriber");
                e
            })?;

        let mut state = self.shared.state.lock();
        if let Err(e) = Self::expect_state(*state, DiscoveryState::Subscribing) {
            drop(state);
            let _ = subscriber.undeclare();
            return Err(e);
        }
        *self.subscriber.lock() = Some(subscriber);
        *state = DiscoveryState::Active;
        info!(%keyexpr, "discovery active");
        Ok(())
    }

    /// Stream of graph events applied from now on.
    pub fn events(&self) -> GraphEventStream {
        BroadcastStream::new(self.shared.events.subscribe())
            .filter_map(|msg| async move { msg.ok() })
            .boxed()
    }

    /// Undeclare the subscription and close the session.
    ///
    /// Idempotent. A failure to close the session is returned, but the
    /// controller still ends up in [`DiscoveryState::Shutdown`].
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.is_shutting_down() {
                return Ok(());
            }
            *state = DiscoveryState::ShuttingDown;
        }

        if let Some(subscriber) = self.subscriber.lock().take() {
            if let Err(e) = subscriber.undeclare() {
                warn!(error = %e, "failed to undeclare liveliness subscriber");
            }
        }
        let closed = self.session.close();

        *self.shared.state.lock() = DiscoveryState::Shutdown;
        match closed {
            Ok(()) => {
                info!(session = %self.session.id(), "discovery shut down");
                Ok(())
            }
            Err(e) => {
                warn!(session = %self.session.id(), error = %e, "failed to close session");
                Err(e)
            }
        }
    }
}

impl Drop for DiscoveryController {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
