//! In-process transport.
//!
//! A [`LocalHub`] routes liveliness tokens and queries between any number of
//! [`LocalSession`]s in the same process. Callbacks run on the hub's own
//! multi-thread runtime, never on the thread that triggered them, which gives
//! the same concurrency shape as a networked transport.

use std::collections::{BTreeMap, HashSet};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{
    Declaration, Query, QueryHandler, Reply, ReplyCallback, Sample, SampleCallback, Session,
    SessionId,
};
use crate::error::{Error, Result};
use crate::keyexpr;

const DEFAULT_WORKER_THREADS: usize = 2;

static HUB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// In-process router shared by [`LocalSession`]s.
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for LocalHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("LocalHub")
            .field("tokens", &state.tokens.len())
            .field("subscribers", &state.subscribers.len())
            .field("queryables", &state.queryables.len())
            .finish()
    }
}

struct HubInner {
    runtime: Option<Runtime>,
    handle: Handle,
    nonce: [u8; 32],
    next_session: AtomicU64,
    next_declaration: AtomicU64,
    state: Mutex<HubState>,
}

#[derive(Default)]
struct HubState {
    tokens: BTreeMap<u64, Token>,
    subscribers: BTreeMap<u64, Subscriber>,
    queryables: BTreeMap<u64, Queryable>,
    closed: HashSet<SessionId>,
}

struct Token {
    owner: SessionId,
    key_expr: String,
}

struct Subscriber {
    owner: SessionId,
    key_expr: String,
    tx: mpsc::UnboundedSender<Sample>,
}

struct Queryable {
    owner: SessionId,
    key_expr: String,
    handler: QueryHandler,
}

#[derive(Debug, Clone, Copy)]
enum DeclarationKind {
    Token,
    Subscriber,
    Queryable,
}

impl HubState {
    // Sent while the hub lock is held so every subscriber sees one global order.
    fn publish(&self, sample: &Sample) {
        for sub in self.subscribers.values() {
            if keyexpr::intersects(&sub.key_expr, &sample.key_expr) {
                let _ = sub.tx.send(sample.clone());
            }
        }
    }

    fn ensure_open(&self, session: SessionId) -> Result<()> {
        if self.closed.contains(&session) {
            return Err(Error::transport(format!("session {session} is closed")));
        }
        Ok(())
    }

    fn remove(&mut self, kind: DeclarationKind, id: u64) {
        match kind {
            DeclarationKind::Token => {
                if let Some(token) = self.tokens.remove(&id) {
                    self.publish(&Sample::delete(token.key_expr));
                }
            }
            DeclarationKind::Subscriber => {
                self.subscribers.remove(&id);
            }
            DeclarationKind::Queryable => {
                self.queryables.remove(&id);
            }
        }
    }

    fn remove_owned_by(&mut self, owner: SessionId) {
        let tokens: Vec<u64> = self
            .tokens
            .iter()
            .filter(|(_, t)| t.owner == owner)
            .map(|(id, _)| *id)
            .collect();
        for id in tokens {
            self.remove(DeclarationKind::Token, id);
        }
        self.subscribers.retain(|_, s| s.owner != owner);
        self.queryables.retain(|_, q| q.owner != owner);
    }
}

impl Drop for HubInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl LocalHub {
    /// Create a hub with a small worker pool.
    pub fn new() -> Result<Self> {
        Self::with_worker_threads(DEFAULT_WORKER_THREADS)
    }

    /// Create a hub whose callbacks run on `threads` worker threads.
    pub fn with_worker_threads(threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("local-hub")
            .enable_time()
            .build()
            .map_err(|e| Error::transport(format!("failed to start hub runtime: {e}")))?;

        let mut hasher = Sha256::new();
        hasher.update(process::id().to_le_bytes());
        hasher.update(HUB_COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
        hasher.update(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
                .to_le_bytes(),
        );

        Ok(Self {
            inner: Arc::new(HubInner {
                handle: runtime.handle().clone(),
                runtime: Some(runtime),
                nonce: hasher.finalize().into(),
                next_session: AtomicU64::new(0),
                next_declaration: AtomicU64::new(0),
                state: Mutex::new(HubState::default()),
            }),
        })
    }

    /// Open a new session on this hub.
    pub fn open_session(&self) -> Arc<LocalSession> {
        let n = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let digest = Sha256::new()
            .chain_update(self.inner.nonce)
            .chain_update(n.to_le_bytes())
            .finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        let id = SessionId::from_bytes(id);
        debug!(session = %id, "opened local session");
        Arc::new(LocalSession {
            id,
            hub: Arc::clone(&self.inner),
        })
    }

    /// Key expressions of all live tokens, in declaration order.
    pub fn live_tokens(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        state.tokens.values().map(|t| t.key_expr.clone()).collect()
    }
}

/// A session on a [`LocalHub`].
pub struct LocalSession {
    id: SessionId,
    hub: Arc<HubInner>,
}

impl std::fmt::Debug for LocalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSession").field("id", &self.id).finish()
    }
}

impl LocalSession {
    fn declare(
        &self,
        kind: DeclarationKind,
        insert: impl FnOnce(&mut HubState, u64),
    ) -> Result<Box<dyn Declaration>> {
        let mut state = self.hub.state.lock();
        state.ensure_open(self.id)?;
        let id = self.hub.next_declaration.fetch_add(1, Ordering::Relaxed);
        insert(&mut *state, id);
        Ok(Box::new(LocalDeclaration {
            hub: Arc::downgrade(&self.hub),
            id,
            kind,
            released: false,
        }))
    }
}

fn check_keyexpr(key_expr: &str, wildcards: bool) -> Result<()> {
    if !keyexpr::is_valid(key_expr) || (!wildcards && key_expr.contains('*')) {
        return Err(Error::transport(format!("invalid key expression `{key_expr}`")));
    }
    Ok(())
}

impl Session for LocalSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn declare_token(&self, key_expr: &str) -> Result<Box<dyn Declaration>> {
        check_keyexpr(key_expr, false)?;
        let owner = self.id;
        let handle = self.declare(DeclarationKind::Token, |state, id| {
            state.publish(&Sample::put(key_expr, Bytes::new(), None));
            state.tokens.insert(
                id,
                Token {
                    owner,
                    key_expr: key_expr.to_string(),
                },
            );
        })?;
        trace!(session = %owner, %key_expr, "declared token");
        Ok(handle)
    }

    fn declare_liveliness_subscriber(
        &self,
        key_expr: &str,
        callback: SampleCallback,
    ) -> Result<Box<dyn Declaration>> {
        check_keyexpr(key_expr, true)?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Sample>();
        let owner = self.id;
        let handle = self.declare(DeclarationKind::Subscriber, |state, id| {
            state.subscribers.insert(
                id,
                Subscriber {
                    owner,
                    key_expr: key_expr.to_string(),
                    tx,
                },
            );
        })?;
        self.hub.handle.spawn(async move {
            while let Some(sample) = rx.recv().await {
                callback(sample);
            }
        });
        debug!(session = %owner, %key_expr, "declared liveliness subscriber");
        Ok(handle)
    }

    fn liveliness_get(&self, key_expr: &str) -> Result<mpsc::UnboundedReceiver<Reply>> {
        check_keyexpr(key_expr, true)?;
        let snapshot: Vec<String> = {
            let state = self.hub.state.lock();
            state.ensure_open(self.id)?;
            state
                .tokens
                .values()
                .filter(|t| keyexpr::intersects(key_expr, &t.key_expr))
                .map(|t| t.key_expr.clone())
                .collect()
        };
        trace!(session = %self.id, %key_expr, tokens = snapshot.len(), "liveliness get");

        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.handle.spawn(async move {
            for key in snapshot {
                if tx.send(Reply::Ok(Sample::put(key, Bytes::new(), None))).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    fn get(
        &self,
        key_expr: &str,
        payload: Bytes,
        attachment: Option<Bytes>,
        timeout: Option<Duration>,
        callback: ReplyCallback,
    ) -> Result<()> {
        check_keyexpr(key_expr, true)?;
        let handlers: Vec<QueryHandler> = {
            let state = self.hub.state.lock();
            state.ensure_open(self.id)?;
            state
                .queryables
                .values()
                .filter(|q| keyexpr::intersects(key_expr, &q.key_expr))
                .map(|q| Arc::clone(&q.handler))
                .collect()
        };
        trace!(session = %self.id, %key_expr, queryables = handlers.len(), "issuing query");

        let (tx, mut rx) = mpsc::unbounded_channel();
        for handler in handlers {
            let query = Query::new(key_expr, payload.clone(), attachment.clone(), tx.clone());
            self.hub.handle.spawn(async move { handler(query) });
        }
        drop(tx);

        let key_expr = key_expr.to_string();
        self.hub.handle.spawn(async move {
            let mut callback = callback;
            match timeout {
                None => {
                    while let Some(reply) = rx.recv().await {
                        callback.call(reply);
                    }
                }
                Some(timeout) => {
                    let deadline = tokio::time::Instant::now() + timeout;
                    loop {
                        match tokio::time::timeout_at(deadline, rx.recv()).await {
                            Ok(Some(reply)) => callback.call(reply),
                            Ok(None) => break,
                            Err(_) => {
                                debug!(%key_expr, ?timeout, "query timed out");
                                break;
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn declare_queryable(
        &self,
        key_expr: &str,
        handler: QueryHandler,
    ) -> Result<Box<dyn Declaration>> {
        check_keyexpr(key_expr, true)?;
        let owner = self.id;
        let handle = self.declare(DeclarationKind::Queryable, |state, id| {
            state.queryables.insert(
                id,
                Queryable {
                    owner,
                    key_expr: key_expr.to_string(),
                    handler,
                },
            );
        })?;
        debug!(session = %owner, %key_expr, "declared queryable");
        Ok(handle)
    }

    fn close(&self) -> Result<()> {
        let mut state = self.hub.state.lock();
        if !state.closed.insert(self.id) {
            return Ok(());
        }
        state.remove_owned_by(self.id);
        debug!(session = %self.id, "closed local session");
        Ok(())
    }
}

impl Drop for LocalSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct LocalDeclaration {
    hub: Weak<HubInner>,
    id: u64,
    kind: DeclarationKind,
    released: bool,
}

impl LocalDeclaration {
    fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.state.lock().remove(self.kind, self.id);
            trace!(kind = ?self.kind, id = self.id, "undeclared");
        }
    }
}

impl Declaration for LocalDeclaration {
    fn undeclare(mut self: Box<Self>) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for LocalDeclaration {
    fn drop(&mut self) {
        self.release();
    }
}
