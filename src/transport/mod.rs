//! Transport session abstraction.
//!
//! The core only needs a handful of primitives from the underlying pub/sub
//! transport: liveliness tokens and subscriptions, a one-shot liveliness
//! collection, queries with asynchronous replies, and queryables. [`Session`]
//! captures exactly those; [`local`] provides an in-process implementation.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

pub mod local;

/// Raw event-kind code of a put.
pub const SAMPLE_KIND_PUT: u8 = 0;
/// Raw event-kind code of a delete.
pub const SAMPLE_KIND_DELETE: u8 = 1;

/// Identity of a transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Wrap raw id bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw id bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 32 || !s.is_ascii() {
            return Err(Error::transport(format!("invalid session id `{s}`")));
        }
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16)
                .map_err(|_| Error::transport(format!("invalid session id `{s}`")))?;
        }
        Ok(Self(bytes))
    }
}

/// Closed set of event kinds the core reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    /// The key was announced or updated.
    Put,
    /// The key was withdrawn.
    Delete,
}

impl SampleKind {
    /// Decode a raw event-kind code. Unknown codes yield `None`.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            SAMPLE_KIND_PUT => Some(SampleKind::Put),
            SAMPLE_KIND_DELETE => Some(SampleKind::Delete),
            _ => None,
        }
    }

    /// Raw event-kind code.
    pub fn code(self) -> u8 {
        match self {
            SampleKind::Put => SAMPLE_KIND_PUT,
            SampleKind::Delete => SAMPLE_KIND_DELETE,
        }
    }
}

/// A keyed event delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Key the event is about.
    pub key_expr: String,
    /// Raw event-kind code, see [`Sample::kind`].
    pub kind: u8,
    /// Payload, empty for liveliness events.
    pub payload: Bytes,
    /// Optional attachment.
    pub attachment: Option<Bytes>,
}

impl Sample {
    /// A put sample.
    pub fn put(key_expr: impl Into<String>, payload: Bytes, attachment: Option<Bytes>) -> Self {
        Self {
            key_expr: key_expr.into(),
            kind: SAMPLE_KIND_PUT,
            payload,
            attachment,
        }
    }

    /// A delete sample.
    pub fn delete(key_expr: impl Into<String>) -> Self {
        Self {
            key_expr: key_expr.into(),
            kind: SAMPLE_KIND_DELETE,
            payload: Bytes::new(),
            attachment: None,
        }
    }

    /// Decoded event kind, `None` when the code is not recognized.
    pub fn kind(&self) -> Option<SampleKind> {
        SampleKind::from_code(self.kind)
    }
}

/// One reply to a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A successful reply.
    Ok(Sample),
    /// An error reply with an opaque payload.
    Err(Bytes),
}

type OnReply = Box<dyn FnMut(Reply) + Send>;
type OnDrop = Box<dyn FnOnce() + Send>;

/// Reply handler registered with a query.
///
/// `on_reply` runs once per reply. `on_drop` runs exactly once when the
/// transport releases the callback, whatever the outcome of the query was:
/// after the last reply, on timeout, or when the query could not be issued.
pub struct ReplyCallback {
    on_reply: OnReply,
    on_drop: Option<OnDrop>,
}

impl ReplyCallback {
    /// Create a callback pair.
    pub fn new<R, D>(on_reply: R, on_drop: D) -> Self
    where
        R: FnMut(Reply) + Send + 'static,
        D: FnOnce() + Send + 'static,
    {
        Self {
            on_reply: Box::new(on_reply),
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// Deliver one reply.
    pub fn call(&mut self, reply: Reply) {
        (self.on_reply)(reply)
    }
}

impl fmt::Debug for ReplyCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyCallback")
            .field("dropped", &self.on_drop.is_none())
            .finish()
    }
}

impl Drop for ReplyCallback {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

/// An incoming query, handed to a queryable.
///
/// Replies are routed back to the querier. The query stays open while any
/// clone of it is alive; dropping the last clone finalizes it.
#[derive(Debug, Clone)]
pub struct Query {
    key_expr: String,
    payload: Bytes,
    attachment: Option<Bytes>,
    replies: mpsc::UnboundedSender<Reply>,
}

impl Query {
    /// Create a query whose replies go to `replies`.
    pub fn new(
        key_expr: impl Into<String>,
        payload: Bytes,
        attachment: Option<Bytes>,
        replies: mpsc::UnboundedSender<Reply>,
    ) -> Self {
        Self {
            key_expr: key_expr.into(),
            payload,
            attachment,
            replies,
        }
    }

    /// Key expression the query was issued on.
    pub fn key_expr(&self) -> &str {
        &self.key_expr
    }

    /// Query payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Query attachment.
    pub fn attachment(&self) -> Option<&Bytes> {
        self.attachment.as_ref()
    }

    /// Send a successful reply.
    pub fn reply(&self, key_expr: &str, payload: Bytes, attachment: Option<Bytes>) -> Result<()> {
        self.send(Reply::Ok(Sample::put(key_expr, payload, attachment)))
    }

    /// Send an error reply.
    pub fn reply_err(&self, payload: Bytes) -> Result<()> {
        self.send(Reply::Err(payload))
    }

    fn send(&self, reply: Reply) -> Result<()> {
        self.replies
            .send(reply)
            .map_err(|_| Error::transport(format!("query on `{}` is closed", self.key_expr)))
    }
}

/// Callback for liveliness events.
pub type SampleCallback = Arc<dyn Fn(Sample) + Send + Sync>;

/// Callback for incoming queries.
pub type QueryHandler = Arc<dyn Fn(Query) + Send + Sync>;

/// A declared token, subscriber or queryable.
///
/// Undeclared explicitly with [`Declaration::undeclare`] or implicitly on drop.
pub trait Declaration: Send + Sync {
    /// Withdraw the declaration.
    fn undeclare(self: Box<Self>) -> Result<()>;
}

/// Primitives the core consumes from a transport session.
///
/// Callbacks are invoked on transport-owned threads.
pub trait Session: Send + Sync + 'static {
    /// Identity of this session.
    fn id(&self) -> SessionId;

    /// Announce a liveliness token until the returned handle is undeclared.
    fn declare_token(&self, key_expr: &str) -> Result<Box<dyn Declaration>>;

    /// Subscribe to liveliness puts and deletes matching `key_expr`.
    fn declare_liveliness_subscriber(
        &self,
        key_expr: &str,
        callback: SampleCallback,
    ) -> Result<Box<dyn Declaration>>;

    /// Collect every currently-announced token matching `key_expr`.
    ///
    /// The channel is unbounded and closes once the collection is complete.
    fn liveliness_get(&self, key_expr: &str) -> Result<mpsc::UnboundedReceiver<Reply>>;

    /// Issue a query. `timeout` of `None` waits indefinitely.
    ///
    /// The callback is dropped exactly once, also when this returns an error.
    fn get(
        &self,
        key_expr: &str,
        payload: Bytes,
        attachment: Option<Bytes>,
        timeout: Option<Duration>,
        callback: ReplyCallback,
    ) -> Result<()>;

    /// Serve queries matching `key_expr`.
    fn declare_queryable(&self, key_expr: &str, handler: QueryHandler)
        -> Result<Box<dyn Declaration>>;

    /// Close the session, withdrawing everything it declared.
    fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn session_id_hex() {
        let id = SessionId::from_bytes([0x01, 0xab, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff]);
        let text = id.to_string();
        assert_eq!(text, format!("01ab{}ff", "00".repeat(13)));
        assert_eq!(text.parse::<SessionId>().unwrap(), id);
        assert!("xyz".parse::<SessionId>().is_err());
        assert!("zz".repeat(16).parse::<SessionId>().is_err());
    }

    #[test]
    fn unknown_sample_kind_is_none() {
        assert_eq!(Sample::put("a", Bytes::new(), None).kind(), Some(SampleKind::Put));
        assert_eq!(Sample::delete("a").kind(), Some(SampleKind::Delete));
        let mut odd = Sample::delete("a");
        odd.kind = 7;
        assert_eq!(odd.kind(), None);
    }

    #[test]
    fn reply_callback_drop_fires_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let replies = Arc::new(AtomicUsize::new(0));
        let (d, r) = (drops.clone(), replies.clone());
        let mut cb = ReplyCallback::new(
            move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                d.fetch_add(1, Ordering::SeqCst);
            },
        );
        cb.call(Reply::Err(Bytes::new()));
        cb.call(Reply::Err(Bytes::new()));
        drop(cb);
        assert_eq!(replies.load(Ordering::SeqCst), 2);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn query_reply_after_receiver_gone_fails() {
        let (tx, rx) = mpsc::unbounded_channel();
        let query = Query::new("k", Bytes::new(), None, tx);
        query.reply("k", Bytes::from_static(b"x"), None).unwrap();
        drop(rx);
        assert!(query.reply_err(Bytes::new()).is_err());
    }
}
