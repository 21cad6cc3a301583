//! Service client: correlated calls on top of transport queries.
//!
//! Every call is a query tagged with a fresh sequence number. Replies arrive
//! on transport threads, are queued under the client's QoS bound and are
//! taken by polling. Each query's reply callback holds an owning reference to
//! the client and counts as in flight until the transport drops it; a client
//! that is shut down leaves its node's registry only once that count reaches
//! zero.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::attachment::{now_nanos, AttachmentData, AttachmentError, Gid, ServiceInfo};
use crate::codec::MessageCodec;
use crate::error::{Error, Result};
use crate::liveliness::{Entity, EntityKind, QosProfile, TokenError};
use crate::node::NodeData;
use crate::transport::{Declaration, Reply, ReplyCallback, Sample, Session};
use crate::wait_set::{DataCallbackManager, EventCallback, WaitSetData};

/// A reply as queued by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedReply {
    /// The reply sample, carrying payload and attachment.
    pub sample: Sample,
    /// Local arrival time in nanoseconds since the unix epoch.
    pub received_timestamp: i64,
}

impl ReceivedReply {
    /// Wrap a sample with its arrival time.
    pub fn new(sample: Sample, received_timestamp: i64) -> Self {
        Self {
            sample,
            received_timestamp,
        }
    }
}

struct ClientState {
    shutdown: bool,
    in_flight: usize,
    released: bool,
    queue: VecDeque<ReceivedReply>,
    wait_set: Option<Arc<WaitSetData>>,
    token: Option<Box<dyn Declaration>>,
}

/// State of one service client.
pub struct ClientData {
    id: usize,
    entity: Entity,
    keyexpr: String,
    qos: QosProfile,
    query_timeout: Option<Duration>,
    session: Arc<dyn Session>,
    node: Weak<NodeData>,
    sequence_number: AtomicI64,
    state: Mutex<ClientState>,
    callbacks: DataCallbackManager,
}

impl fmt::Debug for ClientData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ClientData")
            .field("id", &self.id)
            .field("keyexpr", &self.keyexpr)
            .field("shutdown", &state.shutdown)
            .field("in_flight", &state.in_flight)
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl ClientData {
    /// Announce the client and create its state.
    ///
    /// `node` is notified through its registry once the client has been
    /// shut down and no call is in flight.
    pub(crate) fn new(
        session: Arc<dyn Session>,
        node: Weak<NodeData>,
        id: usize,
        entity: Entity,
        query_timeout: Option<Duration>,
    ) -> Result<Arc<Self>> {
        let topic = match (entity.kind(), entity.topic_info()) {
            (EntityKind::Client, Some(topic)) => topic.clone(),
            (kind, _) => return Err(TokenError::TopicInfoMismatch(kind).into()),
        };
        let token = session.declare_token(entity.keyexpr())?;
        debug!(keyexpr = %entity.keyexpr(), "declared client");

        Ok(Arc::new(Self {
            id,
            keyexpr: topic.topic_keyexpr(),
            qos: topic.qos,
            query_timeout,
            entity,
            session,
            node,
            sequence_number: AtomicI64::new(1),
            state: Mutex::new(ClientState {
                shutdown: false,
                in_flight: 0,
                released: false,
                queue: VecDeque::new(),
                wait_set: None,
                token: Some(token),
            }),
            callbacks: DataCallbackManager::new(),
        }))
    }

    /// Registry handle of this client.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The client's liveliness entity.
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    /// Gid stamped on every request.
    pub fn gid(&self) -> Gid {
        self.entity.gid()
    }

    /// Key expression requests are sent on.
    pub fn keyexpr(&self) -> &str {
        &self.keyexpr
    }

    /// Issue the next sequence number. Starts at 1, never reused.
    pub fn next_sequence_number(&self) -> i64 {
        self.sequence_number.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a serialized request and return its sequence number.
    ///
    /// Fails without issuing anything once the client is shut down.
    pub fn send_request(self: &Arc<Self>, payload: Bytes) -> Result<i64> {
        if self.is_shutdown() {
            return Err(Error::ShutDown("client"));
        }
        let sequence_number = self.next_sequence_number();
        let attachment = AttachmentData::stamped(sequence_number, self.gid()).encode()?;
        {
            let mut state = self.state.lock();
            if state.shutdown {
                return Err(Error::ShutDown("client"));
            }
            // Counted before the query exists, so no reply can outrun it.
            state.in_flight += 1;
        }

        let on_reply = {
            let client = Arc::clone(self);
            move |reply| client.handle_reply(reply)
        };
        let on_drop = {
            let client = Arc::clone(self);
            move || client.decrement_in_flight_and_conditionally_remove()
        };

        // On error the callback has already been dropped, undoing the count.
        self.session
            .get(
                &self.keyexpr,
                payload,
                Some(attachment),
                self.query_timeout,
                ReplyCallback::new(on_reply, on_drop),
            )
            .map_err(|e| {
                error!(keyexpr = %self.keyexpr, sequence_number, error = %e, "failed to send request");
                e
            })?;

        trace!(keyexpr = %self.keyexpr, sequence_number, "sent request");
        Ok(sequence_number)
    }

    /// Serialize `request` with `codec` and send it.
    pub fn send_request_with<T, C>(self: &Arc<Self>, codec: &C, request: &T) -> Result<i64>
    where
        C: MessageCodec<T>,
    {
        let payload = codec.encode(request)?;
        self.send_request(payload)
    }

    fn handle_reply(&self, reply: Reply) {
        match reply {
            Reply::Ok(sample) => self.add_new_reply(ReceivedReply::new(sample, now_nanos())),
            Reply::Err(payload) => {
                error!(
                    keyexpr = %self.keyexpr,
                    reason = %String::from_utf8_lossy(&payload),
                    "received error reply"
                );
            }
        }
    }

    /// Queue a reply, evicting the oldest one if the queue is full.
    ///
    /// Fires the new-response callback and then the attached wait-set. A
    /// reply arriving after shutdown is dropped.
    pub fn add_new_reply(&self, reply: ReceivedReply) {
        let wait_set = {
            let mut state = self.state.lock();
            if state.shutdown {
                trace!(keyexpr = %self.keyexpr, "client shut down, dropping reply");
                return;
            }
            if let Some(depth) = self.qos.queue_bound() {
                if state.queue.len() >= depth {
                    warn!(
                        keyexpr = %self.keyexpr,
                        depth,
                        "reply queue depth reached, discarding oldest reply"
                    );
                    state.queue.pop_front();
                }
            }
            state.queue.push_back(reply);
            state.wait_set.clone()
        };

        self.callbacks.trigger_callback();
        if let Some(wait_set) = wait_set {
            wait_set.notify();
        }
    }

    /// Pop the oldest queued reply.
    pub fn take_next_reply(&self) -> Option<ReceivedReply> {
        self.state.lock().queue.pop_front()
    }

    /// Pop the oldest reply and decode its correlation header.
    ///
    /// Returns `Ok(None)` when nothing is queued or the client is shut down.
    /// A reply whose attachment is missing or invalid is consumed and
    /// reported as an error.
    pub fn take_response(&self) -> Result<Option<(Bytes, ServiceInfo)>> {
        let reply = {
            let mut state = self.state.lock();
            if state.shutdown {
                return Ok(None);
            }
            match state.queue.pop_front() {
                Some(reply) => reply,
                None => return Ok(None),
            }
        };

        let decoded = reply
            .sample
            .attachment
            .as_deref()
            .ok_or(AttachmentError::MissingField("sequence_number"))
            .and_then(AttachmentData::decode);
        let attachment = match decoded {
            Ok(attachment) => attachment,
            Err(e) => {
                warn!(keyexpr = %reply.sample.key_expr, error = %e, "rejecting reply with invalid attachment");
                return Err(e.into());
            }
        };

        Ok(Some((
            reply.sample.payload,
            ServiceInfo::new(&attachment, reply.received_timestamp),
        )))
    }

    /// [`take_response`](Self::take_response) followed by deserialization.
    pub fn take_response_with<T, C>(&self, codec: &C) -> Result<Option<(T, ServiceInfo)>>
    where
        C: MessageCodec<T>,
    {
        match self.take_response()? {
            Some((payload, info)) => Ok(Some((codec.decode(payload)?, info))),
            None => Ok(None),
        }
    }

    /// Install or clear the callback fired for every queued reply.
    pub fn set_on_new_response_callback(&self, callback: Option<EventCallback>) {
        self.callbacks.set_callback(callback);
    }

    /// If nothing is queued, attach `wait_set` and return `false`.
    pub fn queue_has_data_and_attach_condition_if_not(&self, wait_set: &Arc<WaitSetData>) -> bool {
        let mut state = self.state.lock();
        if !state.queue.is_empty() {
            return true;
        }
        state.wait_set = Some(Arc::clone(wait_set));
        false
    }

    /// Detach any wait-set and report whether the queue is empty.
    pub fn detach_condition_and_queue_is_empty(&self) -> bool {
        let mut state = self.state.lock();
        state.wait_set = None;
        state.queue.is_empty()
    }

    /// Number of calls whose reply callback is still registered.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Whether shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    fn decrement_in_flight_and_conditionally_remove(&self) {
        let release = {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.shutdown && state.in_flight == 0 && !std::mem::replace(&mut state.released, true)
        };
        if release {
            debug!(keyexpr = %self.keyexpr, "last in-flight call finished");
            self.release();
        }
    }

    fn release(&self) {
        if let Some(node) = self.node.upgrade() {
            node.release_client(self.id);
        }
    }

    /// Stop accepting calls and withdraw the client's token.
    ///
    /// Idempotent and non-blocking. If no call is in flight the node drops
    /// the client right away; otherwise that happens when the last in-flight
    /// call's callback is dropped.
    pub fn shutdown(&self) -> Result<()> {
        let (token, release, in_flight) = {
            let mut state = self.state.lock();
            if state.shutdown {
                return Ok(());
            }
            state.shutdown = true;
            let release = state.in_flight == 0 && !std::mem::replace(&mut state.released, true);
            (state.token.take(), release, state.in_flight)
        };

        let undeclared = match token {
            Some(token) => token.undeclare(),
            None => Ok(()),
        };
        if let Err(e) = &undeclared {
            error!(keyexpr = %self.keyexpr, error = %e, "unable to undeclare client token");
        }
        debug!(keyexpr = %self.keyexpr, in_flight, "client shut down");

        if release {
            self.release();
        }
        undeclared
    }
}
