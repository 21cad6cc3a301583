//! Service server.
//!
//! A service declares a queryable on its topic key expression and a
//! liveliness token. Incoming queries are queued like client replies, taken
//! by polling, and answered with the request's sequence number and the
//! calling client's gid so the reply can be correlated on the other side.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::attachment::{now_nanos, AttachmentData, AttachmentError, Gid, ServiceInfo};
use crate::codec::MessageCodec;
use crate::error::{Error, Result};
use crate::liveliness::{Entity, EntityKind, QosProfile, TokenError};
use crate::transport::{Declaration, Query, QueryHandler, Session};
use crate::wait_set::{DataCallbackManager, EventCallback, WaitSetData};

/// Identifies a taken request for [`ServiceData::send_response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    /// Gid of the calling client.
    pub client_gid: Gid,
    /// The client's sequence number for this call.
    pub sequence_number: i64,
}

impl From<&ServiceInfo> for RequestId {
    fn from(info: &ServiceInfo) -> Self {
        Self {
            client_gid: info.source_gid,
            sequence_number: info.sequence_number,
        }
    }
}

struct QueuedQuery {
    query: Query,
    received_timestamp: i64,
}

struct ServiceState {
    shutdown: bool,
    queue: VecDeque<QueuedQuery>,
    taken: HashMap<RequestId, Query>,
    wait_set: Option<Arc<WaitSetData>>,
    token: Option<Box<dyn Declaration>>,
    queryable: Option<Box<dyn Declaration>>,
}

/// State of one service server.
pub struct ServiceData {
    id: usize,
    entity: Entity,
    keyexpr: String,
    qos: QosProfile,
    state: Mutex<ServiceState>,
    callbacks: DataCallbackManager,
}

impl fmt::Debug for ServiceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ServiceData")
            .field("id", &self.id)
            .field("keyexpr", &self.keyexpr)
            .field("shutdown", &state.shutdown)
            .field("queued", &state.queue.len())
            .field("taken", &state.taken.len())
            .finish()
    }
}

impl ServiceData {
    /// Declare the queryable and announce the service.
    pub(crate) fn new(session: &dyn Session, id: usize, entity: Entity) -> Result<Arc<Self>> {
        let topic = match (entity.kind(), entity.topic_info()) {
            (EntityKind::Service, Some(topic)) => topic.clone(),
            (kind, _) => return Err(TokenError::TopicInfoMismatch(kind).into()),
        };

        let service = Arc::new(Self {
            id,
            keyexpr: topic.topic_keyexpr(),
            qos: topic.qos,
            entity,
            state: Mutex::new(ServiceState {
                shutdown: false,
                queue: VecDeque::new(),
                taken: HashMap::new(),
                wait_set: None,
                token: None,
                queryable: None,
            }),
            callbacks: DataCallbackManager::new(),
        });

        // The session owns the handler; a strong reference would keep the
        // service alive for as long as the queryable is declared.
        let weak: Weak<ServiceData> = Arc::downgrade(&service);
        let handler: QueryHandler = Arc::new(move |query| {
            if let Some(service) = weak.upgrade() {
                service.add_new_query(query);
            }
        });
        let queryable = session.declare_queryable(&service.keyexpr, handler)?;
        let token = session.declare_token(service.entity.keyexpr())?;
        {
            let mut state = service.state.lock();
            state.queryable = Some(queryable);
            state.token = Some(token);
        }
        debug!(keyexpr = %service.keyexpr, "declared service");
        Ok(service)
    }

    /// Registry handle of this service.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The service's liveliness entity.
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    /// Key expression the service answers on.
    pub fn keyexpr(&self) -> &str {
        &self.keyexpr
    }

    fn add_new_query(&self, query: Query) {
        let wait_set = {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            if let Some(depth) = self.qos.queue_bound() {
                if state.queue.len() >= depth {
                    warn!(
                        keyexpr = %self.keyexpr,
                        depth,
                        "request queue depth reached, discarding oldest request"
                    );
                    state.queue.pop_front();
                }
            }
            state.queue.push_back(QueuedQuery {
                query,
                received_timestamp: now_nanos(),
            });
            state.wait_set.clone()
        };

        self.callbacks.trigger_callback();
        if let Some(wait_set) = wait_set {
            wait_set.notify();
        }
    }

    /// Pop the oldest request and decode its correlation header.
    ///
    /// The request stays pending until answered with
    /// [`send_response`](Self::send_response). A request without a valid
    /// attachment is consumed and reported as an error.
    pub fn take_request(&self) -> Result<Option<(Bytes, ServiceInfo)>> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Ok(None);
        }
        let Some(queued) = state.queue.pop_front() else {
            return Ok(None);
        };

        let decoded = queued
            .query
            .attachment()
            .map(|a| &a[..])
            .ok_or(AttachmentError::MissingField("sequence_number"))
            .and_then(AttachmentData::decode);
        let attachment = match decoded {
            Ok(attachment) => attachment,
            Err(e) => {
                warn!(keyexpr = %self.keyexpr, error = %e, "rejecting request with invalid attachment");
                return Err(e.into());
            }
        };

        let info = ServiceInfo::new(&attachment, queued.received_timestamp);
        let request = RequestId::from(&info);
        if state.taken.contains_key(&request) {
            return Err(Error::DuplicateRequest {
                sequence_number: request.sequence_number,
            });
        }
        let payload = queued.query.payload().clone();
        state.taken.insert(request, queued.query);
        trace!(keyexpr = %self.keyexpr, sequence_number = info.sequence_number, "took request");
        Ok(Some((payload, info)))
    }

    /// [`take_request`](Self::take_request) followed by deserialization.
    pub fn take_request_with<T, C>(&self, codec: &C) -> Result<Option<(T, ServiceInfo)>>
    where
        C: MessageCodec<T>,
    {
        match self.take_request()? {
            Some((payload, info)) => Ok(Some((codec.decode(payload)?, info))),
            None => Ok(None),
        }
    }

    /// Answer a taken request.
    ///
    /// The reply carries the request's sequence number and the client's gid.
    /// A request that was never taken, or was already answered, is ignored.
    pub fn send_response(&self, request: &RequestId, payload: Bytes) -> Result<()> {
        let attachment =
            AttachmentData::stamped(request.sequence_number, request.client_gid).encode()?;
        let Some(query) = self.state.lock().taken.remove(request) else {
            debug!(
                keyexpr = %self.keyexpr,
                sequence_number = request.sequence_number,
                "no pending request, dropping response"
            );
            return Ok(());
        };

        // Dropping the query afterwards completes the call on the client side.
        query
            .reply(query.key_expr(), payload, Some(attachment))
            .map_err(|e| {
                error!(
                    keyexpr = %self.keyexpr,
                    sequence_number = request.sequence_number,
                    error = %e,
                    "failed to send response"
                );
                e
            })
    }

    /// Serialize `response` with `codec` and answer `request` with it.
    pub fn send_response_with<T, C>(&self, codec: &C, request: &RequestId, response: &T) -> Result<()>
    where
        C: MessageCodec<T>,
    {
        let payload = codec.encode(response)?;
        self.send_response(request, payload)
    }

    /// Install or clear the callback fired for every queued request.
    pub fn set_on_new_request_callback(&self, callback: Option<EventCallback>) {
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

    /// Whether shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Undeclare the queryable and token and drop every pending request.
    ///
    /// Idempotent. Dropped requests complete on their clients without a
    /// reply.
    pub fn shutdown(&self) -> Result<()> {
        let (queryable, token, queue, taken) = {
            let mut state = self.state.lock();
            if state.shutdown {
                return Ok(());
            }
            state.shutdown = true;
            state.wait_set = None;
            (
                state.queryable.take(),
                state.token.take(),
                std::mem::take(&mut state.queue),
                std::mem::take(&mut state.taken),
            )
        };
        debug!(
            keyexpr = %self.keyexpr,
            queued = queue.len(),
            taken = taken.len(),
            "service shut down"
        );
        drop((queue, taken));

        let mut result = Ok(());
        for declaration in [queryable, token].into_iter().flatten() {
            if let Err(e) = declaration.undeclare() {
                error!(keyexpr = %self.keyexpr, error = %e, "unable to undeclare service");
                result = Err(e);
            }
        }
        result
    }
}
