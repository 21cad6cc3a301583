//! Node registry: the node's token plus maps from handle to entity state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::client::ClientData;
use crate::codec::TypeInfo;
use crate::error::{Error, Result};
use crate::liveliness::{Entity, EntityKind, NodeInfo, QosProfile, TopicInfo};
use crate::service::ServiceData;
use crate::transport::{Declaration, Session};

// Publishers and subscriptions are announced but carry no data path here.
struct Endpoint {
    entity: Entity,
    token: Box<dyn Declaration>,
}

#[derive(Default)]
struct NodeState {
    shutdown: bool,
    token: Option<Box<dyn Declaration>>,
    clients: BTreeMap<usize, Arc<ClientData>>,
    services: BTreeMap<usize, Arc<ServiceData>>,
    endpoints: BTreeMap<usize, Endpoint>,
}

/// State of one node.
pub struct NodeData {
    id: usize,
    entity: Entity,
    session: Arc<dyn Session>,
    entity_ids: Arc<AtomicUsize>,
    query_timeout: Option<Duration>,
    this: Weak<NodeData>,
    released_clients: AtomicUsize,
    state: Mutex<NodeState>,
}

impl fmt::Debug for NodeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("NodeData")
            .field("id", &self.id)
            .field("name", &self.entity.node_info().fully_qualified_name())
            .field("clients", &state.clients.len())
            .field("services", &state.services.len())
            .field("endpoints", &state.endpoints.len())
            .finish()
    }
}

impl NodeData {
    /// Announce a node. Entity handles are drawn from `entity_ids`.
    pub(crate) fn new(
        session: Arc<dyn Session>,
        entity_ids: Arc<AtomicUsize>,
        id: usize,
        info: NodeInfo,
        query_timeout: Option<Duration>,
    ) -> Result<Arc<Self>> {
        let entity = Entity::new(session.id(), id, id, EntityKind::Node, info, None)?;
        let token = session.declare_token(entity.keyexpr())?;
        debug!(node = %entity.node_info().fully_qualified_name(), id, "declared node");
        Ok(Arc::new_cyclic(|this| Self {
            id,
            entity,
            session,
            entity_ids,
            query_timeout,
            this: this.clone(),
            released_clients: AtomicUsize::new(0),
            state: Mutex::new(NodeState {
                token: Some(token),
                ..Default::default()
            }),
        }))
    }

    /// Registry handle of this node.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Name, namespace and enclave.
    pub fn info(&self) -> &NodeInfo {
        self.entity.node_info()
    }

    /// The node's liveliness entity.
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    fn endpoint_entity(
        &self,
        kind: EntityKind,
        name: &str,
        type_info: &TypeInfo,
        qos: QosProfile,
    ) -> Result<Entity> {
        if self.state.lock().shutdown {
            return Err(Error::ShutDown("node"));
        }
        let info = self.entity.node_info();
        let topic = TopicInfo::new(
            info.domain_id,
            name,
            type_info.name.clone(),
            type_info.hash.clone(),
            qos,
        );
        let id = self.entity_ids.fetch_add(1, Ordering::Relaxed);
        Ok(Entity::new(
            self.session.id(),
            self.id,
            id,
            kind,
            info.clone(),
            Some(topic),
        )?)
    }

    /// Create a service client.
    pub fn create_client(
        &self,
        service_name: &str,
        type_info: &TypeInfo,
        qos: QosProfile,
    ) -> Result<Arc<ClientData>> {
        let entity = self.endpoint_entity(EntityKind::Client, service_name, type_info, qos)?;
        let id = entity.id();
        let client = ClientData::new(
            Arc::clone(&self.session),
            self.this.clone(),
            id,
            entity,
            self.query_timeout,
        )?;

        let mut state = self.state.lock();
        if state.shutdown || state.clients.contains_key(&id) {
            let err = if state.shutdown {
                Error::ShutDown("node")
            } else {
                Error::AlreadyExists { kind: "client", id }
            };
            drop(state);
            let _ = client.shutdown();
            return Err(err);
        }
        state.clients.insert(id, Arc::clone(&client));
        Ok(client)
    }

    /// Look up a client by handle.
    ///
    /// A client stays registered after [`destroy_client`](Self::destroy_client)
    /// until its last in-flight call completes.
    pub fn client(&self, id: usize) -> Option<Arc<ClientData>> {
        self.state.lock().clients.get(&id).cloned()
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// Shut a client down. A missing handle is a no-op.
    pub fn destroy_client(&self, id: usize) -> Result<()> {
        let client = self.state.lock().clients.get(&id).cloned();
        match client {
            Some(client) => client.shutdown(),
            None => Ok(()),
        }
    }

    /// Drop the registry's reference to a client that finished shutting down.
    pub(crate) fn release_client(&self, id: usize) {
        self.released_clients.fetch_add(1, Ordering::SeqCst);
        if self.state.lock().clients.remove(&id).is_some() {
            debug!(node = self.id, client = id, "released client");
        }
    }

    /// How many times a shut-down client has handed itself back to this node.
    ///
    /// Each client does so exactly once, after its last in-flight call.
    pub fn released_client_count(&self) -> usize {
        self.released_clients.load(Ordering::SeqCst)
    }

    /// Create a service server.
    pub fn create_service(
        &self,
        service_name: &str,
        type_info: &TypeInfo,
        qos: QosProfile,
    ) -> Result<Arc<ServiceData>> {
        let entity = self.endpoint_entity(EntityKind::Service, service_name, type_info, qos)?;
        let id = entity.id();
        let service = ServiceData::new(&*self.session, id, entity)?;

        let mut state = self.state.lock();
        if state.shutdown || state.services.contains_key(&id) {
            let err = if state.shutdown {
                Error::ShutDown("node")
            } else {
                Error::AlreadyExists { kind: "service", id }
            };
            drop(state);
            let _ = service.shutdown();
            return Err(err);
        }
        state.services.insert(id, Arc::clone(&service));
        Ok(service)
    }

    /// Look up a service by handle.
    pub fn service(&self, id: usize) -> Option<Arc<ServiceData>> {
        self.state.lock().services.get(&id).cloned()
    }

    /// Remove and shut down a service. A missing handle is a no-op.
    pub fn destroy_service(&self, id: usize) -> Result<()> {
        let service = self.state.lock().services.remove(&id);
        match service {
            Some(service) => service.shutdown(),
            None => Ok(()),
        }
    }

    fn create_endpoint(
        &self,
        kind: EntityKind,
        topic_name: &str,
        type_info: &TypeInfo,
        qos: QosProfile,
    ) -> Result<Entity> {
        let entity = self.endpoint_entity(kind, topic_name, type_info, qos)?;
        let token = self.session.declare_token(entity.keyexpr())?;
        let mut state = self.state.lock();
        if state.shutdown {
            drop(state);
            let _ = token.undeclare();
            return Err(Error::ShutDown("node"));
        }
        state.endpoints.insert(
            entity.id(),
            Endpoint {
                entity: entity.clone(),
                token,
            },
        );
        debug!(keyexpr = %entity.keyexpr(), "declared endpoint");
        Ok(entity)
    }

    /// Announce a publisher on `topic_name`.
    pub fn create_publisher(
        &self,
        topic_name: &str,
        type_info: &TypeInfo,
        qos: QosProfile,
    ) -> Result<Entity> {
        self.create_endpoint(EntityKind::Publisher, topic_name, type_info, qos)
    }

    /// Announce a subscription on `topic_name`.
    pub fn create_subscription(
        &self,
        topic_name: &str,
        type_info: &TypeInfo,
        qos: QosProfile,
    ) -> Result<Entity> {
        self.create_endpoint(EntityKind::Subscription, topic_name, type_info, qos)
    }

    /// Withdraw a publisher or subscription. A missing handle is a no-op.
    pub fn destroy_endpoint(&self, id: usize) -> Result<()> {
        let endpoint = self.state.lock().endpoints.remove(&id);
        match endpoint {
            Some(endpoint) => {
                debug!(keyexpr = %endpoint.entity.keyexpr(), "undeclaring endpoint");
                endpoint.token.undeclare()
            }
            None => Ok(()),
        }
    }

    /// Whether the node was shut down.
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Shut down every entity, then withdraw the node token.
    ///
    /// Idempotent. Clients with calls in flight stay registered until those
    /// calls complete. The first error is returned after everything was
    /// attempted.
    pub fn shutdown(&self) -> Result<()> {
        let (clients, services, endpoints, token) = {
            let mut state = self.state.lock();
            if state.shutdown {
                return Ok(());
            }
            state.shutdown = true;
            (
                state.clients.values().cloned().collect::<Vec<_>>(),
                std::mem::take(&mut state.services),
                std::mem::take(&mut state.endpoints),
                state.token.take(),
            )
        };

        let mut result = Ok(());
        let mut record = |r: Result<()>| {
            if let Err(e) = r {
                warn!(node = self.id, error = %e, "error while shutting down node");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        };
        for client in clients {
            record(client.shutdown());
        }
        for service in services.into_values() {
            record(service.shutdown());
        }
        for endpoint in endpoints.into_values() {
            record(endpoint.token.undeclare());
        }
        if let Some(token) = token {
            record(token.undeclare());
        }
        debug!(node = self.id, "node shut down");
        result
    }
}
