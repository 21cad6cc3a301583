//! Session-level context: discovery, graph cache and node registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, info_span, warn};

use crate::config::Config;
use crate::discovery::{DiscoveryController, DiscoveryState, GraphEventStream};
use crate::error::{Error, Result};
use crate::graph_cache::{EndpointInfo, GraphCache, NamesAndTypes, NodeName};
use crate::liveliness::{EntityKind, NodeInfo};
use crate::node::NodeData;
use crate::transport::local::LocalHub;
use crate::transport::{Session, SessionId};
use crate::wait_set::GuardCondition;

/// Everything one session shares: discovery, the graph and the nodes created
/// on it.
pub struct Context {
    config: Config,
    session: Arc<dyn Session>,
    graph_guard: Arc<GuardCondition>,
    discovery: DiscoveryController,
    entity_ids: Arc<AtomicUsize>,
    nodes: Mutex<Option<BTreeMap<usize, Arc<NodeData>>>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("session", &self.session.id())
            .field("config", &self.config)
            .field("discovery", &self.discovery.state())
            .finish()
    }
}

impl Context {
    /// Build a context on `session`.
    ///
    /// Blocks while the graph is bootstrapped from the tokens already live,
    /// then starts the live subscription. Either failure fails construction.
    ///
    /// Call it from a plain thread or from a multi-thread tokio runtime,
    /// where the wait runs under `block_in_place`. From a current-thread
    /// runtime it returns [`Error::BlockingInRuntime`].
    pub fn new(session: Arc<dyn Session>, config: Config) -> Result<Self> {
        config.validate()?;
        let _span = info_span!("context", session = %session.id(), domain_id = config.domain_id)
            .entered();

        let graph_cache = Arc::new(GraphCache::new(session.id()));
        let graph_guard = Arc::new(GuardCondition::new());
        let discovery = DiscoveryController::new(
            Arc::clone(&session),
            config.domain_id,
            graph_cache,
            Arc::clone(&graph_guard),
        );
        discovery.bootstrap()?;
        discovery.activate()?;
        info!("context ready");

        Ok(Self {
            config,
            session,
            graph_guard,
            discovery,
            entity_ids: Arc::new(AtomicUsize::new(0)),
            nodes: Mutex::new(Some(BTreeMap::new())),
        })
    }

    /// Build a context on a fresh session of `hub`.
    pub fn with_local_hub(hub: &LocalHub, config: Config) -> Result<Self> {
        Self::new(hub.open_session(), config)
    }

    /// The configuration the context was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Id of the underlying session.
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// Hand out the next entity handle. Shared by nodes and their entities.
    pub fn next_entity_id(&self) -> usize {
        self.entity_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// State of the discovery subscription.
    pub fn discovery_state(&self) -> DiscoveryState {
        self.discovery.state()
    }

    /// Condition triggered on every applied graph change.
    pub fn graph_guard_condition(&self) -> &Arc<GuardCondition> {
        &self.graph_guard
    }

    /// The graph as discovered so far.
    pub fn graph_cache(&self) -> &Arc<GraphCache> {
        self.discovery.graph_cache()
    }

    /// Graph changes applied from now on.
    pub fn graph_events(&self) -> GraphEventStream {
        self.discovery.events()
    }

    /// Create and announce a node.
    pub fn create_node(&self, name: &str, namespace: &str) -> Result<Arc<NodeData>> {
        let id = self.next_entity_id();
        let info = NodeInfo::new(self.config.domain_id, namespace, name, self.config.enclave.clone());

        let mut nodes = self.nodes.lock();
        let registry = nodes.as_mut().ok_or(Error::ShutDown("context"))?;
        if registry.contains_key(&id) {
            return Err(Error::AlreadyExists { kind: "node", id });
        }
        let node = NodeData::new(
            Arc::clone(&self.session),
            Arc::clone(&self.entity_ids),
            id,
            info,
            self.config.query_timeout,
        )?;
        registry.insert(id, Arc::clone(&node));
        Ok(node)
    }

    /// Look up a node by handle.
    pub fn node(&self, id: usize) -> Option<Arc<NodeData>> {
        self.nodes.lock().as_ref()?.get(&id).cloned()
    }

    /// Remove and shut down a node. A missing handle is a no-op.
    pub fn destroy_node(&self, id: usize) -> Result<()> {
        let node = self.nodes.lock().as_mut().and_then(|nodes| nodes.remove(&id));
        match node {
            Some(node) => node.shutdown(),
            None => Ok(()),
        }
    }

    /// Fully qualified names of every known node.
    pub fn node_names(&self) -> Vec<NodeName> {
        self.graph_cache().node_names()
    }

    /// Topics and their types.
    pub fn topic_names_and_types(&self) -> NamesAndTypes {
        self.graph_cache().topic_names_and_types()
    }

    /// Services and their types.
    pub fn service_names_and_types(&self) -> NamesAndTypes {
        self.graph_cache().service_names_and_types()
    }

    /// Number of publishers on `topic`.
    pub fn count_publishers(&self, topic: &str) -> usize {
        self.graph_cache().count_publishers(topic)
    }

    /// Number of subscriptions on `topic`.
    pub fn count_subscriptions(&self, topic: &str) -> usize {
        self.graph_cache().count_subscriptions(topic)
    }

    /// Number of servers for `service`.
    pub fn count_services(&self, service: &str) -> usize {
        self.graph_cache().count_services(service)
    }

    /// Number of clients of `service`.
    pub fn count_clients(&self, service: &str) -> usize {
        self.graph_cache().count_clients(service)
    }

    /// Endpoints of `kind` on `topic`.
    pub fn endpoints_info_by_topic(&self, kind: EntityKind, topic: &str) -> Vec<EndpointInfo> {
        self.graph_cache().endpoints_info_by_topic(kind, topic)
    }

    /// Whether a server with a matching type is announced for `service`.
    pub fn service_server_is_available(&self, service: &str, type_name: &str) -> bool {
        self.graph_cache().service_server_is_available(service, type_name)
    }

    /// Shut down every node, then discovery and the session.
    ///
    /// Idempotent. Node errors are logged; the session close result is
    /// returned.
    pub fn shutdown(&self) -> Result<()> {
        let nodes = match self.nodes.lock().take() {
            Some(nodes) => nodes,
            None => return Ok(()),
        };
        for (id, node) in nodes {
            if let Err(e) = node.shutdown() {
                warn!(node = id, error = %e, "failed to shut down node");
            }
        }
        self.discovery.shutdown()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
