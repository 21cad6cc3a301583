//! Graph cache: the local view of every node and endpoint in the domain.
//!
//! The cache is fed only with decoded liveliness tokens. Inserts are keyed by
//! the token itself, so applying the same put twice leaves one entry.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use tracing::debug;

use crate::attachment::Gid;
use crate::liveliness::{Entity, EntityKind, NodeInfo, NodeKey, QosProfile, TokenError};
use crate::transport::SessionId;

/// Names mapped to the set of types seen for each.
pub type NamesAndTypes = BTreeMap<String, BTreeSet<String>>;

/// A node as reported by [`GraphCache::node_names`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeName {
    /// Node name.
    pub name: String,
    /// Node namespace.
    pub namespace: String,
    /// Security enclave.
    pub enclave: String,
}

/// One endpoint on a topic, as reported by [`GraphCache::endpoints_info_by_topic`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Owning node name.
    pub node_name: String,
    /// Owning node namespace.
    pub node_namespace: String,
    /// Type on the topic.
    pub topic_type: String,
    /// Type hash.
    pub type_hash: String,
    /// Endpoint kind.
    pub kind: EntityKind,
    /// Endpoint gid.
    pub gid: Gid,
    /// Endpoint QoS.
    pub qos: QosProfile,
}

#[derive(Debug)]
struct GraphNode {
    info: NodeInfo,
    // Whether the node's own token was seen, as opposed to being implied by
    // one of its endpoints.
    announced: bool,
    endpoints: BTreeMap<String, Entity>,
}

impl GraphNode {
    fn implied_by(entity: &Entity) -> Self {
        Self {
            info: entity.node_info().clone(),
            announced: false,
            endpoints: BTreeMap::new(),
        }
    }
}

/// Cache of the distributed graph.
#[derive(Debug)]
pub struct GraphCache {
    zid: SessionId,
    nodes: RwLock<BTreeMap<NodeKey, GraphNode>>,
}

impl GraphCache {
    /// Create an empty cache for the session `zid`.
    pub fn new(zid: SessionId) -> Self {
        Self {
            zid,
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Decode a token and apply it as a put.
    ///
    /// With `ignore_local` set, tokens from this cache's own session are
    /// skipped and `Ok(None)` is returned.
    pub fn parse_put(&self, keyexpr: &str, ignore_local: bool) -> Result<Option<Entity>, TokenError> {
        let entity = Entity::from_keyexpr(keyexpr)?;
        if ignore_local && self.is_local_entity(&entity) {
            debug!(%keyexpr, "skipping token from local session");
            return Ok(None);
        }
        self.apply_put(&entity);
        Ok(Some(entity))
    }

    /// Decode a token and apply it as a delete.
    pub fn parse_delete(&self, keyexpr: &str) -> Result<Entity, TokenError> {
        let entity = Entity::from_keyexpr(keyexpr)?;
        self.apply_delete(&entity);
        Ok(entity)
    }

    /// Insert an entity. Returns whether the cache changed.
    pub fn apply_put(&self, entity: &Entity) -> bool {
        let mut nodes = self.nodes.write();
        let node = nodes
            .entry(entity.node_key())
            .or_insert_with(|| GraphNode::implied_by(entity));

        let changed = if entity.kind() == EntityKind::Node {
            let changed = !node.announced;
            node.announced = true;
            node.info = entity.node_info().clone();
            changed
        } else {
            node.endpoints
                .insert(entity.keyexpr().to_string(), entity.clone())
                .is_none()
        };
        debug!(keyexpr = %entity.keyexpr(), changed, "graph put");
        changed
    }

    /// Remove an entity. Returns whether the cache changed.
    ///
    /// Removing a node also removes its endpoints. A node that was only
    /// implied by endpoints disappears with its last endpoint.
    pub fn apply_delete(&self, entity: &Entity) -> bool {
        let mut nodes = self.nodes.write();
        let key = entity.node_key();
        let changed = if entity.kind() == EntityKind::Node {
            nodes.remove(&key).is_some()
        } else {
            match nodes.get_mut(&key) {
                Some(node) => {
                    let removed = node.endpoints.remove(entity.keyexpr()).is_some();
                    if !node.announced && node.endpoints.is_empty() {
                        nodes.remove(&key);
                    }
                    removed
                }
                None => false,
            }
        };
        debug!(keyexpr = %entity.keyexpr(), changed, "graph delete");
        changed
    }

    /// Whether the entity belongs to this cache's session.
    pub fn is_local_entity(&self, entity: &Entity) -> bool {
        entity.zid() == self.zid
    }

    /// Number of nodes, announced or implied.
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Number of endpoints across all nodes.
    pub fn endpoint_count(&self) -> usize {
        self.nodes.read().values().map(|n| n.endpoints.len()).sum()
    }

    /// All nodes in the graph.
    pub fn node_names(&self) -> Vec<NodeName> {
        let nodes = self.nodes.read();
        let mut names: Vec<NodeName> = nodes
            .values()
            .map(|n| NodeName {
                name: n.info.name.clone(),
                namespace: n.info.namespace.clone(),
                enclave: n.info.enclave.clone(),
            })
            .collect();
        names.sort();
        names
    }

    fn collect_names_and_types(&self, pred: impl Fn(EntityKind) -> bool) -> NamesAndTypes {
        let nodes = self.nodes.read();
        let mut out = NamesAndTypes::new();
        for entity in nodes.values().flat_map(|n| n.endpoints.values()) {
            if !pred(entity.kind()) {
                continue;
            }
            if let Some(topic) = entity.topic_info() {
                out.entry(topic.name.clone())
                    .or_default()
                    .insert(topic.type_name.clone());
            }
        }
        out
    }

    /// Topics with publishers or subscriptions, and their types.
    pub fn topic_names_and_types(&self) -> NamesAndTypes {
        self.collect_names_and_types(EntityKind::is_topic)
    }

    /// Services with servers or clients, and their types.
    pub fn service_names_and_types(&self) -> NamesAndTypes {
        self.collect_names_and_types(EntityKind::is_service)
    }

    fn count(&self, kind: EntityKind, name: &str, type_name: Option<&str>) -> usize {
        let nodes = self.nodes.read();
        nodes
            .values()
            .flat_map(|n| n.endpoints.values())
            .filter(|e| e.kind() == kind)
            .filter_map(|e| e.topic_info())
            .filter(|t| t.name == name && type_name.map_or(true, |ty| t.type_name == ty))
            .count()
    }

    /// Publishers on `topic`.
    pub fn count_publishers(&self, topic: &str) -> usize {
        self.count(EntityKind::Publisher, topic, None)
    }

    /// Subscriptions on `topic`.
    pub fn count_subscriptions(&self, topic: &str) -> usize {
        self.count(EntityKind::Subscription, topic, None)
    }

    /// Service servers for `service`.
    pub fn count_services(&self, service: &str) -> usize {
        self.count(EntityKind::Service, service, None)
    }

    /// Service clients for `service`.
    pub fn count_clients(&self, service: &str) -> usize {
        self.count(EntityKind::Client, service, None)
    }

    /// Endpoints on the other side of `entity`'s topic with the same type:
    /// subscriptions for a publisher, servers for a client, and so on.
    pub fn count_matched(&self, entity: &Entity) -> usize {
        let peer = match entity.kind() {
            EntityKind::Publisher => EntityKind::Subscription,
            EntityKind::Subscription => EntityKind::Publisher,
            EntityKind::Client => EntityKind::Service,
            EntityKind::Service => EntityKind::Client,
            EntityKind::Node => return 0,
        };
        match entity.topic_info() {
            Some(topic) => self.count(peer, &topic.name, Some(&topic.type_name)),
            None => 0,
        }
    }

    /// Names and types of `kind` endpoints owned by a node.
    ///
    /// Returns `None` if no such node is known.
    pub fn names_and_types_by_node(
        &self,
        kind: EntityKind,
        node_name: &str,
        node_namespace: &str,
    ) -> Option<NamesAndTypes> {
        let nodes = self.nodes.read();
        let mut found = false;
        let mut out = NamesAndTypes::new();
        for node in nodes
            .values()
            .filter(|n| n.info.name == node_name && n.info.namespace == node_namespace)
        {
            found = true;
            for topic in node
                .endpoints
                .values()
                .filter(|e| e.kind() == kind)
                .filter_map(|e| e.topic_info())
            {
                out.entry(topic.name.clone())
                    .or_default()
                    .insert(topic.type_name.clone());
            }
        }
        found.then_some(out)
    }

    /// Every `kind` endpoint on `topic`.
    pub fn endpoints_info_by_topic(&self, kind: EntityKind, topic: &str) -> Vec<EndpointInfo> {
        let nodes = self.nodes.read();
        nodes
            .values()
            .flat_map(|n| n.endpoints.values())
            .filter(|e| e.kind() == kind)
            .filter_map(|e| {
                let info = e.topic_info().filter(|t| t.name == topic)?;
                Some(EndpointInfo {
                    node_name: e.node_info().name.clone(),
                    node_namespace: e.node_info().namespace.clone(),
                    topic_type: info.type_name.clone(),
                    type_hash: info.type_hash.clone(),
                    kind: e.kind(),
                    gid: e.gid(),
                    qos: info.qos,
                })
            })
            .collect()
    }

    /// Whether at least one server for `service` with `type_name` is live.
    pub fn service_server_is_available(&self, service: &str, type_name: &str) -> bool {
        self.count(EntityKind::Service, service, Some(type_name)) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveliness::TopicInfo;

    fn zid(b: u8) -> SessionId {
        SessionId::from_bytes([b; 16])
    }

    fn node(z: u8, nid: usize, name: &str) -> Entity {
        Entity::new(zid(z), nid, nid, EntityKind::Node, NodeInfo::new(0, "/", name, "/"), None)
            .unwrap()
    }

    fn endpoint(z: u8, nid: usize, eid: usize, kind: EntityKind, topic: &str, ty: &str) -> Entity {
        Entity::new(
            zid(z),
            nid,
            eid,
            kind,
            NodeInfo::new(0, "/", format!("node{nid}"), "/"),
            Some(TopicInfo::new(0, topic, ty, "RIHS01_00", QosProfile::default())),
        )
        .unwrap()
    }

    #[test]
    fn put_is_idempotent() {
        let cache = GraphCache::new(zid(0));
        let pub_ = endpoint(1, 1, 2, EntityKind::Publisher, "/chatter", "String");

        assert!(cache.apply_put(&node(1, 1, "node1")));
        assert!(cache.apply_put(&pub_));
        let names = cache.node_names();
        let topics = cache.topic_names_and_types();

        assert!(!cache.apply_put(&node(1, 1, "node1")));
        assert!(!cache.apply_put(&pub_));
        assert_eq!(cache.node_names(), names);
        assert_eq!(cache.topic_names_and_types(), topics);
        assert_eq!(cache.node_count(), 1);
        assert_eq!(cache.endpoint_count(), 1);
    }

    #[test]
    fn deleting_node_removes_endpoints() {
        let cache = GraphCache::new(zid(0));
        cache.apply_put(&node(1, 1, "node1"));
        cache.apply_put(&endpoint(1, 1, 2, EntityKind::Publisher, "/a", "T"));
        cache.apply_put(&endpoint(1, 1, 3, EntityKind::Service, "/s", "S"));

        assert!(cache.apply_delete(&node(1, 1, "node1")));
        assert_eq!(cache.node_count(), 0);
        assert_eq!(cache.endpoint_count(), 0);
        assert!(!cache.apply_delete(&node(1, 1, "node1")));
    }

    #[test]
    fn implied_node_disappears_with_last_endpoint() {
        let cache = GraphCache::new(zid(0));
        let a = endpoint(2, 5, 6, EntityKind::Subscription, "/a", "T");
        let b = endpoint(2, 5, 7, EntityKind::Subscription, "/b", "T");
        cache.apply_put(&a);
        cache.apply_put(&b);
        assert_eq!(cache.node_count(), 1);

        cache.apply_delete(&a);
        assert_eq!(cache.node_count(), 1);
        cache.apply_delete(&b);
        assert_eq!(cache.node_count(), 0);
    }

    #[test]
    fn announced_node_survives_endpoint_removal() {
        let cache = GraphCache::new(zid(0));
        let a = endpoint(2, 5, 6, EntityKind::Publisher, "/a", "T");
        cache.apply_put(&a);
        cache.apply_put(&node(2, 5, "node5"));
        cache.apply_delete(&a);
        assert_eq!(cache.node_count(), 1);
    }

    #[test]
    fn counts_and_matching() {
        let cache = GraphCache::new(zid(0));
        let pub_ = endpoint(1, 1, 2, EntityKind::Publisher, "/chatter", "String");
        let sub_ok = endpoint(2, 3, 4, EntityKind::Subscription, "/chatter", "String");
        let sub_other_type = endpoint(2, 3, 5, EntityKind::Subscription, "/chatter", "Int");
        let server = endpoint(3, 6, 7, EntityKind::Service, "/add", "AddTwoInts");
        let client = endpoint(1, 1, 8, EntityKind::Client, "/add", "AddTwoInts");
        for e in [&pub_, &sub_ok, &sub_other_type, &server, &client] {
            cache.apply_put(e);
        }

        assert_eq!(cache.count_publishers("/chatter"), 1);
        assert_eq!(cache.count_subscriptions("/chatter"), 2);
        assert_eq!(cache.count_services("/add"), 1);
        assert_eq!(cache.count_clients("/add"), 1);
        assert_eq!(cache.count_matched(&pub_), 1);
        assert_eq!(cache.count_matched(&sub_other_type), 0);
        assert_eq!(cache.count_matched(&client), 1);

        assert!(cache.service_server_is_available("/add", "AddTwoInts"));
        assert!(!cache.service_server_is_available("/add", "Other"));

        let topics = cache.topic_names_and_types();
        assert_eq!(
            topics["/chatter"].iter().cloned().collect::<Vec<_>>(),
            vec!["Int".to_string(), "String".to_string()]
        );
        assert!(cache.service_names_and_types().contains_key("/add"));
    }

    #[test]
    fn per_node_and_per_topic_queries() {
        let cache = GraphCache::new(zid(0));
        cache.apply_put(&endpoint(1, 1, 2, EntityKind::Publisher, "/chatter", "String"));
        cache.apply_put(&endpoint(1, 1, 3, EntityKind::Subscription, "/cmd", "Twist"));

        let pubs = cache
            .names_and_types_by_node(EntityKind::Publisher, "node1", "/")
            .unwrap();
        assert_eq!(pubs.keys().collect::<Vec<_>>(), vec!["/chatter"]);
        assert!(cache
            .names_and_types_by_node(EntityKind::Publisher, "missing", "/")
            .is_none());

        let infos = cache.endpoints_info_by_topic(EntityKind::Subscription, "/cmd");
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].node_name, "node1");
        assert_eq!(infos[0].topic_type, "Twist");
    }

    #[test]
    fn parse_put_skips_local_tokens_when_asked() {
        let cache = GraphCache::new(zid(9));
        let local = node(9, 1, "me");
        assert_eq!(cache.parse_put(local.keyexpr(), true).unwrap(), None);
        assert_eq!(cache.node_count(), 0);
        assert!(cache.parse_put(local.keyexpr(), false).unwrap().is_some());
        assert_eq!(cache.node_count(), 1);

        assert!(cache.parse_put("@ros2_lv/garbage", false).is_err());
        assert_eq!(cache.parse_delete(local.keyexpr()).unwrap(), local);
        assert_eq!(cache.node_count(), 0);
    }
}
