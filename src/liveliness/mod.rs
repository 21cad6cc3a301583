//! Liveliness tokens: the structured keys every entity announces itself with.
//!
//! A token is both the presence announcement and the graph-cache index key.
//! Its layout is a stable cross-process contract:
//!
//! ```text
//! @ros2_lv/<domain>/<zid>/<nid>/<eid>/<kind>/<enclave>/<namespace>/<node>
//!     [/<topic>/<type>/<type_hash>/<qos>]
//! ```
//!
//! The trailing topic fields are present for every kind except nodes. Names
//! are mangled so that each occupies exactly one chunk: `/` becomes `%` and an
//! empty field is written `_`.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::attachment::{Gid, GID_SIZE};
use crate::transport::SessionId;

mod qos;

pub use qos::{Durability, History, Liveliness, QosProfile, Reliability};

/// Root of every liveliness token.
pub const ADMIN_SPACE: &str = "@ros2_lv";

const SLASH_REPLACEMENT: char = '%';
const EMPTY_FIELD: &str = "_";

const NODE_FIELDS: usize = 9;
const ENDPOINT_FIELDS: usize = 13;

/// Reason a token could not be built or parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// The key does not start with [`ADMIN_SPACE`].
    #[error("token does not start with `@ros2_lv`: {0}")]
    BadPrefix(String),

    /// The key has the wrong number of chunks for its kind.
    #[error("token has {0} fields")]
    FieldCount(usize),

    /// A field failed to parse.
    #[error("invalid {field} `{value}`")]
    InvalidField {
        /// Name of the field.
        field: &'static str,
        /// Raw field value.
        value: String,
    },

    /// The entity kind is not one of `NN`, `MP`, `MS`, `SS`, `SC`.
    #[error("unknown entity kind `{0}`")]
    UnknownKind(String),

    /// A name contains `%`, or is exactly the empty-field marker `_`.
    #[error("{field} `{value}` is reserved or contains reserved character `%`")]
    ReservedCharacter {
        /// Name of the field.
        field: &'static str,
        /// Offending value.
        value: String,
    },

    /// A field that must not be empty was empty.
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    /// Topic information was given for a node, or missing for an endpoint.
    #[error("{0:?} entity topic info mismatch")]
    TopicInfoMismatch(EntityKind),
}

/// Kind of entity a token announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    /// A node.
    Node,
    /// A topic publisher.
    Publisher,
    /// A topic subscription.
    Subscription,
    /// A service server.
    Service,
    /// A service client.
    Client,
}

impl EntityKind {
    /// Two-letter code used in the token.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Node => "NN",
            EntityKind::Publisher => "MP",
            EntityKind::Subscription => "MS",
            EntityKind::Service => "SS",
            EntityKind::Client => "SC",
        }
    }

    /// Whether this kind is a topic endpoint.
    pub fn is_topic(self) -> bool {
        matches!(self, EntityKind::Publisher | EntityKind::Subscription)
    }

    /// Whether this kind is a service endpoint.
    pub fn is_service(self) -> bool {
        matches!(self, EntityKind::Service | EntityKind::Client)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NN" => Ok(EntityKind::Node),
            "MP" => Ok(EntityKind::Publisher),
            "MS" => Ok(EntityKind::Subscription),
            "SS" => Ok(EntityKind::Service),
            "SC" => Ok(EntityKind::Client),
            other => Err(TokenError::UnknownKind(other.to_string())),
        }
    }
}

/// Identity of the node that owns an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeInfo {
    /// Domain the node lives in.
    pub domain_id: usize,
    /// Node namespace, such as `/` or `/robot1`.
    pub namespace: String,
    /// Node name.
    pub name: String,
    /// Security enclave.
    pub enclave: String,
}

impl NodeInfo {
    /// Create node info.
    pub fn new(
        domain_id: usize,
        namespace: impl Into<String>,
        name: impl Into<String>,
        enclave: impl Into<String>,
    ) -> Self {
        Self {
            domain_id,
            namespace: namespace.into(),
            name: name.into(),
            enclave: enclave.into(),
        }
    }

    /// Fully qualified node name, e.g. `/robot1/talker`.
    pub fn fully_qualified_name(&self) -> String {
        if self.namespace.ends_with('/') {
            format!("{}{}", self.namespace, self.name)
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }
}

/// Topic or service an endpoint is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicInfo {
    /// Domain of the topic.
    pub domain_id: usize,
    /// Fully qualified topic or service name.
    pub name: String,
    /// Message or service type name.
    pub type_name: String,
    /// Type hash, `RIHS01_<hex>`.
    pub type_hash: String,
    /// Endpoint QoS.
    pub qos: QosProfile,
}

impl TopicInfo {
    /// Create topic info.
    pub fn new(
        domain_id: usize,
        name: impl Into<String>,
        type_name: impl Into<String>,
        type_hash: impl Into<String>,
        qos: QosProfile,
    ) -> Self {
        Self {
            domain_id,
            name: name.into(),
            type_name: type_name.into(),
            type_hash: type_hash.into(),
            qos,
        }
    }

    /// Key expression data and queries for this topic are routed on:
    /// `<domain>/<topic>/<type>/<type_hash>`.
    pub fn topic_keyexpr(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.domain_id,
            self.name.trim_matches('/'),
            self.type_name,
            self.type_hash
        )
    }

    /// Every chunk of [`topic_keyexpr`](Self::topic_keyexpr) must be non-empty.
    fn check_routable(&self) -> Result<(), TokenError> {
        if self.name.trim_matches('/').is_empty() {
            return Err(TokenError::EmptyField("topic name"));
        }
        if self.type_name.is_empty() {
            return Err(TokenError::EmptyField("type name"));
        }
        if self.type_hash.is_empty() {
            return Err(TokenError::EmptyField("type hash"));
        }
        Ok(())
    }
}

/// Decoded liveliness token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    zid: SessionId,
    nid: usize,
    id: usize,
    kind: EntityKind,
    node_info: NodeInfo,
    topic_info: Option<TopicInfo>,
    keyexpr: String,
    gid: Gid,
}

/// Identity of a node across sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    /// Session the node lives in.
    pub zid: SessionId,
    /// Node id within the session.
    pub nid: usize,
}

impl Entity {
    /// Build an entity and its token.
    ///
    /// Nodes carry no topic info. Every other kind must carry it.
    pub fn new(
        zid: SessionId,
        nid: usize,
        id: usize,
        kind: EntityKind,
        node_info: NodeInfo,
        topic_info: Option<TopicInfo>,
    ) -> Result<Self, TokenError> {
        if (kind == EntityKind::Node) != topic_info.is_none() {
            return Err(TokenError::TopicInfoMismatch(kind));
        }
        if node_info.name.is_empty() {
            return Err(TokenError::EmptyField("node name"));
        }

        let mut keyexpr = format!(
            "{ADMIN_SPACE}/{}/{zid}/{nid}/{id}/{kind}/{}/{}/{}",
            node_info.domain_id,
            mangle("enclave", &node_info.enclave)?,
            mangle("namespace", &node_info.namespace)?,
            mangle("node name", &node_info.name)?,
        );
        if let Some(topic) = &topic_info {
            topic.check_routable()?;
            keyexpr.push('/');
            keyexpr.push_str(&mangle("topic name", &topic.name)?);
            keyexpr.push('/');
            keyexpr.push_str(&mangle("type name", &topic.type_name)?);
            keyexpr.push('/');
            keyexpr.push_str(&mangle("type hash", &topic.type_hash)?);
            keyexpr.push('/');
            keyexpr.push_str(&topic.qos.to_string());
        }

        Ok(Self {
            zid,
            nid,
            id,
            kind,
            node_info,
            topic_info,
            gid: gid_of(&keyexpr),
            keyexpr,
        })
    }

    /// Parse a token received from the transport.
    pub fn from_keyexpr(keyexpr: &str) -> Result<Self, TokenError> {
        let parts: Vec<&str> = keyexpr.split('/').collect();
        if parts.first() != Some(&ADMIN_SPACE) {
            return Err(TokenError::BadPrefix(keyexpr.to_string()));
        }
        if parts.len() != NODE_FIELDS && parts.len() != ENDPOINT_FIELDS {
            return Err(TokenError::FieldCount(parts.len()));
        }

        let domain_id = parse_field("domain id", parts[1])?;
        let zid = parse_field("session id", parts[2])?;
        let nid = parse_field("node id", parts[3])?;
        let id = parse_field("entity id", parts[4])?;
        let kind: EntityKind = parts[5].parse()?;

        let expected = if kind == EntityKind::Node {
            NODE_FIELDS
        } else {
            ENDPOINT_FIELDS
        };
        if parts.len() != expected {
            return Err(TokenError::FieldCount(parts.len()));
        }

        let node_info = NodeInfo {
            domain_id,
            enclave: demangle(parts[6]),
            namespace: demangle(parts[7]),
            name: demangle(parts[8]),
        };
        if node_info.name.is_empty() {
            return Err(TokenError::EmptyField("node name"));
        }

        let topic_info = if kind == EntityKind::Node {
            None
        } else {
            let topic = TopicInfo {
                domain_id,
                name: demangle(parts[9]),
                type_name: demangle(parts[10]),
                type_hash: demangle(parts[11]),
                qos: parts[12].parse()?,
            };
            topic.check_routable()?;
            Some(topic)
        };

        Ok(Self {
            zid,
            nid,
            id,
            kind,
            node_info,
            topic_info,
            keyexpr: keyexpr.to_string(),
            gid: gid_of(keyexpr),
        })
    }

    /// Session that owns the entity.
    pub fn zid(&self) -> SessionId {
        self.zid
    }

    /// Node id within the session.
    pub fn nid(&self) -> usize {
        self.nid
    }

    /// Entity id within the session.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Kind of entity.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Owning node.
    pub fn node_info(&self) -> &NodeInfo {
        &self.node_info
    }

    /// Topic info, `None` for nodes.
    pub fn topic_info(&self) -> Option<&TopicInfo> {
        self.topic_info.as_ref()
    }

    /// The liveliness token.
    pub fn keyexpr(&self) -> &str {
        &self.keyexpr
    }

    /// Globally unique id derived from the token.
    pub fn gid(&self) -> Gid {
        self.gid
    }

    /// Key of the owning node.
    pub fn node_key(&self) -> NodeKey {
        NodeKey {
            zid: self.zid,
            nid: self.nid,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.keyexpr)
    }
}

/// Key expression matching every token in a domain.
pub fn subscription_keyexpr(domain_id: usize) -> String {
    format!("{ADMIN_SPACE}/{domain_id}/**")
}

fn gid_of(keyexpr: &str) -> Gid {
    let digest = Sha256::digest(keyexpr.as_bytes());
    let mut gid = [0u8; GID_SIZE];
    gid.copy_from_slice(&digest[..GID_SIZE]);
    gid
}

fn mangle(field: &'static str, value: &str) -> Result<String, TokenError> {
    if value.contains(SLASH_REPLACEMENT) {
        return Err(TokenError::ReservedCharacter {
            field,
            value: value.to_string(),
        });
    }
    // A literal `_` would read back as an empty field.
    if value == EMPTY_FIELD {
        return Err(TokenError::ReservedCharacter {
            field,
            value: value.to_string(),
        });
    }
    if value.is_empty() {
        return Ok(EMPTY_FIELD.to_string());
    }
    Ok(value.replace('/', "%"))
}

fn demangle(value: &str) -> String {
    if value == EMPTY_FIELD {
        return String::new();
    }
    value.replace(SLASH_REPLACEMENT, "/")
}

fn parse_field<T: FromStr>(field: &'static str, value: &str) -> Result<T, TokenError> {
    value.parse().map_err(|_| TokenError::InvalidField {
        field,
        value: value.to_string(),
    })
}
