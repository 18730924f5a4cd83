//! Declarative broker topology.
//!
//! A [`Topology`] lists exchanges and queues by name, each with the bindings
//! that attach it to a source exchange. It is usually loaded from YAML:
//!
//! ```yaml
//! exchanges:
//!   events:
//!     type: topic
//!     durable: true
//! queues:
//!   events.audit:
//!     durable: true
//!     bindings:
//!       - exchange: events
//!         key: "#"
//! ```

use crate::error::MqError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::Path;

/// Broker-specific arguments (`x-message-ttl`, `x-max-length`, ...).
pub type Arguments = BTreeMap<String, serde_json::Value>;

/// Exchange routing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Exact routing key match
    Direct,
    /// Every bound destination
    Fanout,
    /// Dot-separated pattern match with `*` and `#`
    Topic,
    /// Header match
    Headers,
}

impl ExchangeKind {
    /// Name used on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binds the owning entity to a source exchange.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Binding {
    /// Source exchange
    pub exchange: String,
    /// Routing key (binding pattern for topic exchanges)
    #[serde(default, rename = "key")]
    pub routing_key: String,
    /// Do not wait for the broker's confirmation
    #[serde(default, rename = "nowait")]
    pub no_wait: bool,
}

impl Binding {
    /// Bind to `exchange` with `routing_key`.
    #[must_use]
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            no_wait: false,
        }
    }
}

/// Exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExchangeSpec {
    /// Routing algorithm
    #[serde(rename = "type")]
    pub kind: ExchangeKind,
    /// Survives a broker restart
    #[serde(default)]
    pub durable: bool,
    /// Deleted when the last binding is removed
    #[serde(default, rename = "autodelete")]
    pub auto_delete: bool,
    /// Cannot be published to directly
    #[serde(default)]
    pub internal: bool,
    /// Do not wait for the broker's confirmation
    #[serde(default, rename = "nowait")]
    pub no_wait: bool,
    /// Broker-specific arguments
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub arguments: Arguments,
    /// Exchange-to-exchange bindings; this exchange is the destination
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<Binding>,
}

impl ExchangeSpec {
    /// Non-durable exchange of the given kind.
    #[must_use]
    pub fn new(kind: ExchangeKind) -> Self {
        Self {
            kind,
            durable: false,
            auto_delete: false,
            internal: false,
            no_wait: false,
            arguments: Arguments::new(),
            bindings: Vec::new(),
        }
    }

    /// Set durability.
    #[must_use]
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Set auto-delete.
    #[must_use]
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Set internal.
    #[must_use]
    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    /// Add a broker argument.
    #[must_use]
    pub fn argument(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    /// Bind this exchange to a source exchange.
    #[must_use]
    pub fn bind(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.bindings.push(Binding::new(exchange, routing_key));
        self
    }

    /// Whether `other` declares the same exchange. Bindings and `no_wait`
    /// are not part of the declaration.
    #[must_use]
    pub fn is_equivalent(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.durable == other.durable
            && self.auto_delete == other.auto_delete
            && self.internal == other.internal
            && self.arguments == other.arguments
    }
}

/// Queue declaration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueSpec {
    /// Survives a broker restart
    #[serde(default)]
    pub durable: bool,
    /// Deleted when the last consumer goes away
    #[serde(default, rename = "autodelete")]
    pub auto_delete: bool,
    /// Only usable by the declaring connection
    #[serde(default)]
    pub exclusive: bool,
    /// Do not wait for the broker's confirmation
    #[serde(default, rename = "nowait")]
    pub no_wait: bool,
    /// Broker-specific arguments
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub arguments: Arguments,
    /// Queue-to-exchange bindings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<Binding>,
}

impl QueueSpec {
    /// Non-durable queue with no bindings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set durability.
    #[must_use]
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Set auto-delete.
    #[must_use]
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Set exclusivity.
    #[must_use]
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Add a broker argument.
    #[must_use]
    pub fn argument(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    /// Bind this queue to a source exchange.
    #[must_use]
    pub fn bind(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.bindings.push(Binding::new(exchange, routing_key));
        self
    }

    /// Whether `other` declares the same queue.
    #[must_use]
    pub fn is_equivalent(&self, other: &Self) -> bool {
        self.durable == other.durable
            && self.auto_delete == other.auto_delete
            && self.exclusive == other.exclusive
            && self.arguments == other.arguments
    }
}

/// The full set of exchanges and queues to reconcile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Exchanges by name
    #[serde(default)]
    pub exchanges: BTreeMap<String, ExchangeSpec>,
    /// Queues by name
    #[serde(default)]
    pub queues: BTreeMap<String, QueueSpec>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTopology {
    #[serde(default)]
    exchanges: Option<BTreeMap<String, serde_yaml::Value>>,
    #[serde(default)]
    queues: Option<BTreeMap<String, serde_yaml::Value>>,
}

impl Topology {
    /// Empty topology.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an exchange.
    #[must_use]
    pub fn with_exchange(mut self, name: impl Into<String>, spec: ExchangeSpec) -> Self {
        self.exchanges.insert(name.into(), spec);
        self
    }

    /// Add a queue.
    #[must_use]
    pub fn with_queue(mut self, name: impl Into<String>, spec: QueueSpec) -> Self {
        self.queues.insert(name.into(), spec);
        self
    }

    /// Whether there is nothing to declare.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty()
    }

    /// Number of bindings across all entities.
    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.exchanges.values().map(|e| e.bindings.len()).sum::<usize>()
            + self.queues.values().map(|q| q.bindings.len()).sum::<usize>()
    }

    /// Parse a YAML topology.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Configuration`] naming the offending key.
    pub fn from_yaml(input: &str) -> Result<Self, MqError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }

        let raw: RawTopology = serde_yaml::from_str(input).map_err(|e| MqError::Configuration {
            key: "topology".to_string(),
            message: e.to_string(),
        })?;

        let mut topology = Self::default();

        for (name, value) in raw.exchanges.unwrap_or_default() {
            let spec: ExchangeSpec =
                serde_yaml::from_value(value).map_err(|e| MqError::Configuration {
                    key: format!("exchanges.{name}"),
                    message: e.to_string(),
                })?;
            topology.exchanges.insert(name, spec);
        }

        for (name, value) in raw.queues.unwrap_or_default() {
            let spec: QueueSpec = if value.is_null() {
                QueueSpec::default()
            } else {
                serde_yaml::from_value(value).map_err(|e| MqError::Configuration {
                    key: format!("queues.{name}"),
                    message: e.to_string(),
                })?
            };
            topology.queues.insert(name, spec);
        }

        topology.validate()?;
        Ok(topology)
    }

    /// Parse a YAML topology from a reader.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Configuration`] if reading or parsing fails.
    pub fn from_yaml_reader<R: Read>(mut reader: R) -> Result<Self, MqError> {
        let mut input = String::new();
        reader
            .read_to_string(&mut input)
            .map_err(|e| MqError::Configuration {
                key: "topology".to_string(),
                message: format!("unable to read topology: {e}"),
            })?;
        Self::from_yaml(&input)
    }

    /// Parse a YAML topology file.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Configuration`] if the file cannot be read or parsed.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, MqError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|e| MqError::Configuration {
            key: "topology".to_string(),
            message: format!("unable to read {}: {e}", path.display()),
        })?;
        Self::from_yaml(&input)
    }

    /// Serialize back to YAML.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Configuration`] if serialization fails.
    pub fn to_yaml(&self) -> Result<String, MqError> {
        serde_yaml::to_string(self).map_err(|e| MqError::Configuration {
            key: "topology".to_string(),
            message: e.to_string(),
        })
    }

    /// Check structural rules that the YAML schema cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Configuration`] for the first invalid entry.
    pub fn validate(&self) -> Result<(), MqError> {
        for (name, spec) in &self.exchanges {
            if name.is_empty() {
                return Err(MqError::Configuration {
                    key: "exchanges".to_string(),
                    message: "exchange name must not be empty".to_string(),
                });
            }
            validate_bindings(&format!("exchanges.{name}"), &spec.bindings)?;
        }
        for (name, spec) in &self.queues {
            if name.is_empty() {
                return Err(MqError::Configuration {
                    key: "queues".to_string(),
                    message: "queue name must not be empty".to_string(),
                });
            }
            validate_bindings(&format!("queues.{name}"), &spec.bindings)?;
        }
        Ok(())
    }
}

fn validate_bindings(owner: &str, bindings: &[Binding]) -> Result<(), MqError> {
    for (i, binding) in bindings.iter().enumerate() {
        if binding.exchange.is_empty() {
            return Err(MqError::Configuration {
                key: format!("{owner}.bindings[{i}].exchange"),
                message: "binding must name a source exchange".to_string(),
            });
        }
    }
    Ok(())
}

/// A topology entity, used to attribute broker failures.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Entity {
    /// An exchange
    Exchange(String),
    /// A queue
    Queue(String),
    /// A binding from `source` to `destination`
    Binding {
        /// Source exchange
        source: String,
        /// Destination exchange or queue
        destination: String,
        /// Routing key
        routing_key: String,
    },
}

impl Entity {
    /// Name of the entity (the destination for bindings).
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Exchange(name) | Self::Queue(name) => name,
            Self::Binding { destination, .. } => destination,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exchange(name) => write!(f, "exchange '{name}'"),
            Self::Queue(name) => write!(f, "queue '{name}'"),
            Self::Binding {
                source,
                destination,
                routing_key,
            } => write!(
                f,
                "binding '{source}' -> '{destination}' (key '{routing_key}')"
            ),
        }
    }
}
