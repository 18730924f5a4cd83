//! Error taxonomy shared by every mqkit crate.

use crate::broker::BrokerError;
use crate::topology::Entity;
use std::fmt;

/// Errors surfaced by mqkit operations.
#[derive(Debug, thiserror::Error)]
pub enum MqError {
    /// Malformed topology configuration
    #[error("configuration error at '{key}': {message}")]
    Configuration {
        /// Dotted path of the offending entry
        key: String,
        /// Parser or validation message
        message: String,
    },
    /// Declaration or binding rejected by the broker
    #[error("topology conflict on {entity}: {source}")]
    TopologyConflict {
        /// Entity the broker rejected
        entity: Entity,
        /// Broker failure
        source: BrokerError,
    },
    /// Connection or channel failure
    #[error("connectivity error while {context}: {source}")]
    Connectivity {
        /// What was being attempted
        context: String,
        /// Broker failure
        source: BrokerError,
    },
    /// Publish rejected or attempted on a closed channel
    #[error("publish to exchange '{exchange}' with key '{routing_key}' failed: {reason}")]
    Publish {
        /// Target exchange
        exchange: String,
        /// Routing key
        routing_key: String,
        /// Failure description
        reason: String,
    },
    /// Consume request rejected
    #[error("subscription to queue '{queue}' failed: {reason}")]
    Subscription {
        /// Queue name
        queue: String,
        /// Failure description
        reason: String,
    },
    /// Call aborted by the caller's cancellation before a reply arrived
    #[error("call cancelled before a reply arrived")]
    Cancelled,
    /// One or more entities could not be deleted
    #[error("teardown failed: {}", FailureList(.failures))]
    Teardown {
        /// Every entity that failed, with its cause
        failures: Vec<EntityFailure>,
    },
    /// A consumer handler panicked while processing a message
    #[error("message handler panicked: {0}")]
    Handler(String),
    /// Body encoding or decoding failed
    #[error("payload error: {0}")]
    Payload(String),
}

impl MqError {
    /// Build a connectivity error.
    pub fn connectivity(context: impl Into<String>, source: BrokerError) -> Self {
        Self::Connectivity {
            context: context.into(),
            source,
        }
    }

    /// Whether this is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Entity named by a topology conflict, if any.
    #[must_use]
    pub fn entity(&self) -> Option<&Entity> {
        match self {
            Self::TopologyConflict { entity, .. } => Some(entity),
            _ => None,
        }
    }
}

/// A failed operation on a single topology entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityFailure {
    /// Entity the operation targeted
    pub entity: Entity,
    /// Broker failure
    pub cause: BrokerError,
}

struct FailureList<'a>(&'a [EntityFailure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{} ({})", failure.entity, failure.cause)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_names_entity() {
        let err = MqError::TopologyConflict {
            entity: Entity::Exchange("events".to_string()),
            source: BrokerError::PreconditionFailed("inequivalent arg 'type'".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("exchange 'events'"));
        assert!(msg.contains("inequivalent arg"));
        assert_eq!(err.entity(), Some(&Entity::Exchange("events".to_string())));
    }

    #[test]
    fn teardown_lists_every_failure() {
        let err = MqError::Teardown {
            failures: vec![
                EntityFailure {
                    entity: Entity::Exchange("ex".to_string()),
                    cause: BrokerError::NotFound("no exchange 'ex'".to_string()),
                },
                EntityFailure {
                    entity: Entity::Queue("q".to_string()),
                    cause: BrokerError::NotFound("no queue 'q'".to_string()),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("exchange 'ex'"));
        assert!(msg.contains("queue 'q'"));
    }
}
