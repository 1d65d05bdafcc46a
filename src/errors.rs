// Error taxonomy for the TypeGraph engine.
// Every user-recoverable fault is a tagged variant carrying enough context
// (kind, id, constraint name, offending key) to act on at the call site.
// Engine APIs return anyhow::Result; callers discriminate variants with
// `err.downcast_ref::<TypeGraphError>()`.

use thiserror::Error;

/// Tagged error variants raised by the registry, storage engine, compiler,
/// and executor.
#[derive(Debug, Error)]
pub enum TypeGraphError {
    /// Prop validator rejection, invalid prepared binding, unknown matchOn
    /// field, invalid cursor, or pagination without ORDER BY.
    #[error("validation failed for {subject}: {reason}")]
    Validation { subject: String, reason: String },

    /// A different live node already owns the uniqueness key.
    #[error("uniqueness conflict on '{constraint}' ({kind}): key already owned by node '{owner}'")]
    Uniqueness {
        kind: String,
        constraint: String,
        key: String,
        owner: String,
    },

    /// The same id exists under a kind declared disjoint with this one.
    #[error("disjoint violation: id '{id}' already exists as '{other_kind}', disjoint with '{kind}'")]
    Disjoint {
        kind: String,
        other_kind: String,
        id: String,
    },

    /// Edge cardinality (`one`, `oneActive`, `unique`) violated on insert.
    #[error("cardinality '{cardinality}' violated for edge '{kind}' from {from_kind}/{from_id}")]
    Cardinality {
        kind: String,
        cardinality: String,
        from_kind: String,
        from_id: String,
    },

    /// Node delete blocked by `onDelete: restrict` while live edges exist.
    #[error("delete of {kind}/{id} restricted: {live_edges} live incident edge(s)")]
    RestrictedDelete {
        kind: String,
        id: String,
        live_edges: usize,
    },

    /// Reference to a kind the graph definition never declared.
    #[error("unknown kind '{kind}'")]
    KindNotFound { kind: String },

    #[error("node {kind}/{id} not found")]
    NodeNotFound { kind: String, id: String },

    #[error("edge '{id}' not found")]
    EdgeNotFound { id: String },

    /// Edge endpoint kind outside the registered from/to kind sets.
    #[error("invalid endpoint for edge '{kind}': {reason}")]
    Endpoint { kind: String, reason: String },

    #[error("no unique constraint named '{constraint}' on kind '{kind}'")]
    ConstraintNotFound { kind: String, constraint: String },

    /// Invalid table names, unsupported capability, cyclic implications, and
    /// other graph-definition faults.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// Wraps backend failures the engine cannot interpret.
    #[error("database operation '{operation}' failed: {message}")]
    DatabaseOperation { operation: String, message: String },

    /// Internal-only: a bug-class invariant failed inside the compiler.
    /// User input should never be able to trigger this.
    #[error("compiler invariant violated: {detail}")]
    CompilerInvariant { detail: String },
}

impl TypeGraphError {
    pub fn validation(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn database(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DatabaseOperation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn invariant(detail: impl Into<String>) -> Self {
        Self::CompilerInvariant {
            detail: detail.into(),
        }
    }

    /// Short stable tag for structured logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Uniqueness { .. } => "uniqueness",
            Self::Disjoint { .. } => "disjoint",
            Self::Cardinality { .. } => "cardinality",
            Self::RestrictedDelete { .. } => "restricted_delete",
            Self::KindNotFound { .. } => "kind_not_found",
            Self::NodeNotFound { .. } => "node_not_found",
            Self::EdgeNotFound { .. } => "edge_not_found",
            Self::Endpoint { .. } => "endpoint",
            Self::ConstraintNotFound { .. } => "constraint_not_found",
            Self::Configuration { .. } => "configuration",
            Self::DatabaseOperation { .. } => "database_operation",
            Self::CompilerInvariant { .. } => "compiler_invariant",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcasts_through_anyhow() {
        let err: anyhow::Error = TypeGraphError::KindNotFound {
            kind: "Person".to_string(),
        }
        .into();
        let tg = err.downcast_ref::<TypeGraphError>().unwrap();
        assert_eq!(tg.tag(), "kind_not_found");
    }

    #[test]
    fn messages_carry_context() {
        let err = TypeGraphError::Uniqueness {
            kind: "User".into(),
            constraint: "email".into(),
            key: "alice@example.com".into(),
            owner: "n1".into(),
        };
        let text = err.to_string();
        assert!(text.contains("email"));
        assert!(text.contains("n1"));
    }
}
