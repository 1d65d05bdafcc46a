// TypeGraph - An Embedded Typed Knowledge-Graph Engine over SQL
// Root library module

pub mod backend_sql;
pub mod contracts;
pub mod dialect;
pub mod errors;
pub mod field_tracker;
pub mod graph_store;
pub mod memory_backend;
pub mod observability;
pub mod ontology;
pub mod postgres_backend;
pub mod query_ast;
pub mod query_builder;
pub mod query_compiler;
pub mod query_executor;
pub mod registry;
pub mod schema;
pub mod schema_doc;
pub mod sql;
pub mod sqlite_backend;
pub mod types;
pub mod validation;

// Re-export logging setup
pub use observability::{init_logging, init_logging_with_level};

// Re-export the error taxonomy
pub use errors::TypeGraphError;

// Re-export validated types
pub use types::{EntityId, GraphId, KindName, TableNames, TemporalMode, Validity};

// Re-export the schema vocabulary and ontology
pub use ontology::OntologyRelation;
pub use schema::{
    Cardinality, DeleteBehavior, EdgeRegistration, EdgeType, GraphDef, GraphDefBuilder,
    KeyCollation, NodeRegistration, NodeType, UniqueConstraint, UniqueScope,
};
pub use validation::{AnyProps, FieldType, PropSchema, PropValidator};

// Re-export the registry
pub use registry::{EdgeExpansion, KindRegistry, ResolvedConstraint};

// Re-export the backend contract and row types
pub use contracts::{
    BackendCapabilities, EdgePatch, EdgeRow, GraphBackend, GraphTransaction, NodePatch, NodeRow,
    SchemaVersionRow, TemporalFilter, UniqueRow,
};

// Re-export the storage engine surface
pub use graph_store::{
    CreateEdge, CreateNode, FindOptions, FindOrCreateEdge, FindOrCreateNode, FoundOrCreated,
    GraphStore, NodeRef, OnConflict, StoreConfig, StoreConfigBuilder, UpdateOptions,
};

// Re-export the query surface
pub use field_tracker::{AliasView, ProjectionCtx};
pub use query_ast::{
    AggFunc, AggOutput, Direction, Expr, FieldRef, Operand, ParamType, Projection, SystemField,
};
pub use query_builder::{
    and, exists, field, lit, not, not_exists, or, param, prop, sys, sysf, GraphQuery, Hop,
};
pub use query_executor::{Page, PageArgs, PreparedQuery, ResultRow};

// Re-export the bundled backends
pub use memory_backend::MemoryBackend;
pub use postgres_backend::PostgresBackend;
pub use sqlite_backend::SqliteBackend;

// Re-export the dialect strategy
pub use dialect::{SqlDialect, StatementCache};
pub use sql::{SqlRow, SqlStatement, SqlValue};
