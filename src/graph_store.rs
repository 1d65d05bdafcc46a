// Graph storage engine.
// Enforces the full graph contract on top of a backend that only speaks SQL
// CRUD: disjointness, uniqueness lifecycle, cardinality, delete behaviors,
// bitemporal validity, find-or-create, and schema publishing. Every mutating
// operation goes through exactly one method here.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::contracts::{
    EdgePatch, EdgeRow, GraphBackend, NodePatch, NodeRow, SchemaVersionRow, TemporalFilter,
    UniqueRow,
};
use crate::errors::TypeGraphError;
use crate::registry::KindRegistry;
use crate::schema::{Cardinality, DeleteBehavior};
use crate::schema_doc::{build_schema_doc, schema_hash};
use crate::types::{EntityId, GraphId, Validity};
use crate::validation::{paths, AnyProps, PropValidator};

/// Store-level configuration, validated at construction.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub graph_id: GraphId,
}

impl StoreConfig {
    pub fn builder(graph_id: impl Into<String>) -> StoreConfigBuilder {
        StoreConfigBuilder {
            graph_id: graph_id.into(),
        }
    }
}

/// Fluent builder for [`StoreConfig`].
pub struct StoreConfigBuilder {
    graph_id: String,
}

impl StoreConfigBuilder {
    pub fn build(self) -> Result<StoreConfig> {
        Ok(StoreConfig {
            graph_id: GraphId::new(self.graph_id)?,
        })
    }
}

/// Reference to a node endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub kind: String,
    pub id: String,
}

impl NodeRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl From<&NodeRow> for NodeRef {
    fn from(row: &NodeRow) -> Self {
        Self::new(row.kind.clone(), row.id.clone())
    }
}

/// Node creation request.
#[derive(Debug, Clone)]
pub struct CreateNode {
    pub kind: String,
    pub props: JsonValue,
    pub id: Option<String>,
    pub validity: Validity,
}

impl CreateNode {
    pub fn new(kind: impl Into<String>, props: JsonValue) -> Self {
        Self {
            kind: kind.into(),
            props,
            id: None,
            validity: Validity::default(),
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn validity(mut self, validity: Validity) -> Self {
        self.validity = validity;
        self
    }
}

/// Edge creation request.
#[derive(Debug, Clone)]
pub struct CreateEdge {
    pub kind: String,
    pub from: NodeRef,
    pub to: NodeRef,
    pub props: JsonValue,
    pub id: Option<String>,
    pub validity: Validity,
}

impl CreateEdge {
    pub fn new(kind: impl Into<String>, from: NodeRef, to: NodeRef) -> Self {
        Self {
            kind: kind.into(),
            from,
            to,
            props: JsonValue::Null,
            id: None,
            validity: Validity::default(),
        }
    }

    pub fn props(mut self, props: JsonValue) -> Self {
        self.props = props;
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn validity(mut self, validity: Validity) -> Self {
        self.validity = validity;
        self
    }
}

/// Options for node updates.
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    pub increment_version: bool,
    pub validity: Option<Validity>,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            increment_version: true,
            validity: None,
        }
    }
}

/// Conflict policy when find-or-create finds an existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnConflict {
    /// Return the existing row untouched.
    #[default]
    Ignore,
    /// Apply the incoming props to the existing row first.
    Update,
}

/// Find-or-create request for nodes; `match_on` names a uniqueness
/// constraint declared for the kind.
#[derive(Debug, Clone)]
pub struct FindOrCreateNode {
    pub spec: CreateNode,
    pub match_on: String,
    pub on_conflict: OnConflict,
}

impl FindOrCreateNode {
    pub fn new(spec: CreateNode, match_on: impl Into<String>) -> Self {
        Self {
            spec,
            match_on: match_on.into(),
            on_conflict: OnConflict::default(),
        }
    }

    pub fn on_conflict(mut self, policy: OnConflict) -> Self {
        self.on_conflict = policy;
        self
    }
}

/// Find-or-create request for edges; `match_on` lists prop field paths that
/// must agree (empty = endpoints only).
#[derive(Debug, Clone)]
pub struct FindOrCreateEdge {
    pub spec: CreateEdge,
    pub match_on: Vec<String>,
    pub on_conflict: OnConflict,
}

impl FindOrCreateEdge {
    pub fn new(spec: CreateEdge) -> Self {
        Self {
            spec,
            match_on: Vec::new(),
            on_conflict: OnConflict::default(),
        }
    }

    pub fn match_on(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.match_on = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn on_conflict(mut self, policy: OnConflict) -> Self {
        self.on_conflict = policy;
        self
    }
}

/// Result of a find-or-create operation.
#[derive(Debug, Clone, PartialEq)]
pub struct FoundOrCreated<T> {
    pub row: T,
    pub created: bool,
}

/// Listing options for kind scans.
#[derive(Debug, Clone, Copy, Default)]
pub struct FindOptions {
    pub include_subclasses: bool,
    pub filter: TemporalFilter,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// The typed graph store: a shared registry, a shared backend handle, and a
/// graph id. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct GraphStore {
    registry: Arc<KindRegistry>,
    backend: Arc<dyn GraphBackend>,
    config: Arc<StoreConfig>,
    in_transaction: bool,
}

impl GraphStore {
    pub fn new(
        registry: Arc<KindRegistry>,
        backend: Arc<dyn GraphBackend>,
        config: StoreConfig,
    ) -> Result<Self> {
        backend.table_names().validate()?;
        Ok(Self {
            registry,
            backend,
            config: Arc::new(config),
            in_transaction: false,
        })
    }

    pub fn registry(&self) -> &Arc<KindRegistry> {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<dyn GraphBackend> {
        &self.backend
    }

    pub fn graph_id(&self) -> &str {
        self.config.graph_id.as_str()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // --- nodes ---

    /// Create a node: validate props, assign an id, enforce disjointness and
    /// uniqueness, insert with version 1.
    #[instrument(skip(self, spec), fields(kind = %spec.kind))]
    pub async fn create_node(&self, spec: CreateNode) -> Result<NodeRow> {
        let registration = self.registry.node_registration(&spec.kind)?;
        let props = registration.node_type.validator.validate(&spec.props)?;
        let id = match spec.id {
            Some(id) => EntityId::new(id)?.into_string(),
            None => EntityId::generate().into_string(),
        };

        self.check_disjointness(&spec.kind, &id).await?;
        self.claim_unique_keys(&spec.kind, &id, &props).await?;

        let now = Utc::now();
        let row = NodeRow {
            graph_id: self.graph_id().to_string(),
            kind: spec.kind.clone(),
            id,
            props,
            version: 1,
            valid_from: spec.validity.valid_from,
            valid_to: spec.validity.valid_to,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.backend.insert_node(row.clone()).await?;
        debug!(kind = %row.kind, id = %row.id, "node created");
        Ok(row)
    }

    /// Create several nodes, preserving input order. Empty input performs no
    /// backend writes.
    pub async fn create_nodes(&self, specs: Vec<CreateNode>) -> Result<Vec<NodeRow>> {
        let mut out = Vec::with_capacity(specs.len());
        for spec in specs {
            out.push(self.create_node(spec).await?);
        }
        Ok(out)
    }

    pub async fn get_node(&self, kind: &str, id: &str) -> Result<Option<NodeRow>> {
        self.get_node_with(kind, id, TemporalFilter::current()).await
    }

    pub async fn get_node_with(
        &self,
        kind: &str,
        id: &str,
        filter: TemporalFilter,
    ) -> Result<Option<NodeRow>> {
        self.registry.node_registration(kind)?;
        self.backend
            .get_node(self.graph_id(), kind, id, filter)
            .await
    }

    /// Fetch nodes by id in input order, skipping ids with no visible row.
    /// An empty id list returns without touching the backend.
    pub async fn get_nodes(&self, kind: &str, ids: &[String]) -> Result<Vec<NodeRow>> {
        self.get_nodes_with(kind, ids, TemporalFilter::current())
            .await
    }

    pub async fn get_nodes_with(
        &self,
        kind: &str,
        ids: &[String],
        filter: TemporalFilter,
    ) -> Result<Vec<NodeRow>> {
        self.registry.node_registration(kind)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .backend
            .get_nodes(self.graph_id(), Some(kind), ids, filter)
            .await?;
        let mut by_id: HashMap<&str, &NodeRow> =
            rows.iter().map(|row| (row.id.as_str(), row)).collect();
        Ok(ids
            .iter()
            .filter_map(|id| by_id.remove(id.as_str()).cloned())
            .collect())
    }

    /// Update a node's props: validate the merged payload, migrate changed
    /// unique keys, bump the version (unless disabled).
    #[instrument(skip(self, props))]
    pub async fn update_node(&self, kind: &str, id: &str, props: JsonValue) -> Result<NodeRow> {
        self.update_node_with(kind, id, props, UpdateOptions::default())
            .await
    }

    pub async fn update_node_with(
        &self,
        kind: &str,
        id: &str,
        props: JsonValue,
        options: UpdateOptions,
    ) -> Result<NodeRow> {
        let registration = self.registry.node_registration(kind)?;
        let current = self
            .backend
            .get_node(self.graph_id(), kind, id, TemporalFilter::current())
            .await?
            .ok_or_else(|| TypeGraphError::NodeNotFound {
                kind: kind.to_string(),
                id: id.to_string(),
            })?;

        let merged = paths::merge(&current.props, &props);
        let validated = registration.node_type.validator.validate(&merged)?;

        self.migrate_unique_keys(kind, id, &current.props, &validated)
            .await?;

        let mut patch = NodePatch {
            props: Some(validated),
            bump_version: options.increment_version,
            updated_at: Some(Utc::now()),
            ..NodePatch::default()
        };
        if let Some(validity) = options.validity {
            patch.valid_from = Some(validity.valid_from);
            patch.valid_to = Some(validity.valid_to);
        }

        let updated = self
            .backend
            .update_node(self.graph_id(), kind, id, patch)
            .await?
            .ok_or_else(|| TypeGraphError::NodeNotFound {
                kind: kind.to_string(),
                id: id.to_string(),
            })?;
        Ok(updated)
    }

    /// Soft-delete a node per its registered delete behavior, releasing its
    /// uniqueness claims so the keys become reusable.
    #[instrument(skip(self))]
    pub async fn delete_node(&self, kind: &str, id: &str) -> Result<()> {
        let registration = self.registry.node_registration(kind)?;
        let node = self
            .backend
            .get_node(self.graph_id(), kind, id, TemporalFilter::current())
            .await?
            .ok_or_else(|| TypeGraphError::NodeNotFound {
                kind: kind.to_string(),
                id: id.to_string(),
            })?;

        let incident = self
            .backend
            .find_edges_connected_to(self.graph_id(), kind, id, TemporalFilter::current())
            .await?;

        let now = Utc::now();
        match registration.on_delete {
            DeleteBehavior::Restrict => {
                if !incident.is_empty() {
                    bail!(TypeGraphError::RestrictedDelete {
                        kind: kind.to_string(),
                        id: id.to_string(),
                        live_edges: incident.len(),
                    });
                }
            }
            DeleteBehavior::Cascade => {
                debug!(kind, id, edges = incident.len(), "cascade_delete_edges");
                self.soft_delete_edges(&incident, now).await?;
            }
            DeleteBehavior::Disconnect => {
                debug!(kind, id, edges = incident.len(), "disconnect_edges");
                self.soft_delete_edges(&incident, now).await?;
            }
        }

        self.backend
            .update_node(
                self.graph_id(),
                kind,
                id,
                NodePatch {
                    deleted_at: Some(Some(now)),
                    updated_at: Some(now),
                    ..NodePatch::default()
                },
            )
            .await?;
        self.backend
            .release_uniques_for_node(self.graph_id(), &node.id, now)
            .await?;
        Ok(())
    }

    /// Physically remove a node and everything referencing it, inside a
    /// transaction. The order is fixed: embeddings, uniques, incident edges,
    /// then the node, so nothing dangles mid-flight.
    #[instrument(skip(self))]
    pub async fn hard_delete_node(&self, kind: &str, id: &str) -> Result<()> {
        self.registry.node_registration(kind)?;
        if self.in_transaction {
            return self.hard_delete_node_inner(kind, id).await;
        }
        if !self.backend.capabilities().transactions {
            bail!(TypeGraphError::configuration(
                "hard delete requires a backend with transaction support",
            ));
        }
        let kind = kind.to_string();
        let id = id.to_string();
        self.transaction(move |store| {
            Box::pin(async move { store.hard_delete_node_inner(&kind, &id).await })
        })
        .await
    }

    async fn hard_delete_node_inner(&self, kind: &str, id: &str) -> Result<()> {
        let graph_id = self.graph_id();
        self.backend
            .purge_embeddings_for_node(graph_id, kind, id)
            .await?;
        self.backend.purge_uniques_for_node(graph_id, id).await?;
        self.backend
            .purge_edges_connected_to(graph_id, kind, id)
            .await?;
        self.backend.purge_node(graph_id, kind, id).await?;
        Ok(())
    }

    pub async fn find_nodes_by_kind(
        &self,
        kind: &str,
        options: FindOptions,
    ) -> Result<Vec<NodeRow>> {
        self.registry.node_registration(kind)?;
        let kinds = if options.include_subclasses {
            self.registry.expand_sub_classes(kind)
        } else {
            vec![kind.to_string()]
        };
        self.backend
            .find_nodes_by_kind(
                self.graph_id(),
                &kinds,
                options.filter,
                options.limit,
                options.offset,
            )
            .await
    }

    pub async fn count_nodes_by_kind(&self, kind: &str, include_subclasses: bool) -> Result<u64> {
        self.registry.node_registration(kind)?;
        let kinds = if include_subclasses {
            self.registry.expand_sub_classes(kind)
        } else {
            vec![kind.to_string()]
        };
        self.backend
            .count_nodes_by_kind(self.graph_id(), &kinds, TemporalFilter::current())
            .await
    }

    /// Look up the live owner of a uniqueness key derived from `props`.
    /// Soft-deleted claims are invisible here.
    pub async fn find_by_unique(
        &self,
        kind: &str,
        constraint_name: &str,
        props: &JsonValue,
    ) -> Result<Option<NodeRow>> {
        let resolved = self.registry.unique_constraint(kind, constraint_name)?;
        let key = self.registry.resolve_unique_key(&resolved.constraint, props)?;
        let claim = self
            .backend
            .check_unique(
                self.graph_id(),
                &resolved.namespace,
                &resolved.constraint.name,
                &key,
                TemporalFilter::current(),
            )
            .await?;
        let Some(claim) = claim else {
            return Ok(None);
        };
        self.backend
            .get_node(
                self.graph_id(),
                &claim.concrete_kind,
                &claim.node_id,
                TemporalFilter::current(),
            )
            .await
    }

    // --- edges ---

    /// Create an edge: validate props, enforce endpoint kinds (with subclass
    /// expansion), check that both endpoints exist live, and enforce the
    /// registered cardinality.
    #[instrument(skip(self, spec), fields(kind = %spec.kind))]
    pub async fn create_edge(&self, spec: CreateEdge) -> Result<EdgeRow> {
        let registration = self.registry.edge_registration(&spec.kind)?;
        let props = match &registration.edge_type.validator {
            Some(validator) => validator.validate(&spec.props)?,
            None => AnyProps.validate(&spec.props)?,
        };

        self.check_endpoint(&spec.kind, &registration.from_kinds, &spec.from, "from")
            .await?;
        self.check_endpoint(&spec.kind, &registration.to_kinds, &spec.to, "to")
            .await?;
        self.check_cardinality(registration.cardinality, &spec).await?;

        let id = match spec.id {
            Some(id) => EntityId::new(id)?.into_string(),
            None => EntityId::generate().into_string(),
        };
        let now = Utc::now();
        let row = EdgeRow {
            graph_id: self.graph_id().to_string(),
            id,
            kind: spec.kind.clone(),
            from_kind: spec.from.kind.clone(),
            from_id: spec.from.id.clone(),
            to_kind: spec.to.kind.clone(),
            to_id: spec.to.id.clone(),
            props,
            valid_from: spec.validity.valid_from,
            valid_to: spec.validity.valid_to,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.backend.insert_edge(row.clone()).await?;
        debug!(kind = %row.kind, id = %row.id, "edge created");
        Ok(row)
    }

    pub async fn get_edge(&self, id: &str) -> Result<Option<EdgeRow>> {
        self.get_edge_with(id, TemporalFilter::current()).await
    }

    pub async fn get_edge_with(&self, id: &str, filter: TemporalFilter) -> Result<Option<EdgeRow>> {
        self.backend.get_edge(self.graph_id(), id, filter).await
    }

    pub async fn update_edge(&self, id: &str, props: JsonValue) -> Result<EdgeRow> {
        let current = self
            .backend
            .get_edge(self.graph_id(), id, TemporalFilter::current())
            .await?
            .ok_or_else(|| TypeGraphError::EdgeNotFound { id: id.to_string() })?;
        let registration = self.registry.edge_registration(&current.kind)?;
        let merged = paths::merge(&current.props, &props);
        let validated = match &registration.edge_type.validator {
            Some(validator) => validator.validate(&merged)?,
            None => AnyProps.validate(&merged)?,
        };
        let updated = self
            .backend
            .update_edge(
                self.graph_id(),
                id,
                EdgePatch {
                    props: Some(validated),
                    updated_at: Some(Utc::now()),
                    ..EdgePatch::default()
                },
            )
            .await?
            .ok_or_else(|| TypeGraphError::EdgeNotFound { id: id.to_string() })?;
        Ok(updated)
    }

    /// Soft-delete an edge.
    pub async fn delete_edge(&self, id: &str) -> Result<()> {
        let existing = self
            .backend
            .get_edge(self.graph_id(), id, TemporalFilter::current())
            .await?;
        if existing.is_none() {
            bail!(TypeGraphError::EdgeNotFound { id: id.to_string() });
        }
        let now = Utc::now();
        self.backend
            .update_edge(
                self.graph_id(),
                id,
                EdgePatch {
                    deleted_at: Some(Some(now)),
                    updated_at: Some(now),
                    ..EdgePatch::default()
                },
            )
            .await?;
        Ok(())
    }

    pub async fn find_edges_by_kind(
        &self,
        kind: &str,
        options: FindOptions,
    ) -> Result<Vec<EdgeRow>> {
        self.registry.edge_registration(kind)?;
        self.backend
            .find_edges_by_kind(
                self.graph_id(),
                &[kind.to_string()],
                options.filter,
                options.limit,
                options.offset,
            )
            .await
    }

    pub async fn count_edges_by_kind(&self, kind: &str) -> Result<u64> {
        self.registry.edge_registration(kind)?;
        self.backend
            .count_edges_by_kind(
                self.graph_id(),
                &[kind.to_string()],
                TemporalFilter::current(),
            )
            .await
    }

    pub async fn count_edges_from(
        &self,
        edge_kind: &str,
        from: &NodeRef,
        active_only: bool,
    ) -> Result<u64> {
        self.registry.edge_registration(edge_kind)?;
        self.backend
            .count_edges_from(
                self.graph_id(),
                edge_kind,
                &from.kind,
                &from.id,
                active_only,
            )
            .await
    }

    pub async fn find_edges_connected_to(&self, node: &NodeRef) -> Result<Vec<EdgeRow>> {
        self.registry.node_registration(&node.kind)?;
        self.backend
            .find_edges_connected_to(
                self.graph_id(),
                &node.kind,
                &node.id,
                TemporalFilter::current(),
            )
            .await
    }

    // --- find or create ---

    /// Find a node by a named uniqueness constraint or create it. A live
    /// match is returned as-is (props applied first under
    /// `OnConflict::Update`); a tombstoned match is resurrected with its
    /// constraints re-validated; otherwise a fresh node is created.
    #[instrument(skip(self, request), fields(kind = %request.spec.kind, match_on = %request.match_on))]
    pub async fn find_or_create_node(
        &self,
        request: FindOrCreateNode,
    ) -> Result<FoundOrCreated<NodeRow>> {
        let registration = self.registry.node_registration(&request.spec.kind)?;
        let props = registration
            .node_type
            .validator
            .validate(&request.spec.props)?;
        let resolved = self
            .registry
            .unique_constraint(&request.spec.kind, &request.match_on)?;
        let key = self.registry.resolve_unique_key(&resolved.constraint, &props)?;

        let claim = self
            .backend
            .check_unique(
                self.graph_id(),
                &resolved.namespace,
                &resolved.constraint.name,
                &key,
                TemporalFilter::include_tombstones(),
            )
            .await?;

        match claim {
            Some(claim) if claim.deleted_at.is_none() => {
                let mut row = self
                    .backend
                    .get_node(
                        self.graph_id(),
                        &claim.concrete_kind,
                        &claim.node_id,
                        TemporalFilter::current(),
                    )
                    .await?
                    .ok_or_else(|| TypeGraphError::NodeNotFound {
                        kind: claim.concrete_kind.clone(),
                        id: claim.node_id.clone(),
                    })?;
                if request.on_conflict == OnConflict::Update {
                    row = self
                        .update_node(&row.kind.clone(), &row.id.clone(), props)
                        .await?;
                }
                Ok(FoundOrCreated {
                    row,
                    created: false,
                })
            }
            Some(claim) => {
                match self
                    .backend
                    .get_node(
                        self.graph_id(),
                        &claim.concrete_kind,
                        &claim.node_id,
                        TemporalFilter::include_tombstones(),
                    )
                    .await?
                {
                    Some(tombstone) if tombstone.deleted_at.is_some() => {
                        let row = self.resurrect_node(&tombstone, props).await?;
                        Ok(FoundOrCreated {
                            row,
                            created: false,
                        })
                    }
                    // The claim is stale (owner gone or live under a changed
                    // key): create fresh.
                    _ => self.create_matched_node(request.spec, props).await,
                }
            }
            None => self.create_matched_node(request.spec, props).await,
        }
    }

    /// Bulk find-or-create with input order preserved. Within-batch
    /// duplicates (same match key) resolve to the first occurrence's row;
    /// under `OnConflict::Update` later duplicates apply their updates.
    pub async fn bulk_find_or_create_nodes(
        &self,
        requests: Vec<FindOrCreateNode>,
    ) -> Result<Vec<FoundOrCreated<NodeRow>>> {
        let mut out: Vec<FoundOrCreated<NodeRow>> = Vec::with_capacity(requests.len());
        let mut seen: HashMap<(String, String, String), usize> = HashMap::new();

        for request in requests {
            let registration = self.registry.node_registration(&request.spec.kind)?;
            let props = registration
                .node_type
                .validator
                .validate(&request.spec.props)?;
            let resolved = self
                .registry
                .unique_constraint(&request.spec.kind, &request.match_on)?;
            let key = self.registry.resolve_unique_key(&resolved.constraint, &props)?;
            let dedup_key = (
                resolved.namespace.clone(),
                resolved.constraint.name.clone(),
                key,
            );

            match seen.get(&dedup_key) {
                Some(&index) => {
                    let mut row = out[index].row.clone();
                    if request.on_conflict == OnConflict::Update {
                        row = self
                            .update_node(&row.kind.clone(), &row.id.clone(), props)
                            .await?;
                        out[index].row = row.clone();
                    }
                    out.push(FoundOrCreated {
                        row,
                        created: false,
                    });
                }
                None => {
                    let result = self.find_or_create_node(request).await?;
                    seen.insert(dedup_key, out.len());
                    out.push(result);
                }
            }
        }
        Ok(out)
    }

    /// Find an edge by endpoints (plus optional prop paths) or create it.
    /// Tombstoned matches are resurrected with cardinality re-checked.
    #[instrument(skip(self, request), fields(kind = %request.spec.kind))]
    pub async fn find_or_create_edge(
        &self,
        request: FindOrCreateEdge,
    ) -> Result<FoundOrCreated<EdgeRow>> {
        let registration = self.registry.edge_registration(&request.spec.kind)?;
        let props = match &registration.edge_type.validator {
            Some(validator) => validator.validate(&request.spec.props)?,
            None => AnyProps.validate(&request.spec.props)?,
        };
        for field in &request.match_on {
            paths::segments(field)
                .with_context(|| format!("matchOn field for edge '{}'", request.spec.kind))?;
        }

        let candidates = self
            .backend
            .find_edges_between(
                self.graph_id(),
                &request.spec.kind,
                &request.spec.from.kind,
                &request.spec.from.id,
                &request.spec.to.kind,
                &request.spec.to.id,
                TemporalFilter::include_tombstones(),
            )
            .await?;

        let matches = |candidate: &EdgeRow| {
            request
                .match_on
                .iter()
                .all(|field| paths::get(&candidate.props, field) == paths::get(&props, field))
        };

        if let Some(live) = candidates
            .iter()
            .find(|row| row.deleted_at.is_none() && matches(row))
        {
            let mut row = live.clone();
            if request.on_conflict == OnConflict::Update {
                row = self.update_edge(&row.id.clone(), props).await?;
            }
            return Ok(FoundOrCreated {
                row,
                created: false,
            });
        }

        if let Some(tombstone) = candidates
            .iter()
            .find(|row| row.deleted_at.is_some() && matches(row))
        {
            let row = self
                .resurrect_edge(tombstone, props, registration.cardinality, &request.spec)
                .await?;
            return Ok(FoundOrCreated {
                row,
                created: false,
            });
        }

        let mut spec = request.spec;
        spec.props = props;
        let row = self.create_edge(spec).await?;
        Ok(FoundOrCreated { row, created: true })
    }

    /// Bulk edge find-or-create; same ordering and dedup semantics as the
    /// node variant, keyed by endpoints plus match-on values.
    pub async fn bulk_find_or_create_edges(
        &self,
        requests: Vec<FindOrCreateEdge>,
    ) -> Result<Vec<FoundOrCreated<EdgeRow>>> {
        let mut out: Vec<FoundOrCreated<EdgeRow>> = Vec::with_capacity(requests.len());
        let mut seen: HashMap<String, usize> = HashMap::new();

        for request in requests {
            let registration = self.registry.edge_registration(&request.spec.kind)?;
            let props = match &registration.edge_type.validator {
                Some(validator) => validator.validate(&request.spec.props)?,
                None => AnyProps.validate(&request.spec.props)?,
            };
            let mut dedup_key = format!(
                "{}\u{0001}{}\u{0001}{}\u{0001}{}\u{0001}{}",
                request.spec.kind,
                request.spec.from.kind,
                request.spec.from.id,
                request.spec.to.kind,
                request.spec.to.id,
            );
            for field in &request.match_on {
                let component = paths::get(&props, field)
                    .map(crate::schema_doc::canonical_string)
                    .unwrap_or_default();
                dedup_key.push('\u{0001}');
                dedup_key.push_str(&component);
            }

            match seen.get(&dedup_key) {
                Some(&index) => {
                    let mut row = out[index].row.clone();
                    if request.on_conflict == OnConflict::Update {
                        row = self.update_edge(&row.id.clone(), props).await?;
                        out[index].row = row.clone();
                    }
                    out.push(FoundOrCreated {
                        row,
                        created: false,
                    });
                }
                None => {
                    let result = self.find_or_create_edge(request).await?;
                    seen.insert(dedup_key, out.len());
                    out.push(result);
                }
            }
        }
        Ok(out)
    }

    // --- maintenance ---

    /// Delete every row of this graph in dependency order. Not atomic unless
    /// called inside [`GraphStore::transaction`].
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<()> {
        self.backend.clear_graph(self.graph_id()).await
    }

    /// Run a closure against a transaction-scoped store. Commits on success,
    /// rolls back and rethrows on error.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(GraphStore) -> BoxFuture<'static, Result<T>> + Send,
    {
        if !self.backend.capabilities().transactions {
            bail!(TypeGraphError::configuration(
                "this backend does not support transactions",
            ));
        }
        if self.in_transaction {
            bail!(TypeGraphError::configuration(
                "nested transactions are not supported",
            ));
        }
        let tx = self.backend.begin().await?;
        let tx_backend: Arc<dyn GraphBackend> = tx.clone();
        let store = GraphStore {
            registry: Arc::clone(&self.registry),
            backend: tx_backend,
            config: Arc::clone(&self.config),
            in_transaction: true,
        };
        match f(store).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback().await {
                    warn!(%rollback_error, "rollback failed after transaction error");
                }
                Err(error)
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }

    // --- schema versions ---

    /// Publish the current graph definition as a schema version. When the
    /// active version already carries the same hash this is a no-op;
    /// otherwise the new version becomes active.
    #[instrument(skip(self))]
    pub async fn publish_schema(&self) -> Result<SchemaVersionRow> {
        let doc = build_schema_doc(&self.registry);
        let hash = schema_hash(&doc);
        let active = self.backend.get_active_schema(self.graph_id()).await?;
        if let Some(active) = &active {
            if active.schema_hash == hash {
                debug!(version = active.version, "schema unchanged");
                return Ok(active.clone());
            }
        }
        let version = active.map(|row| row.version + 1).unwrap_or(1);
        // Insert inactive first; the activation flip keeps the at-most-one
        // active row invariant intact under the partial unique index.
        let mut row = SchemaVersionRow {
            graph_id: self.graph_id().to_string(),
            version,
            schema_hash: hash,
            schema_doc: doc,
            created_at: Utc::now(),
            is_active: false,
        };
        self.backend.insert_schema(row.clone()).await?;
        self.backend
            .set_active_schema(self.graph_id(), version)
            .await?;
        row.is_active = true;
        Ok(row)
    }

    pub async fn active_schema(&self) -> Result<Option<SchemaVersionRow>> {
        self.backend.get_active_schema(self.graph_id()).await
    }

    pub async fn schema_version(&self, version: i64) -> Result<Option<SchemaVersionRow>> {
        self.backend
            .get_schema_version(self.graph_id(), version)
            .await
    }

    /// Compare the in-code definition against the persisted active schema.
    /// Returns `Some((active_hash, current_hash))` when they differ.
    pub async fn schema_drift(&self) -> Result<Option<(String, String)>> {
        let current = schema_hash(&build_schema_doc(&self.registry));
        match self.backend.get_active_schema(self.graph_id()).await? {
            Some(active) if active.schema_hash != current => {
                Ok(Some((active.schema_hash, current)))
            }
            _ => Ok(None),
        }
    }

    // --- internals ---

    async fn check_disjointness(&self, kind: &str, id: &str) -> Result<()> {
        for other in self.registry.disjoint_with(kind) {
            let existing = self
                .backend
                .get_node(self.graph_id(), &other, id, TemporalFilter::current())
                .await?;
            if existing.is_some() {
                bail!(TypeGraphError::Disjoint {
                    kind: kind.to_string(),
                    other_kind: other,
                    id: id.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Claim every uniqueness key the node's props resolve to. The backend
    /// upsert is atomic; a returned owner other than this node means a live
    /// conflict.
    async fn claim_unique_keys(&self, kind: &str, id: &str, props: &JsonValue) -> Result<()> {
        for resolved in self.registry.constraints_for_kind(kind)? {
            let key = self.registry.resolve_unique_key(&resolved.constraint, props)?;
            let owner = self
                .backend
                .insert_unique(UniqueRow {
                    graph_id: self.graph_id().to_string(),
                    node_kind: resolved.namespace.clone(),
                    constraint_name: resolved.constraint.name.clone(),
                    key: key.clone(),
                    node_id: id.to_string(),
                    concrete_kind: kind.to_string(),
                    deleted_at: None,
                })
                .await?;
            if owner != id {
                bail!(TypeGraphError::Uniqueness {
                    kind: kind.to_string(),
                    constraint: resolved.constraint.name.clone(),
                    key,
                    owner,
                });
            }
        }
        Ok(())
    }

    /// For every constraint whose key changed, claim the new key first and
    /// then soft-delete the stale row.
    async fn migrate_unique_keys(
        &self,
        kind: &str,
        id: &str,
        old_props: &JsonValue,
        new_props: &JsonValue,
    ) -> Result<()> {
        let now = Utc::now();
        for resolved in self.registry.constraints_for_kind(kind)? {
            let old_key = self
                .registry
                .resolve_unique_key(&resolved.constraint, old_props)
                .ok();
            let new_key = self
                .registry
                .resolve_unique_key(&resolved.constraint, new_props)?;
            if old_key.as_deref() == Some(new_key.as_str()) {
                continue;
            }
            let owner = self
                .backend
                .insert_unique(UniqueRow {
                    graph_id: self.graph_id().to_string(),
                    node_kind: resolved.namespace.clone(),
                    constraint_name: resolved.constraint.name.clone(),
                    key: new_key.clone(),
                    node_id: id.to_string(),
                    concrete_kind: kind.to_string(),
                    deleted_at: None,
                })
                .await?;
            if owner != id {
                bail!(TypeGraphError::Uniqueness {
                    kind: kind.to_string(),
                    constraint: resolved.constraint.name.clone(),
                    key: new_key,
                    owner,
                });
            }
            if let Some(old_key) = old_key {
                self.backend
                    .delete_unique(
                        self.graph_id(),
                        &resolved.namespace,
                        &resolved.constraint.name,
                        &old_key,
                        now,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn soft_delete_edges(&self, edges: &[EdgeRow], now: DateTime<Utc>) -> Result<()> {
        for edge in edges {
            self.backend
                .update_edge(
                    self.graph_id(),
                    &edge.id,
                    EdgePatch {
                        deleted_at: Some(Some(now)),
                        updated_at: Some(now),
                        ..EdgePatch::default()
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn check_endpoint(
        &self,
        edge_kind: &str,
        declared: &[String],
        endpoint: &NodeRef,
        side: &str,
    ) -> Result<()> {
        let allowed = declared.iter().any(|declared_kind| {
            self.registry
                .expand_sub_classes(declared_kind)
                .contains(&endpoint.kind)
        });
        if !allowed {
            bail!(TypeGraphError::Endpoint {
                kind: edge_kind.to_string(),
                reason: format!(
                    "{side} kind '{}' is not among the declared kinds {declared:?}",
                    endpoint.kind
                ),
            });
        }
        let exists = self
            .backend
            .get_node(
                self.graph_id(),
                &endpoint.kind,
                &endpoint.id,
                TemporalFilter::current(),
            )
            .await?;
        if exists.is_none() {
            bail!(TypeGraphError::Endpoint {
                kind: edge_kind.to_string(),
                reason: format!("{side} node {}/{} does not exist", endpoint.kind, endpoint.id),
            });
        }
        Ok(())
    }

    async fn check_cardinality(&self, cardinality: Cardinality, spec: &CreateEdge) -> Result<()> {
        let violated = match cardinality {
            Cardinality::Many => false,
            Cardinality::One => {
                self.backend
                    .count_edges_from(
                        self.graph_id(),
                        &spec.kind,
                        &spec.from.kind,
                        &spec.from.id,
                        false,
                    )
                    .await?
                    > 0
            }
            Cardinality::OneActive => {
                self.backend
                    .count_edges_from(
                        self.graph_id(),
                        &spec.kind,
                        &spec.from.kind,
                        &spec.from.id,
                        true,
                    )
                    .await?
                    > 0
            }
            Cardinality::Unique => {
                self.backend
                    .edge_exists_between(
                        self.graph_id(),
                        &spec.kind,
                        &spec.from.kind,
                        &spec.from.id,
                        &spec.to.kind,
                        &spec.to.id,
                    )
                    .await?
            }
        };
        if violated {
            bail!(TypeGraphError::Cardinality {
                kind: spec.kind.clone(),
                cardinality: cardinality.as_str().to_string(),
                from_kind: spec.from.kind.clone(),
                from_id: spec.from.id.clone(),
            });
        }
        Ok(())
    }

    async fn create_matched_node(
        &self,
        mut spec: CreateNode,
        validated_props: JsonValue,
    ) -> Result<FoundOrCreated<NodeRow>> {
        spec.props = validated_props;
        let row = self.create_node(spec).await?;
        Ok(FoundOrCreated { row, created: true })
    }

    /// Bring a tombstoned node back: re-check disjointness, re-claim every
    /// unique key, apply the new props, bump the version.
    async fn resurrect_node(&self, tombstone: &NodeRow, props: JsonValue) -> Result<NodeRow> {
        self.check_disjointness(&tombstone.kind, &tombstone.id)
            .await?;
        self.claim_unique_keys(&tombstone.kind, &tombstone.id, &props)
            .await?;
        let row = self
            .backend
            .update_node(
                self.graph_id(),
                &tombstone.kind,
                &tombstone.id,
                NodePatch {
                    props: Some(props),
                    bump_version: true,
                    updated_at: Some(Utc::now()),
                    deleted_at: Some(None),
                    ..NodePatch::default()
                },
            )
            .await?
            .ok_or_else(|| TypeGraphError::NodeNotFound {
                kind: tombstone.kind.clone(),
                id: tombstone.id.clone(),
            })?;
        debug!(kind = %row.kind, id = %row.id, "node resurrected");
        Ok(row)
    }

    /// Bring a tombstoned edge back, re-checking cardinality as if it were
    /// being inserted now.
    async fn resurrect_edge(
        &self,
        tombstone: &EdgeRow,
        props: JsonValue,
        cardinality: Cardinality,
        spec: &CreateEdge,
    ) -> Result<EdgeRow> {
        self.check_cardinality(cardinality, spec).await?;
        let row = self
            .backend
            .update_edge(
                self.graph_id(),
                &tombstone.id,
                EdgePatch {
                    props: Some(props),
                    updated_at: Some(Utc::now()),
                    deleted_at: Some(None),
                    ..EdgePatch::default()
                },
            )
            .await?
            .ok_or_else(|| TypeGraphError::EdgeNotFound {
                id: tombstone.id.clone(),
            })?;
        debug!(kind = %row.kind, id = %row.id, "edge resurrected");
        Ok(row)
    }
}
