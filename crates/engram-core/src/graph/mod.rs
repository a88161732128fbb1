//! Associative Graph
//!
//! Nodes and typed weighted edges stored as rows keyed by integer ids.
//! No owning pointers anywhere: callers that walk the graph follow ids
//! and carry their own visited sets. Memory-typed nodes
//! (`memory:<engram_id>`) are created on demand by the Hebbian linker.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::storage::{EngramStore, Result};

// ============================================================================
// WELL-KNOWN TYPES
// ============================================================================

/// Node types the core itself creates. The column is an open string -
/// callers may introduce their own types.
pub mod node_types {
    /// An abstract concept
    pub const CONCEPT: &str = "concept";
    /// A stored engram (name = `memory:<engram_id>`)
    pub const MEMORY: &str = "memory";
    /// A file path
    pub const FILE: &str = "file";
    /// A function or symbol
    pub const FUNCTION: &str = "function";
    /// An external library
    pub const EXTERNAL_LIB: &str = "external_lib";
    /// A claim extracted from content
    pub const CLAIM: &str = "claim";
}

/// Edge types the core itself creates.
pub mod edge_types {
    /// Symmetric association (at most one edge per unordered pair)
    pub const RELATES_TO: &str = "relates_to";
    /// Directed mention
    pub const MENTIONS: &str = "mentions";
    /// Contradiction between claims
    pub const CONTRADICTS: &str = "contradicts";
    /// Non-obvious connection surfaced by deep consolidation
    pub const DEEP_CONNECTION: &str = "deep_connection";
}

/// Node name for an engram's memory node.
pub fn memory_node_name(engram_id: &str) -> String {
    format!("memory:{}", engram_id)
}

// ============================================================================
// MODELS
// ============================================================================

/// A graph node row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    /// Row id
    pub id: i64,
    /// Open-ended node type
    pub node_type: String,
    /// Name, unique per type
    pub name: String,
    /// Property bag
    pub properties: Map<String, Value>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// A directed, typed, weighted edge row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    /// Row id
    pub id: i64,
    /// Source node
    pub source_node_id: i64,
    /// Target node
    pub target_node_id: i64,
    /// Open-ended edge type
    pub edge_type: String,
    /// Weight in [0, 1]
    pub weight: f32,
    /// Property bag (ltp_count, from_success, source provenance)
    pub properties: Map<String, Value>,
    /// Traversal access counter
    pub access_count: i64,
    /// Last traversal access
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Specification for a new edge.
#[derive(Debug, Clone)]
pub struct EdgeSpec {
    /// Source node id
    pub source_node_id: i64,
    /// Target node id
    pub target_node_id: i64,
    /// Edge type
    pub edge_type: String,
    /// Initial weight, clamped to [0, 1]
    pub weight: f32,
    /// Property bag
    pub properties: Map<String, Value>,
}

// ============================================================================
// GRAPH
// ============================================================================

/// Associative graph over the shared row store.
pub struct Graph {
    store: Arc<EngramStore>,
}

impl Graph {
    /// Create over the shared store.
    pub fn new(store: Arc<EngramStore>) -> Self {
        Self { store }
    }

    /// Find a node by `(type, name)`, creating it when absent.
    pub fn find_or_create_node(
        &self,
        node_type: &str,
        name: &str,
        properties: Option<&Map<String, Value>>,
    ) -> Result<GraphNode> {
        if let Some(existing) = self.get_node_by_name(node_type, name)? {
            return Ok(existing);
        }

        let props_json = properties
            .map(|p| Value::Object(p.clone()).to_string())
            .unwrap_or_else(|| "{}".to_string());
        let now = Utc::now();

        // INSERT OR IGNORE + re-select keeps this race-free against a
        // concurrent find_or_create of the same (type, name).
        self.store.write(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO graph_nodes (node_type, name, properties, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![node_type, name, props_json, now],
            )
        })?;

        self.get_node_by_name(node_type, name)?
            .ok_or_else(|| crate::storage::StorageError::NotFound(name.to_string()))
    }

    /// Fetch a node by id.
    pub fn get_node(&self, id: i64) -> Result<Option<GraphNode>> {
        self.store.read(|conn| {
            conn.query_row(
                "SELECT id, node_type, name, properties, created_at
                 FROM graph_nodes WHERE id = ?1",
                [id],
                row_to_node,
            )
            .optional()
        })
    }

    /// Fetch a node by `(type, name)`.
    pub fn get_node_by_name(&self, node_type: &str, name: &str) -> Result<Option<GraphNode>> {
        self.store.read(|conn| {
            conn.query_row(
                "SELECT id, node_type, name, properties, created_at
                 FROM graph_nodes WHERE node_type = ?1 AND name = ?2",
                params![node_type, name],
                row_to_node,
            )
            .optional()
        })
    }

    /// Substring search over node names, optionally restricted to types.
    pub fn search_nodes(
        &self,
        query: &str,
        types: Option<&[&str]>,
        limit: usize,
    ) -> Result<Vec<GraphNode>> {
        let needle = format!("%{}%", query);
        let mut sql = "SELECT id, node_type, name, properties, created_at
             FROM graph_nodes WHERE name LIKE ?"
            .to_string();
        let mut values: Vec<SqlValue> = vec![SqlValue::Text(needle)];
        if let Some(types) = types {
            if !types.is_empty() {
                sql.push_str(&format!(
                    " AND node_type IN ({})",
                    vec!["?"; types.len()].join(",")
                ));
                values.extend(types.iter().map(|t| SqlValue::Text(t.to_string())));
            }
        }
        sql.push_str(" ORDER BY name LIMIT ?");
        values.push(SqlValue::Integer(limit as i64));

        self.store.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), row_to_node)?;
            rows.collect()
        })
    }

    /// All nodes of one type.
    pub fn find_by_type(&self, node_type: &str, limit: usize) -> Result<Vec<GraphNode>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, node_type, name, properties, created_at
                 FROM graph_nodes WHERE node_type = ?1 ORDER BY id LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![node_type, limit as i64], row_to_node)?;
            rows.collect()
        })
    }

    /// Create an edge unconditionally.
    pub fn create_edge(&self, spec: &EdgeSpec) -> Result<GraphEdge> {
        let now = Utc::now();
        let props_json = Value::Object(spec.properties.clone()).to_string();
        let weight = spec.weight.clamp(0.0, 1.0);

        let id = self.store.write(|conn| {
            conn.execute(
                "INSERT INTO graph_edges
                    (source_node_id, target_node_id, edge_type, weight, properties, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    spec.source_node_id,
                    spec.target_node_id,
                    spec.edge_type,
                    weight,
                    props_json,
                    now
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        Ok(GraphEdge {
            id,
            source_node_id: spec.source_node_id,
            target_node_id: spec.target_node_id,
            edge_type: spec.edge_type.clone(),
            weight,
            properties: spec.properties.clone(),
            access_count: 0,
            last_accessed_at: None,
            created_at: now,
        })
    }

    /// Idempotent edge creation: returns the existing edge when one is
    /// already present on `(src, dst, type)` - or on the unordered pair
    /// for the symmetric `relates_to` type.
    pub fn ensure_edge(&self, spec: &EdgeSpec) -> Result<GraphEdge> {
        let symmetric = spec.edge_type == edge_types::RELATES_TO;
        if let Some(existing) = self.find_edge(
            spec.source_node_id,
            spec.target_node_id,
            &spec.edge_type,
            symmetric,
        )? {
            return Ok(existing);
        }
        self.create_edge(spec)
    }

    /// Look up an edge, optionally in either direction.
    pub fn find_edge(
        &self,
        src: i64,
        dst: i64,
        edge_type: &str,
        either_direction: bool,
    ) -> Result<Option<GraphEdge>> {
        let sql = if either_direction {
            "SELECT id, source_node_id, target_node_id, edge_type, weight, properties,
                    access_count, last_accessed_at, created_at
             FROM graph_edges
             WHERE edge_type = ?3
               AND ((source_node_id = ?1 AND target_node_id = ?2)
                 OR (source_node_id = ?2 AND target_node_id = ?1))
             LIMIT 1"
        } else {
            "SELECT id, source_node_id, target_node_id, edge_type, weight, properties,
                    access_count, last_accessed_at, created_at
             FROM graph_edges
             WHERE edge_type = ?3 AND source_node_id = ?1 AND target_node_id = ?2
             LIMIT 1"
        };
        self.store.read(|conn| {
            conn.query_row(sql, params![src, dst, edge_type], row_to_edge)
                .optional()
        })
    }

    /// Update an edge's weight and properties.
    pub fn update_edge(
        &self,
        id: i64,
        weight: f32,
        properties: &Map<String, Value>,
    ) -> Result<()> {
        let props_json = Value::Object(properties.clone()).to_string();
        self.store.write(|conn| {
            conn.execute(
                "UPDATE graph_edges SET weight = ?1, properties = ?2 WHERE id = ?3",
                params![weight.clamp(0.0, 1.0), props_json, id],
            )
        })?;
        Ok(())
    }

    /// Outgoing edges of a node; with `preload` the target nodes come
    /// along.
    pub fn outgoing_edges(
        &self,
        node_id: i64,
        preload: bool,
    ) -> Result<Vec<(GraphEdge, Option<GraphNode>)>> {
        let edges: Vec<GraphEdge> = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, source_node_id, target_node_id, edge_type, weight, properties,
                        access_count, last_accessed_at, created_at
                 FROM graph_edges WHERE source_node_id = ?1 ORDER BY weight DESC",
            )?;
            let rows = stmt.query_map([node_id], row_to_edge)?;
            rows.collect()
        })?;

        let mut result = Vec::with_capacity(edges.len());
        for edge in edges {
            let target = if preload {
                self.get_node(edge.target_node_id)?
            } else {
                None
            };
            result.push((edge, target));
        }
        Ok(result)
    }

    /// Delete never-accessed edges from one provenance source older
    /// than the cutoff. Returns how many went away.
    pub fn delete_stale_edges(&self, source: &str, older_than_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
        let pattern = format!("%\"source\":\"{}\"%", source);
        self.store.write(|conn| {
            conn.execute(
                "DELETE FROM graph_edges
                 WHERE access_count = 0 AND created_at < ?1 AND properties LIKE ?2",
                params![cutoff, pattern],
            )
        })
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<GraphNode> {
    let properties: String = row.get(3)?;
    Ok(GraphNode {
        id: row.get(0)?,
        node_type: row.get(1)?,
        name: row.get(2)?,
        properties: serde_json::from_str(&properties).unwrap_or_default(),
        created_at: row.get(4)?,
    })
}

fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<GraphEdge> {
    let properties: String = row.get(5)?;
    Ok(GraphEdge {
        id: row.get(0)?,
        source_node_id: row.get(1)?,
        target_node_id: row.get(2)?,
        edge_type: row.get(3)?,
        weight: row.get::<_, f64>(4)? as f32,
        properties: serde_json::from_str(&properties).unwrap_or_default(),
        access_count: row.get(6)?,
        last_accessed_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

// ============================================================================
// TESTS
// ============================================================================
