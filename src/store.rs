//! pgvector-backed GraphRAG storage.
//!
//! Entities, relationships, communities, and conversation messages live in
//! Postgres; embeddings are pgvector columns written as vector literals and
//! searched with cosine distance. Methods take any [`PgExecutor`] so memory
//! extraction can compose several calls into one acquired connection and an
//! explicit transaction.

use serde_json::{Value, json};
use sqlx::Row;
use sqlx::postgres::{PgExecutor, PgPool, PgPoolOptions};
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::Result;

/// Tables exported to CSV at shutdown, in dependency order.
pub const EXPORT_TABLES: [&str; 5] = [
    "entities",
    "relationships",
    "communities",
    "community_members",
    "conversation_messages",
];

/// Create the connection pool from the database settings.
///
/// # Errors
///
/// Returns an error if the database is unreachable.
pub async fn init_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .min_connections(config.db_pool_min)
        .max_connections(config.db_pool_max)
        .connect(&config.database_url)
        .await?;
    info!(
        min = config.db_pool_min,
        max = config.db_pool_max,
        "DB pool created"
    );
    Ok(pool)
}

/// Format an embedding as a pgvector literal (`[v1,v2,...]`) for a
/// `$n::vector` cast.
pub fn vector_literal(embedding: &[f32]) -> String {
    let mut out = String::with_capacity(embedding.len() * 10 + 2);
    out.push('[');
    for (i, v) in embedding.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&v.to_string());
    }
    out.push(']');
    out
}

/// Idempotent schema, applied at startup.
const SCHEMA_SQL: &str = r"
CREATE EXTENSION IF NOT EXISTS vector;

CREATE TABLE IF NOT EXISTS entities (
    id              uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    namespace       text NOT NULL DEFAULT 'default',
    name            text NOT NULL,
    entity_type     text NOT NULL,
    description     text NOT NULL DEFAULT '',
    name_embedding  vector(1024),
    mention_count   integer NOT NULL DEFAULT 1,
    updated_at      timestamptz NOT NULL DEFAULT now(),
    UNIQUE (namespace, name)
);

CREATE TABLE IF NOT EXISTS relationships (
    id              uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    source_id       uuid NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    target_id       uuid NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    relation_type   text NOT NULL,
    description     text NOT NULL DEFAULT '',
    weight          double precision NOT NULL DEFAULT 1.0,
    updated_at      timestamptz NOT NULL DEFAULT now(),
    UNIQUE (source_id, target_id, relation_type)
);
CREATE INDEX IF NOT EXISTS relationships_source_idx ON relationships (source_id);
CREATE INDEX IF NOT EXISTS relationships_target_idx ON relationships (target_id);

CREATE TABLE IF NOT EXISTS communities (
    id                uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    level             integer NOT NULL DEFAULT 0,
    summary           text NOT NULL,
    summary_embedding vector(1024),
    entity_count      integer NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS community_members (
    community_id  uuid NOT NULL REFERENCES communities(id) ON DELETE CASCADE,
    entity_id     uuid NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    PRIMARY KEY (community_id, entity_id)
);

CREATE TABLE IF NOT EXISTS conversation_messages (
    id                uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    conversation_id   uuid NOT NULL,
    role              text NOT NULL,
    content           text NOT NULL,
    content_embedding vector(1024),
    created_at        timestamptz NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS entities_embedding_idx
    ON entities USING hnsw (name_embedding vector_cosine_ops);
CREATE INDEX IF NOT EXISTS communities_embedding_idx
    ON communities USING hnsw (summary_embedding vector_cosine_ops);
";

/// A community to be written by [`GraphStore::rebuild_communities`].
#[derive(Debug, Clone)]
pub struct CommunityRecord {
    pub summary: String,
    pub summary_embedding: Vec<f32>,
    pub entity_ids: Vec<Uuid>,
}

/// An entity row used by community detection.
#[derive(Debug, Clone)]
pub struct EntityNode {
    pub id: Uuid,
    pub name: String,
    pub entity_type: String,
    pub description: String,
}

/// A relationship edge used by community detection.
#[derive(Debug, Clone)]
pub struct RelationshipEdge {
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub weight: f64,
}

/// pgvector-backed GraphRAG store.
#[derive(Debug, Clone)]
pub struct GraphStore {
    pool: PgPool,
}

impl GraphStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the schema (idempotent).
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA_SQL.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Insert or update an entity, returning its id.
    ///
    /// On conflict with `(namespace, name)`: `mention_count` is incremented,
    /// `updated_at` refreshed, the embedding replaced only when one is
    /// provided, and the description merged — an empty existing description
    /// takes the new one, a new description already contained in the existing
    /// one is a no-op, otherwise the new text is appended on a fresh line and
    /// the result truncated to 500 characters.
    pub async fn upsert_entity<'e, E: PgExecutor<'e>>(
        &self,
        exec: E,
        name: &str,
        entity_type: &str,
        description: &str,
        embedding: Option<&[f32]>,
        namespace: &str,
    ) -> Result<Uuid> {
        let row = sqlx::query(
            r"INSERT INTO entities (namespace, name, entity_type, description, name_embedding)
              VALUES ($1, $2, $3, $4, $5::vector)
              ON CONFLICT (namespace, name)
              DO UPDATE SET
                  description = CASE
                      WHEN entities.description = '' THEN EXCLUDED.description
                      WHEN position(EXCLUDED.description IN entities.description) > 0
                          THEN entities.description
                      ELSE left(entities.description || E'\n' || EXCLUDED.description, 500)
                  END,
                  mention_count = entities.mention_count + 1,
                  name_embedding = COALESCE(EXCLUDED.name_embedding, entities.name_embedding),
                  updated_at = now()
              RETURNING id",
        )
        .bind(namespace)
        .bind(name)
        .bind(entity_type)
        .bind(description)
        .bind(embedding.map(vector_literal))
        .fetch_one(exec)
        .await?;
        Ok(row.get("id"))
    }

    /// Insert or update a relationship, returning its id. On conflict with
    /// `(source_id, target_id, relation_type)` the description and weight
    /// are overwritten.
    pub async fn upsert_relationship<'e, E: PgExecutor<'e>>(
        &self,
        exec: E,
        source_id: Uuid,
        target_id: Uuid,
        relation_type: &str,
        description: &str,
        weight: f64,
    ) -> Result<Uuid> {
        let row = sqlx::query(
            r"INSERT INTO relationships (source_id, target_id, relation_type, description, weight)
              VALUES ($1, $2, $3, $4, $5)
              ON CONFLICT (source_id, target_id, relation_type)
              DO UPDATE SET description = EXCLUDED.description,
                            weight = EXCLUDED.weight,
                            updated_at = now()
              RETURNING id",
        )
        .bind(source_id)
        .bind(target_id)
        .bind(relation_type)
        .bind(description)
        .bind(weight)
        .fetch_one(exec)
        .await?;
        Ok(row.get("id"))
    }

    /// Look up an entity id by name within a namespace.
    pub async fn get_entity_id_by_name<'e, E: PgExecutor<'e>>(
        &self,
        exec: E,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Uuid>> {
        let row = sqlx::query("SELECT id FROM entities WHERE namespace = $1 AND name = $2")
            .bind(namespace)
            .bind(name)
            .fetch_optional(exec)
            .await?;
        Ok(row.map(|r| r.get("id")))
    }

    /// All entity names within a namespace.
    pub async fn get_entity_names(&self, namespace: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM entities WHERE namespace = $1 ORDER BY name")
            .bind(namespace)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("name")).collect())
    }

    /// Total entity count.
    pub async fn get_entity_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT count(*) AS cnt FROM entities")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("cnt"))
    }

    /// Cosine-similarity entity search. Entities with a NULL embedding are
    /// skipped; results carry `similarity = 1 - cos_distance`, descending.
    pub async fn search_entities_semantic(
        &self,
        query_embedding: &[f32],
        top_k: i64,
    ) -> Result<Vec<Value>> {
        let literal = vector_literal(query_embedding);
        let rows = sqlx::query(
            r"SELECT id, name, entity_type, description, mention_count,
                     1 - (name_embedding <=> $1::vector) AS similarity
              FROM entities WHERE name_embedding IS NOT NULL
              ORDER BY name_embedding <=> $1::vector LIMIT $2",
        )
        .bind(&literal)
        .bind(top_k)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                json!({
                    "id": r.get::<Uuid, _>("id"),
                    "name": r.get::<String, _>("name"),
                    "entity_type": r.get::<String, _>("entity_type"),
                    "description": r.get::<String, _>("description"),
                    "mention_count": r.get::<i32, _>("mention_count"),
                    "similarity": r.get::<f64, _>("similarity"),
                })
            })
            .collect())
    }

    /// Depth-1 neighbors of an entity: the other endpoint of every touching
    /// relationship, with the relationship's type and description, ordered by
    /// weight descending.
    pub async fn get_entity_neighbors(&self, entity_id: Uuid) -> Result<Vec<Value>> {
        let rows = sqlx::query(
            r"SELECT e.id, e.name, e.entity_type, e.description,
                     r.relation_type, r.description AS rel_description, r.weight
              FROM relationships r
              JOIN entities e
                ON e.id = CASE WHEN r.source_id = $1 THEN r.target_id ELSE r.source_id END
              WHERE r.source_id = $1 OR r.target_id = $1
              ORDER BY r.weight DESC",
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                json!({
                    "id": r.get::<Uuid, _>("id"),
                    "name": r.get::<String, _>("name"),
                    "entity_type": r.get::<String, _>("entity_type"),
                    "description": r.get::<String, _>("description"),
                    "relation_type": r.get::<String, _>("relation_type"),
                    "rel_description": r.get::<String, _>("rel_description"),
                })
            })
            .collect())
    }

    /// Cosine-similarity community search, mirroring
    /// [`search_entities_semantic`](Self::search_entities_semantic).
    pub async fn search_communities(
        &self,
        query_embedding: &[f32],
        top_k: i64,
    ) -> Result<Vec<Value>> {
        let literal = vector_literal(query_embedding);
        let rows = sqlx::query(
            r"SELECT id, level, summary, entity_count,
                     1 - (summary_embedding <=> $1::vector) AS similarity
              FROM communities WHERE summary_embedding IS NOT NULL
              ORDER BY summary_embedding <=> $1::vector LIMIT $2",
        )
        .bind(&literal)
        .bind(top_k)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                json!({
                    "id": r.get::<Uuid, _>("id"),
                    "level": r.get::<i32, _>("level"),
                    "summary": r.get::<String, _>("summary"),
                    "entity_count": r.get::<i32, _>("entity_count"),
                    "similarity": r.get::<f64, _>("similarity"),
                })
            })
            .collect())
    }

    /// Replace all stored communities with `communities`, atomically
    /// (delete-then-insert in one transaction). An empty list clears
    /// stale data.
    pub async fn rebuild_communities(&self, communities: &[CommunityRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM communities").execute(&mut *tx).await?;
        for community in communities {
            let row = sqlx::query(
                r"INSERT INTO communities (level, summary, summary_embedding, entity_count)
                  VALUES (0, $1, $2::vector, $3) RETURNING id",
            )
            .bind(&community.summary)
            .bind(vector_literal(&community.summary_embedding))
            .bind(community.entity_ids.len() as i32)
            .fetch_one(&mut *tx)
            .await?;
            let community_id: Uuid = row.get("id");
            for entity_id in &community.entity_ids {
                sqlx::query(
                    r"INSERT INTO community_members (community_id, entity_id)
                      VALUES ($1, $2) ON CONFLICT DO NOTHING",
                )
                .bind(community_id)
                .bind(entity_id)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Persist one conversation message.
    pub async fn save_message(
        &self,
        conversation_id: Uuid,
        role: &str,
        content: &str,
        embedding: Option<&[f32]>,
    ) -> Result<Uuid> {
        let row = sqlx::query(
            r"INSERT INTO conversation_messages (conversation_id, role, content, content_embedding)
              VALUES ($1, $2, $3, $4::vector) RETURNING id",
        )
        .bind(conversation_id)
        .bind(role)
        .bind(content)
        .bind(embedding.map(vector_literal))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    /// Load all entities and relationships for community detection.
    pub async fn load_graph(&self) -> Result<(Vec<EntityNode>, Vec<RelationshipEdge>)> {
        let entity_rows =
            sqlx::query("SELECT id, name, entity_type, description FROM entities")
                .fetch_all(&self.pool)
                .await?;
        let entities = entity_rows
            .into_iter()
            .map(|r| EntityNode {
                id: r.get("id"),
                name: r.get("name"),
                entity_type: r.get("entity_type"),
                description: r.get("description"),
            })
            .collect();

        let rel_rows = sqlx::query("SELECT source_id, target_id, weight FROM relationships")
            .fetch_all(&self.pool)
            .await?;
        let relationships = rel_rows
            .into_iter()
            .map(|r| RelationshipEdge {
                source_id: r.get("source_id"),
                target_id: r.get("target_id"),
                weight: r.get("weight"),
            })
            .collect();

        Ok((entities, relationships))
    }

    /// Export every table to `{dir}/{table}.csv`. Each table is exported
    /// independently; one failure does not block the others.
    pub async fn export_tables(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        for table in EXPORT_TABLES {
            match self.export_table(table, &dir.join(format!("{table}.csv"))).await {
                Ok(rows) => info!(table, rows, "exported"),
                Err(e) => warn!(table, "export failed: {e}"),
            }
        }
        Ok(())
    }

    async fn export_table(&self, table: &str, dest: &Path) -> Result<usize> {
        // Cast the whole row to json so vector columns export as their text
        // representation without per-table column knowledge.
        let rows = sqlx::query(&format!(
            "SELECT row_to_json(t)::text AS row FROM {table} t"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut header: Vec<String> = Vec::new();
        let mut lines: Vec<String> = Vec::new();
        for row in &rows {
            let raw: String = row.get("row");
            let value: Value = serde_json::from_str(&raw)?;
            let Value::Object(map) = value else { continue };
            if header.is_empty() {
                header = map.keys().cloned().collect();
            }
            let fields: Vec<String> = header
                .iter()
                .map(|key| csv_field(map.get(key).unwrap_or(&Value::Null)))
                .collect();
            lines.push(fields.join(","));
        }

        let mut out = String::new();
        out.push_str(&header.join(","));
        out.push('\n');
        for line in lines {
            out.push_str(&line);
            out.push('\n');
        }
        std::fs::write(dest, out)?;
        Ok(rows.len())
    }
}

/// Quote one CSV field (RFC 4180 style).
fn csv_field(value: &Value) -> String {
    let raw = match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if raw.contains(['"', ',', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw
    }
}
