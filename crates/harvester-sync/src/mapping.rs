//! Identifier correspondence between the source and destination systems.
//!
//! Rows are `(source_prefix, entity_kind, source_perm_id, destination_perm_id)`.
//! Earlier runs populate the table; this engine only reads it, once per run.

use crate::error::MappingError;
use harvester_manifest::EntityKind;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;

/// source permId → destination permId
pub type PermIdMap = HashMap<String, String>;

pub trait IdentifierMapper: Send + Sync {
    fn mappings(&self, source_prefix: &str, kind: EntityKind) -> Result<PermIdMap, MappingError>;
}

/// A loaded mapping for one entity kind. Unmapped ids resolve to themselves.
#[derive(Debug, Clone, Default)]
pub struct PermIdMapping {
    map: PermIdMap,
}

impl PermIdMapping {
    pub fn new(map: PermIdMap) -> Self {
        Self { map }
    }

    pub fn load(
        mapper: &dyn IdentifierMapper,
        source_prefix: &str,
        kind: EntityKind,
    ) -> Result<Self, MappingError> {
        Ok(Self::new(mapper.mappings(source_prefix, kind)?))
    }

    pub fn resolve<'a>(&'a self, source_perm_id: &'a str) -> &'a str {
        self.map
            .get(source_perm_id)
            .map(String::as_str)
            .unwrap_or(source_perm_id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// ============================================================================
// SQLite
// ============================================================================

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS synced_entities (
    source_prefix       TEXT NOT NULL,
    entity_kind         TEXT NOT NULL,
    source_perm_id      TEXT NOT NULL,
    destination_perm_id TEXT NOT NULL,
    PRIMARY KEY (source_prefix, entity_kind, source_perm_id)
)";

pub struct SqliteIdentifierMapper {
    conn: Mutex<Connection>,
}

impl SqliteIdentifierMapper {
    /// Opens (and if needed creates) the mapping table.
    pub fn open(path: &Path) -> Result<Self, MappingError> {
        let conn = Connection::open(path).map_err(|source| MappingError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_connection(conn)
    }

    pub fn from_connection(conn: Connection) -> Result<Self, MappingError> {
        conn.execute_batch(CREATE_TABLE)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl IdentifierMapper for SqliteIdentifierMapper {
    fn mappings(&self, source_prefix: &str, kind: EntityKind) -> Result<PermIdMap, MappingError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT source_perm_id, destination_perm_id FROM synced_entities
             WHERE source_prefix = ?1 AND entity_kind = ?2",
        )?;
        let rows = stmt.query_map(params![source_prefix, kind.label()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = PermIdMap::new();
        for row in rows {
            let (source, destination) = row?;
            out.insert(source, destination);
        }
        tracing::debug!(prefix = source_prefix, kind = %kind, rows = out.len(), "loaded identifier mappings");
        Ok(out)
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct StaticIdentifierMapper {
    rows: HashMap<(String, EntityKind), PermIdMap>,
}

impl StaticIdentifierMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mapping(
        mut self,
        source_prefix: &str,
        kind: EntityKind,
        source_perm_id: &str,
        destination_perm_id: &str,
    ) -> Self {
        self.rows
            .entry((source_prefix.to_string(), kind))
            .or_default()
            .insert(source_perm_id.to_string(), destination_perm_id.to_string());
        self
    }
}

impl IdentifierMapper for StaticIdentifierMapper {
    fn mappings(&self, source_prefix: &str, kind: EntityKind) -> Result<PermIdMap, MappingError> {
        Ok(self
            .rows
            .get(&(source_prefix.to_string(), kind))
            .cloned()
            .unwrap_or_default())
    }
}

/// No rows at all: every permId maps to itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapper;

impl IdentifierMapper for IdentityMapper {
    fn mappings(&self, _source_prefix: &str, _kind: EntityKind) -> Result<PermIdMap, MappingError> {
        Ok(PermIdMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_mapper_scopes_by_prefix_and_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.sqlite");
        let mapper = SqliteIdentifierMapper::open(&path).unwrap();

        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(
                "INSERT INTO synced_entities VALUES (?1, ?2, ?3, ?4)",
                params!["SRC", "EXPERIMENT", "src-1", "dst-1"],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO synced_entities VALUES (?1, ?2, ?3, ?4)",
                params!["SRC", "SAMPLE", "src-2", "dst-2"],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO synced_entities VALUES (?1, ?2, ?3, ?4)",
                params!["OTHER", "EXPERIMENT", "src-3", "dst-3"],
            )
            .unwrap();
        }

        let rows = mapper.mappings("SRC", EntityKind::Experiment).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows["src-1"], "dst-1");
    }

    #[test]
    fn unmapped_ids_resolve_to_themselves() {
        let mapper = StaticIdentifierMapper::new().with_mapping(
            "SRC",
            EntityKind::Experiment,
            "src-1",
            "dst-1",
        );
        let mapping = PermIdMapping::load(&mapper, "SRC", EntityKind::Experiment).unwrap();
        assert_eq!(mapping.resolve("src-1"), "dst-1");
        assert_eq!(mapping.resolve("src-9"), "src-9");

        let identity = PermIdMapping::load(&IdentityMapper, "SRC", EntityKind::Experiment).unwrap();
        assert!(identity.is_empty());
        assert_eq!(identity.resolve("src-1"), "src-1");
    }
}
