use serde::{Deserialize, Serialize};

use crate::types::{ColumnId, IndexId, PartitionId, SchemaId, TableId};

/// Visibility phase of a schema object that is being changed.
///
/// An object moves through these phases one step at a time so that every
/// node, whatever schema version it has loaded, sees an object state that is
/// compatible with the states its neighbours may have loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SchemaState {
    /// Not present (or fully removed).
    #[default]
    None,
    /// Only deletes are applied to the object.
    DeleteOnly,
    /// Deletes and writes are applied; reads ignore the object.
    WriteOnly,
    /// Writes are applied and existing data is being migrated.
    WriteReorganization,
    /// Object is leaving: data is being cleaned up.
    DeleteReorganization,
    /// Partition data exists but waits for replicas to become ready.
    ReplicaOnly,
    /// Fully visible.
    Public,
}

impl SchemaState {
    /// Visibility rank: how much of the object the executor exposes.
    /// Rolling back must never increase the rank.
    pub fn visibility_rank(self) -> u8 {
        match self {
            SchemaState::None => 0,
            SchemaState::DeleteOnly | SchemaState::DeleteReorganization => 1,
            SchemaState::WriteOnly | SchemaState::ReplicaOnly => 2,
            SchemaState::WriteReorganization => 3,
            SchemaState::Public => 4,
        }
    }
}

impl std::fmt::Display for SchemaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaState::None => write!(f, "none"),
            SchemaState::DeleteOnly => write!(f, "delete only"),
            SchemaState::WriteOnly => write!(f, "write only"),
            SchemaState::WriteReorganization => write!(f, "write reorganization"),
            SchemaState::DeleteReorganization => write!(f, "delete reorganization"),
            SchemaState::ReplicaOnly => write!(f, "replica only"),
            SchemaState::Public => write!(f, "public"),
        }
    }
}

/// Column definition in a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub id: ColumnId,
    pub name: String,
    /// SQL type text, e.g. `bigint` or `varchar(64)`.
    pub data_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub state: SchemaState,
    /// Set while a NULL → NOT NULL change is validating existing rows; the
    /// executor rejects new NULL writes while it is set.
    #[serde(default)]
    pub prevent_null_insert: bool,
    /// Name of the column this hidden column will replace (data-changing
    /// MODIFY COLUMN only).
    #[serde(default)]
    pub changing_of: Option<String>,
}

impl ColumnInfo {
    pub fn new(id: ColumnId, name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default_value: None,
            state: SchemaState::None,
            prevent_null_insert: false,
            changing_of: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_state(mut self, state: SchemaState) -> Self {
        self.state = state;
        self
    }
}

/// Secondary or primary index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub id: IndexId,
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub primary: bool,
    #[serde(default)]
    pub invisible: bool,
    #[serde(default)]
    pub state: SchemaState,
}

/// CHECK constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintInfo {
    pub id: u64,
    pub name: String,
    /// Raw SQL expression text.
    pub expr: String,
    pub enforced: bool,
    #[serde(default)]
    pub state: SchemaState,
}

/// FOREIGN KEY constraint referencing another table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub id: u64,
    pub name: String,
    pub columns: Vec<String>,
    pub ref_table: String,
    pub ref_columns: Vec<String>,
    #[serde(default)]
    pub state: SchemaState,
}

/// One range partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionDef {
    pub id: PartitionId,
    pub name: String,
    /// Upper bound expression (`VALUES LESS THAN`).
    pub less_than: String,
}

/// Partitioning of a table. Definitions being added or dropped by an
/// in-flight job are tracked separately from the public ones.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub definitions: Vec<PartitionDef>,
    #[serde(default)]
    pub adding_definitions: Vec<PartitionDef>,
    #[serde(default)]
    pub dropping_definitions: Vec<PartitionDef>,
}

impl PartitionInfo {
    pub fn find(&self, name: &str) -> Option<&PartitionDef> {
        self.definitions
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
    }

    pub fn ids(&self) -> Vec<PartitionId> {
        self.definitions.iter().map(|d| d.id).collect()
    }
}

/// Table metadata as persisted in the metadata store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: TableId,
    pub schema_id: SchemaId,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub indices: Vec<IndexInfo>,
    #[serde(default)]
    pub constraints: Vec<ConstraintInfo>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyInfo>,
    #[serde(default)]
    pub partition: Option<PartitionInfo>,
    #[serde(default)]
    pub charset: String,
    #[serde(default)]
    pub collate: String,
    #[serde(default)]
    pub auto_inc_base: i64,
    #[serde(default)]
    pub auto_id_cache: u64,
    #[serde(default)]
    pub shard_row_id_bits: u64,
    #[serde(default)]
    pub state: SchemaState,
}

impl TableInfo {
    pub fn new(id: TableId, schema_id: SchemaId, name: impl Into<String>) -> Self {
        Self {
            id,
            schema_id,
            name: name.into(),
            columns: Vec::new(),
            indices: Vec::new(),
            constraints: Vec::new(),
            foreign_keys: Vec::new(),
            partition: None,
            charset: "utf8mb4".into(),
            collate: "utf8mb4_bin".into(),
            auto_inc_base: 0,
            auto_id_cache: 0,
            shard_row_id_bits: 0,
            state: SchemaState::None,
        }
    }

    /// Find column index by name (case-insensitive).
    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.find_column(name).map(|i| &self.columns[i])
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut ColumnInfo> {
        let idx = self.find_column(name)?;
        Some(&mut self.columns[idx])
    }

    /// The hidden column replacing `name` during a data-changing MODIFY COLUMN.
    pub fn changing_column_of(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| {
            c.changing_of
                .as_deref()
                .is_some_and(|of| of.eq_ignore_ascii_case(name))
        })
    }

    pub fn remove_column(&mut self, name: &str) -> Option<ColumnInfo> {
        let idx = self.find_column(name)?;
        Some(self.columns.remove(idx))
    }

    pub fn find_index(&self, name: &str) -> Option<usize> {
        self.indices
            .iter()
            .position(|i| i.name.eq_ignore_ascii_case(name))
    }

    pub fn index(&self, name: &str) -> Option<&IndexInfo> {
        self.find_index(name).map(|i| &self.indices[i])
    }

    pub fn index_mut(&mut self, name: &str) -> Option<&mut IndexInfo> {
        let idx = self.find_index(name)?;
        Some(&mut self.indices[idx])
    }

    pub fn primary_index(&self) -> Option<&IndexInfo> {
        self.indices.iter().find(|i| i.primary)
    }

    pub fn remove_index(&mut self, name: &str) -> Option<IndexInfo> {
        let idx = self.find_index(name)?;
        Some(self.indices.remove(idx))
    }

    /// Indexes whose only key column is `column`; they go away together with
    /// the column.
    pub fn single_column_indices(&self, column: &str) -> Vec<String> {
        self.indices
            .iter()
            .filter(|i| i.columns.len() == 1 && i.columns[0].eq_ignore_ascii_case(column))
            .map(|i| i.name.clone())
            .collect()
    }

    pub fn constraint(&self, name: &str) -> Option<&ConstraintInfo> {
        self.constraints
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn constraint_mut(&mut self, name: &str) -> Option<&mut ConstraintInfo> {
        self.constraints
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn remove_constraint(&mut self, name: &str) -> Option<ConstraintInfo> {
        let idx = self
            .constraints
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))?;
        Some(self.constraints.remove(idx))
    }

    pub fn foreign_key(&self, name: &str) -> Option<&ForeignKeyInfo> {
        self.foreign_keys
            .iter()
            .find(|fk| fk.name.eq_ignore_ascii_case(name))
    }

    /// Columns visible to ordinary statements.
    pub fn public_columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns
            .iter()
            .filter(|c| c.state == SchemaState::Public)
    }

    /// Physical ids owned by this table: its own id, or one per partition.
    pub fn physical_ids(&self) -> Vec<u64> {
        match &self.partition {
            Some(p) if !p.definitions.is_empty() => p.definitions.iter().map(|d| d.id.0).collect(),
            _ => vec![self.id.0],
        }
    }
}

/// Database metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub id: SchemaId,
    pub name: String,
    #[serde(default)]
    pub charset: String,
    #[serde(default)]
    pub collate: String,
    #[serde(default)]
    pub state: SchemaState,
}

impl DatabaseInfo {
    pub fn new(id: SchemaId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            charset: "utf8mb4".into(),
            collate: "utf8mb4_bin".into(),
            state: SchemaState::Public,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableInfo {
        let mut t = TableInfo::new(TableId(10), SchemaId(1), "users");
        t.columns.push(ColumnInfo::new(ColumnId(11), "id", "bigint").not_null().with_state(SchemaState::Public));
        t.columns.push(ColumnInfo::new(ColumnId(12), "Email", "varchar(64)").with_state(SchemaState::Public));
        t.indices.push(IndexInfo {
            id: IndexId(13),
            name: "idx_email".into(),
            columns: vec!["email".into()],
            unique: true,
            primary: false,
            invisible: false,
            state: SchemaState::Public,
        });
        t
    }

    #[test]
    fn test_find_column_case_insensitive() {
        let t = table();
        assert_eq!(t.find_column("email"), Some(1));
        assert_eq!(t.find_column("EMAIL"), Some(1));
        assert!(t.find_column("missing").is_none());
    }

    #[test]
    fn test_single_column_indices() {
        let t = table();
        assert_eq!(t.single_column_indices("email"), vec!["idx_email".to_string()]);
        assert!(t.single_column_indices("id").is_empty());
    }

    #[test]
    fn test_visibility_rank_ordering() {
        assert!(SchemaState::Public.visibility_rank() > SchemaState::WriteReorganization.visibility_rank());
        assert!(SchemaState::WriteOnly.visibility_rank() > SchemaState::DeleteOnly.visibility_rank());
        assert_eq!(
            SchemaState::DeleteOnly.visibility_rank(),
            SchemaState::DeleteReorganization.visibility_rank()
        );
        assert_eq!(SchemaState::None.visibility_rank(), 0);
    }

    #[test]
    fn test_physical_ids_fall_back_to_table_id() {
        let mut t = table();
        assert_eq!(t.physical_ids(), vec![10]);
        t.partition = Some(PartitionInfo {
            definitions: vec![
                PartitionDef { id: PartitionId(20), name: "p0".into(), less_than: "100".into() },
                PartitionDef { id: PartitionId(21), name: "p1".into(), less_than: "MAXVALUE".into() },
            ],
            ..Default::default()
        });
        assert_eq!(t.physical_ids(), vec![20, 21]);
    }
}
