//! Schema catalog built from raw DDL text
//!
//! The catalog is an immutable snapshot of tables/columns/types/constraints,
//! built once per dataset load and shared by reference across sessions.
//! Reloading a dataset produces a new snapshot rather than mutating the old
//! one, so in-flight turns keep a consistent view.

use serde::{Deserialize, Serialize};
use sqlparser::ast::{ColumnOption, ObjectName, Statement, TableConstraint};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("DDL parse error: {0}")]
    Parse(#[from] sqlparser::parser::ParserError),

    #[error("Duplicate table name: {0}")]
    DuplicateTable(String),

    #[error("Duplicate column '{column}' in table '{table}'")]
    DuplicateColumn { table: String, column: String },

    #[error("No CREATE TABLE statements found in DDL")]
    Empty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    pub is_key: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableDef {
    /// Case-insensitive column lookup, returning the catalog-cased definition.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Immutable per-load snapshot of the dataset schema.
///
/// Invariant: table names are unique case-insensitively, and column names
/// are unique case-insensitively within each table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaCatalog {
    tables: Vec<TableDef>,
}

impl SchemaCatalog {
    /// Build a catalog from raw DDL text supplied by the ingestion component.
    ///
    /// Only CREATE TABLE statements contribute to the catalog; other
    /// statements in the DDL (indexes, comments) are ignored.
    pub fn from_ddl(ddl: &str) -> Result<Self, SchemaError> {
        let statements = Parser::parse_sql(&GenericDialect {}, ddl)?;

        let mut tables: Vec<TableDef> = Vec::new();
        for stmt in statements {
            let create = match stmt {
                Statement::CreateTable(create) => create,
                _ => continue,
            };

            let name = object_name_tail(&create.name);
            if tables.iter().any(|t| t.name.eq_ignore_ascii_case(&name)) {
                return Err(SchemaError::DuplicateTable(name));
            }

            // Table-level constraints first, so inline options can add to them.
            let mut key_columns: Vec<String> = Vec::new();
            let mut foreign_keys: Vec<ForeignKey> = Vec::new();
            for constraint in &create.constraints {
                match constraint {
                    TableConstraint::PrimaryKey { columns, .. } => {
                        key_columns.extend(columns.iter().map(|c| c.value.clone()));
                    }
                    TableConstraint::ForeignKey {
                        columns,
                        foreign_table,
                        referred_columns,
                        ..
                    } => {
                        for (col, referred) in columns.iter().zip(referred_columns.iter()) {
                            foreign_keys.push(ForeignKey {
                                column: col.value.clone(),
                                referenced_table: object_name_tail(foreign_table),
                                referenced_column: referred.value.clone(),
                            });
                        }
                    }
                    _ => {}
                }
            }

            let mut columns: Vec<ColumnDef> = Vec::new();
            for col in &create.columns {
                if columns.iter().any(|c| c.name.eq_ignore_ascii_case(&col.name.value)) {
                    return Err(SchemaError::DuplicateColumn {
                        table: name,
                        column: col.name.value.clone(),
                    });
                }

                let mut nullable = true;
                let mut is_key = key_columns
                    .iter()
                    .any(|k| k.eq_ignore_ascii_case(&col.name.value));

                for opt in &col.options {
                    match &opt.option {
                        ColumnOption::NotNull => nullable = false,
                        ColumnOption::Unique { is_primary, .. } if *is_primary => {
                            is_key = true;
                            nullable = false;
                        }
                        ColumnOption::ForeignKey {
                            foreign_table,
                            referred_columns,
                            ..
                        } => {
                            foreign_keys.push(ForeignKey {
                                column: col.name.value.clone(),
                                referenced_table: object_name_tail(foreign_table),
                                referenced_column: referred_columns
                                    .first()
                                    .map(|c| c.value.clone())
                                    .unwrap_or_default(),
                            });
                        }
                        _ => {}
                    }
                }

                columns.push(ColumnDef {
                    name: col.name.value.clone(),
                    sql_type: col.data_type.to_string(),
                    nullable,
                    is_key,
                });
            }

            tables.push(TableDef {
                name,
                columns,
                foreign_keys,
            });
        }

        if tables.is_empty() {
            return Err(SchemaError::Empty);
        }

        tracing::debug!(tables = tables.len(), "schema catalog built from DDL");
        Ok(Self { tables })
    }

    pub fn tables(&self) -> &[TableDef] {
        &self.tables
    }

    /// Case-insensitive table lookup, returning the catalog-cased definition.
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Case-insensitive `table.column` lookup in one step.
    pub fn resolve_column(&self, table: &str, column: &str) -> Option<&ColumnDef> {
        self.table(table)?.column(column)
    }

    /// Condensed schema rendering for prompt context: names, types and key
    /// markers only. Sample rows are deliberately never included here, since
    /// they could carry sensitive values into the model prompt.
    pub fn prompt_summary(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            out.push_str(&format!("Table: {}\n", table.name));
            for col in &table.columns {
                out.push_str(&format!("  - {}: {}", col.name, col.sql_type));
                if !col.nullable {
                    out.push_str(" NOT NULL");
                }
                if col.is_key {
                    out.push_str(" PRIMARY KEY");
                }
                out.push('\n');
            }
            for fk in &table.foreign_keys {
                out.push_str(&format!(
                    "  FK: {} -> {}.{}\n",
                    fk.column, fk.referenced_table, fk.referenced_column
                ));
            }
        }
        out
    }
}

/// Last segment of a possibly-qualified name ("main.users" -> "users").
fn object_name_tail(name: &ObjectName) -> String {
    name.0
        .last()
        .map(|ident| ident.value.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DDL: &str = "
        CREATE TABLE users (
            id INTEGER PRIMARY KEY,
            name VARCHAR(100) NOT NULL,
            email VARCHAR(255),
            city VARCHAR(50)
        );
        CREATE TABLE orders (
            id INTEGER PRIMARY KEY,
            user_id INTEGER NOT NULL REFERENCES users(id),
            total DECIMAL(10,2),
            placed_at TIMESTAMP
        );
    ";

    #[test]
    fn builds_catalog_from_ddl() {
        let catalog = SchemaCatalog::from_ddl(DDL).unwrap();
        assert_eq!(catalog.tables().len(), 2);

        let users = catalog.table("users").unwrap();
        assert_eq!(users.columns.len(), 4);
        assert!(users.column("id").unwrap().is_key);
        assert!(!users.column("name").unwrap().nullable);
        assert!(users.column("email").unwrap().nullable);

        let orders = catalog.table("orders").unwrap();
        assert_eq!(orders.foreign_keys.len(), 1);
        assert_eq!(orders.foreign_keys[0].referenced_table, "users");
        assert_eq!(orders.foreign_keys[0].referenced_column, "id");
    }

    #[test]
    fn lookup_is_case_insensitive_with_catalog_casing() {
        let catalog = SchemaCatalog::from_ddl(DDL).unwrap();
        let table = catalog.table("USERS").unwrap();
        assert_eq!(table.name, "users");
        assert_eq!(table.column("EMAIL").unwrap().name, "email");
    }

    #[test]
    fn duplicate_table_rejected() {
        let ddl = "CREATE TABLE t(a INTEGER); CREATE TABLE T(b INTEGER);";
        assert!(matches!(
            SchemaCatalog::from_ddl(ddl),
            Err(SchemaError::DuplicateTable(_))
        ));
    }

    #[test]
    fn duplicate_column_rejected() {
        let ddl = "CREATE TABLE t(a INTEGER, A VARCHAR);";
        assert!(matches!(
            SchemaCatalog::from_ddl(ddl),
            Err(SchemaError::DuplicateColumn { .. })
        ));
    }

    #[test]
    fn table_level_primary_key_marks_columns() {
        let ddl = "CREATE TABLE pairs(a INTEGER, b INTEGER, PRIMARY KEY (a, b));";
        let catalog = SchemaCatalog::from_ddl(ddl).unwrap();
        let pairs = catalog.table("pairs").unwrap();
        assert!(pairs.column("a").unwrap().is_key);
        assert!(pairs.column("b").unwrap().is_key);
    }

    #[test]
    fn prompt_summary_has_no_sample_rows() {
        let catalog = SchemaCatalog::from_ddl(DDL).unwrap();
        let summary = catalog.prompt_summary();
        assert!(summary.contains("Table: users"));
        assert!(summary.contains("email: VARCHAR(255)"));
        assert!(summary.contains("FK: user_id -> users.id"));
    }

    #[test]
    fn empty_ddl_rejected() {
        assert!(matches!(
            SchemaCatalog::from_ddl("-- nothing here"),
            Err(SchemaError::Empty)
        ));
    }
}
