use crate::db::SqliteDb;
use async_trait::async_trait;
use librarian_error::WrappedSqlxError;

/// A column of some table that holds a foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForeignKeyReference {
    pub table: String,
    pub column: String,
}

impl std::fmt::Display for ForeignKeyReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

/// Discovers which columns of the schema point at a given column.
#[async_trait]
pub trait SchemaIntrospector: Send + Sync {
    async fn references_to(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Vec<ForeignKeyReference>, WrappedSqlxError>;
}

#[async_trait]
impl SchemaIntrospector for SqliteDb {
    /// A foreign key declared without a target column targets the primary
    /// key, and is reported for any `column` asked about.
    async fn references_to(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Vec<ForeignKeyReference>, WrappedSqlxError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT m.name, p."from"
            FROM sqlite_master AS m, pragma_foreign_key_list(m.name) AS p
            WHERE m.type = 'table'
                AND lower(p."table") = lower($1)
                AND (p."to" IS NULL OR lower(p."to") = lower($2))
            ORDER BY m.name, p."from"
            "#,
        )
        .bind(table)
        .bind(column)
        .fetch_all(self.get_conn())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(table, column)| ForeignKeyReference { table, column })
            .collect())
    }
}

/// Quotes an identifier read from the catalog for use in generated SQL.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
