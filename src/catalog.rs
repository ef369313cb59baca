//! Product Catalog
//!
//! Row-level operations on the product table and the chat log, run through a
//! validated [`Cursor`]. Tables:
//! - `{schema}.PRODUCT_EMBEDDINGS (PRODUCT_ID, NAME, DESCRIPTION, VECTOR)`
//! - `{schema}.CHAT_LOG (ID, QUESTION, ANSWER, TIMESTAMP)`
//!
//! The schema is interpolated into statements, so it must be a plain SQL
//! identifier. Every value goes through positional `?` parameters.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::assist::vec_to_blob;
use crate::connection::Cursor;
use crate::engine::{Session, SqlParam};
use crate::error::{DbReachError, Result};

/// One product row (vector omitted)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
}

/// Catalog bound to one schema
#[derive(Debug, Clone)]
pub struct Catalog {
    schema: String,
}

impl Catalog {
    /// Bind to `schema`; rejects anything that is not a plain identifier
    pub fn new(schema: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        if !is_identifier(&schema) {
            return Err(DbReachError::invalid_input(format!(
                "Schema '{schema}' is not a plain SQL identifier"
            )));
        }
        Ok(Self { schema })
    }

    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn products(&self) -> String {
        format!("{}.PRODUCT_EMBEDDINGS", self.schema)
    }

    fn chat_log(&self) -> String {
        format!("{}.CHAT_LOG", self.schema)
    }

    /// Distinct product names
    pub async fn product_names<S: Session>(&self, cursor: &mut Cursor<'_, S>) -> Result<Vec<String>> {
        cursor.execute(&format!("SELECT DISTINCT NAME FROM {}", self.products()), &[]).await?;
        Ok(cursor.fetch_all().iter().filter_map(|row| row.first().and_then(as_text)).collect())
    }

    /// All products ordered by id
    pub async fn list_products<S: Session>(&self, cursor: &mut Cursor<'_, S>) -> Result<Vec<Product>> {
        cursor
            .execute(
                &format!("SELECT PRODUCT_ID, NAME, DESCRIPTION FROM {} ORDER BY PRODUCT_ID", self.products()),
                &[],
            )
            .await?;

        cursor
            .fetch_all()
            .iter()
            .map(|row| {
                let id = row.first().and_then(as_i64).ok_or_else(|| {
                    DbReachError::query_failed("PRODUCT_ID column missing or not an integer")
                })?;
                Ok(Product {
                    id,
                    name: row.get(1).and_then(as_text).unwrap_or_default(),
                    description: row.get(2).and_then(as_text),
                })
            })
            .collect()
    }

    /// Description of the named product, `None` when absent
    pub async fn description_of<S: Session>(&self, cursor: &mut Cursor<'_, S>, name: &str) -> Result<Option<String>> {
        cursor
            .execute(&format!("SELECT DESCRIPTION FROM {} WHERE NAME = ?", self.products()), &[name.into()])
            .await?;
        Ok(cursor.fetch_one().and_then(|row| row.first().and_then(as_text)))
    }

    /// `MAX(PRODUCT_ID) + 1`, or 1 for an empty table
    pub async fn next_product_id<S: Session>(&self, cursor: &mut Cursor<'_, S>) -> Result<i64> {
        cursor.execute(&format!("SELECT MAX(PRODUCT_ID) FROM {}", self.products()), &[]).await?;
        let max = cursor.fetch_one().and_then(|row| row.first().and_then(as_i64)).unwrap_or(0);
        Ok(max + 1)
    }

    /// Insert a product under the next free id and commit; returns the id
    pub async fn insert_product<S: Session>(
        &self,
        cursor: &mut Cursor<'_, S>,
        name: &str,
        description: &str,
        vector: Option<&[f32]>,
    ) -> Result<i64> {
        if name.trim().is_empty() {
            return Err(DbReachError::invalid_input("Product name must not be empty"));
        }

        let id = self.next_product_id(cursor).await?;
        cursor
            .execute(
                &format!(
                    "INSERT INTO {} (PRODUCT_ID, NAME, DESCRIPTION, VECTOR) VALUES (?, ?, ?, ?)",
                    self.products()
                ),
                &[id.into(), name.into(), description.into(), vector.map(vec_to_blob).into()],
            )
            .await?;
        cursor.commit().await?;
        Ok(id)
    }

    /// Replace the description (and vector, when given); returns rows affected
    pub async fn update_description<S: Session>(
        &self,
        cursor: &mut Cursor<'_, S>,
        name: &str,
        description: &str,
        vector: Option<&[f32]>,
    ) -> Result<u64> {
        match vector {
            Some(vector) => {
                cursor
                    .execute(
                        &format!("UPDATE {} SET DESCRIPTION = ?, VECTOR = ? WHERE NAME = ?", self.products()),
                        &[description.into(), vec_to_blob(vector).into(), name.into()],
                    )
                    .await?;
            }
            None => {
                cursor
                    .execute(
                        &format!("UPDATE {} SET DESCRIPTION = ? WHERE NAME = ?", self.products()),
                        &[description.into(), name.into()],
                    )
                    .await?;
            }
        }
        let affected = cursor.rowcount();
        cursor.commit().await?;
        Ok(affected)
    }

    /// Delete by name; returns rows affected
    pub async fn delete_product<S: Session>(&self, cursor: &mut Cursor<'_, S>, name: &str) -> Result<u64> {
        cursor.execute(&format!("DELETE FROM {} WHERE NAME = ?", self.products()), &[name.into()]).await?;
        let affected = cursor.rowcount();
        cursor.commit().await?;
        Ok(affected)
    }

    /// Record a question/answer pair keyed by its UTC `YYYYMMDDHHMMSS` time; returns the id
    pub async fn log_conversation<S: Session>(
        &self,
        cursor: &mut Cursor<'_, S>,
        question: &str,
        answer: &str,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let id = conversation_id(at)?;
        cursor
            .execute(
                &format!("INSERT INTO {} (ID, QUESTION, ANSWER, TIMESTAMP) VALUES (?, ?, ?, ?)", self.chat_log()),
                &[id.into(), question.into(), answer.into(), SqlParam::Timestamp(at.naive_utc())],
            )
            .await?;
        cursor.commit().await?;
        Ok(id)
    }
}

fn conversation_id(at: DateTime<Utc>) -> Result<i64> {
    at.format("%Y%m%d%H%M%S")
        .to_string()
        .parse()
        .map_err(|e| DbReachError::invalid_input(format!("Could not derive chat log id: {e}")))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 128
}

/// Integer from a decoded column (numeric or numeric string)
fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_schema_must_be_identifier() {
        assert!(Catalog::new("SMART_RETAIL1").is_ok());
        assert!(Catalog::new("_private").is_ok());
        assert!(Catalog::new("1abc").is_err());
        assert!(Catalog::new("a.b").is_err());
        assert!(Catalog::new("x; DROP TABLE y").is_err());
        assert!(Catalog::new("").is_err());
    }

    #[test]
    fn test_conversation_id_is_utc_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(conversation_id(at).unwrap(), 20_240_309_070_501);
    }

    #[test]
    fn test_value_extraction() {
        assert_eq!(as_i64(&json!(7)), Some(7));
        assert_eq!(as_i64(&json!("12")), Some(12));
        assert_eq!(as_i64(&json!(null)), None);
        assert_eq!(as_text(&json!(null)), None);
        assert_eq!(as_text(&json!("Lamp")), Some("Lamp".to_string()));
    }
}
