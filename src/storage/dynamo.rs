//! DynamoDB-backed column store.
//!
//! Table layout (one table per column family):
//!
//! ```text
//! row_key          S  partition key
//! column_name      S  sort key
//! value            B
//! write_timestamp  N  client timestamp, orders conflicting writes
//! expires_at       N  epoch millis, absent for columns without TTL
//! deleted          BOOL  tombstone marker
//! ttl              N  epoch seconds, DynamoDB TTL attribute for reaping
//! ```
//!
//! DynamoDB removes expired items lazily, so liveness is always decided from
//! `expires_at` on read rather than from the item being present.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use rusoto_core::RusotoError;
use rusoto_dynamodb::{
    AttributeValue, DynamoDb, DynamoDbClient, GetItemError, GetItemInput, PutItemError, PutItemInput,
    QueryError, QueryInput,
};
use tracing::debug;

use super::{Column, ColumnStore, TOMBSTONE_RETENTION};
use crate::util::exception::{Exception, LockResult};

const ROW_KEY: &str = "row_key";
const COLUMN_NAME: &str = "column_name";
const VALUE: &str = "value";
const WRITE_TIMESTAMP: &str = "write_timestamp";
const EXPIRES_AT: &str = "expires_at";
const DELETED: &str = "deleted";
const REAP_AT: &str = "ttl";

pub struct DynamoColumnStore {
    dynamo_client: DynamoDbClient,
    table_name: String,
}

impl DynamoColumnStore {
    /// Store for `column_family` in `keyspace`, kept in table `{keyspace}.{column_family}`.
    pub fn new(dynamo_client: DynamoDbClient, keyspace: &str, column_family: &str) -> Self {
        Self::with_table(dynamo_client, format!("{}.{}", keyspace, column_family))
    }

    pub fn with_table(dynamo_client: DynamoDbClient, table_name: impl Into<String>) -> Self {
        Self {
            dynamo_client,
            table_name: table_name.into(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    async fn put_with_condition(
        &self,
        item: HashMap<String, AttributeValue>,
        condition: String,
        values: HashMap<String, AttributeValue>,
    ) -> LockResult<bool> {
        let names = attribute_names(&condition);
        let input = PutItemInput {
            table_name: self.table_name.clone(),
            item,
            condition_expression: Some(condition),
            expression_attribute_names: Some(names),
            expression_attribute_values: Some(values),
            ..PutItemInput::default()
        };

        match self.dynamo_client.put_item(input).await {
            Ok(_) => Ok(true),
            Err(RusotoError::Service(PutItemError::ConditionalCheckFailed(_))) => Ok(false),
            Err(err) => Err(classify("PutItem", err)),
        }
    }

    async fn write_cell(
        &self,
        row_key: &str,
        column: Column,
        deleted: bool,
        ttl: Option<Duration>,
    ) -> LockResult<()> {
        let now_ms = Utc::now().timestamp_millis();
        let timestamp = column.timestamp;
        let item = column_item(row_key, column, deleted, ttl, now_ms);
        let mut values = HashMap::new();
        values.insert(":ts".to_string(), n_attr(timestamp));
        values.insert(":now".to_string(), n_attr(now_ms));

        let written = self
            .put_with_condition(item, lww_condition(deleted), values)
            .await?;
        if !written {
            debug!(row_key, timestamp, "Write lost to a newer cell");
        }
        Ok(())
    }
}

/// Name aliases referenced by `expression`; DynamoDB rejects unused ones.
fn attribute_names(expression: &str) -> HashMap<String, String> {
    [
        ("#rk", ROW_KEY),
        ("#val", VALUE),
        ("#ts", WRITE_TIMESTAMP),
        ("#exp", EXPIRES_AT),
        ("#del", DELETED),
    ]
    .iter()
    .filter(|(alias, _)| expression.contains(alias))
    .map(|(alias, name)| (alias.to_string(), name.to_string()))
    .collect()
}

/// Condition under which a write stamped `:ts` replaces the stored cell.
/// Tombstones win timestamp ties.
fn lww_condition(tombstone: bool) -> String {
    let order = if tombstone { "#ts <= :ts" } else { "#ts < :ts" };
    format!("attribute_not_exists(#rk) OR {} OR #exp < :now", order)
}

fn cas_condition(expect_absent: bool) -> String {
    if expect_absent {
        "attribute_not_exists(#rk) OR #del = :true OR #exp < :now".to_string()
    } else {
        "#val = :expected AND #del = :false AND (attribute_not_exists(#exp) OR #exp >= :now)".to_string()
    }
}

fn s_attr(value: impl Into<String>) -> AttributeValue {
    AttributeValue {
        s: Some(value.into()),
        ..AttributeValue::default()
    }
}

fn n_attr(value: i64) -> AttributeValue {
    AttributeValue {
        n: Some(value.to_string()),
        ..AttributeValue::default()
    }
}

fn b_attr(value: Bytes) -> AttributeValue {
    AttributeValue {
        b: Some(value),
        ..AttributeValue::default()
    }
}

fn bool_attr(value: bool) -> AttributeValue {
    AttributeValue {
        bool: Some(value),
        ..AttributeValue::default()
    }
}

fn key_of(row_key: &str, column_name: &str) -> HashMap<String, AttributeValue> {
    let mut key = HashMap::new();
    key.insert(ROW_KEY.to_string(), s_attr(row_key));
    key.insert(COLUMN_NAME.to_string(), s_attr(column_name));
    key
}

fn column_item(
    row_key: &str,
    column: Column,
    deleted: bool,
    ttl: Option<Duration>,
    now_ms: i64,
) -> HashMap<String, AttributeValue> {
    let mut item = key_of(row_key, &column.name);
    item.insert(WRITE_TIMESTAMP.to_string(), n_attr(column.timestamp));
    item.insert(DELETED.to_string(), bool_attr(deleted));
    if deleted {
        let reap_at_ms = now_ms + TOMBSTONE_RETENTION.as_millis() as i64;
        item.insert(REAP_AT.to_string(), n_attr(reap_at_ms / 1000));
    } else {
        item.insert(VALUE.to_string(), b_attr(column.value));
        if let Some(ttl) = ttl {
            let expires_at_ms = now_ms + ttl.as_millis() as i64;
            item.insert(EXPIRES_AT.to_string(), n_attr(expires_at_ms));
            item.insert(REAP_AT.to_string(), n_attr(expires_at_ms / 1000 + 1));
        }
    }
    item
}

fn number_field(item: &HashMap<String, AttributeValue>, name: &str) -> LockResult<Option<i64>> {
    match item.get(name).and_then(|attr| attr.n.as_ref()) {
        Some(n) => n
            .parse::<i64>()
            .map(Some)
            .map_err(|_| Exception::NonRetryable(format!("Attribute '{}' contains an invalid format", name))),
        None => Ok(None),
    }
}

/// The live column an item represents, or `None` for tombstones and expired cells.
fn item_to_column(item: &HashMap<String, AttributeValue>, now_ms: i64) -> LockResult<Option<Column>> {
    if item.get(DELETED).and_then(|attr| attr.bool).unwrap_or(false) {
        return Ok(None);
    }
    if let Some(expires_at) = number_field(item, EXPIRES_AT)? {
        if expires_at <= now_ms {
            return Ok(None);
        }
    }

    let name = item
        .get(COLUMN_NAME)
        .and_then(|attr| attr.s.clone())
        .ok_or_else(|| Exception::NonRetryable(format!("Attribute '{}' was missing", COLUMN_NAME)))?;
    let value = item
        .get(VALUE)
        .and_then(|attr| attr.b.clone())
        .ok_or_else(|| Exception::NonRetryable(format!("Attribute '{}' was missing", VALUE)))?;
    let timestamp = number_field(item, WRITE_TIMESTAMP)?
        .ok_or_else(|| Exception::NonRetryable(format!("Attribute '{}' was missing", WRITE_TIMESTAMP)))?;
    Ok(Some(Column::new(name, value, timestamp)))
}

trait TransientServiceError {
    fn is_transient(&self) -> bool;
}

impl TransientServiceError for GetItemError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            GetItemError::InternalServerError(_)
                | GetItemError::ProvisionedThroughputExceeded(_)
                | GetItemError::RequestLimitExceeded(_)
        )
    }
}

impl TransientServiceError for PutItemError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            PutItemError::InternalServerError(_)
                | PutItemError::ProvisionedThroughputExceeded(_)
                | PutItemError::RequestLimitExceeded(_)
        )
    }
}

impl TransientServiceError for QueryError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            QueryError::InternalServerError(_)
                | QueryError::ProvisionedThroughputExceeded(_)
                | QueryError::RequestLimitExceeded(_)
        )
    }
}

fn classify<E>(operation: &str, err: RusotoError<E>) -> Exception
where
    E: TransientServiceError + std::error::Error + 'static,
{
    let retryable = match &err {
        RusotoError::Service(e) => e.is_transient(),
        RusotoError::HttpDispatch(_) => true,
        RusotoError::Unknown(response) => {
            response.status.is_server_error() || response.status.as_u16() == 429
        }
        _ => false,
    };
    let message = format!("DynamoDB {} failed: {}", operation, err);
    if retryable {
        Exception::Retryable(message)
    } else {
        Exception::NonRetryable(message)
    }
}

#[async_trait]
impl ColumnStore for DynamoColumnStore {
    async fn get_column(&self, row_key: &str, column_name: &str) -> LockResult<Option<Column>> {
        let input = GetItemInput {
            table_name: self.table_name.clone(),
            key: key_of(row_key, column_name),
            consistent_read: Some(true),
            ..GetItemInput::default()
        };
        let output = self
            .dynamo_client
            .get_item(input)
            .await
            .map_err(|err| classify("GetItem", err))?;
        match output.item {
            Some(item) => item_to_column(&item, Utc::now().timestamp_millis()),
            None => Ok(None),
        }
    }

    async fn get_columns(
        &self,
        row_key: &str,
        exclusive_start: Option<&str>,
        limit: usize,
    ) -> LockResult<Vec<Column>> {
        let mut values = HashMap::new();
        values.insert(":rk".to_string(), s_attr(row_key));
        let key_condition = match exclusive_start {
            Some(start) => {
                values.insert(":start".to_string(), s_attr(start));
                "row_key = :rk AND column_name > :start"
            }
            None => "row_key = :rk",
        };

        let mut columns = Vec::new();
        let mut exclusive_start_key = None;
        loop {
            let input = QueryInput {
                table_name: self.table_name.clone(),
                key_condition_expression: Some(key_condition.to_string()),
                expression_attribute_values: Some(values.clone()),
                consistent_read: Some(true),
                limit: Some(limit.max(1) as i64),
                exclusive_start_key,
                ..QueryInput::default()
            };
            let output = self
                .dynamo_client
                .query(input)
                .await
                .map_err(|err| classify("Query", err))?;

            let now_ms = Utc::now().timestamp_millis();
            for item in output.items.unwrap_or_default() {
                if let Some(column) = item_to_column(&item, now_ms)? {
                    columns.push(column);
                    if columns.len() >= limit {
                        return Ok(columns);
                    }
                }
            }

            match output.last_evaluated_key {
                Some(key) => exclusive_start_key = Some(key),
                None => return Ok(columns),
            }
        }
    }

    async fn add_column(&self, row_key: &str, column: Column, ttl: Option<Duration>) -> LockResult<()> {
        self.write_cell(row_key, column, false, ttl).await
    }

    async fn delete_column(&self, row_key: &str, column_name: &str, timestamp: i64) -> LockResult<()> {
        let tombstone = Column::new(column_name, Bytes::new(), timestamp);
        self.write_cell(row_key, tombstone, true, None).await
    }

    async fn compare_and_set(
        &self,
        row_key: &str,
        column: Column,
        expected: Option<&Bytes>,
        ttl: Option<Duration>,
    ) -> LockResult<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let mut values = HashMap::new();
        values.insert(":now".to_string(), n_attr(now_ms));
        match expected {
            Some(expected) => {
                values.insert(":expected".to_string(), b_attr(expected.clone()));
                values.insert(":false".to_string(), bool_attr(false));
            }
            None => {
                values.insert(":true".to_string(), bool_attr(true));
            }
        }
        let item = column_item(row_key, column, false, ttl, now_ms);
        self.put_with_condition(item, cas_condition(expected.is_none()), values)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_items_become_columns() {
        let column = Column::new("00000000000000000001:a", Bytes::from_static(b"{}"), 17);
        let item = column_item("main:l", column.clone(), false, Some(Duration::from_secs(5)), 1_000);
        assert_eq!(item_to_column(&item, 1_000).unwrap(), Some(column));
        assert_eq!(item_to_column(&item, 6_000).unwrap(), None);
        assert_eq!(
            number_field(&item, REAP_AT).unwrap(),
            Some(7),
            "reaping must not happen before expiry"
        );
    }

    #[test]
    fn tombstones_are_not_columns() {
        let tombstone = Column::new("c", Bytes::new(), 3);
        let item = column_item("main:l", tombstone, true, None, 1_000);
        assert!(item.get(VALUE).is_none());
        assert_eq!(item_to_column(&item, 1_000).unwrap(), None);
    }

    #[test]
    fn missing_attributes_are_reported() {
        let mut item = key_of("r", "c");
        item.insert(WRITE_TIMESTAMP.to_string(), n_attr(1));
        match item_to_column(&item, 0) {
            Err(Exception::NonRetryable(msg)) => assert!(msg.contains(VALUE)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn only_referenced_names_are_sent() {
        let names = attribute_names(&lww_condition(false));
        assert_eq!(names.len(), 3);
        assert!(names.contains_key("#rk") && names.contains_key("#ts") && names.contains_key("#exp"));

        let names = attribute_names(&cas_condition(false));
        assert!(names.contains_key("#val") && names.contains_key("#del"));
        assert!(!names.contains_key("#rk"));
    }

    #[test]
    fn tombstones_win_timestamp_ties() {
        assert!(lww_condition(true).contains("#ts <= :ts"));
        assert!(lww_condition(false).contains("#ts < :ts"));
    }

    #[test]
    fn throttling_is_retryable_and_validation_is_not() {
        let throttled: RusotoError<PutItemError> =
            RusotoError::Service(PutItemError::ProvisionedThroughputExceeded("slow down".to_string()));
        assert!(classify("PutItem", throttled).is_retryable());

        let missing: RusotoError<QueryError> =
            RusotoError::Service(QueryError::ResourceNotFound("no table".to_string()));
        assert!(!classify("Query", missing).is_retryable());

        let invalid: RusotoError<GetItemError> = RusotoError::Validation("bad key".to_string());
        assert!(!classify("GetItem", invalid).is_retryable());
    }
}
