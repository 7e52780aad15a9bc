// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

use std::collections::HashMap;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::Context;
use anyhow::Result;
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::types::ConditionCheck;
use aws_sdk_dynamodb::types::KeySchemaElement;
use aws_sdk_dynamodb::types::KeyType;
use aws_sdk_dynamodb::types::ReturnValuesOnConditionCheckFailure;
use aws_sdk_dynamodb::types::TransactWriteItem;
use aws_sdk_dynamodb::types::Update;
use spike_api::Connection;
use spike_api::ExecOutcome;
use spike_api::HolderId;
use spike_api::KeyValueStore;
use spike_api::LeaseGrant;
use spike_api::LeaseStore;
use spike_api::QueuedOp;
use spike_api::Reply;
use spike_api::StoreError;
use spike_api::StoreResult;
use tracing::debug;

const PK_COLUMN: &str = "pk";
const VAL_COLUMN: &str = "val";
const VER_COLUMN: &str = "ver";
const HOLDER_COLUMN: &str = "holder";
const EXPIRES_COLUMN: &str = "expires_at";

const VALUE_PREFIX: &str = "kv#";
const LEASE_PREFIX: &str = "lease#";

/// Update expression shared by plain SET and transactional writes; every
/// write bumps `ver` so watchers notice it even if the value is unchanged.
const WRITE_EXPRESSION: &str = "SET val = :val ADD ver :one";

fn value_pk(key: &str) -> AttributeValue {
    AttributeValue::S(format!("{VALUE_PREFIX}{key}"))
}

fn lease_pk(name: &str) -> AttributeValue {
    AttributeValue::S(format!("{LEASE_PREFIX}{name}"))
}

fn epoch_ms(time: SystemTime) -> u128 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0)
}

fn number(value: u128) -> AttributeValue {
    AttributeValue::N(value.to_string())
}

fn read_number(item: &HashMap<String, AttributeValue>, column: &str) -> u128 {
    item.get(column)
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

fn unavailable(err: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// A remote store backed by a DynamoDB table with a single string partition
/// key `pk`.
///
/// Values live in `kv#<key>` items as `{val, ver}`; leases live in
/// `lease#<name>` items as `{holder, expires_at}` with a wall-clock expiry in
/// epoch milliseconds.
#[derive(Clone)]
pub struct DynamoStore {
    client: aws_sdk_dynamodb::Client,
    table_name: String,
}

impl DynamoStore {
    pub async fn new(client: aws_sdk_dynamodb::Client, table_name: String) -> Result<Self> {
        let output = client
            .describe_table()
            .table_name(&table_name)
            .send()
            .await
            .context("failed to describe table")?;

        let table = output.table.context("missing table description")?;
        let key_schema = table.key_schema();

        let has_hash = key_schema.iter().any(|k: &KeySchemaElement| {
            k.attribute_name() == PK_COLUMN && k.key_type() == &KeyType::Hash
        });
        anyhow::ensure!(
            has_hash && key_schema.len() == 1,
            "table '{}' must have a single partition key '{}' (S, HASH) and no sort key",
            table_name,
            PK_COLUMN,
        );

        Ok(Self { client, table_name })
    }

    /// Reads `(value, version)`; version 0 means the key is absent.
    async fn read_versioned(&self, key: &str) -> StoreResult<(Option<String>, u128)> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(PK_COLUMN, value_pk(key))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| unavailable(e.into_service_error()))?;

        let Some(item) = output.item() else {
            return Ok((None, 0));
        };
        let value = match item.get(VAL_COLUMN) {
            Some(AttributeValue::S(value)) => Some(value.clone()),
            Some(_) => {
                return Err(StoreError::Protocol(format!(
                    "value at '{key}' is not a string"
                )));
            }
            None => None,
        };
        Ok((value, read_number(item, VER_COLUMN)))
    }

    async fn commit(
        &self,
        watched: HashMap<String, u128>,
        queued: Vec<QueuedOp>,
    ) -> StoreResult<ExecOutcome> {
        // Queued reads see the pre-commit value, or the value written earlier
        // in the same queue. Watched keys are pinned by the version checks.
        let mut overlay: HashMap<String, String> = HashMap::new();
        let mut replies = Vec::with_capacity(queued.len());
        for op in &queued {
            match op {
                QueuedOp::Get { key } => {
                    let value = match overlay.get(key) {
                        Some(value) => Some(value.clone()),
                        None => self.read_versioned(key).await?.0,
                    };
                    replies.push(value.map_or(Reply::Nil, Reply::Value));
                }
                QueuedOp::Set { key, value } => {
                    overlay.insert(key.clone(), value.clone());
                    replies.push(Reply::Ok);
                }
            }
        }

        // One operation per item: a watched key that is also written carries
        // its version check on the update itself.
        let mut items = Vec::new();
        for (key, value) in &overlay {
            let mut update = Update::builder()
                .table_name(&self.table_name)
                .key(PK_COLUMN, value_pk(key))
                .update_expression(WRITE_EXPRESSION)
                .expression_attribute_values(":val", AttributeValue::S(value.clone()))
                .expression_attribute_values(":one", number(1));
            if let Some(version) = watched.get(key) {
                update = version_condition(update, *version);
            }
            items.push(
                TransactWriteItem::builder()
                    .update(update.build().map_err(unavailable)?)
                    .build(),
            );
        }
        for (key, version) in watched.iter().filter(|(key, _)| !overlay.contains_key(*key)) {
            let check = ConditionCheck::builder()
                .table_name(&self.table_name)
                .key(PK_COLUMN, value_pk(key));
            let check = if *version == 0 {
                check.condition_expression("attribute_not_exists(pk)")
            } else {
                check
                    .condition_expression("ver = :ver")
                    .expression_attribute_values(":ver", number(*version))
            };
            items.push(
                TransactWriteItem::builder()
                    .condition_check(check.build().map_err(unavailable)?)
                    .build(),
            );
        }

        if items.is_empty() {
            return Ok(ExecOutcome::Committed(replies));
        }

        let result = self
            .client
            .transact_write_items()
            .set_transact_items(Some(items))
            .send()
            .await;
        match result {
            Ok(_) => Ok(ExecOutcome::Committed(replies)),
            Err(err) => match err.into_service_error() {
                TransactWriteItemsError::TransactionCanceledException(cancelled)
                    if cancelled
                        .cancellation_reasons()
                        .iter()
                        .any(|reason| reason.code() == Some("ConditionalCheckFailed")) =>
                {
                    debug!(table = %self.table_name, "Transaction aborted by version check");
                    Ok(ExecOutcome::Aborted)
                }
                other => Err(unavailable(other)),
            },
        }
    }
}

fn version_condition(
    update: aws_sdk_dynamodb::types::builders::UpdateBuilder,
    version: u128,
) -> aws_sdk_dynamodb::types::builders::UpdateBuilder {
    if version == 0 {
        update.condition_expression("attribute_not_exists(pk)")
    } else {
        update
            .condition_expression("ver = :ver")
            .expression_attribute_values(":ver", number(version))
    }
}

impl KeyValueStore for DynamoStore {
    type Connection = DynamoConnection;

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.read_versioned(key).await?.0)
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        self.client
            .update_item()
            .table_name(&self.table_name)
            .key(PK_COLUMN, value_pk(key))
            .update_expression(WRITE_EXPRESSION)
            .expression_attribute_values(":val", AttributeValue::S(value))
            .expression_attribute_values(":one", number(1))
            .send()
            .await
            .map_err(|e| unavailable(e.into_service_error()))?;
        Ok(())
    }

    async fn connect(&self) -> StoreResult<DynamoConnection> {
        Ok(DynamoConnection {
            store: self.clone(),
            watched: HashMap::new(),
            queued: None,
        })
    }
}

impl LeaseStore for DynamoStore {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &HolderId,
        lease: Duration,
    ) -> StoreResult<LeaseGrant> {
        let now = SystemTime::now();
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .item(PK_COLUMN, lease_pk(name))
            .item(HOLDER_COLUMN, AttributeValue::S(holder.to_string()))
            .item(EXPIRES_COLUMN, number(epoch_ms(now + lease)))
            .condition_expression(
                "attribute_not_exists(pk) OR expires_at <= :now OR holder = :holder",
            )
            .expression_attribute_values(":now", number(epoch_ms(now)))
            .expression_attribute_values(":holder", AttributeValue::S(holder.to_string()))
            .return_values_on_condition_check_failure(ReturnValuesOnConditionCheckFailure::AllOld)
            .send()
            .await;

        match result {
            Ok(_) => Ok(LeaseGrant::Acquired),
            Err(err) => match err.into_service_error() {
                PutItemError::ConditionalCheckFailedException(failed) => {
                    let item = failed.item().cloned().unwrap_or_default();
                    let current = match item.get(HOLDER_COLUMN) {
                        Some(AttributeValue::S(current)) => HolderId::new(current.clone()),
                        _ => {
                            return Err(StoreError::Protocol(format!(
                                "lease '{name}' has no holder"
                            )));
                        }
                    };
                    let remaining_ms = read_number(&item, EXPIRES_COLUMN)
                        .saturating_sub(epoch_ms(now))
                        .min(u64::MAX as u128) as u64;
                    Ok(LeaseGrant::Held {
                        holder: current,
                        remaining: Duration::from_millis(remaining_ms),
                    })
                }
                other => Err(unavailable(other)),
            },
        }
    }

    async fn renew(&self, name: &str, holder: &HolderId, lease: Duration) -> StoreResult<bool> {
        let now = SystemTime::now();
        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key(PK_COLUMN, lease_pk(name))
            .update_expression("SET expires_at = :expires")
            .condition_expression("holder = :holder AND expires_at > :now")
            .expression_attribute_values(":expires", number(epoch_ms(now + lease)))
            .expression_attribute_values(":now", number(epoch_ms(now)))
            .expression_attribute_values(":holder", AttributeValue::S(holder.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_conditional_check_failed_exception() {
                    Ok(false)
                } else {
                    Err(unavailable(service_err))
                }
            }
        }
    }

    async fn release(&self, name: &str, holder: &HolderId) -> StoreResult<bool> {
        let now = SystemTime::now();
        let result = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .key(PK_COLUMN, lease_pk(name))
            .condition_expression("holder = :holder AND expires_at > :now")
            .expression_attribute_values(":now", number(epoch_ms(now)))
            .expression_attribute_values(":holder", AttributeValue::S(holder.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_conditional_check_failed_exception() {
                    Ok(false)
                } else {
                    Err(unavailable(service_err))
                }
            }
        }
    }
}

/// Connection over DynamoDB.
///
/// DynamoDB has no server-side session, so the watch set and the MULTI queue
/// are kept client-side and EXEC becomes a single `TransactWriteItems` call
/// with a version check for every watched key.
pub struct DynamoConnection {
    store: DynamoStore,
    watched: HashMap<String, u128>,
    queued: Option<Vec<QueuedOp>>,
}

impl Connection for DynamoConnection {
    async fn watch(&mut self, key: &str) -> StoreResult<()> {
        if self.queued.is_some() {
            return Err(StoreError::Protocol(
                "WATCH inside MULTI is not allowed".to_string(),
            ));
        }
        let (_, version) = self.store.read_versioned(key).await?;
        self.watched.insert(key.to_string(), version);
        Ok(())
    }

    async fn unwatch(&mut self) -> StoreResult<()> {
        self.watched.clear();
        Ok(())
    }

    async fn get(&mut self, key: &str) -> StoreResult<Option<String>> {
        if self.queued.is_some() {
            return Err(StoreError::Protocol(
                "immediate GET inside MULTI, queue it instead".to_string(),
            ));
        }
        Ok(self.store.read_versioned(key).await?.0)
    }

    async fn multi(&mut self) -> StoreResult<()> {
        if self.queued.is_some() {
            return Err(StoreError::Protocol(
                "MULTI calls can not be nested".to_string(),
            ));
        }
        self.queued = Some(Vec::new());
        Ok(())
    }

    async fn queue(&mut self, op: QueuedOp) -> StoreResult<()> {
        match self.queued.as_mut() {
            Some(queued) => {
                queued.push(op);
                Ok(())
            }
            None => Err(StoreError::Protocol(
                "queued command without MULTI".to_string(),
            )),
        }
    }

    async fn exec(&mut self) -> StoreResult<ExecOutcome> {
        let queued = self
            .queued
            .take()
            .ok_or_else(|| StoreError::Protocol("EXEC without MULTI".to_string()))?;
        let watched = std::mem::take(&mut self.watched);
        self.store.commit(watched, queued).await
    }

    async fn discard(&mut self) -> StoreResult<()> {
        if self.queued.take().is_none() {
            return Err(StoreError::Protocol("DISCARD without MULTI".to_string()));
        }
        self.watched.clear();
        Ok(())
    }
}
