//! `SQLite`-backed persistence gateway.
//!
//! Uses WAL mode for concurrent reads with a single mutex-guarded write
//! connection. Entities with nested structure persist their canonical
//! JSON in a `body` column next to the typed columns used for lookups;
//! scalar-only entities (subscriptions, events, offsets) map field per
//! column.

// Mutex poisoning indicates a panic in another thread, which is
// unrecoverable for a storage engine.
#![allow(clippy::missing_panics_doc)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use uuid::Uuid;

use super::{Database, GroupOps, Offset, StoreError, EVENT_FIELDS, SUBSCRIPTION_FIELDS};
use crate::filter::{coerce_field, Filter, FilterNode, Op, QueryFields, Scalar, Update};
use crate::types::{
    Batch, Bytes32, Data, Event, EventType, FirstEvent, Message, Subscription,
    SubscriptionFilter, SubscriptionOptions, Transaction, TransactionStatus,
};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// The persistence gateway backed by `SQLite`.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens or creates a store at the given path, applying the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

// ---------------------------------------------------------------------------
// Canonical column text forms
// ---------------------------------------------------------------------------

fn time_text(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn opt_time_text(t: Option<&DateTime<Utc>>) -> Option<String> {
    t.map(time_text)
}

fn parse_time(table: &'static str, s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::corrupt(table, e))
}

fn parse_opt_time(
    table: &'static str,
    s: Option<String>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.map(|s| parse_time(table, &s)).transpose()
}

fn parse_uuid(table: &'static str, s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::corrupt(table, e))
}

fn hash_text(hash: Option<&Bytes32>) -> String {
    hash.map(ToString::to_string).unwrap_or_default()
}

fn body_json<T: serde::Serialize>(table: &'static str, entity: &T) -> Result<String, StoreError> {
    serde_json::to_string(entity).map_err(|e| StoreError::corrupt(table, e))
}

fn from_body<T: serde::de::DeserializeOwned>(
    table: &'static str,
    body: &str,
) -> Result<T, StoreError> {
    serde_json::from_str(body).map_err(|e| StoreError::corrupt(table, e))
}

// ---------------------------------------------------------------------------
// Filter compilation
// ---------------------------------------------------------------------------

/// Maps a query field name to its column for one entity table.
type ColumnFn = fn(&str) -> &'static str;

fn subscription_column(field: &str) -> &'static str {
    match field {
        "id" => "id",
        "namespace" => "namespace",
        "name" => "name",
        "transport" => "transport",
        "events" => "events",
        "topic" => "topic",
        "context" => "context",
        "group" => "grp",
        _ => "created",
    }
}

fn event_column(field: &str) -> &'static str {
    match field {
        "sequence" => "sequence",
        "type" => "etype",
        "reference" => "reference",
        "namespace" => "namespace",
        _ => "created",
    }
}

fn scalar_value(scalar: Scalar) -> rusqlite::types::Value {
    match scalar {
        Scalar::Text(t) => rusqlite::types::Value::Text(t),
        Scalar::Int(i) => rusqlite::types::Value::Integer(i),
        Scalar::Null => rusqlite::types::Value::Null,
    }
}

fn compile_node(
    fields: QueryFields,
    column: ColumnFn,
    node: &FilterNode,
    params: &mut Vec<rusqlite::types::Value>,
) -> Result<String, StoreError> {
    match node {
        FilterNode::And(children) => compile_group(fields, column, children, " AND ", "1=1", params),
        FilterNode::Or(children) => compile_group(fields, column, children, " OR ", "1=0", params),
        FilterNode::Compare { field, op, value } => {
            let scalar = coerce_field(fields, field, value)?;
            let col = column(field);
            match (op, &scalar) {
                (Op::Eq, Scalar::Null) => Ok(format!("{col} IS NULL")),
                (Op::Neq, Scalar::Null) => Ok(format!("{col} IS NOT NULL")),
                _ => {
                    let sql_op = match op {
                        Op::Eq => "=",
                        Op::Neq => "!=",
                        Op::Lt => "<",
                        Op::Gt => ">",
                    };
                    params.push(scalar_value(scalar));
                    Ok(format!("{col} {sql_op} ?"))
                }
            }
        }
    }
}

fn compile_group(
    fields: QueryFields,
    column: ColumnFn,
    children: &[FilterNode],
    joiner: &str,
    empty: &str,
    params: &mut Vec<rusqlite::types::Value>,
) -> Result<String, StoreError> {
    if children.is_empty() {
        return Ok(empty.to_string());
    }
    let parts = children
        .iter()
        .map(|child| compile_node(fields, column, child, params))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(format!("( {} )", parts.join(joiner)))
}

/// Compiles a [`Filter`] to a WHERE clause, bound parameters, and an
/// ORDER BY / LIMIT / OFFSET tail.
fn compile_filter(
    fields: QueryFields,
    column: ColumnFn,
    filter: &Filter,
) -> Result<(String, Vec<rusqlite::types::Value>, String), StoreError> {
    let mut params = Vec::new();
    let where_clause = match &filter.root {
        Some(node) => compile_node(fields, column, node, &mut params)?,
        None => "1=1".to_string(),
    };

    let mut tail = String::new();
    if !filter.sort.is_empty() {
        let cols = filter
            .sort
            .iter()
            .map(|s| {
                // Validates the sort field against the schema.
                crate::filter::field_def(fields, &s.field)?;
                Ok(format!(
                    "{}{}",
                    column(&s.field),
                    if s.descending { " DESC" } else { "" }
                ))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        tail.push_str(" ORDER BY ");
        tail.push_str(&cols.join(", "));
    }
    if filter.limit.is_some() || filter.skip.is_some() {
        // SQLite requires LIMIT before OFFSET; -1 means unlimited.
        let limit = filter.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(-1));
        tail.push_str(&format!(" LIMIT {limit}"));
        if let Some(skip) = filter.skip {
            tail.push_str(&format!(" OFFSET {skip}"));
        }
    }

    Ok((where_clause, params, tail))
}

// ---------------------------------------------------------------------------
// Entity row mapping (shared by direct and group scopes)
// ---------------------------------------------------------------------------

/// Checks the stored hash for a keyed row before an upsert.
///
/// Returns `HashMismatch` when a row exists, hash updates are not
/// allowed, and its hash differs from `hash`.
fn precheck_hash(
    conn: &Connection,
    sql: &str,
    key: &[&dyn rusqlite::ToSql],
    hash: &str,
    allow_hash_update: bool,
) -> Result<(), StoreError> {
    if allow_hash_update {
        return Ok(());
    }
    let existing: Option<String> = conn
        .query_row(sql, params_from_iter(key.iter()), |row| row.get(0))
        .optional()?;
    match existing {
        Some(stored) if stored != hash => Err(StoreError::HashMismatch),
        _ => Ok(()),
    }
}

fn upsert_batch_impl(
    conn: &Connection,
    batch: &Batch,
    allow_hash_update: bool,
) -> Result<(), StoreError> {
    let id = batch.id.ok_or(StoreError::MissingId)?.to_string();
    let hash = hash_text(batch.hash.as_ref());
    precheck_hash(
        conn,
        "SELECT hash FROM batches WHERE id = ?",
        &[&id],
        &hash,
        allow_hash_update,
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO batches (id, namespace, author, hash, confirmed, body)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id,
            batch.namespace,
            batch.author,
            hash,
            opt_time_text(batch.confirmed.as_ref()),
            body_json("batches", batch)?,
        ],
    )?;
    Ok(())
}

fn get_batch_impl(conn: &Connection, id: &Uuid) -> Result<Option<Batch>, StoreError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM batches WHERE id = ?",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|b| from_body("batches", &b)).transpose()
}

fn upsert_transaction_impl(
    conn: &Connection,
    transaction: &Transaction,
    allow_hash_update: bool,
) -> Result<(), StoreError> {
    let id = transaction.id.ok_or(StoreError::MissingId)?.to_string();
    let hash = hash_text(transaction.hash.as_ref());
    precheck_hash(
        conn,
        "SELECT hash FROM transactions WHERE namespace = ? AND id = ?",
        &[&transaction.subject.namespace, &id],
        &hash,
        allow_hash_update,
    )?;
    let status = transaction.status.map(|s| match s {
        TransactionStatus::Pending => "pending",
        TransactionStatus::Confirmed => "confirmed",
    });
    conn.execute(
        "INSERT OR REPLACE INTO transactions (id, namespace, hash, status, body)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id,
            transaction.subject.namespace,
            hash,
            status,
            body_json("transactions", transaction)?,
        ],
    )?;
    Ok(())
}

fn get_transaction_impl(
    conn: &Connection,
    namespace: &str,
    id: &Uuid,
) -> Result<Option<Transaction>, StoreError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM transactions WHERE namespace = ? AND id = ?",
            params![namespace, id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|b| from_body("transactions", &b)).transpose()
}

fn upsert_data_impl(
    conn: &Connection,
    data: &Data,
    allow_hash_update: bool,
) -> Result<(), StoreError> {
    let id = data.id.ok_or(StoreError::MissingId)?.to_string();
    let hash = hash_text(data.hash.as_ref());
    precheck_hash(
        conn,
        "SELECT hash FROM data WHERE id = ?",
        &[&id],
        &hash,
        allow_hash_update,
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO data (id, hash, body) VALUES (?1, ?2, ?3)",
        params![id, hash, body_json("data", data)?],
    )?;
    Ok(())
}

fn get_data_impl(conn: &Connection, id: &Uuid) -> Result<Option<Data>, StoreError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM data WHERE id = ?",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|b| from_body("data", &b)).transpose()
}

fn upsert_message_impl(
    conn: &Connection,
    message: &Message,
    allow_hash_update: bool,
) -> Result<(), StoreError> {
    let id = message.header.id.ok_or(StoreError::MissingId)?.to_string();
    let hash = hash_text(message.hash.as_ref());
    precheck_hash(
        conn,
        "SELECT hash FROM messages WHERE id = ?",
        &[&id],
        &hash,
        allow_hash_update,
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO messages
         (id, namespace, topic, context, grp, batch_id, hash, confirmed, body)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id,
            message.header.namespace,
            message.header.topic,
            message.header.context,
            message.header.group,
            message.batch_id.map(|b| b.to_string()),
            hash,
            opt_time_text(message.confirmed.as_ref()),
            body_json("messages", message)?,
        ],
    )?;
    Ok(())
}

fn get_message_impl(conn: &Connection, id: &Uuid) -> Result<Option<Message>, StoreError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM messages WHERE id = ?",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|b| from_body("messages", &b)).transpose()
}

fn insert_event_impl(conn: &Connection, event: &Event) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO events (etype, reference, namespace, created) VALUES (?1, ?2, ?3, ?4)",
        params![
            event.event_type.as_str(),
            event.reference.to_string(),
            event.namespace,
            time_text(&event.created),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn row_to_subscription(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubscriptionRow> {
    Ok(SubscriptionRow {
        id: row.get(0)?,
        namespace: row.get(1)?,
        name: row.get(2)?,
        transport: row.get(3)?,
        events: row.get(4)?,
        topic: row.get(5)?,
        context: row.get(6)?,
        group: row.get(7)?,
        first_event: row.get(8)?,
        batch_enabled: row.get(9)?,
        batch_timeout: row.get(10)?,
        batch_size: row.get(11)?,
        created: row.get(12)?,
    })
}

/// Raw subscription columns before typed decoding.
struct SubscriptionRow {
    id: String,
    namespace: String,
    name: String,
    transport: String,
    events: String,
    topic: String,
    context: String,
    group: String,
    first_event: Option<String>,
    batch_enabled: Option<bool>,
    batch_timeout: Option<String>,
    batch_size: Option<i64>,
    created: Option<String>,
}

impl SubscriptionRow {
    fn decode(self) -> Result<Subscription, StoreError> {
        Ok(Subscription {
            id: Some(parse_uuid("subscriptions", &self.id)?),
            namespace: self.namespace,
            name: self.name,
            transport: self.transport,
            filter: SubscriptionFilter {
                events: self.events,
                topic: self.topic,
                context: self.context,
                group: self.group,
            },
            options: SubscriptionOptions {
                first_event: self.first_event.map(FirstEvent),
                batch_enabled: self.batch_enabled,
                batch_timeout: self.batch_timeout,
                batch_size: self.batch_size.map(|v| v.max(0) as u64),
            },
            created: parse_opt_time("subscriptions", self.created)?,
        })
    }
}

const SUBSCRIPTION_COLS: &str = "id, namespace, name, transport, events, topic, context, grp, \
     first_event, batch_enabled, batch_timeout, batch_size, created";

// ---------------------------------------------------------------------------
// Group scope
// ---------------------------------------------------------------------------

/// [`GroupOps`] backed by one open `SQLite` transaction.
struct SqliteGroupOps<'c> {
    conn: &'c Connection,
}

impl GroupOps for SqliteGroupOps<'_> {
    fn upsert_batch(&mut self, batch: &Batch, allow_hash_update: bool) -> Result<(), StoreError> {
        upsert_batch_impl(self.conn, batch, allow_hash_update)
    }

    fn get_transaction(
        &mut self,
        namespace: &str,
        id: &Uuid,
    ) -> Result<Option<Transaction>, StoreError> {
        get_transaction_impl(self.conn, namespace, id)
    }

    fn upsert_transaction(
        &mut self,
        transaction: &Transaction,
        allow_hash_update: bool,
    ) -> Result<(), StoreError> {
        upsert_transaction_impl(self.conn, transaction, allow_hash_update)
    }

    fn upsert_data(&mut self, data: &Data, allow_hash_update: bool) -> Result<(), StoreError> {
        upsert_data_impl(self.conn, data, allow_hash_update)
    }

    fn upsert_message(
        &mut self,
        message: &Message,
        allow_hash_update: bool,
    ) -> Result<(), StoreError> {
        upsert_message_impl(self.conn, message, allow_hash_update)
    }

    fn insert_event(&mut self, event: &Event) -> Result<i64, StoreError> {
        insert_event_impl(self.conn, event)
    }
}

// ---------------------------------------------------------------------------
// Gateway implementation
// ---------------------------------------------------------------------------

impl Database for SqliteStore {
    fn run_as_group(
        &self,
        op: &mut dyn FnMut(&mut dyn GroupOps) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let mut guard = self.conn.lock().unwrap();
        let tx = guard.transaction()?;
        {
            let mut ops = SqliteGroupOps { conn: &tx };
            // An error drops the transaction, rolling the group back.
            op(&mut ops)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_batch(&self, id: &Uuid) -> Result<Option<Batch>, StoreError> {
        get_batch_impl(&self.conn.lock().unwrap(), id)
    }

    fn get_transaction(
        &self,
        namespace: &str,
        id: &Uuid,
    ) -> Result<Option<Transaction>, StoreError> {
        get_transaction_impl(&self.conn.lock().unwrap(), namespace, id)
    }

    fn get_data(&self, id: &Uuid) -> Result<Option<Data>, StoreError> {
        get_data_impl(&self.conn.lock().unwrap(), id)
    }

    fn get_message(&self, id: &Uuid) -> Result<Option<Message>, StoreError> {
        get_message_impl(&self.conn.lock().unwrap(), id)
    }

    fn get_events(&self, filter: &Filter) -> Result<Vec<Event>, StoreError> {
        let (where_clause, params, tail) = compile_filter(EVENT_FIELDS, event_column, filter)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT sequence, etype, reference, namespace, created FROM events \
             WHERE {where_clause}{tail}"
        ))?;
        let rows = stmt
            .query_map(params_from_iter(params), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(sequence, etype, reference, namespace, created)| {
                let event_type: EventType = etype
                    .parse()
                    .map_err(|e| StoreError::corrupt("events", e))?;
                Ok(Event {
                    sequence: Some(sequence),
                    event_type,
                    reference: parse_uuid("events", &reference)?,
                    namespace,
                    created: parse_time("events", &created)?,
                })
            })
            .collect()
    }

    fn highest_event_sequence(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let max: Option<i64> =
            conn.query_row("SELECT MAX(sequence) FROM events", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0))
    }

    fn upsert_subscription(
        &self,
        subscription: &Subscription,
        allow_existing: bool,
    ) -> Result<Uuid, StoreError> {
        let conn = self.conn.lock().unwrap();

        if allow_existing {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM subscriptions WHERE namespace = ? AND name = ?",
                    params![subscription.namespace, subscription.name],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(stored) = existing {
                let stored_id = parse_uuid("subscriptions", &stored)?;
                // The generated id is immutable after creation.
                if matches!(subscription.id, Some(id) if id != stored_id) {
                    return Err(StoreError::IdMismatch);
                }
                conn.execute(
                    "UPDATE subscriptions SET transport = ?1, events = ?2, topic = ?3, \
                     context = ?4, grp = ?5, first_event = ?6, batch_enabled = ?7, \
                     batch_timeout = ?8, batch_size = ?9, created = ?10 \
                     WHERE namespace = ?11 AND name = ?12",
                    params![
                        subscription.transport,
                        subscription.filter.events,
                        subscription.filter.topic,
                        subscription.filter.context,
                        subscription.filter.group,
                        subscription.options.first_event.as_ref().map(|f| &f.0),
                        subscription.options.batch_enabled,
                        subscription.options.batch_timeout,
                        subscription.options.batch_size.map(|v| i64::try_from(v).unwrap_or(i64::MAX)),
                        opt_time_text(subscription.created.as_ref()),
                        subscription.namespace,
                        subscription.name,
                    ],
                )?;
                return Ok(stored_id);
            }
        }

        let id = subscription.id.unwrap_or_else(Uuid::new_v4);
        conn.execute(
            "INSERT INTO subscriptions \
             (id, namespace, name, transport, events, topic, context, grp, \
              first_event, batch_enabled, batch_timeout, batch_size, created) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                id.to_string(),
                subscription.namespace,
                subscription.name,
                subscription.transport,
                subscription.filter.events,
                subscription.filter.topic,
                subscription.filter.context,
                subscription.filter.group,
                subscription.options.first_event.as_ref().map(|f| &f.0),
                subscription.options.batch_enabled,
                subscription.options.batch_timeout,
                subscription.options.batch_size.map(|v| i64::try_from(v).unwrap_or(i64::MAX)),
                opt_time_text(subscription.created.as_ref()),
            ],
        )?;
        Ok(id)
    }

    fn get_subscription(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {SUBSCRIPTION_COLS} FROM subscriptions \
                     WHERE namespace = ? AND name = ?"
                ),
                params![namespace, name],
                row_to_subscription,
            )
            .optional()?;
        row.map(SubscriptionRow::decode).transpose()
    }

    fn get_subscriptions(&self, filter: &Filter) -> Result<Vec<Subscription>, StoreError> {
        let (where_clause, params, tail) =
            compile_filter(SUBSCRIPTION_FIELDS, subscription_column, filter)?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUBSCRIPTION_COLS} FROM subscriptions WHERE {where_clause}{tail}"
        ))?;
        let rows = stmt
            .query_map(params_from_iter(params), row_to_subscription)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(SubscriptionRow::decode).collect()
    }

    fn update_subscription(
        &self,
        namespace: &str,
        name: &str,
        update: &Update,
    ) -> Result<(), StoreError> {
        let mut sets = Vec::with_capacity(update.ops.len());
        let mut params: Vec<rusqlite::types::Value> = Vec::with_capacity(update.ops.len() + 2);
        for (field, value) in &update.ops {
            let scalar = coerce_field(SUBSCRIPTION_FIELDS, field, value)?;
            sets.push(format!("{} = ?", subscription_column(field)));
            params.push(scalar_value(scalar));
        }
        if sets.is_empty() {
            return Ok(());
        }
        params.push(rusqlite::types::Value::Text(namespace.to_string()));
        params.push(rusqlite::types::Value::Text(name.to_string()));

        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "UPDATE subscriptions SET {} WHERE namespace = ? AND name = ?",
                sets.join(", ")
            ),
            params_from_iter(params),
        )?;
        Ok(())
    }

    fn delete_subscription(&self, id: &Uuid) -> Result<(), StoreError> {
        let mut guard = self.conn.lock().unwrap();
        let tx = guard.transaction()?;
        let key: Option<(String, String)> = tx
            .query_row(
                "SELECT namespace, name FROM subscriptions WHERE id = ?",
                params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((namespace, name)) = key {
            tx.execute(
                "DELETE FROM subscriptions WHERE namespace = ? AND name = ?",
                params![namespace, name],
            )?;
            tx.execute(
                "DELETE FROM offsets WHERE namespace = ? AND name = ?",
                params![namespace, name],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_offset(&self, namespace: &str, name: &str) -> Result<Option<Offset>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let current: Option<i64> = conn
            .query_row(
                "SELECT current FROM offsets WHERE namespace = ? AND name = ?",
                params![namespace, name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(current.map(|current| Offset {
            namespace: namespace.to_string(),
            name: name.to_string(),
            current,
        }))
    }

    fn upsert_offset(&self, offset: &Offset) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO offsets (namespace, name, current) VALUES (?1, ?2, ?3)",
            params![offset.namespace, offset.name, offset.current],
        )?;
        Ok(())
    }
}
