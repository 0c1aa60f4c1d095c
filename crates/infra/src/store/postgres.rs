//! Postgres-backed store gateway.
//!
//! Each [`Mutation`] is rendered to one parameterized statement against the
//! configured schema and bound positionally. Upserts are a single statement
//! group (`UPDATE` inside a CTE, `INSERT ... WHERE NOT EXISTS` on the updated
//! rows), so the update-then-insert pair needs no native `ON CONFLICT`.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `UniqueViolation` |
//! | Database (other) | any other | `Database` (code preserved) |
//! | PoolClosed | N/A | `PoolClosed` |
//! | Io / Tls / Protocol / PoolTimedOut | N/A | `Connection` |
//! | Other | N/A | `Database` without code |
//!
//! ## Thread Safety
//!
//! `PostgresStore` is `Send + Sync` and cheap to clone; every clone shares
//! the same connection pool.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{Executor, Postgres, Transaction};
use tracing::instrument;

use crate::config::StorageOptions;

use super::gateway::{IsolationLevel, SessionTransaction, StoreError, StoreSession};
use super::mutation::Mutation;

/// Postgres session over a connection pool.
///
/// Statements executed through [`StoreSession::execute`] autocommit on any
/// pooled connection; [`StoreSession::begin`] pins one connection for the
/// lifetime of the transaction.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
    schema: Arc<str>,
}

impl PostgresStore {
    /// Create a store over an existing pool, operating in `schema`.
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool: Arc::new(pool),
            schema: Arc::from(schema.into()),
        }
    }

    /// Open a pool sized from the storage options.
    pub async fn connect(database_url: &str, options: &StorageOptions) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, options.schema_name.clone()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StoreSession for PostgresStore {
    fn schema_name(&self) -> &str {
        &self.schema
    }

    fn describe(&self) -> String {
        let options = self.pool.connect_options();
        format!(
            "PostgreSQL Server: Host: {}, DB: {}, Schema: {}",
            options.get_host(),
            options.get_database().unwrap_or("<default>"),
            self.schema
        )
    }

    #[instrument(
        level = "debug",
        skip(self, mutation),
        fields(operation = mutation.kind(), target = %mutation.target()),
        err
    )]
    async fn execute(&self, mutation: &Mutation) -> Result<u64, StoreError> {
        execute_on(&*self.pool, &self.schema, mutation).await
    }

    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn SessionTransaction>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let set_isolation = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql());
        sqlx::query(&set_isolation)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_isolation_level", e))?;

        Ok(Box::new(PostgresTransaction {
            tx,
            schema: self.schema.clone(),
        }))
    }
}

struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
    schema: Arc<str>,
}

#[async_trait]
impl SessionTransaction for PostgresTransaction {
    async fn execute(&mut self, mutation: &Mutation) -> Result<u64, StoreError> {
        execute_on(&mut *self.tx, &self.schema, mutation).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

async fn execute_on<'c, E>(executor: E, schema: &str, mutation: &Mutation) -> Result<u64, StoreError>
where
    E: Executor<'c, Database = Postgres>,
{
    let statement = render(schema, mutation)?;
    let result = bind_all(sqlx::query(&statement.sql), &statement.params)
        .execute(executor)
        .await
        .map_err(|e| map_sqlx_error(mutation.kind(), e))?;
    Ok(result.rows_affected())
}

/// Positional statement parameter.
#[derive(Debug, Clone, PartialEq)]
enum Param {
    Text(String),
    NullableText(Option<String>),
    Int4(i32),
    Int8(i64),
    Float8(f64),
    Json(serde_json::Value),
}

#[derive(Debug)]
struct Statement {
    sql: String,
    params: Vec<Param>,
}

impl Statement {
    fn new(sql: String, params: Vec<Param>) -> Self {
        Self { sql, params }
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [Param],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Param::Text(v) => query.bind(v.as_str()),
            Param::NullableText(v) => query.bind(v.as_deref()),
            Param::Int4(v) => query.bind(*v),
            Param::Int8(v) => query.bind(*v),
            Param::Float8(v) => query.bind(*v),
            Param::Json(v) => query.bind(v),
        };
    }
    query
}

fn table(schema: &str, name: &str) -> String {
    format!(r#""{schema}"."{name}""#)
}

fn text(v: &str) -> Param {
    Param::Text(v.to_string())
}

fn saturating_i64(v: usize) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Render a mutation to SQL against `schema`.
fn render(schema: &str, mutation: &Mutation) -> Result<Statement, StoreError> {
    let statement = match mutation {
        Mutation::InsertLock {
            resource,
            update_count,
        } => {
            let lock = table(schema, "lock");
            Statement::new(
                format!(
                    r#"
                    INSERT INTO {lock} ("resource", "updatecount")
                    SELECT $1, $2
                    WHERE NOT EXISTS (
                        SELECT 1 FROM {lock} WHERE "resource" = $1
                    )
                    "#
                ),
                vec![text(resource), Param::Int4(*update_count)],
            )
        }
        Mutation::ClaimLock { resource } => Statement::new(
            format!(
                r#"UPDATE {} SET "updatecount" = 1 WHERE "resource" = $1 AND "updatecount" = 0"#,
                table(schema, "lock")
            ),
            vec![text(resource)],
        ),
        Mutation::DeleteLock { resource } => Statement::new(
            format!(r#"DELETE FROM {} WHERE "resource" = $1"#, table(schema, "lock")),
            vec![text(resource)],
        ),
        Mutation::ExpireJob { job_id, expire_in } => Statement::new(
            format!(
                r#"UPDATE {} SET "expireat" = NOW() + make_interval(secs => $2) WHERE "id" = $1"#,
                table(schema, "job")
            ),
            vec![Param::Int8(job_id.as_i64()), Param::Float8(expire_in.as_secs_f64())],
        ),
        Mutation::PersistJob { job_id } => Statement::new(
            format!(
                r#"UPDATE {} SET "expireat" = NULL WHERE "id" = $1"#,
                table(schema, "job")
            ),
            vec![Param::Int8(job_id.as_i64())],
        ),
        Mutation::SetJobState { job_id, state } | Mutation::AddJobState { job_id, state } => {
            let data = serde_json::to_value(&state.data).map_err(|e| {
                StoreError::database(mutation.kind(), None, format!("failed to serialize state data: {e}"))
            })?;
            let insert_state = format!(
                r#"
                INSERT INTO {} ("jobid", "name", "reason", "createdat", "data")
                VALUES ($1, $2, $3, NOW(), $4)
                "#,
                table(schema, "state")
            );
            let sql = if matches!(mutation, Mutation::SetJobState { .. }) {
                format!(
                    r#"
                    WITH "s" AS ({insert_state} RETURNING "id")
                    UPDATE {job} "j"
                    SET "stateid" = "s"."id", "statename" = $2
                    FROM "s"
                    WHERE "j"."id" = $1
                    "#,
                    job = table(schema, "job")
                )
            } else {
                insert_state
            };
            Statement::new(
                sql,
                vec![
                    Param::Int8(job_id.as_i64()),
                    text(&state.name),
                    Param::NullableText(state.reason.clone()),
                    Param::Json(data),
                ],
            )
        }
        Mutation::EnqueueJob { queue, job_id } => Statement::new(
            format!(
                r#"INSERT INTO {} ("jobid", "queue") VALUES ($1, $2)"#,
                table(schema, "jobqueue")
            ),
            vec![Param::Int8(job_id.as_i64()), text(queue)],
        ),
        Mutation::InsertCounter {
            key,
            delta,
            expire_in: None,
        } => Statement::new(
            format!(
                r#"INSERT INTO {} ("key", "value") VALUES ($1, $2)"#,
                table(schema, "counter")
            ),
            vec![text(key), Param::Int8(*delta)],
        ),
        Mutation::InsertCounter {
            key,
            delta,
            expire_in: Some(expire_in),
        } => Statement::new(
            format!(
                r#"
                INSERT INTO {} ("key", "value", "expireat")
                VALUES ($1, $2, NOW() + make_interval(secs => $3))
                "#,
                table(schema, "counter")
            ),
            vec![text(key), Param::Int8(*delta), Param::Float8(expire_in.as_secs_f64())],
        ),
        Mutation::UpsertSetMember { key, value, score } => {
            let set = table(schema, "set");
            Statement::new(
                format!(
                    r#"
                    WITH "inputvalues" AS (
                        SELECT $1::text "key", $2::text "value", $3::float8 "score"
                    ), "updatedrows" AS (
                        UPDATE {set} "updatetarget"
                        SET "score" = "inputvalues"."score"
                        FROM "inputvalues"
                        WHERE "updatetarget"."key" = "inputvalues"."key"
                        AND "updatetarget"."value" = "inputvalues"."value"
                        RETURNING "updatetarget"."key", "updatetarget"."value"
                    )
                    INSERT INTO {set} ("key", "value", "score")
                    SELECT "key", "value", "score" FROM "inputvalues" "insertvalues"
                    WHERE NOT EXISTS (
                        SELECT 1 FROM "updatedrows"
                        WHERE "updatedrows"."key" = "insertvalues"."key"
                        AND "updatedrows"."value" = "insertvalues"."value"
                    )
                    "#
                ),
                vec![text(key), text(value), Param::Float8(*score)],
            )
        }
        Mutation::RemoveSetMember { key, value } => Statement::new(
            format!(
                r#"DELETE FROM {} WHERE "key" = $1 AND "value" = $2"#,
                table(schema, "set")
            ),
            vec![text(key), text(value)],
        ),
        Mutation::RemoveSet { key } => Statement::new(
            format!(r#"DELETE FROM {} WHERE "key" = $1"#, table(schema, "set")),
            vec![text(key)],
        ),
        Mutation::InsertListValue { key, value } => Statement::new(
            format!(
                r#"INSERT INTO {} ("key", "value") VALUES ($1, $2)"#,
                table(schema, "list")
            ),
            vec![text(key), text(value)],
        ),
        Mutation::RemoveListValue { key, value } => Statement::new(
            format!(
                r#"DELETE FROM {} WHERE "key" = $1 AND "value" = $2"#,
                table(schema, "list")
            ),
            vec![text(key), text(value)],
        ),
        Mutation::TrimList {
            key,
            keep_starting_from,
            keep_ending_at,
        } => {
            let list = table(schema, "list");
            // Inverted windows keep nothing; a window wider than i64 has no limit.
            let keep_count = match keep_ending_at.checked_sub(*keep_starting_from) {
                Some(span) => span.checked_add(1).map_or(i64::MAX, saturating_i64),
                None => 0,
            };
            Statement::new(
                format!(
                    r#"
                    DELETE FROM {list} AS "source"
                    WHERE "key" = $1
                    AND "id" NOT IN (
                        SELECT "id" FROM {list} AS "keep"
                        WHERE "keep"."key" = "source"."key"
                        ORDER BY "id"
                        OFFSET $2 LIMIT $3
                    )
                    "#
                ),
                vec![
                    text(key),
                    Param::Int8(saturating_i64(*keep_starting_from)),
                    Param::Int8(keep_count),
                ],
            )
        }
        Mutation::UpsertHashField { key, field, value } => {
            let hash = table(schema, "hash");
            Statement::new(
                format!(
                    r#"
                    WITH "inputvalues" AS (
                        SELECT $1::text "key", $2::text "field", $3::text "value"
                    ), "updatedrows" AS (
                        UPDATE {hash} "updatetarget"
                        SET "value" = "inputvalues"."value"
                        FROM "inputvalues"
                        WHERE "updatetarget"."key" = "inputvalues"."key"
                        AND "updatetarget"."field" = "inputvalues"."field"
                        RETURNING "updatetarget"."key", "updatetarget"."field"
                    )
                    INSERT INTO {hash} ("key", "field", "value")
                    SELECT "key", "field", "value" FROM "inputvalues" "insertvalues"
                    WHERE NOT EXISTS (
                        SELECT 1 FROM "updatedrows"
                        WHERE "updatedrows"."key" = "insertvalues"."key"
                        AND "updatedrows"."field" = "insertvalues"."field"
                    )
                    "#
                ),
                vec![text(key), text(field), text(value)],
            )
        }
        Mutation::RemoveHash { key } => Statement::new(
            format!(r#"DELETE FROM {} WHERE "key" = $1"#, table(schema, "hash")),
            vec![text(key)],
        ),
        Mutation::ExpireKey {
            table: target,
            key,
            expire_in,
        } => Statement::new(
            format!(
                r#"UPDATE {} SET "expireat" = NOW() + make_interval(secs => $2) WHERE "key" = $1"#,
                table(schema, target.table_name())
            ),
            vec![text(key), Param::Float8(expire_in.as_secs_f64())],
        ),
        Mutation::PersistKey { table: target, key } => Statement::new(
            format!(
                r#"UPDATE {} SET "expireat" = NULL WHERE "key" = $1"#,
                table(schema, target.table_name())
            ),
            vec![text(key)],
        ),
    };
    Ok(statement)
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_string();
            match db_err.code() {
                Some(code) if code.as_ref() == "23505" => StoreError::UniqueViolation {
                    operation: operation.to_string(),
                    message,
                },
                code => StoreError::database(operation, code.as_deref(), message),
            }
        }
        sqlx::Error::PoolClosed => StoreError::PoolClosed(operation.to_string()),
        err @ (sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut) => StoreError::Connection {
            operation: operation.to_string(),
            message: err.to_string(),
        },
        other => StoreError::database(operation, None, other.to_string()),
    }
}
