pub mod byte_array;
pub mod cancels;
pub mod cutoffs;
pub mod fills;
pub mod orders;
pub mod pending_transactions;
pub mod ring_mined;

use {
    byte_array::ByteArray,
    sqlx::{Executor, PgPool},
};

// Design:
//
// Functions running several statements that have to succeed or fail together
// take `&mut PgTransaction`, everything else takes `&mut PgConnection` so the
// caller decides whether it becomes part of a bigger transaction. The
// parameter is called `ex` after the `Executor` trait. Callers commit.
//
// Postgres tests open a transaction, run all queries in it and never commit,
// so they can run in parallel without clearing tables first.

pub type PgTransaction<'a> = sqlx::Transaction<'a, sqlx::Postgres>;

/// The names of all tables we use in the db.
pub const TABLES: &[&str] = &[
    "orders",
    "fills",
    "cancels",
    "cutoffs",
    "cutoff_pairs",
    "ring_mined",
    "pending_transactions",
];

/// Delete all data in the database. Only used by tests.
#[allow(non_snake_case)]
pub async fn clear_DANGER_(ex: &mut PgTransaction<'_>) -> sqlx::Result<()> {
    for table in TABLES {
        ex.execute(format!("TRUNCATE {table};").as_str()).await?;
    }
    Ok(())
}

/// Like above but more ergonomic for some tests that use a pool.
#[allow(non_snake_case)]
pub async fn clear_DANGER(pool: &PgPool) -> sqlx::Result<()> {
    let mut transaction = pool.begin().await?;
    clear_DANGER_(&mut transaction).await?;
    transaction.commit().await
}

/// Unique constraint violations mean the row was written before.
pub fn is_duplicate_record_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(err) if err.code().as_deref() == Some("23505")
    )
}

pub type Address = ByteArray<20>;
pub type TransactionHash = ByteArray<32>;
pub type OrderHash = ByteArray<32>;

/// Status column shared by the orders and pending transactions tables.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, sqlx::Type)]
#[sqlx(type_name = "OrderStatus")]
#[sqlx(rename_all = "snake_case")]
pub enum OrderStatus {
    Unknown,
    #[default]
    New,
    Partial,
    Finished,
    Cancel,
    Cutoff,
    FlexCancel,
    Pending,
    Cancelling,
    Cutoffing,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, sqlx::Type)]
#[sqlx(type_name = "TxStatus")]
#[sqlx(rename_all = "lowercase")]
pub enum TxStatus {
    #[default]
    Pending,
    Success,
    Failed,
}
