//! Proposal sub-entities are immutable rows identified by their full content:
//! two proposals carrying the same tuple reference the same row.

use super::rows::address_column;
use super::StorageError;
use snapshot_lib::proposal::{ApprovalEvent, DequeueEvent, ExecutionEvent, Proposer, VoteTally};
use sqlx::SqliteConnection;

pub(super) enum Column<'a> {
    Text(&'a str),
    Owned(String),
    Integer(i64),
}

pub(super) trait ContentAddressed {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];

    /// Values in `COLUMNS` order.
    fn values(&self) -> Vec<Column<'_>>;
}

impl ContentAddressed for Proposer {
    const TABLE: &'static str = "proposer";
    const COLUMNS: &'static [&'static str] = &["address", "deposit", "timestamp"];

    fn values(&self) -> Vec<Column<'_>> {
        vec![
            Column::Owned(address_column(&self.address)),
            Column::Text(&self.deposit),
            Column::Text(&self.timestamp),
        ]
    }
}

impl ContentAddressed for VoteTally {
    const TABLE: &'static str = "vote_tally";
    const COLUMNS: &'static [&'static str] = &["total", "yes", "no", "abstain"];

    fn values(&self) -> Vec<Column<'_>> {
        vec![
            Column::Text(&self.total),
            Column::Text(&self.yes),
            Column::Text(&self.no),
            Column::Text(&self.abstain),
        ]
    }
}

impl ContentAddressed for DequeueEvent {
    const TABLE: &'static str = "dequeue";
    const COLUMNS: &'static [&'static str] = &["dequeued", "queue_index", "address", "timestamp"];

    fn values(&self) -> Vec<Column<'_>> {
        // NULLs never collide under UNIQUE, so an absent index is stored as -1
        let index = self
            .index
            .map_or(-1, |index| i64::try_from(index).unwrap_or(i64::MAX));
        vec![
            Column::Integer(self.dequeued.into()),
            Column::Integer(index),
            Column::Text(&self.address),
            Column::Text(&self.timestamp),
        ]
    }
}

impl ContentAddressed for ApprovalEvent {
    const TABLE: &'static str = "approval";
    const COLUMNS: &'static [&'static str] = &["approved", "address", "timestamp"];

    fn values(&self) -> Vec<Column<'_>> {
        vec![
            Column::Integer(self.approved.into()),
            Column::Text(&self.address),
            Column::Text(&self.timestamp),
        ]
    }
}

impl ContentAddressed for ExecutionEvent {
    const TABLE: &'static str = "execution";
    const COLUMNS: &'static [&'static str] = &["sender", "timestamp", "block_number", "tx_hash"];

    fn values(&self) -> Vec<Column<'_>> {
        vec![
            Column::Text(&self.from),
            Column::Text(&self.timestamp),
            Column::Text(&self.block_number),
            Column::Text(&self.tx_hash),
        ]
    }
}

macro_rules! bind_all {
    ($query:expr, $values:expr) => {{
        let mut query = $query;
        for value in $values {
            query = match value {
                Column::Text(text) => query.bind(*text),
                Column::Owned(text) => query.bind(text.as_str()),
                Column::Integer(integer) => query.bind(*integer),
            };
        }
        query
    }};
}

/// Returns the id of the row holding `entity`, inserting it first if no such
/// row exists. The flag is true when a row was inserted.
pub(super) async fn intern<T: ContentAddressed>(
    conn: &mut SqliteConnection,
    entity: &T,
) -> Result<(i64, bool), StorageError> {
    let values = entity.values();
    let columns = T::COLUMNS.join(", ");
    let placeholders = vec!["?"; T::COLUMNS.len()].join(", ");

    let insert = format!(
        "INSERT INTO {} ({columns}) VALUES ({placeholders}) ON CONFLICT DO NOTHING RETURNING id",
        T::TABLE
    );
    let inserted = bind_all!(sqlx::query_scalar::<_, i64>(&insert), &values)
        .fetch_optional(&mut *conn)
        .await?;
    if let Some(id) = inserted {
        return Ok((id, true));
    }

    let filter = T::COLUMNS
        .iter()
        .map(|column| format!("{column} = ?"))
        .collect::<Vec<_>>()
        .join(" AND ");
    let select = format!("SELECT id FROM {} WHERE {filter}", T::TABLE);
    let id = bind_all!(sqlx::query_scalar::<_, i64>(&select), &values)
        .fetch_one(&mut *conn)
        .await?;
    Ok((id, false))
}
