//! Relational persistence for snapshots. Every write compares the incoming
//! snapshot with what is stored and only touches rows that differ.

mod content;
mod rows;
mod schema;

use content::intern;
use rows::{
    address_column, commission_column, parse_address, to_integer, GroupRow, GroupVotesRow,
    ProposalDetailRow, ProposalRow, ValidatorRecordRow, ValidatorRow,
};
use snapshot_lib::group::GroupSnapshot;
use snapshot_lib::proposal::ProposalSnapshot;
use snapshot_lib::{Address, BlockHeight, ProposalId};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub use rows::ValidatorRecord;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored {column} holds invalid value {value:?}")]
    InvalidColumn { column: &'static str, value: String },
    #[error("{what} {value} does not fit in a database integer")]
    OutOfRange { what: &'static str, value: u64 },
}

/// Rows touched by one [`ReconciliationStore::upsert_group`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupWrites {
    pub group: bool,
    pub votes: bool,
    pub validators_written: usize,
    pub validators_removed: usize,
}

impl GroupWrites {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// Rows touched by one [`ReconciliationStore::upsert_proposal`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProposalWrites {
    pub proposal: bool,
    pub new_sub_entities: usize,
}

impl ProposalWrites {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone)]
pub struct ReconciliationStore {
    pool: SqlitePool,
}

const VALIDATOR_COLUMNS: &str = "group_id, position, address, vote_signer, elected, score";

/// How long a writer waits for another process or pool connection to release
/// the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const PROPOSAL_DETAIL: &str = r#"
    SELECT p.proposal_id, p.stage, p.timespan, p.title, p.description, p.upvotes,
           pr.address AS proposer_address, pr.deposit AS proposer_deposit,
           pr.timestamp AS proposer_timestamp,
           t.total AS tally_total, t.yes AS tally_yes, t.no AS tally_no,
           t.abstain AS tally_abstain,
           d.dequeued, d.queue_index, d.address AS dequeue_address,
           d.timestamp AS dequeue_timestamp,
           a.approved, a.address AS approval_address, a.timestamp AS approval_timestamp,
           e.sender AS execution_sender, e.timestamp AS execution_timestamp,
           e.block_number AS execution_block_number, e.tx_hash AS execution_tx_hash
    FROM proposal p
    JOIN proposer pr ON pr.id = p.proposer_id
    JOIN vote_tally t ON t.id = p.vote_tally_id
    JOIN dequeue d ON d.id = p.dequeue_id
    JOIN approval a ON a.id = p.approval_id
    JOIN execution e ON e.id = p.execution_id
    WHERE p.proposal_id = ?
"#;

impl ReconciliationStore {
    /// Opens (creating if needed) the database at `url` and brings its schema
    /// up to date.
    ///
    /// Writes run as `BEGIN IMMEDIATE` transactions, so several handles on one
    /// file serialise behind the busy timeout. File databases use WAL so reads
    /// proceed while a write is in progress.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        // every connection to an in-memory database gets its own database
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 8 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        schema::migrate(&pool).await?;
        debug!(url, "store ready");
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, StorageError> {
        Self::connect("sqlite::memory:").await
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Reconciles one group, its vote snapshot and its member list in a single
    /// transaction. Members missing from the snapshot are deleted along with
    /// their unsigned history; members moving in from another group are
    /// re-parented.
    pub async fn upsert_group(&self, group: &GroupSnapshot) -> Result<GroupWrites, StorageError> {
        let mut conn = begin_immediate(&self.pool).await?;
        let result = reconcile_group(&mut conn, group).await;
        let writes = finish(conn, result).await?;
        debug!(address = %group.address, ?writes, "group reconciled");
        Ok(writes)
    }

    /// Stores a proposal, reusing existing sub-entity rows with identical
    /// content. Sub-entity rows are never updated.
    pub async fn upsert_proposal(
        &self,
        proposal: &ProposalSnapshot,
    ) -> Result<ProposalWrites, StorageError> {
        let proposal_id = to_integer("proposal id", proposal.id)?;
        let mut conn = begin_immediate(&self.pool).await?;
        let result = reconcile_proposal(&mut conn, proposal_id, proposal).await;
        let writes = finish(conn, result).await?;
        debug!(proposal_id = proposal.id, ?writes, "proposal reconciled");
        Ok(writes)
    }

    /// Id of the validator row for `address`, creating a bare row if the
    /// validator has never been seen.
    pub async fn upsert_validator(&self, address: Address) -> Result<i64, StorageError> {
        let mut conn = self.pool.acquire().await?;
        validator_id(&mut conn, address).await
    }

    /// Records that `address` did not sign the block at `height`. Recording the
    /// same pair again is a no-op. Returns the validator's id.
    pub async fn save_unsigned_validator(
        &self,
        height: BlockHeight,
        address: Address,
    ) -> Result<i64, StorageError> {
        let height = to_integer("block height", height)?;
        let mut conn = begin_immediate(&self.pool).await?;
        let result = record_unsigned(&mut conn, height, address).await;
        finish(conn, result).await
    }

    pub async fn get_unsigned_validators(
        &self,
        height: BlockHeight,
    ) -> Result<Vec<Address>, StorageError> {
        let height = to_integer("block height", height)?;
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT v.address FROM unsigned u
            JOIN validator v ON v.id = u.validator_id
            WHERE u.block_num = ?
            ORDER BY u.id
            "#,
        )
        .bind(height)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|address| parse_address("validator.address", address))
        .collect()
    }

    /// Stored groups among `addresses`, in request order. Unknown addresses are
    /// skipped.
    pub async fn get_group_info(
        &self,
        addresses: &[Address],
    ) -> Result<Vec<GroupSnapshot>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        let mut groups = Vec::with_capacity(addresses.len());
        for address in addresses {
            let Some(row) = sqlx::query_as::<_, GroupRow>(
                "SELECT id, address, name, is_eligible, commission, last_slashed, domain, vote_signer
                 FROM validator_group WHERE address = ?",
            )
            .bind(address_column(address))
            .fetch_optional(&mut *conn)
            .await?
            else {
                continue;
            };

            let votes = sqlx::query_as::<_, GroupVotesRow>(
                "SELECT total, active, pending, receivable FROM group_votes WHERE group_id = ?",
            )
            .bind(row.id)
            .fetch_optional(&mut *conn)
            .await?
            .map(Into::into)
            .unwrap_or_default();
            let members = sqlx::query_as::<_, ValidatorRow>(&format!(
                "SELECT {VALIDATOR_COLUMNS} FROM validator WHERE group_id = ? ORDER BY position"
            ))
            .bind(row.id)
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .map(ValidatorRow::into_snapshot)
            .collect::<Result<Vec<_>, _>>()?;

            groups.push(row.into_snapshot(votes, members)?);
        }
        Ok(groups)
    }

    pub async fn get_validator_info(
        &self,
        addresses: &[Address],
    ) -> Result<Vec<ValidatorRecord>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        let mut validators = Vec::with_capacity(addresses.len());
        for address in addresses {
            let row = sqlx::query_as::<_, ValidatorRecordRow>(
                r#"
                SELECT v.address, g.address AS group_address, v.position, v.vote_signer,
                       v.elected, v.score
                FROM validator v
                LEFT JOIN validator_group g ON g.id = v.group_id
                WHERE v.address = ?
                "#,
            )
            .bind(address_column(address))
            .fetch_optional(&mut *conn)
            .await?;
            if let Some(row) = row {
                validators.push(row.try_into()?);
            }
        }
        Ok(validators)
    }

    pub async fn get_proposal_info(
        &self,
        ids: &[ProposalId],
    ) -> Result<Vec<ProposalSnapshot>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        let mut proposals = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query_as::<_, ProposalDetailRow>(PROPOSAL_DETAIL)
                .bind(to_integer("proposal id", *id)?)
                .fetch_optional(&mut *conn)
                .await?;
            if let Some(row) = row {
                proposals.push(row.try_into()?);
            }
        }
        Ok(proposals)
    }
}

/// Opens a write transaction with `BEGIN IMMEDIATE`. The write lock is taken
/// before the first read, so a second writer waits out the busy timeout
/// instead of failing to upgrade its read lock.
///
/// Callers must hand the connection to [`finish`]; a write abandoned halfway
/// leaves the transaction open on a pooled connection.
async fn begin_immediate(pool: &SqlitePool) -> Result<PoolConnection<Sqlite>, StorageError> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(conn)
}

/// Commits on `Ok` and rolls back on `Err`.
async fn finish<T>(
    mut conn: PoolConnection<Sqlite>,
    result: Result<T, StorageError>,
) -> Result<T, StorageError> {
    let statement = if result.is_ok() { "COMMIT" } else { "ROLLBACK" };
    let outcome = sqlx::query(statement).execute(&mut *conn).await;
    if let Err(error) = &outcome {
        // the transaction state is unknown, so the connection is not reused
        warn!(statement, %error, "could not end write transaction");
        drop(conn.detach());
    }
    match (result, outcome) {
        (Ok(value), Ok(_)) => Ok(value),
        (Ok(_), Err(error)) => Err(error.into()),
        (Err(error), _) => Err(error),
    }
}

async fn reconcile_group(
    tx: &mut SqliteConnection,
    group: &GroupSnapshot,
) -> Result<GroupWrites, StorageError> {
    let mut writes = GroupWrites::default();
    let address = address_column(&group.address);

    let stored = sqlx::query_as::<_, GroupRow>(
        "SELECT id, address, name, is_eligible, commission, last_slashed, domain, vote_signer
         FROM validator_group WHERE address = ?",
    )
    .bind(&address)
    .fetch_optional(&mut *tx)
    .await?;

    let group_id = match stored {
        Some(row) if row.matches(group) => row.id,
        _ => {
            writes.group = true;
            sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO validator_group
                    (address, name, is_eligible, commission, last_slashed, domain, vote_signer)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (address) DO UPDATE SET
                    name = excluded.name,
                    is_eligible = excluded.is_eligible,
                    commission = excluded.commission,
                    last_slashed = excluded.last_slashed,
                    domain = excluded.domain,
                    vote_signer = excluded.vote_signer
                RETURNING id
                "#,
            )
            .bind(&address)
            .bind(&group.name)
            .bind(group.is_eligible)
            .bind(commission_column(&group.commission))
            .bind(&group.last_slashed)
            .bind(&group.domain)
            .bind(address_column(&group.vote_signer))
            .fetch_one(&mut *tx)
            .await?
        }
    };

    let votes = sqlx::query_as::<_, GroupVotesRow>(
        "SELECT total, active, pending, receivable FROM group_votes WHERE group_id = ?",
    )
    .bind(group_id)
    .fetch_optional(&mut *tx)
    .await?;
    if !votes.is_some_and(|votes| votes.matches(&group.votes)) {
        writes.votes = true;
        sqlx::query(
            r#"
            INSERT INTO group_votes (group_id, total, active, pending, receivable)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (group_id) DO UPDATE SET
                total = excluded.total,
                active = excluded.active,
                pending = excluded.pending,
                receivable = excluded.receivable
            "#,
        )
        .bind(group_id)
        .bind(&group.votes.total)
        .bind(&group.votes.active)
        .bind(&group.votes.pending)
        .bind(&group.votes.receivable)
        .execute(&mut *tx)
        .await?;
    }

    let current = group
        .members
        .iter()
        .map(|member| address_column(&member.address))
        .collect::<Vec<_>>();
    let previous = sqlx::query_scalar::<_, String>("SELECT address FROM validator WHERE group_id = ?")
        .bind(group_id)
        .fetch_all(&mut *tx)
        .await?;
    for departed in previous.iter().filter(|address| !current.contains(*address)) {
        sqlx::query("DELETE FROM validator WHERE address = ?")
            .bind(departed)
            .execute(&mut *tx)
            .await?;
        writes.validators_removed += 1;
    }

    for (position, (member, member_address)) in group.members.iter().zip(&current).enumerate() {
        let position = position as i64;
        let stored = sqlx::query_as::<_, ValidatorRow>(&format!(
            "SELECT {VALIDATOR_COLUMNS} FROM validator WHERE address = ?"
        ))
        .bind(member_address)
        .fetch_optional(&mut *tx)
        .await?;
        if stored.is_some_and(|row| row.matches(group_id, position, member)) {
            continue;
        }
        sqlx::query(
            r#"
            INSERT INTO validator (group_id, position, address, vote_signer, elected, score)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (address) DO UPDATE SET
                group_id = excluded.group_id,
                position = excluded.position,
                vote_signer = excluded.vote_signer,
                elected = excluded.elected,
                score = excluded.score
            "#,
        )
        .bind(group_id)
        .bind(position)
        .bind(member_address)
        .bind(address_column(&member.vote_signer))
        .bind(member.elected)
        .bind(&member.score)
        .execute(&mut *tx)
        .await?;
        writes.validators_written += 1;
    }

    Ok(writes)
}

async fn reconcile_proposal(
    tx: &mut SqliteConnection,
    proposal_id: i64,
    proposal: &ProposalSnapshot,
) -> Result<ProposalWrites, StorageError> {
    let mut writes = ProposalWrites::default();

    let mut ids = [0i64; 5];
    let interned = [
        intern(&mut *tx, &proposal.proposer).await?,
        intern(&mut *tx, &proposal.votes).await?,
        intern(&mut *tx, &proposal.dequeue).await?,
        intern(&mut *tx, &proposal.approval).await?,
        intern(&mut *tx, &proposal.execution).await?,
    ];
    for (slot, (id, inserted)) in ids.iter_mut().zip(interned) {
        *slot = id;
        writes.new_sub_entities += usize::from(inserted);
    }
    let [proposer_id, vote_tally_id, dequeue_id, approval_id, execution_id] = ids;

    let row = ProposalRow {
        stage: proposal.stage.to_string(),
        timespan: proposal.timespan.clone(),
        title: proposal.title.clone(),
        description: proposal.description.clone(),
        upvotes: proposal.upvotes.clone(),
        proposer_id,
        vote_tally_id,
        dequeue_id,
        approval_id,
        execution_id,
    };
    let stored = sqlx::query_as::<_, ProposalRow>(
        r#"
        SELECT stage, timespan, title, description, upvotes,
               proposer_id, vote_tally_id, dequeue_id, approval_id, execution_id
        FROM proposal WHERE proposal_id = ?
        "#,
    )
    .bind(proposal_id)
    .fetch_optional(&mut *tx)
    .await?;

    if stored.as_ref() != Some(&row) {
        writes.proposal = true;
        sqlx::query(
            r#"
            INSERT INTO proposal
                (proposal_id, stage, timespan, title, description, upvotes,
                 proposer_id, vote_tally_id, dequeue_id, approval_id, execution_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (proposal_id) DO UPDATE SET
                stage = excluded.stage,
                timespan = excluded.timespan,
                title = excluded.title,
                description = excluded.description,
                upvotes = excluded.upvotes,
                proposer_id = excluded.proposer_id,
                vote_tally_id = excluded.vote_tally_id,
                dequeue_id = excluded.dequeue_id,
                approval_id = excluded.approval_id,
                execution_id = excluded.execution_id
            "#,
        )
        .bind(proposal_id)
        .bind(&row.stage)
        .bind(&row.timespan)
        .bind(&row.title)
        .bind(&row.description)
        .bind(&row.upvotes)
        .bind(row.proposer_id)
        .bind(row.vote_tally_id)
        .bind(row.dequeue_id)
        .bind(row.approval_id)
        .bind(row.execution_id)
        .execute(&mut *tx)
        .await?;
    }

    Ok(writes)
}

async fn record_unsigned(
    conn: &mut SqliteConnection,
    height: i64,
    address: Address,
) -> Result<i64, StorageError> {
    let id = validator_id(&mut *conn, address).await?;
    sqlx::query(
        "INSERT INTO unsigned (block_num, validator_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
    )
    .bind(height)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(id)
}

async fn validator_id(conn: &mut SqliteConnection, address: Address) -> Result<i64, StorageError> {
    let address = address_column(&address);
    let inserted = sqlx::query_scalar::<_, i64>(
        "INSERT INTO validator (address) VALUES (?) ON CONFLICT (address) DO NOTHING RETURNING id",
    )
    .bind(&address)
    .fetch_optional(&mut *conn)
    .await?;
    match inserted {
        Some(id) => Ok(id),
        None => Ok(
            sqlx::query_scalar::<_, i64>("SELECT id FROM validator WHERE address = ?")
                .bind(&address)
                .fetch_one(&mut *conn)
                .await?,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use snapshot_lib::group::{GroupVotes, ValidatorSnapshot};
    use snapshot_lib::proposal::{
        ApprovalEvent, DequeueEvent, ExecutionEvent, ProposalStage, Proposer, VoteTally, UNKNOWN,
    };

    fn address(byte: u8) -> Address {
        Address::with_last_byte(byte)
    }

    fn member(byte: u8, elected: bool) -> ValidatorSnapshot {
        ValidatorSnapshot {
            address: address(byte),
            vote_signer: address(byte + 100),
            elected,
            score: "1000000".to_string(),
        }
    }

    fn group(byte: u8, members: Vec<ValidatorSnapshot>) -> GroupSnapshot {
        GroupSnapshot {
            address: address(byte),
            name: format!("group {byte}"),
            is_eligible: true,
            commission: dec!(0.1),
            last_slashed: "0".to_string(),
            domain: "validators.example".to_string(),
            vote_signer: address(byte + 50),
            votes: GroupVotes {
                total: "300".to_string(),
                active: "200".to_string(),
                pending: "100".to_string(),
                receivable: "1000".to_string(),
            },
            members,
        }
    }

    fn proposal(id: u64, yes: &str) -> ProposalSnapshot {
        ProposalSnapshot {
            id,
            stage: ProposalStage::Referendum,
            timespan: UNKNOWN.to_string(),
            title: UNKNOWN.to_string(),
            description: format!("https://example.org/cgp-{id}.md"),
            upvotes: "0".to_string(),
            proposer: Proposer {
                address: address(0xaa),
                deposit: "100".to_string(),
                timestamp: "1650000000".to_string(),
            },
            votes: VoteTally {
                total: yes.to_string(),
                yes: yes.to_string(),
                no: "0".to_string(),
                abstain: "0".to_string(),
            },
            dequeue: DequeueEvent {
                dequeued: true,
                index: Some(id),
                address: UNKNOWN.to_string(),
                timestamp: UNKNOWN.to_string(),
            },
            approval: ApprovalEvent {
                approved: false,
                address: UNKNOWN.to_string(),
                timestamp: UNKNOWN.to_string(),
            },
            execution: ExecutionEvent::unknown(),
        }
    }

    async fn count(store: &ReconciliationStore, table: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&store.pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn schema_creation_is_idempotent() {
        let store = ReconciliationStore::in_memory().await.unwrap();
        schema::migrate(&store.pool).await.unwrap();
        assert_eq!(count(&store, "validator_group").await, 0);
    }

    #[tokio::test]
    async fn identical_group_snapshot_writes_nothing() {
        let store = ReconciliationStore::in_memory().await.unwrap();
        let snapshot = group(1, vec![member(10, true), member(11, false)]);

        let first = store.upsert_group(&snapshot).await.unwrap();
        assert_eq!(
            first,
            GroupWrites {
                group: true,
                votes: true,
                validators_written: 2,
                validators_removed: 0,
            }
        );
        let second = store.upsert_group(&snapshot).await.unwrap();
        assert!(second.is_noop(), "{second:?}");
    }

    #[tokio::test]
    async fn stored_group_reads_back_as_written() {
        let store = ReconciliationStore::in_memory().await.unwrap();
        let snapshot = group(1, vec![member(12, false), member(10, true), member(11, true)]);
        store.upsert_group(&snapshot).await.unwrap();

        let stored = store
            .get_group_info(&[address(1), address(99)])
            .await
            .unwrap();
        assert_eq!(stored, vec![snapshot]);
    }

    #[tokio::test]
    async fn changes_touch_only_what_changed() {
        let store = ReconciliationStore::in_memory().await.unwrap();
        let mut snapshot = group(1, vec![member(10, true), member(11, false)]);
        store.upsert_group(&snapshot).await.unwrap();

        snapshot.votes.active = "250".to_string();
        snapshot.members[1].elected = true;
        let writes = store.upsert_group(&snapshot).await.unwrap();
        assert_eq!(
            writes,
            GroupWrites {
                group: false,
                votes: true,
                validators_written: 1,
                validators_removed: 0,
            }
        );

        snapshot.commission = dec!(0.15);
        let writes = store.upsert_group(&snapshot).await.unwrap();
        assert!(writes.group && !writes.votes);
        assert_eq!(
            store.get_group_info(&[address(1)]).await.unwrap()[0].commission,
            dec!(0.15)
        );
    }

    #[tokio::test]
    async fn departed_members_are_deleted_with_their_history() {
        let store = ReconciliationStore::in_memory().await.unwrap();
        store
            .upsert_group(&group(1, vec![member(10, true), member(11, true)]))
            .await
            .unwrap();
        store.save_unsigned_validator(500, address(11)).await.unwrap();
        store.save_unsigned_validator(500, address(10)).await.unwrap();

        let writes = store
            .upsert_group(&group(1, vec![member(10, true)]))
            .await
            .unwrap();
        assert_eq!(writes.validators_removed, 1);
        assert_eq!(writes.validators_written, 0);
        assert_eq!(
            store.get_unsigned_validators(500).await.unwrap(),
            vec![address(10)]
        );
        assert!(store
            .get_validator_info(&[address(11)])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn members_moving_groups_keep_their_identity() {
        let store = ReconciliationStore::in_memory().await.unwrap();
        store
            .upsert_group(&group(1, vec![member(10, true)]))
            .await
            .unwrap();
        let id = store.upsert_validator(address(10)).await.unwrap();
        store.save_unsigned_validator(7, address(10)).await.unwrap();

        let writes = store
            .upsert_group(&group(2, vec![member(10, true)]))
            .await
            .unwrap();
        assert_eq!(writes.validators_written, 1);

        let record = store.get_validator_info(&[address(10)]).await.unwrap();
        assert_eq!(record[0].group, Some(address(2)));
        assert_eq!(store.upsert_validator(address(10)).await.unwrap(), id);
        assert_eq!(store.get_unsigned_validators(7).await.unwrap(), vec![address(10)]);
    }

    #[tokio::test]
    async fn validator_ids_are_stable() {
        let store = ReconciliationStore::in_memory().await.unwrap();
        let id = store.upsert_validator(address(3)).await.unwrap();
        assert_eq!(store.upsert_validator(address(3)).await.unwrap(), id);
        assert_eq!(store.save_unsigned_validator(10, address(3)).await.unwrap(), id);
        assert_eq!(store.save_unsigned_validator(11, address(3)).await.unwrap(), id);
        assert_ne!(store.upsert_validator(address(4)).await.unwrap(), id);

        let record = &store.get_validator_info(&[address(3)]).await.unwrap()[0];
        assert_eq!(record.group, None);
        assert_eq!(record.vote_signer, None);
    }

    #[tokio::test]
    async fn replayed_unsigned_records_are_not_duplicated() {
        let store = ReconciliationStore::in_memory().await.unwrap();
        for _ in 0..3 {
            store.save_unsigned_validator(42, address(1)).await.unwrap();
            store.save_unsigned_validator(42, address(2)).await.unwrap();
        }
        assert_eq!(count(&store, "unsigned").await, 2);
        assert_eq!(
            store.get_unsigned_validators(42).await.unwrap(),
            vec![address(1), address(2)]
        );
        assert!(store.get_unsigned_validators(43).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn identical_tallies_share_a_row() {
        let store = ReconciliationStore::in_memory().await.unwrap();
        let first = store.upsert_proposal(&proposal(0, "10")).await.unwrap();
        assert_eq!(
            first,
            ProposalWrites {
                proposal: true,
                new_sub_entities: 5,
            }
        );
        // proposer, tally, approval and execution are shared; the dequeue index differs
        let second = store.upsert_proposal(&proposal(1, "10")).await.unwrap();
        assert_eq!(second.new_sub_entities, 1);
        assert_eq!(count(&store, "vote_tally").await, 1);

        let changed = store.upsert_proposal(&proposal(1, "25")).await.unwrap();
        assert_eq!(
            changed,
            ProposalWrites {
                proposal: true,
                new_sub_entities: 1,
            }
        );
        assert_eq!(count(&store, "vote_tally").await, 2);

        let stored = store.get_proposal_info(&[0, 1]).await.unwrap();
        assert_eq!(stored[0].votes.yes, "10");
        assert_eq!(stored[1].votes.yes, "25");
    }

    #[tokio::test]
    async fn unchanged_proposal_is_not_rewritten() {
        let store = ReconciliationStore::in_memory().await.unwrap();
        let snapshot = proposal(3, "10");
        store.upsert_proposal(&snapshot).await.unwrap();
        assert!(store.upsert_proposal(&snapshot).await.unwrap().is_noop());

        let mut undequeued = proposal(4, "10");
        undequeued.dequeue = DequeueEvent {
            dequeued: false,
            index: None,
            address: UNKNOWN.to_string(),
            timestamp: UNKNOWN.to_string(),
        };
        store.upsert_proposal(&undequeued).await.unwrap();

        assert_eq!(
            store.get_proposal_info(&[3, 4, 5]).await.unwrap(),
            vec![snapshot, undequeued]
        );
    }

    #[tokio::test]
    async fn failed_group_write_leaves_previous_state() {
        let store = ReconciliationStore::in_memory().await.unwrap();
        let mut old = group(1, vec![member(10, true)]);
        old.name = "old".to_string();
        store.upsert_group(&old).await.unwrap();
        store.save_unsigned_validator(500, address(10)).await.unwrap();

        sqlx::query(&format!(
            "CREATE TRIGGER reject_member BEFORE INSERT ON validator
             WHEN NEW.address = '{}'
             BEGIN SELECT RAISE(ABORT, 'rejected'); END",
            address_column(&address(11))
        ))
        .execute(&store.pool)
        .await
        .unwrap();

        let mut new = group(1, vec![member(11, true)]);
        new.name = "new".to_string();
        new.votes.active = "250".to_string();
        assert!(store.upsert_group(&new).await.is_err());

        assert_eq!(store.get_group_info(&[address(1)]).await.unwrap(), vec![old.clone()]);
        assert_eq!(
            store.get_unsigned_validators(500).await.unwrap(),
            vec![address(10)]
        );
        // the pooled connection is usable again
        assert!(store.upsert_group(&old).await.unwrap().is_noop());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handles_sharing_a_file_write_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("monitor.db").display());
        let first = ReconciliationStore::connect(&url).await.unwrap();
        let second = ReconciliationStore::connect(&url).await.unwrap();

        for round in 0..20u8 {
            let left = group(1, vec![member(10, round % 2 == 0), member(11, true)]);
            let mut right = group(1, vec![member(11, true), member(12, round % 3 == 0)]);
            right.name = format!("renamed {round}");
            let (left, right, unsigned) = tokio::join!(
                first.upsert_group(&left),
                second.upsert_group(&right),
                second.save_unsigned_validator(u64::from(round), address(20)),
            );
            left.unwrap();
            right.unwrap();
            unsigned.unwrap();
        }

        assert_eq!(count(&first, "validator_group").await, 1);
        assert_eq!(count(&first, "unsigned").await, 20);
        assert_eq!(count(&second, "group_votes").await, 1);
    }
}
