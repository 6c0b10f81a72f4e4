use sqlx::SqlitePool;

// Ownership edges cascade so that removing a validator takes its unsigned
// history with it. Content-addressed tables are unique over every column.
const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS validator_group (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        address TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        is_eligible INTEGER NOT NULL,
        commission TEXT NOT NULL,
        last_slashed TEXT NOT NULL,
        domain TEXT NOT NULL,
        vote_signer TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS group_votes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id INTEGER NOT NULL UNIQUE REFERENCES validator_group(id) ON DELETE CASCADE,
        total TEXT NOT NULL,
        active TEXT NOT NULL,
        pending TEXT NOT NULL,
        receivable TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS validator (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id INTEGER REFERENCES validator_group(id) ON DELETE CASCADE,
        position INTEGER,
        address TEXT NOT NULL UNIQUE,
        vote_signer TEXT,
        elected INTEGER,
        score TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS unsigned (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        block_num INTEGER NOT NULL,
        validator_id INTEGER NOT NULL REFERENCES validator(id) ON DELETE CASCADE,
        UNIQUE (block_num, validator_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS unsigned_block_num ON unsigned (block_num)",
    r#"
    CREATE TABLE IF NOT EXISTS proposer (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        address TEXT NOT NULL,
        deposit TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        UNIQUE (address, deposit, timestamp)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vote_tally (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        total TEXT NOT NULL,
        yes TEXT NOT NULL,
        no TEXT NOT NULL,
        abstain TEXT NOT NULL,
        UNIQUE (total, yes, no, abstain)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dequeue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        dequeued INTEGER NOT NULL,
        queue_index INTEGER NOT NULL,
        address TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        UNIQUE (dequeued, queue_index, address, timestamp)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS approval (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        approved INTEGER NOT NULL,
        address TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        UNIQUE (approved, address, timestamp)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS execution (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sender TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        block_number TEXT NOT NULL,
        tx_hash TEXT NOT NULL,
        UNIQUE (sender, timestamp, block_number, tx_hash)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS proposal (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        proposal_id INTEGER NOT NULL UNIQUE,
        stage TEXT NOT NULL,
        timespan TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        upvotes TEXT NOT NULL,
        proposer_id INTEGER NOT NULL REFERENCES proposer(id),
        vote_tally_id INTEGER NOT NULL REFERENCES vote_tally(id),
        dequeue_id INTEGER NOT NULL REFERENCES dequeue(id),
        approval_id INTEGER NOT NULL REFERENCES approval(id),
        execution_id INTEGER NOT NULL REFERENCES execution(id)
    )
    "#,
];

pub(super) async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
