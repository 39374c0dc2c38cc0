//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// This creates the job table, its fields and indexes. Safe to run on every start.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    db.query(JOB_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Job table schema. Timestamps are microseconds since the Unix epoch; payload,
/// result and error are stored as JSON text.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS job_id ON job TYPE string;
DEFINE FIELD IF NOT EXISTS job_type ON job TYPE string;
DEFINE FIELD IF NOT EXISTS priority ON job TYPE string;
DEFINE FIELD IF NOT EXISTS priority_rank ON job TYPE int;
DEFINE FIELD IF NOT EXISTS payload ON job TYPE string;
DEFINE FIELD IF NOT EXISTS status ON job TYPE string;
DEFINE FIELD IF NOT EXISTS progress ON job TYPE int;
DEFINE FIELD IF NOT EXISTS attempts ON job TYPE int;
DEFINE FIELD IF NOT EXISTS max_retries ON job TYPE int;
DEFINE FIELD IF NOT EXISTS scheduled_for ON job TYPE int;
DEFINE FIELD IF NOT EXISTS created_at ON job TYPE int;
DEFINE FIELD IF NOT EXISTS started_at ON job TYPE option<int>;
DEFINE FIELD IF NOT EXISTS finished_at ON job TYPE option<int>;
DEFINE FIELD IF NOT EXISTS result ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS error ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS correlation_id ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS worker_id ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS lease_expires_at ON job TYPE option<int>;
DEFINE FIELD IF NOT EXISTS cancel_requested ON job TYPE bool;
DEFINE FIELD IF NOT EXISTS updated_at ON job TYPE int;
DEFINE FIELD IF NOT EXISTS version ON job TYPE int;

-- Indexes for claim polling, listing and lease recovery
DEFINE INDEX IF NOT EXISTS job_status ON job FIELDS status;
DEFINE INDEX IF NOT EXISTS job_type ON job FIELDS job_type;
DEFINE INDEX IF NOT EXISTS job_created ON job FIELDS created_at;
DEFINE INDEX IF NOT EXISTS job_claimable ON job FIELDS status, scheduled_for;
DEFINE INDEX IF NOT EXISTS job_lease ON job FIELDS status, lease_expires_at;
"#;
