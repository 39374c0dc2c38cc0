mod common;

use std::sync::Arc;

use common::TestResult;
use jobs_db::MemoryJobStore;

fn store() -> Arc<MemoryJobStore> {
    Arc::new(MemoryJobStore::new())
}

#[tokio::test]
async fn test_claim_is_exclusive() -> TestResult {
    common::claim_is_exclusive(store()).await
}

#[tokio::test]
async fn test_claims_follow_priority() -> TestResult {
    common::claims_follow_priority(store()).await
}

#[tokio::test]
async fn test_expired_leases_are_requeued() -> TestResult {
    common::expired_leases_are_requeued(store()).await
}

#[tokio::test]
async fn test_cancelled_pending_job_is_never_claimed() -> TestResult {
    common::cancelled_pending_job_is_never_claimed(store()).await
}

#[tokio::test]
async fn test_attempts_are_capped() -> TestResult {
    common::attempts_are_capped(store()).await
}

#[tokio::test]
async fn test_progress_and_completion() -> TestResult {
    common::progress_and_completion(store()).await
}

#[tokio::test]
async fn test_query_count_and_purge() -> TestResult {
    common::query_count_and_purge(store()).await
}

#[tokio::test]
async fn test_duplicate_insert_is_rejected() -> TestResult {
    common::duplicate_insert_is_rejected(store()).await
}

#[tokio::test]
async fn test_rearm_requires_failed_status() -> TestResult {
    common::rearm_requires_failed_status(store()).await
}
