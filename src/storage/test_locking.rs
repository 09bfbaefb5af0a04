//! Concurrency tests for reservation
//!
//! These verify that concurrent workers never receive the same live job and
//! that every job is handed out exactly once while reservations hold, for
//! each in-process driver.

use crate::core::Job;
use crate::storage::{FileConfig, FileDriver, MemoryDriver, StorageDriver};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const VISIBILITY: Duration = Duration::from_secs(60);

fn create_test_job(name: &str) -> Job {
    Job::new(name, json!({"n": name}))
}

/// Spawn `workers` tasks that each try one reservation; returns how many won.
async fn race_for_single_job(driver: Arc<dyn StorageDriver>, workers: usize) -> usize {
    let success_count = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for _ in 0..workers {
        let driver = Arc::clone(&driver);
        let success_count = Arc::clone(&success_count);
        handles.push(tokio::spawn(async move {
            if let Ok(Some(_job)) = driver.reserve("default", VISIBILITY).await {
                success_count.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    for result in futures::future::join_all(handles).await {
        result.unwrap();
    }
    success_count.load(Ordering::SeqCst)
}

/// Drain `jobs` pushed jobs with `workers` concurrent reservers; returns the
/// ids each reservation produced, in no particular order.
async fn drain_concurrently(
    driver: Arc<dyn StorageDriver>,
    jobs: usize,
    workers: usize,
) -> Vec<String> {
    for i in 0..jobs {
        driver
            .push(create_test_job(&format!("job_{}", i)))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..workers {
        let driver = Arc::clone(&driver);
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = driver.reserve("default", VISIBILITY).await.unwrap() {
                driver.ack(&job).await.unwrap();
                claimed.push(job.id);
            }
            claimed
        }));
    }

    futures::future::join_all(handles)
        .await
        .into_iter()
        .flat_map(|r| r.unwrap())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_no_race_condition_job_fetching() {
    let driver: Arc<dyn StorageDriver> = Arc::new(MemoryDriver::new());
    driver.push(create_test_job("single")).await.unwrap();

    assert_eq!(race_for_single_job(driver, 10).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_two_workers_one_job() {
    let driver: Arc<dyn StorageDriver> = Arc::new(MemoryDriver::new());
    driver.push(create_test_job("single")).await.unwrap();

    assert_eq!(race_for_single_job(driver.clone(), 2).await, 1);
    let stats = driver.stats("default").await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.reserved, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_every_job_claimed_once() {
    let driver: Arc<dyn StorageDriver> = Arc::new(MemoryDriver::new());
    let claimed = drain_concurrently(driver, 200, 8).await;

    let unique: HashSet<&String> = claimed.iter().collect();
    assert_eq!(claimed.len(), 200);
    assert_eq!(unique.len(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_no_race_condition_job_fetching() {
    let dir = tempfile::tempdir().unwrap();
    let driver: Arc<dyn StorageDriver> =
        Arc::new(FileDriver::open(FileConfig::new(dir.path())).await.unwrap());
    driver.push(create_test_job("single")).await.unwrap();

    assert_eq!(race_for_single_job(driver, 10).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_every_job_claimed_once() {
    let dir = tempfile::tempdir().unwrap();
    let driver: Arc<dyn StorageDriver> =
        Arc::new(FileDriver::open(FileConfig::new(dir.path())).await.unwrap());
    let claimed = drain_concurrently(driver, 40, 4).await;

    let unique: HashSet<&String> = claimed.iter().collect();
    assert_eq!(claimed.len(), 40);
    assert_eq!(unique.len(), 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_expired_reservation_claimed_by_one_worker() {
    let driver: Arc<dyn StorageDriver> = Arc::new(MemoryDriver::new());
    let job = create_test_job("crashy");
    driver.push(job.clone()).await.unwrap();

    driver
        .reserve("default", Duration::from_millis(20))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    // The crashed worker's job is eligible again, but still for only one taker
    assert_eq!(race_for_single_job(driver.clone(), 10).await, 1);
    assert_eq!(driver.get(&job.id).await.unwrap().unwrap().attempts, 0);
}
