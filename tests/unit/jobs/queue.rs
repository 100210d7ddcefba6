//! Unit tests for the priority job queue

use backtest_orchestrator::jobs::PriorityJobQueue;
use backtest_orchestrator::models::{Job, JobPriority, JobRequest};
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn job(strategy: &str, priority: JobPriority) -> Job {
    let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    Job::from_request(JobRequest::new("BTC", strategy, day, day).with_priority(priority))
}

#[test]
fn test_priority_then_fifo() {
    let queue = PriorityJobQueue::new();
    queue.enqueue(job("batch", JobPriority::Batch));
    queue.enqueue(job("normal-1", JobPriority::Normal));
    queue.enqueue(job("urgent", JobPriority::Urgent));
    queue.enqueue(job("normal-2", JobPriority::Normal));
    assert_eq!(queue.peek_size(), 4);

    let order: Vec<String> = std::iter::from_fn(|| queue.try_dequeue())
        .map(|j| j.strategy)
        .collect();
    assert_eq!(order, vec!["urgent", "normal-1", "normal-2", "batch"]);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_non_blocking_dequeue_on_empty_queue() {
    let queue = PriorityJobQueue::new();
    assert!(queue.dequeue(false, Duration::from_secs(5)).await.is_none());
}

#[tokio::test]
async fn test_blocking_dequeue_times_out() {
    let queue = PriorityJobQueue::new();
    let started = Instant::now();
    assert!(queue.dequeue(true, Duration::from_millis(100)).await.is_none());
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_blocking_dequeue_wakes_on_enqueue() {
    let queue = Arc::new(PriorityJobQueue::new());
    let producer = queue.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        producer.enqueue(job("late", JobPriority::High));
    });

    let started = Instant::now();
    let dequeued = queue.dequeue(true, Duration::from_secs(5)).await;
    assert_eq!(dequeued.map(|j| j.strategy), Some("late".to_string()));
    assert!(started.elapsed() < Duration::from_secs(2));
}
