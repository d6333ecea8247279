// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contract tests for the in-memory queue.

use std::time::Duration;

use whirr_core::{Queue, QueueError};
use whirr_test_harness::MemoryQueue;

fn quick_queue() -> MemoryQueue {
    MemoryQueue::with_recv_wait(Duration::from_millis(20))
}

#[tokio::test]
async fn test_empty_queue_reports_empty() {
    let queue = quick_queue();
    assert!(matches!(
        queue.get_message().await,
        Err(QueueError::Empty)
    ));
}

#[tokio::test]
async fn test_fifo_delivery_and_info_counts() {
    let queue = quick_queue();
    assert_eq!(queue.get_info().await.unwrap().num_messages, 0);

    queue.put("message-1").await.unwrap();
    queue.put("message-2").await.unwrap();
    queue.put("message-3").await.unwrap();
    assert_eq!(queue.get_info().await.unwrap().num_messages, 3);

    assert_eq!(queue.get_message().await.unwrap().body, "message-1");
    assert_eq!(queue.get_info().await.unwrap().num_messages, 2);
    assert_eq!(queue.get_message().await.unwrap().body, "message-2");
    assert_eq!(queue.get_message().await.unwrap().body, "message-3");
    assert_eq!(queue.get_info().await.unwrap().num_messages, 0);

    assert!(matches!(queue.get_message().await, Err(QueueError::Empty)));
}

#[tokio::test]
async fn test_closed_queue_reports_closed() {
    let queue = quick_queue();
    queue.close().await;
    assert!(matches!(queue.get_message().await, Err(QueueError::Closed)));
}

#[tokio::test]
async fn test_close_wins_over_remaining_messages() {
    let queue = quick_queue();
    queue.put("stranded").await.unwrap();
    queue.close().await;
    // Terminal close: receivers unblock with Closed even though a message
    // remains.
    assert!(matches!(queue.get_message().await, Err(QueueError::Closed)));
}

#[tokio::test]
async fn test_put_wakes_blocked_receiver() {
    use std::sync::Arc;
    let queue = Arc::new(MemoryQueue::with_recv_wait(Duration::from_secs(5)));
    let receiver = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.get_message().await })
    };
    // Give the receiver a moment to block.
    tokio::time::sleep(Duration::from_millis(10)).await;
    queue.put("wake-up").await.unwrap();
    let message = receiver.await.unwrap().unwrap();
    assert_eq!(message.body, "wake-up");
}

#[tokio::test]
async fn test_close_wakes_blocked_receiver() {
    use std::sync::Arc;
    let queue = Arc::new(MemoryQueue::with_recv_wait(Duration::from_secs(5)));
    let receiver = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.get_message().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    queue.close().await;
    assert!(matches!(receiver.await.unwrap(), Err(QueueError::Closed)));
}
