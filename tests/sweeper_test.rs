mod common;

use chrono::Duration;
use common::{eventually, harness, on, test_config, wait_for_status, ScriptedProvider};
use notify_dispatch::{
    spawn_maintenance, Channel, Clock, DispatcherConfig, MaintenanceSchedule, NotificationStatus, Priority,
    ProviderError, RecipientId, SendRequest,
};

fn reminder(recipient: &str, body: &str) -> SendRequest {
    SendRequest::new(recipient, "reminder", "Reminder", body).with_channels([Channel::Sms])
}

#[tokio::test]
async fn test_scheduled_waits_until_due() {
    let provider = ScriptedProvider::succeeding();
    let h = harness(test_config(), vec![on(Channel::Sms, &provider)]);

    let at = h.clock.now() + Duration::hours(1);
    let created = h.dispatcher.send(reminder("u1", "dentist").scheduled_at(at)).await.unwrap();
    let id = created[0].id.clone();

    let report = h.dispatcher.process_scheduled().await.unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(h.dispatcher.get(&id).await.unwrap().unwrap().status, NotificationStatus::Pending);
    assert_eq!(provider.total_calls(), 0);

    h.clock.advance(Duration::minutes(61));
    let report = h.dispatcher.process_scheduled().await.unwrap();
    assert_eq!(report.dispatched, 1);
    wait_for_status(&h.dispatcher, &id, NotificationStatus::Delivered).await;
}

#[tokio::test]
async fn test_expiry_wins_over_due() {
    let provider = ScriptedProvider::succeeding();
    let h = harness(test_config(), vec![on(Channel::Sms, &provider)]);

    let now = h.clock.now();
    let created = h
        .dispatcher
        .send(
            reminder("u1", "flash sale")
                .scheduled_at(now + Duration::minutes(10))
                .expires_at(now + Duration::minutes(20)),
        )
        .await
        .unwrap();

    h.clock.advance(Duration::minutes(30));
    let report = h.dispatcher.process_scheduled().await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.dispatched, 0);

    let n = h.dispatcher.get(&created[0].id).await.unwrap().unwrap();
    assert_eq!(n.status, NotificationStatus::Expired);
    assert_eq!(provider.total_calls(), 0);
}

#[tokio::test]
async fn test_due_sweep_prefers_urgent() {
    let provider = ScriptedProvider::succeeding();
    let config = DispatcherConfig {
        batching_enabled: false,
        worker_count: 1,
        ..test_config()
    };
    let h = harness(config, vec![on(Channel::Sms, &provider)]);

    let at = h.clock.now() + Duration::minutes(5);
    let low = h
        .dispatcher
        .send(reminder("u1", "low").scheduled_at(at).with_priority(Priority::Low))
        .await
        .unwrap();
    let urgent = h
        .dispatcher
        .send(reminder("u2", "urgent").scheduled_at(at).with_priority(Priority::Urgent))
        .await
        .unwrap();

    h.clock.advance(Duration::minutes(6));
    h.dispatcher.process_scheduled().await.unwrap();
    wait_for_status(&h.dispatcher, &low[0].id, NotificationStatus::Delivered).await;

    assert_eq!(provider.sent(), vec![urgent[0].id.clone(), low[0].id.clone()]);
}

#[tokio::test]
async fn test_retry_follows_backoff() {
    let provider = ScriptedProvider::failing(ProviderError::Timeout);
    let h = harness(test_config(), vec![on(Channel::Sms, &provider)]);

    let created = h.dispatcher.send(reminder("u1", "pay rent")).await.unwrap();
    let id = created[0].id.clone();
    let failed = wait_for_status(&h.dispatcher, &id, NotificationStatus::Failed).await;
    assert_eq!(failed.retry_count, 0);
    assert_eq!(failed.last_error.as_deref(), Some("delivery failed: provider call timed out"));

    // First retry has no delay. The worker may still hold its claim for a
    // moment after persisting the failure, so poll.
    eventually(|| async { h.dispatcher.process_retries().await.unwrap().rearmed == 1 }).await;
    eventually(|| async {
        let n = h.dispatcher.get(&id).await.unwrap().unwrap();
        n.status == NotificationStatus::Failed && n.retry_count == 1
    })
    .await;

    // Second waits base * multiplier * 1 = 60s.
    h.clock.advance(Duration::seconds(59));
    assert_eq!(h.dispatcher.process_retries().await.unwrap().rearmed, 0);

    provider.set_failure(None);
    h.clock.advance(Duration::seconds(1));
    eventually(|| async { h.dispatcher.process_retries().await.unwrap().rearmed == 1 }).await;

    let delivered = wait_for_status(&h.dispatcher, &id, NotificationStatus::Delivered).await;
    assert_eq!(delivered.retry_count, 2);
}

#[tokio::test]
async fn test_retries_stop_at_max() {
    let provider = ScriptedProvider::failing(ProviderError::Rejected("bad number".into()));
    let config = DispatcherConfig {
        max_retries: 1,
        ..test_config()
    };
    let h = harness(config, vec![on(Channel::Sms, &provider)]);

    let created = h.dispatcher.send(reminder("u1", "pay rent")).await.unwrap();
    let id = created[0].id.clone();
    wait_for_status(&h.dispatcher, &id, NotificationStatus::Failed).await;

    eventually(|| async { h.dispatcher.process_retries().await.unwrap().rearmed == 1 }).await;
    eventually(|| async {
        let n = h.dispatcher.get(&id).await.unwrap().unwrap();
        n.status == NotificationStatus::Failed && n.retry_count == 1
    })
    .await;

    h.clock.advance(Duration::hours(1));
    assert_eq!(h.dispatcher.process_retries().await.unwrap().rearmed, 0);
    assert_eq!(provider.total_calls(), 2);
}

#[tokio::test]
async fn test_exhausted_records_do_not_block_retries() {
    let provider = ScriptedProvider::failing(ProviderError::Unavailable("carrier down".into()));
    let config = DispatcherConfig {
        max_retries: 1,
        sweep_batch_size: 1,
        ..test_config()
    };
    let h = harness(config, vec![on(Channel::Sms, &provider)]);

    let a = h.dispatcher.send(reminder("u1", "first")).await.unwrap()[0].id.clone();
    wait_for_status(&h.dispatcher, &a, NotificationStatus::Failed).await;
    eventually(|| async { h.dispatcher.process_retries().await.unwrap().rearmed == 1 }).await;
    eventually(|| async {
        let n = h.dispatcher.get(&a).await.unwrap().unwrap();
        n.status == NotificationStatus::Failed && n.retry_count == 1
    })
    .await;

    // A is out of retries and older than B; it must not take B's slot.
    h.clock.advance(Duration::minutes(10));
    let b = h.dispatcher.send(reminder("u2", "second")).await.unwrap()[0].id.clone();
    wait_for_status(&h.dispatcher, &b, NotificationStatus::Failed).await;

    eventually(|| async { h.dispatcher.process_retries().await.unwrap().rearmed == 1 }).await;
    eventually(|| async {
        let n = h.dispatcher.get(&b).await.unwrap().unwrap();
        n.status == NotificationStatus::Failed && n.retry_count == 1
    })
    .await;

    let a = h.dispatcher.get(&a).await.unwrap().unwrap();
    assert_eq!(a.retry_count, 1);
    assert_eq!(a.status, NotificationStatus::Failed);
}

#[tokio::test]
async fn test_cleanup_purges_by_age() {
    let provider = ScriptedProvider::succeeding();
    let h = harness(test_config(), vec![on(Channel::Sms, &provider)]);

    let old = h.dispatcher.send(reminder("u1", "old")).await.unwrap();
    wait_for_status(&h.dispatcher, &old[0].id, NotificationStatus::Delivered).await;

    h.clock.advance(Duration::days(29));
    h.dispatcher.send(reminder("u1", "recent")).await.unwrap();

    h.clock.advance(Duration::days(2));
    let report = h.dispatcher.cleanup().await.unwrap();
    assert_eq!(report.purged, 1);

    let remaining = h.dispatcher.get_for_user(&RecipientId::new("u1"), 10, 0).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].body, "recent");
}

#[tokio::test]
async fn test_maintenance_loop_dispatches_due_work() {
    let provider = ScriptedProvider::succeeding();
    let h = harness(test_config(), vec![on(Channel::Sms, &provider)]);

    let at = h.clock.now() + Duration::hours(1);
    let created = h.dispatcher.send(reminder("u1", "standup").scheduled_at(at)).await.unwrap();
    h.clock.advance(Duration::hours(2));

    let handle = spawn_maintenance(
        h.dispatcher.clone(),
        MaintenanceSchedule {
            sweep_interval_secs: 1,
            cleanup_interval_secs: 3_600,
        },
    );
    wait_for_status(&h.dispatcher, &created[0].id, NotificationStatus::Delivered).await;
    handle.stop().await;
}
