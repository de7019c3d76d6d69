//! End-to-end coverage of reconciliation and the VOD processing queue
//! against a real database. Skipped unless `DATABASE_URL` is set, the
//! same convention `sqlx` itself uses for its own compile-time checks.

use archiver::db::types::{NewChatMessage, VodUpsert};
use archiver::db::Db;
use chrono::Utc;

async fn test_db() -> Option<Db> {
    let dsn = std::env::var("DATABASE_URL").ok()?;
    Some(Db::connect(&dsn).await.expect("connecting to test database"))
}

fn unique_channel(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

#[tokio::test]
async fn reconciliation_rebinds_chat_and_replaces_placeholder() {
    let Some(db) = test_db().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };

    let channel = unique_channel("reconcile");
    let placeholder_id = format!("live-{}", uuid::Uuid::new_v4());

    let placeholder = db
        .upsert_vod(&VodUpsert {
            channel: channel.clone(),
            upstream_vod_id: placeholder_id.clone(),
            title: Some("live now".into()),
            stream_start_time: Some(Utc::now()),
            duration_seconds: Some(0),
        })
        .await
        .expect("creating placeholder vod");
    assert_eq!(placeholder.upstream_vod_id, placeholder_id);

    for i in 0..3 {
        db.insert_chat(&NewChatMessage {
            vod_id: placeholder_id.clone(),
            username: "viewer".into(),
            text: format!("message {i}"),
            badges: String::new(),
            emotes: String::new(),
            color: None,
            reply_to_id: None,
            reply_to_username: None,
            reply_to_text: None,
            absolute_timestamp: Utc::now(),
            relative_timestamp: f64::from(i) * 10.0,
        })
        .await
        .expect("inserting chat message");
    }

    let real_id = format!("real-{}", uuid::Uuid::new_v4());
    let real_start = Utc::now();
    let rebound = db
        .reconcile_placeholder(&channel, &placeholder_id, &real_id, "Past Broadcast", 3600, real_start, 5.0)
        .await
        .expect("reconciling placeholder");
    assert_eq!(rebound, 3);

    let real_vod = db
        .get_vod_by_upstream_id(&channel, &real_id)
        .await
        .expect("real vod should exist after reconciliation");
    assert_eq!(real_vod.title, "Past Broadcast");
    assert_eq!(real_vod.duration_seconds, 3600);

    assert!(db.get_vod_by_upstream_id(&channel, &placeholder_id).await.is_err());

    let chat = db.list_chat_for_vod(&real_id).await.expect("listing chat for real vod");
    assert_eq!(chat.len(), 3);
    // relative_timestamp was shifted by +5s and clamped at zero; none here
    // started negative so the shift should be a straight addition.
    assert!((chat[0].1 - 5.0).abs() < 0.001);

    // Re-running against an already-reconciled placeholder is a no-op.
    let rebound_again = db
        .reconcile_placeholder(&channel, &placeholder_id, &real_id, "Past Broadcast", 3600, real_start, 5.0)
        .await
        .expect("re-running reconciliation should not error");
    assert_eq!(rebound_again, 0);
}

#[tokio::test]
async fn next_processable_respects_priority_and_retry_cooldown() {
    let Some(db) = test_db().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };

    let channel = unique_channel("queue");

    let low = db
        .upsert_vod(&VodUpsert {
            channel: channel.clone(),
            upstream_vod_id: "vod-low".into(),
            title: Some("low priority".into()),
            stream_start_time: Some(Utc::now()),
            duration_seconds: Some(60),
        })
        .await
        .expect("creating low priority vod");

    let high = db
        .upsert_vod(&VodUpsert {
            channel: channel.clone(),
            upstream_vod_id: "vod-high".into(),
            title: Some("high priority".into()),
            stream_start_time: Some(Utc::now()),
            duration_seconds: Some(60),
        })
        .await
        .expect("creating high priority vod");
    db.set_priority(high.id, 10).await.expect("bumping priority");

    let picked = db
        .next_processable(&channel, chrono::Duration::seconds(600))
        .await
        .expect("querying next processable")
        .expect("queue should not be empty");
    assert_eq!(picked.id, high.id);

    // Claiming and failing the high-priority VOD should make it ineligible
    // until the retry cooldown elapses, falling through to the low one.
    db.claim_for_download(high.id).await.expect("claiming high priority vod");
    db.record_failure(high.id, "simulated failure").await.expect("recording failure");

    let picked_after_failure = db
        .next_processable(&channel, chrono::Duration::seconds(600))
        .await
        .expect("querying next processable after failure")
        .expect("low priority vod should still be picked");
    assert_eq!(picked_after_failure.id, low.id);

    let picked_with_no_cooldown = db
        .next_processable(&channel, chrono::Duration::zero())
        .await
        .expect("querying next processable with zero cooldown")
        .expect("queue should not be empty");
    assert_eq!(picked_with_no_cooldown.id, high.id);
}

#[tokio::test]
async fn next_processable_excluding_skips_the_given_ids() {
    let Some(db) = test_db().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };

    let channel = unique_channel("exclude");

    let first = db
        .upsert_vod(&VodUpsert {
            channel: channel.clone(),
            upstream_vod_id: "vod-a".into(),
            title: Some("a".into()),
            stream_start_time: Some(Utc::now()),
            duration_seconds: Some(60),
        })
        .await
        .expect("creating vod a");
    let second = db
        .upsert_vod(&VodUpsert {
            channel: channel.clone(),
            upstream_vod_id: "vod-b".into(),
            title: Some("b".into()),
            stream_start_time: Some(Utc::now() + chrono::Duration::seconds(1)),
            duration_seconds: Some(60),
        })
        .await
        .expect("creating vod b");

    let picked = db
        .next_processable_excluding(&channel, chrono::Duration::seconds(600), &[first.id.0])
        .await
        .expect("querying with exclusion")
        .expect("queue should not be empty");
    assert_eq!(picked.id, second.id);

    let picked_none = db
        .next_processable_excluding(&channel, chrono::Duration::seconds(600), &[first.id.0, second.id.0])
        .await
        .expect("querying with both excluded");
    assert!(picked_none.is_none());
}

#[tokio::test]
async fn stale_lease_is_reclaimed_but_a_fresh_one_is_not() {
    let Some(db) = test_db().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };

    let channel = unique_channel("reclaim");
    let vod = db
        .upsert_vod(&VodUpsert {
            channel: channel.clone(),
            upstream_vod_id: "vod-stuck".into(),
            title: Some("stuck mid-download".into()),
            stream_start_time: Some(Utc::now()),
            duration_seconds: Some(60),
        })
        .await
        .expect("creating vod");
    db.claim_for_download(vod.id).await.expect("claiming vod");

    // A long timeout treats the just-claimed lease as fresh: nothing reclaimed.
    let reclaimed = db
        .reclaim_stale_leases(&channel, chrono::Duration::hours(1))
        .await
        .expect("reclaiming with a long timeout");
    assert_eq!(reclaimed, 0);
    let still_downloading = db.get_vod(vod.id).await.expect("fetching vod");
    assert_eq!(still_downloading.download_state.as_str(), "downloading");

    // A zero timeout treats any lease claimed before "now" as stale.
    let reclaimed = db
        .reclaim_stale_leases(&channel, chrono::Duration::zero())
        .await
        .expect("reclaiming with a zero timeout");
    assert_eq!(reclaimed, 1);
    let reclaimed_vod = db.get_vod(vod.id).await.expect("fetching vod");
    assert_eq!(reclaimed_vod.download_state.as_str(), "error");

    // Reclaimed back to `error`, so it's claimable again.
    db.claim_for_download(vod.id).await.expect("re-claiming reclaimed vod");
}
