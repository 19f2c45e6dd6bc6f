//! Integration tests for the Postgres repositories.
//!
//! These need a reachable database in `DATABASE_URL` and are skipped when it
//! is unset. Every test runs in its own schema, so they can share one server
//! and run in parallel.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{Duration, Utc};
use herald_core::{
    models::{ChatId, MailingStatus, MessageId, NewMailing, RecipientStatus},
    storage::Storage,
    CoreError,
};
use sqlx::{postgres::PgPoolOptions, Executor};

static SCHEMA_SEQ: AtomicUsize = AtomicUsize::new(0);

async fn isolated_storage() -> Option<Storage> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };

    let schema =
        format!("herald_test_{}_{}", std::process::id(), SCHEMA_SEQ.fetch_add(1, Ordering::SeqCst));

    let admin = PgPoolOptions::new().max_connections(1).connect(&url).await.unwrap();
    admin.execute(format!("DROP SCHEMA IF EXISTS {schema} CASCADE").as_str()).await.unwrap();
    admin.execute(format!("CREATE SCHEMA {schema}").as_str()).await.unwrap();
    admin.close().await;

    let pool = PgPoolOptions::new()
        .max_connections(8)
        .after_connect(move |conn, _meta| {
            let statement = format!("SET search_path TO {schema}");
            Box::pin(async move {
                conn.execute(statement.as_str()).await?;
                Ok(())
            })
        })
        .connect(&url)
        .await
        .unwrap();

    let storage = Storage::new(pool);
    storage.migrate().await.unwrap();
    Some(storage)
}

fn due_mailing(recipients: &[i64]) -> NewMailing {
    NewMailing {
        message_ids: vec![MessageId(10), MessageId(11)],
        scheduled_at: Utc::now() - Duration::minutes(1),
        recipients: recipients.iter().copied().map(ChatId).collect(),
    }
}

#[tokio::test]
async fn migrate_is_idempotent() {
    let Some(storage) = isolated_storage().await else { return };
    storage.migrate().await.unwrap();
    storage.health_check().await.unwrap();
}

#[tokio::test]
async fn claim_skips_rows_locked_by_another_claimant() {
    let Some(storage) = isolated_storage().await else { return };
    let first = storage.mailings.create(&due_mailing(&[1])).await.unwrap();
    let second = storage.mailings.create(&due_mailing(&[2])).await.unwrap();
    let third = storage.mailings.create(&due_mailing(&[3])).await.unwrap();

    // An in-flight claim holding the lock on `first`.
    let mut competitor = storage.pool().begin().await.unwrap();
    sqlx::query("SELECT id FROM mailings WHERE id = $1 FOR UPDATE")
        .bind(first)
        .execute(&mut *competitor)
        .await
        .unwrap();

    let claimed = storage.mailings.claim_due(Utc::now(), 10).await.unwrap();
    assert_eq!(claimed, vec![second, third]);

    competitor.rollback().await.unwrap();
    assert_eq!(
        storage.mailings.find_status(first).await.unwrap(),
        Some(MailingStatus::Created)
    );
    assert_eq!(
        storage.mailings.find_status(second).await.unwrap(),
        Some(MailingStatus::Pending)
    );
}

#[tokio::test]
async fn claim_ignores_future_and_finished_mailings() {
    let Some(storage) = isolated_storage().await else { return };
    let due = storage.mailings.create(&due_mailing(&[1])).await.unwrap();
    let future = storage
        .mailings
        .create(&NewMailing { scheduled_at: Utc::now() + Duration::hours(1), ..due_mailing(&[2]) })
        .await
        .unwrap();
    let sent = storage.mailings.create(&due_mailing(&[3])).await.unwrap();
    storage.mailings.update_statuses(&[sent], MailingStatus::Sent).await.unwrap();

    let claimed = storage.mailings.claim_due(Utc::now(), 10).await.unwrap();

    assert_eq!(claimed, vec![due]);
    assert_eq!(
        storage.mailings.find_status(future).await.unwrap(),
        Some(MailingStatus::Created)
    );
}

#[tokio::test]
async fn claim_respects_the_limit_in_schedule_order() {
    let Some(storage) = isolated_storage().await else { return };
    let now = Utc::now();
    let mut ids = Vec::new();
    for minutes in [3, 1, 2] {
        let mailing =
            NewMailing { scheduled_at: now - Duration::minutes(minutes), ..due_mailing(&[minutes]) };
        ids.push(storage.mailings.create(&mailing).await.unwrap());
    }

    let claimed = storage.mailings.claim_due(now, 2).await.unwrap();
    assert_eq!(claimed, vec![ids[0], ids[2]]);
}

#[tokio::test]
async fn dispatch_epochs_keep_timestamps_ordered() {
    let Some(storage) = isolated_storage().await else { return };
    let id = storage.mailings.create(&due_mailing(&[1, 2])).await.unwrap();
    let t0 = Utc::now();

    storage.mailings.start_sending(id, t0).await.unwrap();
    storage.mailings.mark_ended(id, t0 + Duration::seconds(1)).await.unwrap();

    // A resumed run keeps the first start and opens a new epoch.
    storage.mailings.start_sending(id, t0 + Duration::seconds(10)).await.unwrap();
    let mailing = storage.mailings.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(mailing.status, MailingStatus::Sending);
    assert_eq!(mailing.started_at.map(|t| t.timestamp_micros()), Some(t0.timestamp_micros()));
    assert_eq!(mailing.ended_at, None);

    // A stale clock never moves ended_at before started_at.
    storage.mailings.finish_sending(id, true, t0 - Duration::seconds(5)).await.unwrap();
    let mailing = storage.mailings.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(mailing.status, MailingStatus::Sent);
    assert!(mailing.ended_at.unwrap() >= mailing.started_at.unwrap());
}

#[tokio::test]
async fn recipients_page_by_status_in_insertion_order() {
    let Some(storage) = isolated_storage().await else { return };
    let id = storage.mailings.create(&due_mailing(&[30, 10, 20, 40])).await.unwrap();

    let all = storage.recipients.find_by_mailing(id).await.unwrap();
    let chats: Vec<i64> = all.iter().map(|r| r.recipient_id.0).collect();
    assert_eq!(chats, vec![30, 10, 20, 40]);

    storage.recipients.update_statuses(&[all[0].id], RecipientStatus::Sent).await.unwrap();
    storage.recipients.update_statuses(&[all[2].id], RecipientStatus::Failed).await.unwrap();

    let page = storage.recipients.page(id, &RecipientStatus::READY, 2, 0).await.unwrap();
    assert_eq!(page.iter().map(|r| r.recipient_id.0).collect::<Vec<_>>(), vec![10, 20]);

    let page = storage.recipients.page(id, &RecipientStatus::READY, 2, 2).await.unwrap();
    assert_eq!(page.iter().map(|r| r.recipient_id.0).collect::<Vec<_>>(), vec![40]);

    assert_eq!(storage.recipients.count_by_status(id, RecipientStatus::Sent).await.unwrap(), 1);
}

#[tokio::test]
async fn duplicate_recipient_is_a_constraint_violation() {
    let Some(storage) = isolated_storage().await else { return };

    let error = storage.mailings.create(&due_mailing(&[7, 7])).await.unwrap_err();
    assert!(matches!(error, CoreError::ConstraintViolation(_)), "got {error:?}");
}

#[tokio::test]
async fn operator_pause_and_resume() {
    let Some(storage) = isolated_storage().await else { return };
    let id = storage.mailings.create(&due_mailing(&[1])).await.unwrap();

    assert!(!storage.mailings.pause(id).await.unwrap(), "only sending mailings pause");
    storage.mailings.start_sending(id, Utc::now()).await.unwrap();
    assert!(storage.mailings.pause(id).await.unwrap());
    assert!(storage.mailings.resume(id).await.unwrap());
    assert_eq!(storage.mailings.find_status(id).await.unwrap(), Some(MailingStatus::Resume));

    let claimed = storage.mailings.claim_due(Utc::now(), 10).await.unwrap();
    assert_eq!(claimed, vec![id]);
}
