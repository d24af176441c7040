//! End-to-end checks against a real PostgreSQL database.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -- --ignored`. Every
//! test works under its own freshly created user, so the database does not
//! need to be empty.

use chrono::{DateTime, Duration, Utc};
use collector::devices::{self, DeviceForm, NewDevice};
use collector::errors::Error;
use collector::measurements::{self, Scope};
use collector::model::{Run, User};
use collector::runs::{self, RunForm};
use collector::tz::truncate_to_minute;
use collector::{db, ingest, users};
use sqlx::PgPool;
use tokio_test::assert_ok;

async fn pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a scratch database");
    db::make_pool(&url, 10).await.expect("Failed to connect")
}

async fn fresh_user(pool: &PgPool, tag: &str) -> User {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap();
    users::get_or_create(pool, &format!("{}-{}", tag, nanos))
        .await
        .unwrap()
}

async fn new_device(pool: &PgPool, owner: &User, columns: &str) -> NewDevice {
    let form = DeviceForm::parse("probe", columns).unwrap();
    devices::create(pool, owner, form).await.unwrap()
}

/// Minute-aligned instant well in the past.
fn t0() -> DateTime<Utc> {
    truncate_to_minute(Utc::now()) - Duration::days(2)
}

async fn insert_at(pool: &PgPool, device_id: i64, at: DateTime<Utc>, data: &[f64]) {
    sqlx::query("INSERT INTO measurements (device_id, date_added, data) VALUES ($1, $2, $3)")
        .bind(device_id)
        .bind(at)
        .bind(data)
        .execute(pool)
        .await
        .unwrap();
}

async fn add_run(
    pool: &PgPool,
    owner: &User,
    device_seq: i32,
    from: DateTime<Utc>,
    to: Option<DateTime<Utc>>,
) -> Result<(Run, u64), Error> {
    let form = RunForm {
        name: "run".to_string(),
        date_from: from,
        date_to: to,
    };
    runs::create_run(pool, owner.id, device_seq, form).await
}

#[tokio::test]
#[ignore]
async fn test_concurrent_device_creation_numbers_devices_sequentially() {
    let pool = pool().await;
    let owner = fresh_user(&pool, "seq").await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let pool = pool.clone();
            let owner = owner.clone();
            tokio::spawn(async move {
                let form = DeviceForm::parse(&format!("dev {}", i), "temp").unwrap();
                devices::create(&pool, &owner, form).await.unwrap()
            })
        })
        .collect();

    let mut sequence_ids = Vec::new();
    for handle in handles {
        sequence_ids.push(handle.await.unwrap().device.sequence_id);
    }
    sequence_ids.sort_unstable();
    assert_eq!(sequence_ids, (1..=8).collect::<Vec<i32>>());
}

#[tokio::test]
#[ignore]
async fn test_authentication() {
    let pool = pool().await;
    let owner = fresh_user(&pool, "auth").await;
    let created = new_device(&pool, &owner, "temp").await;
    let key = created.api_key.clone();

    let device = assert_ok!(devices::authenticate(&pool, &key).await);
    assert_eq!(device.id, created.device.id);

    // Right token, wrong secret
    let mut forged = key[..key.len() - 1].to_string();
    forged.push(if key.ends_with('a') { 'b' } else { 'a' });
    assert!(matches!(
        devices::authenticate(&pool, &forged).await,
        Err(Error::Authentication(_))
    ));

    assert!(matches!(
        devices::authenticate(&pool, &key[..20]).await,
        Err(Error::Authentication(_))
    ));
}

#[tokio::test]
#[ignore]
async fn test_ingest_rejects_wrong_column_count() {
    let pool = pool().await;
    let owner = fresh_user(&pool, "ingest").await;
    let created = new_device(&pool, &owner, "temp, humidity").await;

    let result = ingest::ingest(&pool, &created.device, vec![21.5]).await;
    assert!(matches!(result, Err(Error::FieldErrors(_))));

    let count = measurements::count(&pool, Scope::Device(created.device.id))
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
#[ignore]
async fn test_ingest_assigns_open_run() {
    let pool = pool().await;
    let owner = fresh_user(&pool, "open").await;
    let created = new_device(&pool, &owner, "temp").await;
    let device = &created.device;

    let (run, _) = add_run(&pool, &owner, device.sequence_id, Utc::now() - Duration::hours(1), None)
        .await
        .unwrap();

    let stored = ingest::ingest(&pool, device, vec![20.0]).await.unwrap();
    assert_eq!(stored.run_id, Some(run.id));
}

#[tokio::test]
#[ignore]
async fn test_overlapping_run_is_rejected() {
    let pool = pool().await;
    let owner = fresh_user(&pool, "overlap").await;
    let created = new_device(&pool, &owner, "temp").await;
    let device = &created.device;
    let t0 = t0();

    insert_at(&pool, device.id, t0 + Duration::minutes(45), &[1.0]).await;
    insert_at(&pool, device.id, t0 + Duration::minutes(90), &[2.0]).await;

    let (first, assigned) =
        add_run(&pool, &owner, device.sequence_id, t0, Some(t0 + Duration::hours(1)))
            .await
            .unwrap();
    assert_eq!(assigned, 1);

    match add_run(&pool, &owner, device.sequence_id, t0 + Duration::minutes(30), None).await {
        Err(Error::Overlap { id, .. }) => assert_eq!(id, first.id),
        other => panic!("unexpected {:?}", other),
    }

    assert_eq!(runs::list_for_device(&pool, device.id).await.unwrap().len(), 1);
    let unassigned = measurements::count(&pool, Scope::Unassigned(device.id))
        .await
        .unwrap();
    assert_eq!(unassigned, 1);

    // Touching runs do not overlap.
    let (_, assigned) = add_run(&pool, &owner, device.sequence_id, t0 + Duration::hours(1), None)
        .await
        .unwrap();
    assert_eq!(assigned, 1);
}

#[tokio::test]
#[ignore]
async fn test_run_reassignment_and_detach() {
    let pool = pool().await;
    let owner = fresh_user(&pool, "detach").await;
    let created = new_device(&pool, &owner, "temp").await;
    let device = &created.device;
    let t0 = t0();

    insert_at(&pool, device.id, t0 + Duration::minutes(10), &[1.0]).await;
    insert_at(&pool, device.id, t0 + Duration::minutes(20), &[2.0]).await;
    // Exactly at the end of the run, so outside it
    insert_at(&pool, device.id, t0 + Duration::hours(1), &[3.0]).await;

    let (run, assigned) =
        add_run(&pool, &owner, device.sequence_id, t0, Some(t0 + Duration::hours(1)))
            .await
            .unwrap();
    assert_eq!(assigned, 2);
    assert_eq!(
        measurements::count(&pool, Scope::Run(run.id)).await.unwrap(),
        2
    );

    let (_, detached) = runs::delete_detach(&pool, owner.id, run.id).await.unwrap();
    assert_eq!(detached, 2);
    assert_eq!(
        measurements::count(&pool, Scope::Unassigned(device.id))
            .await
            .unwrap(),
        3
    );
    assert!(matches!(
        runs::get(&pool, owner.id, run.id).await,
        Err(Error::NotFound)
    ));
}

#[tokio::test]
#[ignore]
async fn test_delete_run_with_data() {
    let pool = pool().await;
    let owner = fresh_user(&pool, "purge").await;
    let created = new_device(&pool, &owner, "temp").await;
    let device = &created.device;
    let t0 = t0();

    insert_at(&pool, device.id, t0 + Duration::minutes(5), &[1.0]).await;
    insert_at(&pool, device.id, t0 + Duration::hours(3), &[2.0]).await;

    let (run, _) = add_run(&pool, &owner, device.sequence_id, t0, Some(t0 + Duration::hours(1)))
        .await
        .unwrap();
    let (_, deleted) = runs::delete_with_data(&pool, owner.id, run.id).await.unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(
        measurements::count(&pool, Scope::Device(device.id))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
#[ignore]
async fn test_finalize_twice() {
    let pool = pool().await;
    let owner = fresh_user(&pool, "final").await;
    let created = new_device(&pool, &owner, "temp").await;

    let (run, _) = add_run(&pool, &owner, created.device.sequence_id, t0(), None)
        .await
        .unwrap();

    let now = Utc::now();
    let finalized = runs::finalize(&pool, owner.id, run.id, now).await.unwrap();
    assert!(finalized.date_to.unwrap() > now);

    assert!(matches!(
        runs::finalize(&pool, owner.id, run.id, now).await,
        Err(Error::AlreadyFinalized)
    ));
    let reread = runs::get(&pool, owner.id, run.id).await.unwrap();
    assert_eq!(reread.date_to, finalized.date_to);
}

#[tokio::test]
#[ignore]
async fn test_trim() {
    let pool = pool().await;
    let owner = fresh_user(&pool, "trim").await;
    let created = new_device(&pool, &owner, "temp").await;
    let device = &created.device;
    let t0 = t0();

    let (empty, _) = add_run(
        &pool,
        &owner,
        device.sequence_id,
        t0 - Duration::hours(5),
        Some(t0 - Duration::hours(4)),
    )
    .await
    .unwrap();
    assert!(matches!(
        runs::trim(&pool, owner.id, empty.id).await,
        Err(Error::NoMeasurements)
    ));

    insert_at(&pool, device.id, t0 + Duration::seconds(10 * 60 + 30), &[1.0]).await;
    insert_at(&pool, device.id, t0 + Duration::seconds(20 * 60 + 10), &[2.0]).await;
    let (run, _) = add_run(&pool, &owner, device.sequence_id, t0, None).await.unwrap();

    let trimmed = assert_ok!(runs::trim(&pool, owner.id, run.id).await);
    assert_eq!(trimmed.date_from, t0 + Duration::minutes(10));
    assert_eq!(trimmed.date_to, Some(t0 + Duration::minutes(21)));
}

#[tokio::test]
#[ignore]
async fn test_trim_rejects_overlap_with_neighbour() {
    let pool = pool().await;
    let owner = fresh_user(&pool, "trimnext").await;
    let created = new_device(&pool, &owner, "temp").await;
    let device = &created.device;
    let t0 = t0();
    let split = t0 + Duration::seconds(30);

    let (before, _) = add_run(&pool, &owner, device.sequence_id, t0 - Duration::hours(1), Some(split))
        .await
        .unwrap();
    insert_at(&pool, device.id, t0 + Duration::seconds(40), &[1.0]).await;
    let (after, _) = add_run(&pool, &owner, device.sequence_id, split, None).await.unwrap();

    match runs::trim(&pool, owner.id, after.id).await {
        Err(Error::Overlap { id, .. }) => assert_eq!(id, before.id),
        other => panic!("unexpected {:?}", other),
    }
    let unchanged = runs::get(&pool, owner.id, after.id).await.unwrap();
    assert_eq!(unchanged.date_from, split);
    assert_eq!(unchanged.date_to, None);
}

#[tokio::test]
#[ignore]
async fn test_other_owners_cannot_see_device() {
    let pool = pool().await;
    let owner = fresh_user(&pool, "owner").await;
    let stranger = fresh_user(&pool, "stranger").await;
    let created = new_device(&pool, &owner, "temp").await;

    assert!(matches!(
        devices::get(&pool, stranger.id, created.device.sequence_id).await,
        Err(Error::NotFound)
    ));
    assert!(matches!(
        devices::delete(&pool, stranger.id, created.device.sequence_id).await,
        Err(Error::NotFound)
    ));
}
