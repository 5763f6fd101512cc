//! Staff CSV bootstrap and alias decoration.

mod common;

use common::{setup_db, test_hasher};
use discord_forum_mirror::db::get_staff_role;
use discord_forum_mirror::staff::import_staff_csv;
use discord_forum_mirror::sync::Reconciler;

const STAFF_ID: i64 = 123_456_789_012_345_678;
const REGULAR_ID: i64 = 876_543_210_987_654_321;

#[tokio::test]
async fn csv_import_hashes_ids_and_overwrites_on_reimport() {
    let (db, tmp) = setup_db().await;
    let hasher = test_hasher();

    let csv_path = tmp.path().join("staff.csv");
    tokio::fs::write(&csv_path, format!("{STAFF_ID}, Moderator\n\nbroken line\n"))
        .await
        .unwrap();

    let imported = import_staff_csv(&db, &hasher, &csv_path).await.unwrap();
    assert_eq!(imported, 1);

    let hash = hasher.alias(STAFF_ID);
    let role = get_staff_role(db.pool(), &hash).await.unwrap().unwrap();
    assert_eq!(role.public_tag, "Moderator");

    // Re-import with a new tag overwrites, keyed by the same hash.
    tokio::fs::write(&csv_path, format!("{STAFF_ID},Admin\n")).await.unwrap();
    import_staff_csv(&db, &hasher, &csv_path).await.unwrap();
    let role = get_staff_role(db.pool(), &hash).await.unwrap().unwrap();
    assert_eq!(role.public_tag, "Admin");
}

#[tokio::test]
async fn staff_aliases_carry_the_public_tag() {
    let (db, tmp) = setup_db().await;
    let hasher = test_hasher();

    let csv_path = tmp.path().join("staff.csv");
    tokio::fs::write(&csv_path, format!("{STAFF_ID},Moderator\n"))
        .await
        .unwrap();
    import_staff_csv(&db, &hasher, &csv_path).await.unwrap();

    let reconciler = Reconciler::new(db.clone(), hasher.clone(), None, "sync");

    let decorated = reconciler.author_alias(STAFF_ID).await.unwrap();
    let plain_hash = hasher.alias(STAFF_ID);
    assert_eq!(decorated, format!("{}:Moderator", &plain_hash[..8]));

    let regular = reconciler.author_alias(REGULAR_ID).await.unwrap();
    assert_eq!(regular, hasher.alias(REGULAR_ID));
    assert_eq!(regular.len(), 12);
}
