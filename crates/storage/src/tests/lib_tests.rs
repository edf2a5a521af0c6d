use super::*;

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let store = LocalStore::new("sqlite::memory:").await.expect("db");
    store.health_check().await.expect("health check");
}

#[tokio::test]
async fn profile_snapshot_round_trips() {
    let store = LocalStore::new("sqlite::memory:").await.expect("db");
    assert!(store.load_profile().await.expect("load").is_none());

    let profile = ProfileSnapshot {
        user_id: UserId(7),
        username: "alice".to_string(),
        display_name: Some("Alice".to_string()),
    };
    store.save_profile(&profile).await.expect("save");
    assert_eq!(store.load_profile().await.expect("load"), Some(profile));

    store.clear_profile().await.expect("clear");
    assert!(store.load_profile().await.expect("load").is_none());
}

#[tokio::test]
async fn active_conversation_overwrites_previous_value() {
    let store = LocalStore::new("sqlite::memory:").await.expect("db");
    store
        .save_active_conversation(ConversationId(3))
        .await
        .expect("save");
    store
        .save_active_conversation(ConversationId(9))
        .await
        .expect("save again");
    assert_eq!(
        store.load_active_conversation().await.expect("load"),
        Some(ConversationId(9))
    );
}

#[tokio::test]
async fn theme_defaults_to_system_when_unset() {
    let store = LocalStore::new("sqlite::memory:").await.expect("db");
    assert_eq!(
        store.load_theme().await.expect("load"),
        ThemePreference::System
    );

    store.save_theme(ThemePreference::Dark).await.expect("save");
    assert_eq!(
        store.load_theme().await.expect("load"),
        ThemePreference::Dark
    );
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("local_store_test_{suffix}"));
    let db_path = temp_root.join("nested").join("local.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let store = LocalStore::new(&database_url).await.expect("db");
    store
        .save_theme(ThemePreference::Light)
        .await
        .expect("save");
    drop(store);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}
