//! Integration tests for outpost-db
//!
//! Tests database operations with real SQLite in-memory database

use chrono::Utc;
use outpost_db::{
    connect,
    entities::{command, http_request, tunnel_session},
    migrate, SessionStatus, TaskStatus,
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter, Set,
};

/// Helper to create a test database
async fn setup_test_db() -> sea_orm::DatabaseConnection {
    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");

    migrate(&db).await.expect("Failed to run migrations");

    db
}

fn new_command(id: &str, agent: &str, status: TaskStatus) -> command::ActiveModel {
    let now = Utc::now();
    command::ActiveModel {
        id: Set(id.to_string()),
        target_agent_id: Set(agent.to_string()),
        command: Set("show version".to_string()),
        status: Set(status),
        output: Set(None),
        delivery_id: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
}

#[tokio::test]
async fn test_database_connection() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");

    let backend = db.get_database_backend();
    assert!(matches!(backend, sea_orm::DatabaseBackend::Sqlite));
}

#[tokio::test]
async fn test_migrations_run_successfully() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");

    let result = migrate(&db).await;
    assert!(result.is_ok());

    // Re-running is a no-op
    assert!(migrate(&db).await.is_ok());
}

#[tokio::test]
async fn test_insert_and_read_command() {
    let db = setup_test_db().await;

    new_command("cmd-1", "A42", TaskStatus::Pending)
        .insert(&db)
        .await
        .expect("Failed to insert");

    let found = command::Entity::find_by_id("cmd-1")
        .one(&db)
        .await
        .expect("Failed to query")
        .expect("Command not found");

    assert_eq!(found.target_agent_id, "A42");
    assert_eq!(found.status, TaskStatus::Pending);
    assert!(found.output.is_none());
    assert!(found.delivery_id.is_none());
}

#[tokio::test]
async fn test_filter_commands_by_status() {
    let db = setup_test_db().await;

    new_command("cmd-1", "A1", TaskStatus::Pending)
        .insert(&db)
        .await
        .unwrap();
    new_command("cmd-2", "A1", TaskStatus::Sent)
        .insert(&db)
        .await
        .unwrap();
    new_command("cmd-3", "A2", TaskStatus::Pending)
        .insert(&db)
        .await
        .unwrap();

    let pending_for_a1 = command::Entity::find()
        .filter(command::Column::TargetAgentId.eq("A1"))
        .filter(command::Column::Status.eq(TaskStatus::Pending))
        .count(&db)
        .await
        .unwrap();

    assert_eq!(pending_for_a1, 1);
}

#[tokio::test]
async fn test_insert_http_request() {
    let db = setup_test_db().await;
    let now = Utc::now();

    let request = http_request::ActiveModel {
        id: Set("req-1".to_string()),
        target_agent_id: Set("A7".to_string()),
        url: Set("https://127.0.0.1/api/?type=op".to_string()),
        method: Set("POST".to_string()),
        status: Set(TaskStatus::Pending),
        response: Set(None),
        delivery_id: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    };

    let inserted = request.insert(&db).await.expect("Failed to insert");
    assert_eq!(inserted.method, "POST");
    assert_eq!(inserted.status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_tunnel_session_status_round_trip() {
    let db = setup_test_db().await;
    let now = Utc::now();

    let session = tunnel_session::ActiveModel {
        id: Set("sess-1".to_string()),
        agent_id: Set("A7".to_string()),
        local_port: Set(8100),
        process_id: Set(Some(4242)),
        proxy_binding_id: Set(Some("b1".to_string())),
        status: Set(SessionStatus::Active),
        failure_reason: Set(None),
        created_at: Set(now),
        last_activity_at: Set(now),
        updated_at: Set(now),
    };
    session.insert(&db).await.expect("Failed to insert");

    let live = tunnel_session::Entity::find()
        .filter(
            tunnel_session::Column::Status.is_in([SessionStatus::Active, SessionStatus::Idle]),
        )
        .all(&db)
        .await
        .unwrap();

    assert_eq!(live.len(), 1);
    assert_eq!(live[0].local_port, 8100);
    assert_eq!(live[0].process_id, Some(4242));
}
