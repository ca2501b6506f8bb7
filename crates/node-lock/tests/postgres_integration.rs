//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container and need a Docker daemon.
//! Run with:
//!
//! ```bash
//! cargo test -p node-lock --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use common::NodeId;
use document_store::{DocumentFolder, DocumentStoreConfig, PostgresDocumentStore};
use node_lock::{LockConfig, LockMode, LockOutcome, NodeLockManager};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::migrate!("../../migrations")
                .run(&temp_pool)
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// A lock folder on a fresh store with cleared tables. Each call opens its
/// own pool, so two calls behave like two nodes sharing one database.
async fn node_folder(truncate: bool) -> DocumentFolder {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    if truncate {
        sqlx::query("TRUNCATE TABLE documents, documents_index")
            .execute(&pool)
            .await
            .unwrap();
    }

    PostgresDocumentStore::with_config(
        pool,
        DocumentStoreConfig {
            poll_interval: Duration::from_millis(200),
            reconnect_delay: Duration::from_millis(200),
        },
    )
    .folder()
    .sub_folder("locks")
    .unwrap()
}

fn manager(folder: DocumentFolder, node: &str) -> NodeLockManager {
    NodeLockManager::with_config(
        folder,
        NodeId::from_string(node),
        LockConfig {
            poll_interval: Duration::from_millis(500),
        },
    )
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon"]
async fn lock_is_exclusive_across_nodes() {
    let a = manager(node_folder(true).await, "node-a");
    let b = manager(node_folder(false).await, "node-b");

    assert_eq!(
        a.lock("rebuild.tools", LockMode::NoWait).await.unwrap(),
        LockOutcome::Locked
    );
    assert_eq!(
        b.lock("rebuild.tools", LockMode::NoWait).await.unwrap(),
        LockOutcome::CannotLock
    );
    // Re-entrant for the holder
    assert_eq!(
        a.lock("rebuild.tools", LockMode::NoWait).await.unwrap(),
        LockOutcome::Locked
    );

    a.unlock("rebuild.tools").await.unwrap();
    assert_eq!(
        b.lock("rebuild.tools", LockMode::NoWait).await.unwrap(),
        LockOutcome::Locked
    );
    assert_eq!(b.held_locks(), vec!["rebuild.tools".to_string()]);
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon"]
async fn waiting_node_acquires_after_release() {
    let a = manager(node_folder(true).await, "node-a");
    let b = Arc::new(manager(node_folder(false).await, "node-b"));

    assert_eq!(
        a.lock("rebuild.tools", LockMode::Wait).await.unwrap(),
        LockOutcome::Locked
    );

    let waiter = {
        let b = b.clone();
        tokio::spawn(async move { b.lock("rebuild.tools", LockMode::Wait).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!waiter.is_finished());

    a.dispose().await;
    let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter should acquire the released lock")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, LockOutcome::Locked);
    assert!(a.held_locks().is_empty());
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon"]
async fn concurrent_lockers_have_one_winner() {
    let mut handles = Vec::new();
    for i in 0..6 {
        let folder = node_folder(i == 0).await;
        handles.push(tokio::spawn(async move {
            manager(folder, &format!("node-{i}"))
                .lock("compaction", LockMode::NoWait)
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() == LockOutcome::Locked {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}
