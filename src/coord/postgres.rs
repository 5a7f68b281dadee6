//! Postgres-backed coordination.
//!
//! Nodes live in `coord_nodes`, sessions in `coord_sessions`. Each client
//! owns one session row and renews its lease from a heartbeat task; a
//! session whose lease lapses is reaped by whichever client notices first,
//! taking its ephemeral nodes with it. Every mutation emits
//! `pg_notify('coord_events', '<kind>:<path>')` inside its transaction, and
//! a `PgListener` task turns those notifications into watch deliveries.
//!
//! The client API is blocking: calls run on the supplied tokio runtime via
//! [`Handle::block_on`], so they must come from plain OS threads.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgConnection, PgPool};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Coordinator, CreateMode, EventType, Op, SessionState, StateListener, Watch, WatchDispatcher,
    WatchedEvent, parent_of, sequence_suffix, validate_path,
};
use crate::error::{Error, Result};

const CHANNEL: &str = "coord_events";

#[derive(Debug, Clone)]
pub struct PgCoordinatorOptions {
    /// Lease length. A session not renewed within this window is dead.
    pub session_timeout: Duration,
    pub max_connections: u32,
}

impl Default for PgCoordinatorOptions {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(30),
            max_connections: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Watches {
    data: HashMap<String, Vec<Watch>>,
    children: HashMap<String, Vec<Watch>>,
}

struct Shared {
    id: String,
    state: Mutex<SessionState>,
    listeners: Mutex<Vec<Arc<dyn Fn(SessionState) + Send + Sync>>>,
    watches: Mutex<Watches>,
    dispatcher: WatchDispatcher,
}

impl Shared {
    fn transition(&self, to: SessionState) {
        {
            let mut state = self.state.lock();
            if *state == to || *state == SessionState::Lost {
                return;
            }
            *state = to;
        }
        info!(session = %self.id, state = ?to, "session state changed");
        let listeners: Vec<_> = self.listeners.lock().clone();
        for listener in listeners {
            listener(to);
        }
    }

    /// Route one `coord_events` payload to the watches it triggers.
    fn on_notification(&self, payload: &str) {
        let Some((kind, path)) = payload.split_once(':') else {
            debug!(payload, "ignoring malformed coordination event");
            return;
        };
        let event_type = match kind {
            "created" => EventType::Created,
            "changed" => EventType::Changed,
            "deleted" => EventType::Deleted,
            "child" => EventType::Child,
            _ => return,
        };

        let fired = {
            let mut watches = self.watches.lock();
            let mut fired = Vec::new();
            if event_type == EventType::Child || event_type == EventType::Deleted {
                fired.extend(watches.children.remove(path).unwrap_or_default());
            }
            if event_type != EventType::Child {
                fired.extend(watches.data.remove(path).unwrap_or_default());
            }
            fired
        };
        for watch in fired {
            self.dispatcher.deliver(
                watch,
                WatchedEvent {
                    event_type,
                    path: path.to_string(),
                },
            );
        }
    }

    /// Fire every pending watch. Used when notifications may have been lost,
    /// so watchers re-read and re-arm.
    fn fire_all(&self) {
        let watches = std::mem::take(&mut *self.watches.lock());
        for (path, list) in watches.data {
            for watch in list {
                self.dispatcher.deliver(
                    watch,
                    WatchedEvent {
                        event_type: EventType::Changed,
                        path: path.clone(),
                    },
                );
            }
        }
        for (path, list) in watches.children {
            for watch in list {
                self.dispatcher.deliver(
                    watch,
                    WatchedEvent {
                        event_type: EventType::Child,
                        path: path.clone(),
                    },
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// One coordination session backed by Postgres.
pub struct PgCoordinator {
    handle: Handle,
    pool: PgPool,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PgCoordinator {
    /// Connect, run migrations, open a session and start the heartbeat and
    /// notification tasks on `handle`.
    pub fn connect(handle: Handle, url: &str, options: PgCoordinatorOptions) -> Result<Arc<Self>> {
        let id = Uuid::new_v4().simple().to_string();
        let timeout = options.session_timeout;

        let (pool, listener) = handle.block_on(async {
            let pool = PgPoolOptions::new()
                .max_connections(options.max_connections)
                .connect(url)
                .await?;
            sqlx::migrate!("./migrations").run(&pool).await?;

            sqlx::query(
                "INSERT INTO coord_sessions (id, expires_at)
                 VALUES ($1, now() + make_interval(secs => $2))",
            )
            .bind(&id)
            .bind(timeout.as_secs_f64())
            .execute(&pool)
            .await?;

            let mut listener = PgListener::connect_with(&pool).await?;
            listener.listen(CHANNEL).await?;
            Ok::<_, Error>((pool, listener))
        })?;

        let shared = Arc::new(Shared {
            id,
            state: Mutex::new(SessionState::Connected),
            listeners: Mutex::new(Vec::new()),
            watches: Mutex::new(Watches::default()),
            dispatcher: WatchDispatcher::spawn("pg-coord")?,
        });
        info!(session = %shared.id, "coordination session opened");

        let tasks = vec![
            handle.spawn(heartbeat(pool.clone(), Arc::clone(&shared), timeout)),
            handle.spawn(listen(listener, Arc::clone(&shared))),
        ];

        Ok(Arc::new(Self {
            handle,
            pool,
            shared,
            tasks: Mutex::new(tasks),
        }))
    }

    /// End the session now instead of waiting for the lease to lapse.
    pub fn close(&self) -> Result<()> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let id = self.shared.id.clone();
        let pool = self.pool.clone();
        let result = self.handle.block_on(async move {
            let mut tx = pool.begin().await?;
            reap_sessions(&mut *tx, "id = $1", Some(id.as_str())).await?;
            tx.commit().await?;
            Ok::<_, Error>(())
        });
        self.shared.transition(SessionState::Lost);
        result
    }

    fn run<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match self.state() {
            SessionState::Connected => {}
            SessionState::Suspended => return Err(Error::ConnectionLoss),
            SessionState::Lost => return Err(Error::SessionExpired),
        }
        self.handle.block_on(fut).map_err(classify)
    }
}

impl Drop for PgCoordinator {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Treat transport failures as a connection loss so callers retry them.
fn classify(err: Error) -> Error {
    match err {
        Error::Storage(
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Tls(_),
        ) => Error::ConnectionLoss,
        other => other,
    }
}

impl Coordinator for PgCoordinator {
    fn session_id(&self) -> &str {
        &self.shared.id
    }

    fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    fn add_listener(&self, listener: StateListener) {
        self.shared.listeners.lock().push(Arc::from(listener));
    }

    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.run(async {
            let mut tx = self.pool.begin().await?;
            let actual = create_in(&mut *tx, &self.shared.id, path, data, mode).await?;
            tx.commit().await?;
            Ok(actual)
        })
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.run(async {
            let row: Option<(Vec<u8>,)> =
                sqlx::query_as("SELECT data FROM coord_nodes WHERE path = $1")
                    .bind(path)
                    .fetch_optional(&self.pool)
                    .await?;
            row.map(|(data,)| data)
                .ok_or_else(|| Error::NoNode(path.to_string()))
        })
    }

    fn set(&self, path: &str, data: &[u8]) -> Result<()> {
        self.run(async {
            let mut tx = self.pool.begin().await?;
            let updated = sqlx::query("UPDATE coord_nodes SET data = $2 WHERE path = $1")
                .bind(path)
                .bind(data)
                .execute(&mut *tx)
                .await?;
            if updated.rows_affected() == 0 {
                return Err(Error::NoNode(path.to_string()));
            }
            notify(&mut *tx, "changed", path).await?;
            tx.commit().await?;
            Ok(())
        })
    }

    fn get_data_w(&self, path: &str, watch: Watch) -> Result<Option<Vec<u8>>> {
        // Arm first so a change between the read and the arm is not missed.
        self.shared
            .watches
            .lock()
            .data
            .entry(path.to_string())
            .or_default()
            .push(watch);
        self.run(async {
            let row: Option<(Vec<u8>,)> =
                sqlx::query_as("SELECT data FROM coord_nodes WHERE path = $1")
                    .bind(path)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row.map(|(data,)| data))
        })
    }

    fn get_children(&self, path: &str, watch: Option<Watch>) -> Result<Vec<String>> {
        self.run(async {
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT path FROM coord_nodes WHERE path = $1")
                    .bind(path)
                    .fetch_optional(&self.pool)
                    .await?;
            if exists.is_none() {
                return Err(Error::NoNode(path.to_string()));
            }
            if let Some(watch) = watch {
                self.shared
                    .watches
                    .lock()
                    .children
                    .entry(path.to_string())
                    .or_default()
                    .push(watch);
            }
            let rows: Vec<(String,)> =
                sqlx::query_as("SELECT path FROM coord_nodes WHERE parent = $1 ORDER BY path")
                    .bind(path)
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows
                .into_iter()
                .map(|(child,)| super::name_of(&child).to_string())
                .collect())
        })
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.run(async {
            let mut tx = self.pool.begin().await?;
            delete_in(&mut *tx, path).await?;
            tx.commit().await?;
            Ok(())
        })
    }

    fn multi(&self, ops: Vec<Op>) -> Result<()> {
        self.run(async {
            let mut tx = self.pool.begin().await?;
            for op in &ops {
                match op {
                    Op::Create { path, data, mode } => {
                        create_in(&mut *tx, &self.shared.id, path, data, *mode).await?;
                    }
                    Op::Delete { path } => delete_in(&mut *tx, path).await?,
                }
            }
            tx.commit().await?;
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// SQL helpers
// ---------------------------------------------------------------------------

async fn notify(conn: &mut PgConnection, kind: &str, path: &str) -> Result<()> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(CHANNEL)
        .bind(format!("{kind}:{path}"))
        .execute(conn)
        .await?;
    Ok(())
}

async fn create_in(
    conn: &mut PgConnection,
    session: &str,
    path: &str,
    data: &[u8],
    mode: CreateMode,
) -> Result<String> {
    validate_path(path)?;
    let parent = parent_of(path);

    let seq: Option<(i64,)> = if mode.is_sequential() {
        sqlx::query_as(
            "UPDATE coord_nodes SET next_child_seq = next_child_seq + 1
             WHERE path = $1 RETURNING next_child_seq - 1",
        )
        .bind(parent)
        .fetch_optional(&mut *conn)
        .await?
    } else {
        sqlx::query_as("SELECT next_child_seq FROM coord_nodes WHERE path = $1 FOR UPDATE")
            .bind(parent)
            .fetch_optional(&mut *conn)
            .await?
    };
    let Some((seq,)) = seq else {
        return Err(Error::NoNode(parent.to_string()));
    };

    let actual = if mode.is_sequential() {
        format!("{path}{}", sequence_suffix(seq.max(0) as u64))
    } else {
        path.to_string()
    };
    let owner = mode.is_ephemeral().then_some(session);

    let inserted: Option<(String,)> = sqlx::query_as(
        "INSERT INTO coord_nodes (path, parent, data, ephemeral_owner)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (path) DO NOTHING
         RETURNING path",
    )
    .bind(&actual)
    .bind(parent)
    .bind(data)
    .bind(owner)
    .fetch_optional(&mut *conn)
    .await?;
    if inserted.is_none() {
        return Err(Error::NodeExists(actual));
    }

    notify(conn, "created", &actual).await?;
    notify(conn, "child", parent).await?;
    Ok(actual)
}

async fn delete_in(conn: &mut PgConnection, path: &str) -> Result<()> {
    let (has_children,): (bool,) =
        sqlx::query_as("SELECT EXISTS (SELECT 1 FROM coord_nodes WHERE parent = $1)")
            .bind(path)
            .fetch_one(&mut *conn)
            .await?;
    if has_children {
        return Err(Error::NotEmpty(path.to_string()));
    }

    let deleted: Option<(String,)> =
        sqlx::query_as("DELETE FROM coord_nodes WHERE path = $1 RETURNING parent")
            .bind(path)
            .fetch_optional(&mut *conn)
            .await?;
    let Some((parent,)) = deleted else {
        return Err(Error::NoNode(path.to_string()));
    };

    notify(conn, "deleted", path).await?;
    notify(conn, "child", &parent).await?;
    Ok(())
}

/// Delete matching sessions and their ephemeral nodes, announcing each
/// removed node. `filter` is a predicate over `coord_sessions`.
async fn reap_sessions(conn: &mut PgConnection, filter: &str, id: Option<&str>) -> Result<u64> {
    let sql = format!(
        "DELETE FROM coord_nodes WHERE ephemeral_owner IN
           (SELECT id FROM coord_sessions WHERE {filter})
         RETURNING path, parent"
    );
    let mut query = sqlx::query_as::<_, (String, String)>(&sql);
    if let Some(id) = id {
        query = query.bind(id);
    }
    let removed = query.fetch_all(&mut *conn).await?;
    for (path, parent) in &removed {
        notify(conn, "deleted", path).await?;
        notify(conn, "child", parent).await?;
    }

    let sql = format!("DELETE FROM coord_sessions WHERE {filter}");
    let mut query = sqlx::query(&sql);
    if let Some(id) = id {
        query = query.bind(id);
    }
    query.execute(&mut *conn).await?;
    Ok(removed.len() as u64)
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn heartbeat(pool: PgPool, shared: Arc<Shared>, timeout: Duration) {
    let mut ticker = tokio::time::interval(timeout / 3);
    let mut last_renewed = Instant::now();

    loop {
        ticker.tick().await;

        let renewed = sqlx::query(
            "UPDATE coord_sessions SET expires_at = now() + make_interval(secs => $2)
             WHERE id = $1",
        )
        .bind(&shared.id)
        .bind(timeout.as_secs_f64())
        .execute(&pool)
        .await;

        match renewed {
            Ok(result) if result.rows_affected() == 0 => {
                warn!(session = %shared.id, "session row gone; session lost");
                shared.transition(SessionState::Lost);
                return;
            }
            Ok(_) => {
                last_renewed = Instant::now();
                if *shared.state.lock() == SessionState::Suspended {
                    shared.transition(SessionState::Connected);
                }
            }
            Err(e) => {
                warn!(session = %shared.id, error = %e, "session heartbeat failed");
                if last_renewed.elapsed() >= timeout {
                    shared.transition(SessionState::Lost);
                    return;
                }
                shared.transition(SessionState::Suspended);
                continue;
            }
        }

        let reaped = async {
            let mut tx = pool.begin().await?;
            let n = reap_sessions(&mut *tx, "expires_at < now()", None).await?;
            tx.commit().await?;
            Ok::<_, Error>(n)
        }
        .await;
        match reaped {
            Ok(0) => {}
            Ok(n) => info!(nodes = n, "reaped ephemeral nodes of expired sessions"),
            Err(e) => debug!(error = %e, "session reaping failed"),
        }
    }
}

async fn listen(mut listener: PgListener, shared: Arc<Shared>) {
    loop {
        match listener.recv().await {
            Ok(notification) => shared.on_notification(notification.payload()),
            Err(e) => {
                // The listener reconnects on the next recv; anything sent in
                // between is gone, so make every watcher re-read.
                warn!(error = %e, "coordination event stream interrupted");
                shared.fire_all();
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
