//! Database schema migrations.
//!
//! Version 1 creates users, tasks, plans, the append-only task log, the
//! encrypted vault, confirmations, the cost ledger and semantic memory.
//! Version 2 indexes the unarchived tasks that recovery and the sweeper scan.

use rusqlite::Connection;
use tracing::info;

use taskpilot_core::error::TaskPilotError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), TaskPilotError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| TaskPilotError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| TaskPilotError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }
    if current_version < 2 {
        apply_v2(conn)?;
        info!("Applied migration v2: open_task_index");
    }

    Ok(())
}

/// Version 1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<(), TaskPilotError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY NOT NULL,
            email       TEXT NOT NULL UNIQUE,
            name        TEXT NOT NULL DEFAULT '',
            phone       TEXT,
            is_active   INTEGER NOT NULL DEFAULT 1,
            created_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id              TEXT PRIMARY KEY NOT NULL,
            user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            goal            TEXT NOT NULL,
            state           TEXT NOT NULL
                            CHECK (state IN ('init', 'gather_info', 'research',
                                             'ready_to_execute', 'call_in_progress',
                                             'awaiting_user_input', 'summarize',
                                             'completed', 'failed', 'escalated')),
            priority        TEXT NOT NULL DEFAULT 'medium'
                            CHECK (priority IN ('low', 'medium', 'high', 'urgent')),
            active_plan_id  TEXT,
            metadata        TEXT NOT NULL DEFAULT '{}',
            monitor         TEXT NOT NULL DEFAULT '{}',
            suspension      TEXT,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL,
            archived_at     INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks (user_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks (state);

        CREATE TABLE IF NOT EXISTS plans (
            id                  TEXT PRIMARY KEY NOT NULL,
            task_id             TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            version             INTEGER NOT NULL,
            intent              TEXT NOT NULL,
            intent_confidence   REAL NOT NULL,
            reason              TEXT,
            steps               TEXT NOT NULL,
            created_at          INTEGER NOT NULL,
            superseded_at       INTEGER,
            UNIQUE (task_id, version)
        );

        CREATE TABLE IF NOT EXISTS task_logs (
            id          TEXT PRIMARY KEY NOT NULL,
            task_id     TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            seq         INTEGER NOT NULL,
            event_type  TEXT NOT NULL,
            payload     TEXT NOT NULL DEFAULT '{}',
            timestamp   INTEGER NOT NULL,
            UNIQUE (task_id, seq)
        );

        CREATE TRIGGER IF NOT EXISTS task_logs_immutable
            BEFORE UPDATE ON task_logs
        BEGIN
            SELECT RAISE(ABORT, 'task log entries are immutable');
        END;

        CREATE TABLE IF NOT EXISTS vault_entries (
            id                  TEXT PRIMARY KEY NOT NULL,
            user_id             TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            company             TEXT NOT NULL,
            account_number      TEXT NOT NULL,
            secret_nonce        TEXT NOT NULL,
            secret_ciphertext   TEXT NOT NULL,
            metadata            TEXT NOT NULL DEFAULT '{}',
            created_at          INTEGER NOT NULL,
            updated_at          INTEGER NOT NULL,
            UNIQUE (user_id, company)
        );

        CREATE TABLE IF NOT EXISTS confirmations (
            id            TEXT PRIMARY KEY NOT NULL,
            task_id       TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            plan_id       TEXT NOT NULL,
            step_index    INTEGER NOT NULL,
            action        TEXT NOT NULL,
            description   TEXT NOT NULL,
            status        TEXT NOT NULL DEFAULT 'pending'
                          CHECK (status IN ('pending', 'approved', 'denied', 'expired')),
            requested_at  INTEGER NOT NULL,
            decided_at    INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_confirmations_step
            ON confirmations (plan_id, step_index);

        CREATE TABLE IF NOT EXISTS cost_ledger (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id        TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            plan_id        TEXT NOT NULL,
            step_index     INTEGER NOT NULL,
            action         TEXT NOT NULL,
            tokens         INTEGER NOT NULL DEFAULT 0,
            duration_secs  REAL NOT NULL DEFAULT 0,
            units          REAL NOT NULL DEFAULT 0,
            cost           REAL NOT NULL DEFAULT 0,
            recorded_at    INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS semantic_memories (
            id          TEXT PRIMARY KEY NOT NULL,
            user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            content     TEXT NOT NULL,
            embedding   TEXT NOT NULL,
            metadata    TEXT NOT NULL DEFAULT '{}',
            created_at  INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_semantic_memories_user
            ON semantic_memories (user_id);

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| TaskPilotError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}

/// Version 2: partial index over unarchived tasks.
fn apply_v2(conn: &Connection) -> Result<(), TaskPilotError> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_tasks_open
            ON tasks (created_at) WHERE archived_at IS NULL;

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (2, 'open_task_index');
        ",
    )
    .map_err(|e| TaskPilotError::Storage(format!("Failed to apply migration v2: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn insert_user_and_task(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO users (id, email, name, created_at) VALUES ('u1', 'a@example.com', 'A', 0);
             INSERT INTO tasks (id, user_id, goal, state, created_at, updated_at)
                 VALUES ('t1', 'u1', 'Cancel my Comcast account', 'init', 0, 0);
             INSERT INTO task_logs (id, task_id, seq, event_type, timestamp)
                 VALUES ('l1', 't1', 1, 'task_created', 0);",
        )
        .unwrap();
    }

    #[test]
    fn test_migrations_run_once() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn test_open_task_index_exists() {
        let conn = open_test_conn();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_tasks_open'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_state_check_constraint() {
        let conn = open_test_conn();
        insert_user_and_task(&conn);
        let result = conn.execute("UPDATE tasks SET state = 'paused' WHERE id = 't1'", []);
        assert!(result.is_err());
    }

    #[test]
    fn test_task_logs_reject_update() {
        let conn = open_test_conn();
        insert_user_and_task(&conn);
        let result = conn.execute("UPDATE task_logs SET payload = '{}' WHERE id = 'l1'", []);
        assert!(result.is_err());
    }

    #[test]
    fn test_log_sequence_unique_per_task() {
        let conn = open_test_conn();
        insert_user_and_task(&conn);
        let result = conn.execute(
            "INSERT INTO task_logs (id, task_id, seq, event_type, timestamp)
             VALUES ('l2', 't1', 1, 'tool_invoked', 0)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_user_delete_cascades() {
        let conn = open_test_conn();
        insert_user_and_task(&conn);
        conn.execute("DELETE FROM users WHERE id = 'u1'", []).unwrap();

        let tasks: i64 = conn
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))
            .unwrap();
        let logs: i64 = conn
            .query_row("SELECT COUNT(*) FROM task_logs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(tasks, 0);
        assert_eq!(logs, 0);
    }

    #[test]
    fn test_vault_unique_per_user_company() {
        let conn = open_test_conn();
        insert_user_and_task(&conn);
        let insert = "INSERT INTO vault_entries (id, user_id, company, account_number,
                          secret_nonce, secret_ciphertext, created_at, updated_at)
                      VALUES (?1, 'u1', 'comcast', '1', 'n', 'c', 0, 0)";
        conn.execute(insert, ["v1"]).unwrap();
        assert!(conn.execute(insert, ["v2"]).is_err());
    }
}
