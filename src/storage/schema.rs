//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS jobs_script (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            descr TEXT NOT NULL DEFAULT '',
            project TEXT NOT NULL DEFAULT '',
            label TEXT NOT NULL DEFAULT '',
            language TEXT NOT NULL DEFAULT '',
            enabled INTEGER NOT NULL DEFAULT 1,
            is_builtin INTEGER NOT NULL DEFAULT 0,
            username TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (project, label, name)
        );

        CREATE TABLE IF NOT EXISTS jobs_schedule (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            specification TEXT NOT NULL,
            is_enabled INTEGER NOT NULL DEFAULT 1,
            env_vars TEXT NOT NULL DEFAULT '',
            command_args TEXT NOT NULL DEFAULT '',
            work_dir TEXT NOT NULL DEFAULT '',
            timeout INTEGER NOT NULL DEFAULT 300,
            is_retry INTEGER NOT NULL DEFAULT 0,
            retry_interval INTEGER NOT NULL DEFAULT 60,
            max_retries INTEGER NOT NULL DEFAULT 3,
            username TEXT NOT NULL DEFAULT '',
            script_id INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (script_id) REFERENCES jobs_script(id)
        );

        CREATE TABLE IF NOT EXISTS jobs_script_record (
            id INTEGER PRIMARY KEY,
            trigger_type TEXT NOT NULL,
            status INTEGER NOT NULL DEFAULT 0,
            exit_code INTEGER NOT NULL DEFAULT -1,
            env_vars TEXT NOT NULL DEFAULT '',
            command_args TEXT NOT NULL DEFAULT '',
            work_dir TEXT NOT NULL DEFAULT '',
            timeout INTEGER NOT NULL DEFAULT 300,
            log_name TEXT NOT NULL,
            error_message TEXT NOT NULL DEFAULT '',
            username TEXT NOT NULL DEFAULT '',
            script_id INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (script_id) REFERENCES jobs_script(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_schedule_script ON jobs_schedule(script_id);
        CREATE INDEX IF NOT EXISTS idx_record_script ON jobs_script_record(script_id);
        CREATE INDEX IF NOT EXISTS idx_record_created ON jobs_script_record(created_at);",
    )?;

    Ok(())
}
