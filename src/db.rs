use crate::config::Config;
use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "peerassess.sqlite3";

pub fn table_name(prefix: &str, name: &str) -> String {
    format!("{}{}", prefix, name)
}

pub fn open_db(workspace: &Path, config: &Config) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_schema(&conn, &config.table_prefix)?;
    Ok(conn)
}

/// Creates the prefixed tables the result queries read. Existing tables are left alone.
pub fn create_schema(conn: &Connection, prefix: &str) -> anyhow::Result<()> {
    let collection = table_name(prefix, "user_collection");
    let group = table_name(prefix, "user_group");
    let member = table_name(prefix, "user_group_member");
    let assessment = table_name(prefix, "assessment");
    let mark = table_name(prefix, "user_mark");

    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {collection}(
                collection_id TEXT PRIMARY KEY,
                module_id INTEGER NOT NULL,
                collection_name TEXT NOT NULL,
                collection_created_on TEXT,
                collection_locked_on TEXT
            )"
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE INDEX IF NOT EXISTS idx_{collection}_module ON {collection}(module_id)"
        ),
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {group}(
                group_id TEXT PRIMARY KEY,
                collection_id TEXT NOT NULL,
                group_name TEXT NOT NULL,
                FOREIGN KEY(collection_id) REFERENCES {collection}(collection_id)
            )"
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE INDEX IF NOT EXISTS idx_{group}_collection ON {group}(collection_id)"
        ),
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {member}(
                group_id TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                PRIMARY KEY(group_id, user_id),
                FOREIGN KEY(group_id) REFERENCES {group}(group_id)
            )"
        ),
        [],
    )?;
    conn.execute(
        &format!("CREATE INDEX IF NOT EXISTS idx_{member}_user ON {member}(user_id)"),
        [],
    )?;

    // open_date/close_date are stored as 'YYYY-MM-DD HH:MM:SS' text so range
    // comparisons on bound string parameters order correctly.
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {assessment}(
                assessment_id TEXT PRIMARY KEY,
                module_id INTEGER NOT NULL,
                assessment_name TEXT NOT NULL,
                collection_id TEXT NOT NULL,
                open_date TEXT NOT NULL,
                close_date TEXT NOT NULL,
                FOREIGN KEY(collection_id) REFERENCES {collection}(collection_id)
            )"
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE INDEX IF NOT EXISTS idx_{assessment}_module_open ON {assessment}(module_id, open_date)"
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE INDEX IF NOT EXISTS idx_{assessment}_collection ON {assessment}(collection_id)"
        ),
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {mark}(
                assessment_id TEXT NOT NULL,
                group_id TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                marked_user_id INTEGER NOT NULL,
                question_id INTEGER NOT NULL,
                score INTEGER NOT NULL,
                PRIMARY KEY(assessment_id, group_id, user_id, marked_user_id, question_id),
                FOREIGN KEY(assessment_id) REFERENCES {assessment}(assessment_id)
            )"
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE INDEX IF NOT EXISTS idx_{mark}_assessment_user ON {mark}(assessment_id, user_id)"
        ),
        [],
    )?;

    Ok(())
}
