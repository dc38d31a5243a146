use rusqlite::Connection;

pub fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS partners (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            contact_email TEXT,
            status TEXT NOT NULL DEFAULT 'prospect',
            last_update_note TEXT,
            updated_at TEXT,
            emails TEXT NOT NULL DEFAULT '[]'
        );

        CREATE TABLE IF NOT EXISTS kv_state (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_partners_status ON partners(status);
        CREATE INDEX IF NOT EXISTS idx_partners_contact_email ON partners(contact_email);
        "#,
    )?;

    Ok(())
}
