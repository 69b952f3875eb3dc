//! SQLite dialect.

use super::{base_queries, Dialect, Placeholder};

/// Extended result codes for constraint violations on the unique
/// (name, prev_revision) index, plus the plain CONSTRAINT code some
/// builds report.
const UNIQUE_CODES: &[&str] = &["1555", "2067", "19"];

/// SQLITE_BUSY and SQLITE_LOCKED, including their extended forms.
const RETRY_CODES: &[&str] = &["5", "517", "6", "262"];

pub fn dialect(table: &str) -> Dialect {
    let base = base_queries(table);

    Dialect {
        placeholder: Placeholder::Question,
        last_insert_id: true,
        insert_sql: base.insert_sql,
        current_revision_sql: base.current_revision_sql,
        compact_revision_sql: base.compact_revision_sql,
        list_current_sql: base.list_current_sql,
        list_revision_sql: base.list_revision_sql,
        count_current_sql: base.count_current_sql,
        count_revision_sql: base.count_revision_sql,
        after_sql: base.after_sql,
        get_size_sql: "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()"
            .to_string(),
        compact_sql: base.compact_sql,
        update_watermark_sql: base.update_watermark_sql,
        schema: schema(table),
        migrations: vec![],
        unique_codes: UNIQUE_CODES,
        retry_codes: RETRY_CODES,
        setup_ok_codes: &[],
    }
}

fn schema(table: &str) -> Vec<String> {
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {table} ( \
             id INTEGER PRIMARY KEY AUTOINCREMENT, \
             name TEXT NOT NULL, \
             created INTEGER, \
             deleted INTEGER, \
             create_revision INTEGER, \
             prev_revision INTEGER, \
             lease INTEGER, \
             value BLOB, \
             old_value BLOB)"
        ),
        format!("CREATE INDEX IF NOT EXISTS {table}_name_index ON {table} (name)"),
        format!("CREATE INDEX IF NOT EXISTS {table}_name_id_index ON {table} (name, id)"),
        format!("CREATE INDEX IF NOT EXISTS {table}_id_deleted_index ON {table} (id, deleted)"),
        format!("CREATE INDEX IF NOT EXISTS {table}_prev_revision_index ON {table} (prev_revision)"),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {table}_name_prev_revision_uindex \
             ON {table} (name, prev_revision)"
        ),
    ]
}
