//! MySQL dialect.

use super::{base_queries, Dialect, Placeholder, COMPACT_REV_KEY};

/// ER_DUP_ENTRY.
const UNIQUE_CODES: &[&str] = &["1062"];

/// ER_LOCK_WAIT_TIMEOUT, ER_LOCK_DEADLOCK, ER_CON_COUNT_ERROR.
const RETRY_CODES: &[&str] = &["1205", "1213", "1040"];

/// ER_TABLE_EXISTS_ERROR, ER_DUP_KEYNAME: MySQL DDL has no
/// IF NOT EXISTS for indexes, so setup tolerates these.
const SETUP_OK_CODES: &[&str] = &["1050", "1061"];

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
        get_size_sql: format!(
            "SELECT CAST(COALESCE(SUM(data_length + index_length), 0) AS SIGNED) \
             FROM information_schema.TABLES \
             WHERE table_schema = DATABASE() AND table_name = '{table}'"
        ),
        // MySQL rejects a DELETE whose subquery reads the target table;
        // the derived-table join form is equivalent.
        compact_sql: format!(
            "DELETE kv FROM {table} AS kv INNER JOIN ( \
             SELECT kp.prev_revision AS id FROM {table} AS kp \
             WHERE kp.name != '{COMPACT_REV_KEY}' AND kp.prev_revision != 0 AND kp.id <= ? \
             UNION \
             SELECT kd.id AS id FROM {table} AS kd \
             WHERE kd.deleted != 0 AND kd.id <= ?) AS ks ON kv.id = ks.id"
        ),
        update_watermark_sql: base.update_watermark_sql,
        schema: schema(table),
        migrations: vec![
            format!(
                "ALTER TABLE {table} \
                 MODIFY COLUMN id BIGINT AUTO_INCREMENT NOT NULL, \
                 MODIFY COLUMN create_revision BIGINT, \
                 MODIFY COLUMN prev_revision BIGINT"
            ),
            // Placeholder so migration levels line up with the PostgreSQL list.
            String::new(),
        ],
        unique_codes: UNIQUE_CODES,
        retry_codes: RETRY_CODES,
        setup_ok_codes: SETUP_OK_CODES,
    }
}

fn schema(table: &str) -> Vec<String> {
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {table} ( \
             id BIGINT AUTO_INCREMENT, \
             name VARCHAR(630) CHARACTER SET ascii, \
             created BIGINT, \
             deleted BIGINT, \
             create_revision BIGINT, \
             prev_revision BIGINT, \
             lease BIGINT, \
             value MEDIUMBLOB, \
             old_value MEDIUMBLOB, \
             PRIMARY KEY (id))"
        ),
        format!("CREATE INDEX {table}_name_index ON {table} (name)"),
        format!("CREATE INDEX {table}_name_id_index ON {table} (name, id)"),
        format!("CREATE INDEX {table}_id_deleted_index ON {table} (id, deleted)"),
        format!("CREATE INDEX {table}_prev_revision_index ON {table} (prev_revision)"),
        format!(
            "CREATE UNIQUE INDEX {table}_name_prev_revision_uindex \
             ON {table} (name, prev_revision)"
        ),
    ]
}
