//! PostgreSQL dialect.

use super::{base_queries, Dialect, Placeholder};

/// unique_violation.
const UNIQUE_CODES: &[&str] = &["23505"];

/// serialization_failure, deadlock_detected, too_many_connections.
const RETRY_CODES: &[&str] = &["40001", "40P01", "53300"];

pub fn dialect(table: &str) -> Dialect {
    let base = base_queries(table);

    Dialect {
        placeholder: Placeholder::Dollar,
        last_insert_id: false,
        insert_sql: format!("{} RETURNING id", base.insert_sql),
        current_revision_sql: base.current_revision_sql,
        compact_revision_sql: base.compact_revision_sql,
        list_current_sql: base.list_current_sql,
        list_revision_sql: base.list_revision_sql,
        count_current_sql: base.count_current_sql,
        count_revision_sql: base.count_revision_sql,
        after_sql: base.after_sql,
        get_size_sql: format!("SELECT pg_total_relation_size('{table}')"),
        compact_sql: base.compact_sql,
        update_watermark_sql: base.update_watermark_sql,
        schema: schema(table),
        migrations: vec![
            format!("ALTER TABLE {table} ALTER COLUMN id SET NOT NULL"),
            // Placeholder so migration levels line up with the MySQL list.
            String::new(),
        ],
        unique_codes: UNIQUE_CODES,
        retry_codes: RETRY_CODES,
        setup_ok_codes: &[],
    }
}

fn schema(table: &str) -> Vec<String> {
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {table} ( \
             id BIGSERIAL PRIMARY KEY, \
             name VARCHAR(630) COLLATE \"C\" NOT NULL, \
             created BIGINT, \
             deleted BIGINT, \
             create_revision BIGINT, \
             prev_revision BIGINT, \
             lease BIGINT, \
             value BYTEA, \
             old_value BYTEA)"
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_capabilities() {
        let d = dialect("kine");
        assert_eq!(d.placeholder, Placeholder::Dollar);
        assert!(!d.last_insert_id);
        assert!(d.insert_sql.ends_with("RETURNING id"));
    }

    #[test]
    fn test_ascii_collation() {
        let d = dialect("kine");
        assert!(d.schema[0].contains("COLLATE \"C\""));
    }
}
