//! Server-side SQL assets
//!
//! Everything this crate installs into PostgreSQL: the query-analysis
//! routine, the per-table notify trigger template, and the shared
//! notification channel. All object names carry the reserved
//! `_pg_realtime_` prefix so an admin sweep can find them.
//!
//! The trigger requires the `pgcrypto` extension (for `digest`) and
//! PostgreSQL 14+ (`CREATE OR REPLACE TRIGGER`).

use crate::table::QualifiedTable;

/// The single NOTIFY channel shared by every trigger this crate installs.
pub const CHANNEL: &str = "_pg_realtime_table_changes";

/// Name prefix shared by every database object this crate owns.
pub const RESERVED_PREFIX: &str = "_pg_realtime_";

/// Name of the server-side query-analysis routine.
pub const PARSE_QUERY_FUNCTION: &str = "_pg_realtime_parse_query";

/// A column value longer than this many bytes is replaced by its SHA-256
/// digest before the envelope is built.
pub const COLUMN_HASH_THRESHOLD: usize = 5_000;

/// Target ceiling for the serialized envelope, kept under PostgreSQL's
/// 8 kB NOTIFY payload limit.
pub const ENVELOPE_SIZE_CEILING: usize = 7_500;

/// The degradation loop stops hashing once no un-hashed value is longer
/// than this many bytes.
pub const DEGRADE_FLOOR: usize = 64;

/// Quote an identifier for use in DDL.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Render a table as a quoted, schema-qualified relation for DDL.
pub fn quote_table(table: &QualifiedTable) -> String {
    format!("{}.{}", quote_ident(table.schema()), quote_ident(table.name()))
}

/// Name of the notify function for a table.
pub fn notify_function_name(table: &QualifiedTable) -> String {
    format!("{RESERVED_PREFIX}notify_{}", table.object_suffix())
}

/// Name of the trigger for a table.
pub fn trigger_name(table: &QualifiedTable) -> String {
    format!("{RESERVED_PREFIX}trigger_{}", table.object_suffix())
}

/// DDL for the query-analysis routine.
///
/// Creates a temporary view over the (parameter-stripped) query text, reads
/// the catalog's view-table-usage and view-column-usage for that view, and
/// emits one `('table', name, NULL)` row per dependent relation plus one
/// `('column', name, col)` row per (relation, column) pair. Partition
/// children resolve to their root parent so callers watch the logical
/// table. Schema `public` renders bare; other schemas render as
/// `schema.name`.
pub fn parse_query_function_sql() -> String {
    r#"
CREATE OR REPLACE FUNCTION _pg_realtime_parse_query(query_text text)
RETURNS TABLE (object_type text, tname text, cname text)
LANGUAGE plpgsql
AS $fn$
DECLARE
    v_view text := '_pg_realtime_q_'
        || substr(md5(random()::text || clock_timestamp()::text), 1, 16);
BEGIN
    EXECUTE format('CREATE TEMPORARY VIEW %I AS %s', v_view, query_text);

    RETURN QUERY
    WITH RECURSIVE dep AS (
        SELECT DISTINCT c.oid AS rel_oid
        FROM information_schema.view_table_usage vtu
        JOIN pg_catalog.pg_namespace n ON n.nspname = vtu.table_schema::text
        JOIN pg_catalog.pg_class c
          ON c.relnamespace = n.oid AND c.relname = vtu.table_name::text
        WHERE vtu.view_name::text = v_view
    ),
    ancestry AS (
        SELECT d.rel_oid, d.rel_oid AS ancestor, 0 AS depth
        FROM dep d
        UNION ALL
        SELECT a.rel_oid, i.inhparent, a.depth + 1
        FROM ancestry a
        JOIN pg_catalog.pg_class pc ON pc.oid = a.ancestor AND pc.relispartition
        JOIN pg_catalog.pg_inherits i ON i.inhrelid = a.ancestor
    ),
    root AS (
        SELECT DISTINCT ON (a.rel_oid) a.rel_oid, a.ancestor AS root_oid
        FROM ancestry a
        ORDER BY a.rel_oid, a.depth DESC
    ),
    named AS (
        SELECT r.rel_oid,
               CASE WHEN rn.nspname = 'public' THEN rc.relname::text
                    ELSE rn.nspname::text || '.' || rc.relname::text
               END AS rendered
        FROM root r
        JOIN pg_catalog.pg_class rc ON rc.oid = r.root_oid
        JOIN pg_catalog.pg_namespace rn ON rn.oid = rc.relnamespace
    )
    SELECT DISTINCT 'table'::text, nm.rendered, NULL::text
    FROM named nm
    UNION ALL
    SELECT DISTINCT 'column'::text, nm.rendered, vcu.column_name::text
    FROM information_schema.view_column_usage vcu
    JOIN pg_catalog.pg_namespace n2 ON n2.nspname = vcu.table_schema::text
    JOIN pg_catalog.pg_class c2
      ON c2.relnamespace = n2.oid AND c2.relname = vcu.table_name::text
    JOIN named nm ON nm.rel_oid = c2.oid
    WHERE vcu.view_name::text = v_view;

    EXECUTE format('DROP VIEW IF EXISTS %I', v_view);
END;
$fn$;
"#
    .to_string()
}

/// Template for the per-table notify function. Placeholders:
/// `__FN_NAME__`, `__TABLE_LITERAL__`, `__CHANNEL__`, and the three size
/// limits.
const NOTIFY_FUNCTION_TEMPLATE: &str = r#"
CREATE OR REPLACE FUNCTION __FN_NAME__()
RETURNS trigger
LANGUAGE plpgsql
AS $trg$
DECLARE
    v_row jsonb := '{}'::jsonb;
    v_old jsonb := '{}'::jsonb;
    v_hashed jsonb := '[]'::jsonb;
    v_envelope jsonb;
    v_payload text;
    v_att record;
    v_new_text text;
    v_old_text text;
    v_hash boolean;
    v_oid text;
    v_col text;
    v_len integer;
    v_text_oid text := 'text'::regtype::oid::text;
BEGIN
    FOR v_att IN
        SELECT a.attname::text AS attname, a.atttypid::text AS atttypid
        FROM pg_catalog.pg_attribute a
        WHERE a.attrelid = TG_RELID
          AND a.attnum > 0
          AND NOT a.attisdropped
        ORDER BY a.attnum
    LOOP
        v_new_text := NULL;
        v_old_text := NULL;
        IF TG_OP IN ('INSERT', 'UPDATE') THEN
            EXECUTE format('SELECT ($1).%I::text', v_att.attname)
               INTO v_new_text USING NEW;
        END IF;
        IF TG_OP IN ('UPDATE', 'DELETE') THEN
            EXECUTE format('SELECT ($1).%I::text', v_att.attname)
               INTO v_old_text USING OLD;
        END IF;

        v_hash := octet_length(coalesce(v_new_text, '')) > __HASH_THRESHOLD__
               OR octet_length(coalesce(v_old_text, '')) > __HASH_THRESHOLD__;
        v_oid := v_att.atttypid;
        IF v_hash THEN
            v_hashed := v_hashed || to_jsonb(v_att.attname);
            v_oid := v_text_oid;
        END IF;

        IF TG_OP = 'DELETE' THEN
            v_row := v_row || jsonb_build_object(v_att.attname, jsonb_build_object(
                'value', CASE WHEN v_hash AND v_old_text IS NOT NULL
                              THEN encode(digest(v_old_text, 'sha256'), 'hex')
                              ELSE v_old_text END,
                'oid', v_oid));
        ELSE
            v_row := v_row || jsonb_build_object(v_att.attname, jsonb_build_object(
                'value', CASE WHEN v_hash AND v_new_text IS NOT NULL
                              THEN encode(digest(v_new_text, 'sha256'), 'hex')
                              ELSE v_new_text END,
                'oid', v_oid));
        END IF;

        IF TG_OP = 'UPDATE' AND v_new_text IS DISTINCT FROM v_old_text THEN
            v_old := v_old || jsonb_build_object(v_att.attname, jsonb_build_object(
                'value', CASE WHEN v_hash AND v_old_text IS NOT NULL
                              THEN encode(digest(v_old_text, 'sha256'), 'hex')
                              ELSE v_old_text END,
                'oid', v_oid));
        END IF;
    END LOOP;

    v_envelope := jsonb_build_object(
        'table', '__TABLE_LITERAL__',
        'operation', TG_OP,
        'row', v_row,
        'hashed', v_hashed);
    IF TG_OP = 'UPDATE' THEN
        v_envelope := v_envelope || jsonb_build_object('old_values', v_old);
    END IF;

    v_payload := v_envelope::text;
    WHILE octet_length(v_payload) > __SIZE_CEILING__ LOOP
        v_col := NULL;
        v_len := NULL;
        SELECT e.key, octet_length(e.value ->> 'value')
          INTO v_col, v_len
          FROM jsonb_each(v_envelope -> 'row') AS e
         WHERE NOT v_envelope -> 'hashed' @> to_jsonb(e.key)
           AND e.value ->> 'value' IS NOT NULL
         ORDER BY octet_length(e.value ->> 'value') DESC
         LIMIT 1;

        IF v_col IS NULL OR v_len <= __DEGRADE_FLOOR__ THEN
            EXIT;
        END IF;

        v_envelope := jsonb_set(v_envelope, ARRAY['row', v_col], jsonb_build_object(
            'value', encode(digest(v_envelope -> 'row' -> v_col ->> 'value', 'sha256'), 'hex'),
            'oid', v_text_oid));
        IF v_envelope -> 'old_values' -> v_col ->> 'value' IS NOT NULL THEN
            v_envelope := jsonb_set(v_envelope, ARRAY['old_values', v_col], jsonb_build_object(
                'value', encode(digest(v_envelope -> 'old_values' -> v_col ->> 'value', 'sha256'), 'hex'),
                'oid', v_text_oid));
        END IF;
        v_envelope := jsonb_set(v_envelope, ARRAY['hashed'],
            (v_envelope -> 'hashed') || to_jsonb(v_col));
        v_payload := v_envelope::text;
    END LOOP;

    PERFORM pg_notify('__CHANNEL__', v_payload);
    RETURN NULL;
EXCEPTION WHEN OTHERS THEN
    PERFORM pg_notify('__CHANNEL__', jsonb_build_object(
        'table', '__TABLE_LITERAL__',
        'operation', TG_OP,
        'error', SQLERRM)::text);
    RETURN NULL;
END;
$trg$;
"#;

/// DDL for the notify function of one table.
///
/// Fired AFTER INSERT OR UPDATE OR DELETE FOR EACH ROW, the function
/// enumerates the relation's live attributes, extracts each value's text
/// form from NEW/OLD, hashes oversized values, builds the
/// `{table, operation, row, old_values, hashed}` envelope with `{value,
/// oid}` cells, degrades the envelope below the NOTIFY size ceiling by
/// hashing the largest remaining values, and notifies the shared channel.
/// Any failure inside the body is reported as an `{error}` envelope on the
/// same channel and swallowed.
pub fn notify_function_sql(table: &QualifiedTable) -> String {
    NOTIFY_FUNCTION_TEMPLATE
        .replace("__FN_NAME__", &quote_ident(&notify_function_name(table)))
        .replace("__TABLE_LITERAL__", &escape_literal(&table.to_string()))
        .replace("__CHANNEL__", CHANNEL)
        .replace("__HASH_THRESHOLD__", &COLUMN_HASH_THRESHOLD.to_string())
        .replace("__SIZE_CEILING__", &ENVELOPE_SIZE_CEILING.to_string())
        .replace("__DEGRADE_FLOOR__", &DEGRADE_FLOOR.to_string())
}

/// DDL for the trigger of one table. `CREATE OR REPLACE` keeps
/// re-installation idempotent and race-free under concurrent subscribes.
pub fn create_trigger_sql(table: &QualifiedTable) -> String {
    format!(
        "CREATE OR REPLACE TRIGGER {trigger} \
         AFTER INSERT OR UPDATE OR DELETE ON {relation} \
         FOR EACH ROW EXECUTE FUNCTION {function}()",
        trigger = quote_ident(&trigger_name(table)),
        relation = quote_table(table),
        function = quote_ident(&notify_function_name(table)),
    )
}

/// Query listing crate-owned triggers as (trigger_name, relation) pairs.
pub fn list_owned_triggers_sql() -> String {
    r"
SELECT t.tgname::text AS trigger_name,
       n.nspname::text || '.' || c.relname::text AS relation
FROM pg_catalog.pg_trigger t
JOIN pg_catalog.pg_class c ON c.oid = t.tgrelid
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
WHERE NOT t.tgisinternal
  AND t.tgname LIKE '\_pg\_realtime\_%'
"
    .to_string()
}

/// Query listing crate-owned functions as droppable signatures.
pub fn list_owned_functions_sql() -> String {
    r"
SELECT p.oid::regprocedure::text AS signature
FROM pg_catalog.pg_proc p
JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace
WHERE p.proname LIKE '\_pg\_realtime\_%'
"
    .to_string()
}

/// Escape a string for inclusion as a SQL literal body (single quotes
/// doubled). The caller supplies the surrounding quotes in the template.
fn escape_literal(s: &str) -> String {
    s.replace('\'', "''")
}
