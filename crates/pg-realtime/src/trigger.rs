//! Trigger installation and removal
//!
//! Materializes the notify-trigger template for each table a subscription
//! watches. Both the function and the trigger use `CREATE OR REPLACE`
//! semantics, so re-installation is idempotent and safe under concurrent
//! subscribes to the same table. Triggers are installed on subscribe and
//! deliberately left in place on unsubscribe; [`destroy_objects`] is the
//! explicit admin sweep that removes everything.

use crate::analyzer::WatchSpec;
use crate::driver::SqlDriver;
use crate::error::{LiveQueryError, Result};
use crate::sql;
use crate::table::QualifiedTable;
use crate::value::Value;
use tracing::{debug, info};

/// Install (or re-install) the notify function and trigger for one table.
pub async fn install_trigger(driver: &dyn SqlDriver, table: &QualifiedTable) -> Result<()> {
    driver
        .execute(&sql::notify_function_sql(table), &[])
        .await
        .map_err(|e| LiveQueryError::trigger_install(table.to_string(), e.to_string()))?;
    driver
        .execute(&sql::create_trigger_sql(table), &[])
        .await
        .map_err(|e| LiveQueryError::trigger_install(table.to_string(), e.to_string()))?;

    debug!(table = %table, "installed change trigger");
    Ok(())
}

/// Install triggers for every table in a watch spec. Tables that already
/// carry the trigger are re-installed in place; on failure, triggers
/// installed earlier in the same call are left behind (they are
/// idempotent and harmless).
pub async fn install_triggers(driver: &dyn SqlDriver, spec: &WatchSpec) -> Result<()> {
    for table in spec.tables() {
        install_trigger(driver, table).await?;
    }
    Ok(())
}

/// Drop every trigger and function whose name carries the reserved
/// `_pg_realtime_` prefix. Admin operation; the live-query system must be
/// stopped first, and any still-running subscriptions in other processes
/// will go quiet.
pub async fn destroy_objects(driver: &dyn SqlDriver) -> Result<u64> {
    let mut dropped = 0u64;

    let triggers = driver.query(&sql::list_owned_triggers_sql(), &[]).await?;
    for row in &triggers {
        let (Some(name), Some(relation)) = (
            row.get_by_name("trigger_name").and_then(Value::as_str),
            row.get_by_name("relation").and_then(Value::as_str),
        ) else {
            continue;
        };
        let (schema, table) = relation.split_once('.').unwrap_or(("public", relation));
        driver
            .execute(
                &format!(
                    "DROP TRIGGER IF EXISTS {} ON {}.{}",
                    sql::quote_ident(name),
                    sql::quote_ident(schema),
                    sql::quote_ident(table)
                ),
                &[],
            )
            .await?;
        dropped += 1;
    }

    let functions = driver.query(&sql::list_owned_functions_sql(), &[]).await?;
    for row in &functions {
        let Some(signature) = row.get_by_name("signature").and_then(Value::as_str) else {
            continue;
        };
        driver
            .execute(&format!("DROP FUNCTION IF EXISTS {signature}"), &[])
            .await?;
        dropped += 1;
    }

    info!(dropped, "destroyed crate-owned database objects");
    Ok(dropped)
}
