//! PostgreSQL performance diagnostics run through Metabase's native query
//! endpoint.
//!
//! Three statistics queries feed one [`DiagnosticsReport`]: the slowest
//! statements from `pg_stat_statements` and, when a table is named, its index
//! usage and scan statistics. Every query reports its own failure in a sibling
//! `*_error` field; the report as a whole never fails.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::client::MetabaseClient;
use crate::tools::native_query_body;

pub const DEFAULT_NUM_SLOW_QUERIES: u64 = 10;
/// Largest `LIMIT` PostgreSQL accepts (bigint).
pub const MAX_NUM_SLOW_QUERIES: u64 = i64::MAX as u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticsParams {
    pub database_id: u64,
    pub num_slow_queries: u64,
    pub target_table_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DiagnosticsReport {
    pub database_id: u64,
    pub parameters_used: ParametersUsed,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slow_queries: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slow_queries_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_analysis: Option<TableAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_analysis_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ParametersUsed {
    pub num_slow_queries: u64,
    pub target_table_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TableAnalysis {
    pub table_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_usage: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_usage_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_stats: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_stats_error: Option<String>,
}

/// Positive numbers are truncated to an integer count and capped at
/// [`MAX_NUM_SLOW_QUERIES`]; anything else, including numeric strings, falls
/// back to the default.
pub fn normalize_num_slow_queries(raw: Option<&Value>) -> u64 {
    let Some(raw) = raw.filter(|value| !value.is_null()) else {
        return DEFAULT_NUM_SLOW_QUERIES;
    };
    let normalized = raw
        .as_f64()
        .filter(|n| n.is_finite() && *n >= 1.0)
        .map(|n| (n.trunc() as u64).min(MAX_NUM_SLOW_QUERIES));
    match normalized {
        Some(count) => count,
        None => {
            warn!(
                received = %raw,
                default = DEFAULT_NUM_SLOW_QUERIES,
                "Invalid num_slow_queries, using default"
            );
            DEFAULT_NUM_SLOW_QUERIES
        }
    }
}

/// Blank or whitespace-only names mean "no table". Surrounding whitespace is
/// trimmed.
pub fn normalize_target_table_name(raw: Option<&Value>) -> Option<String> {
    let raw = raw?.as_str()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        warn!("Blank target_table_name ignored, skipping table analysis");
        return None;
    }
    Some(trimmed.to_string())
}

/// Doubles embedded single quotes so `value` can sit inside a SQL string
/// literal. This is the only escaping applied to the table name.
pub fn escape_sql_literal(value: &str) -> String {
    value.replace('\'', "''")
}

pub fn slow_queries_sql(limit: u64) -> String {
    format!(
        r#"SELECT
    queryid::text AS query_id,
    query,
    calls,
    total_exec_time,
    mean_exec_time,
    rows,
    shared_blks_hit,
    shared_blks_read
FROM pg_stat_statements
ORDER BY total_exec_time DESC
LIMIT {limit}"#
    )
}

pub fn index_usage_sql(table_name: &str) -> String {
    format!(
        r#"SELECT
    s.schemaname AS schema_name,
    s.relname AS table_name,
    s.indexrelname AS index_name,
    s.idx_scan,
    s.idx_tup_read,
    s.idx_tup_fetch,
    i.indisunique AS is_unique,
    i.indisprimary AS is_primary,
    pg_size_pretty(pg_relation_size(s.indexrelid)) AS index_size
FROM pg_stat_user_indexes s
JOIN pg_index i ON i.indexrelid = s.indexrelid
WHERE s.relname = '{}'
ORDER BY s.idx_scan DESC"#,
        escape_sql_literal(table_name)
    )
}

pub fn scan_stats_sql(table_name: &str) -> String {
    format!(
        r#"SELECT
    schemaname AS schema_name,
    relname AS table_name,
    seq_scan,
    seq_tup_read,
    idx_scan,
    idx_tup_fetch,
    n_live_tup,
    n_dead_tup,
    last_vacuum,
    last_autovacuum,
    last_analyze,
    last_autoanalyze
FROM pg_stat_user_tables
WHERE relname = '{}'"#,
        escape_sql_literal(table_name)
    )
}

/// Runs the diagnostics queries strictly one after another and assembles the
/// report. Never fails.
pub async fn diagnose(client: &MetabaseClient, params: DiagnosticsParams) -> DiagnosticsReport {
    let DiagnosticsParams {
        database_id,
        num_slow_queries,
        target_table_name,
    } = params;

    let mut report = DiagnosticsReport {
        database_id,
        parameters_used: ParametersUsed {
            num_slow_queries,
            target_table_name: target_table_name.clone(),
        },
        slow_queries: None,
        slow_queries_error: None,
        table_analysis: None,
        table_analysis_error: None,
    };

    match run_stats_query(client, database_id, &slow_queries_sql(num_slow_queries)).await {
        Ok(rows) => report.slow_queries = Some(rows),
        Err(err) => {
            warn!(database_id, error = %err, "Slow query statistics failed");
            report.slow_queries_error = Some(format!("Failed to fetch slow queries: {err}"));
        }
    }

    if let Some(table_name) = target_table_name {
        // Own task so that even a panic in this block leaves the slow-query
        // section intact.
        let task = tokio::spawn(analyze_table(client.clone(), database_id, table_name));
        match task.await {
            Ok(analysis) => report.table_analysis = Some(analysis),
            Err(err) => {
                warn!(database_id, error = %err, "Table analysis aborted");
                report.table_analysis_error = Some(format!("Table analysis aborted: {err}"));
            }
        }
    }

    info!(
        database_id,
        slow_queries_ok = report.slow_queries.is_some(),
        table_analysis = report.table_analysis.is_some(),
        "PostgreSQL diagnostics complete"
    );
    report
}

async fn analyze_table(
    client: MetabaseClient,
    database_id: u64,
    table_name: String,
) -> TableAnalysis {
    let mut analysis = TableAnalysis {
        table_name: table_name.clone(),
        index_usage: None,
        index_usage_error: None,
        scan_stats: None,
        scan_stats_error: None,
    };

    match run_stats_query(&client, database_id, &index_usage_sql(&table_name)).await {
        Ok(rows) => analysis.index_usage = Some(rows),
        Err(err) => {
            warn!(database_id, table = %table_name, error = %err, "Index usage statistics failed");
            analysis.index_usage_error = Some(format!("Failed to fetch index usage: {err}"));
        }
    }

    match run_stats_query(&client, database_id, &scan_stats_sql(&table_name)).await {
        Ok(rows) => analysis.scan_stats = Some(rows),
        Err(err) => {
            warn!(database_id, table = %table_name, error = %err, "Scan statistics failed");
            analysis.scan_stats_error = Some(format!("Failed to fetch scan statistics: {err}"));
        }
    }

    analysis
}

async fn run_stats_query(
    client: &MetabaseClient,
    database_id: u64,
    sql: &str,
) -> Result<Vec<Value>, String> {
    let response = client
        .post("/api/dataset", native_query_body(database_id, sql, Vec::new()))
        .await
        .map_err(|e| e.to_string())?;
    extract_rows(&response)
}

/// Pulls result rows out of a dataset response. Rows become objects keyed by
/// column name when column metadata is present.
fn extract_rows(response: &Value) -> Result<Vec<Value>, String> {
    if response.get("status").and_then(Value::as_str) == Some("failed") {
        let message = response
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("query failed without an error message");
        return Err(format!("Query failed: {message}"));
    }
    if let Some(message) = response.get("error").and_then(Value::as_str) {
        return Err(format!("Query failed: {message}"));
    }

    let data = response
        .get("data")
        .ok_or_else(|| "Query response has no data section".to_string())?;
    let rows = data
        .get("rows")
        .and_then(Value::as_array)
        .ok_or_else(|| "Query response has no rows".to_string())?;

    let columns: Vec<&str> = data
        .get("cols")
        .and_then(Value::as_array)
        .map(|cols| {
            cols.iter()
                .filter_map(|col| col.get("name").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    Ok(rows
        .iter()
        .map(|row| match row.as_array() {
            Some(cells) if !columns.is_empty() && cells.len() == columns.len() => Value::Object(
                columns
                    .iter()
                    .zip(cells)
                    .map(|(name, cell)| (name.to_string(), cell.clone()))
                    .collect::<Map<String, Value>>(),
            ),
            _ => row.clone(),
        })
        .collect())
}
