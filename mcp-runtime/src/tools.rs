use serde_json::{Map, Value, json};
use tracing::info;

use crate::client::MetabaseClient;
use crate::diagnostics::{self, DiagnosticsParams};
use crate::error::RpcError;

#[derive(Debug)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "list_dashboards",
            description: "List all dashboards in Metabase.",
            input_schema: empty_schema(),
        },
        ToolDefinition {
            name: "list_cards",
            description: "List all questions (cards) in Metabase.",
            input_schema: empty_schema(),
        },
        ToolDefinition {
            name: "list_databases",
            description: "List all databases connected to Metabase.",
            input_schema: empty_schema(),
        },
        ToolDefinition {
            name: "execute_card",
            description: "Run a saved Metabase question (card) and return its results.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "card_id": { "type": "number", "description": "ID of the card to execute" },
                    "parameters": {
                        "type": "object",
                        "description": "Optional parameter values passed to the card query"
                    }
                },
                "required": ["card_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_dashboard_cards",
            description: "Get the cards placed on a Metabase dashboard.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "dashboard_id": { "type": "number", "description": "ID of the dashboard" }
                },
                "required": ["dashboard_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "execute_query",
            description: "Execute a native SQL query against a Metabase database.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "database_id": {
                        "type": "number",
                        "description": "ID of the database to query"
                    },
                    "query": { "type": "string", "description": "Native SQL query to run" },
                    "native_parameters": {
                        "type": "array",
                        "description": "Optional native query parameters",
                        "items": { "type": "object" }
                    }
                },
                "required": ["database_id", "query"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_database_schema",
            description: "Get table and field metadata for a Metabase database.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "database_id": { "type": "number", "description": "ID of the database" }
                },
                "required": ["database_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "get_postgres_performance_diagnostics",
            description: "Collect PostgreSQL performance diagnostics through Metabase: slowest statements from pg_stat_statements and, for an optional table, index usage and scan statistics. Each section reports its own error without failing the others.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "database_id": {
                        "type": "number",
                        "description": "ID of a PostgreSQL database connected to Metabase"
                    },
                    "num_slow_queries": {
                        "description": "How many slow statements to return (default 10; non-positive or non-numeric values fall back to 10)",
                        "default": diagnostics::DEFAULT_NUM_SLOW_QUERIES
                    },
                    "target_table_name": {
                        "type": "string",
                        "description": "Optional table to analyse for index usage and scan statistics"
                    }
                },
                "required": ["database_id"],
                "additionalProperties": false
            }),
        },
    ]
}

pub fn find_tool(name: &str) -> Option<ToolDefinition> {
    tool_definitions().into_iter().find(|tool| tool.name == name)
}

fn empty_schema() -> Value {
    json!({
        "type": "object",
        "properties": {},
        "additionalProperties": false
    })
}

/// A tool invocation whose arguments passed schema validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolRequest {
    ListDashboards,
    ListCards,
    ListDatabases,
    ExecuteCard {
        card_id: u64,
        parameters: Option<Map<String, Value>>,
    },
    GetDashboardCards {
        dashboard_id: u64,
    },
    ExecuteQuery {
        database_id: u64,
        query: String,
        native_parameters: Vec<Value>,
    },
    GetDatabaseSchema {
        database_id: u64,
    },
    PostgresDiagnostics(DiagnosticsParams),
}

impl ToolRequest {
    /// Validates `args` against the named tool's schema and builds the typed
    /// request. Unknown tools are `InvalidRequest`, bad arguments
    /// `InvalidParams`.
    pub fn parse(name: &str, args: &Map<String, Value>) -> Result<Self, RpcError> {
        let tool = find_tool(name)
            .ok_or_else(|| RpcError::invalid_request(format!("Unknown tool '{name}'")))?;
        validate_arguments(&tool.input_schema, args)?;

        Ok(match tool.name {
            "list_dashboards" => ToolRequest::ListDashboards,
            "list_cards" => ToolRequest::ListCards,
            "list_databases" => ToolRequest::ListDatabases,
            "execute_card" => ToolRequest::ExecuteCard {
                card_id: required_id(args, "card_id")?,
                parameters: args.get("parameters").and_then(Value::as_object).cloned(),
            },
            "get_dashboard_cards" => ToolRequest::GetDashboardCards {
                dashboard_id: required_id(args, "dashboard_id")?,
            },
            "execute_query" => ToolRequest::ExecuteQuery {
                database_id: required_id(args, "database_id")?,
                query: required_string(args, "query")?,
                native_parameters: args
                    .get("native_parameters")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
            },
            "get_database_schema" => ToolRequest::GetDatabaseSchema {
                database_id: required_id(args, "database_id")?,
            },
            "get_postgres_performance_diagnostics" => {
                ToolRequest::PostgresDiagnostics(DiagnosticsParams {
                    database_id: required_id(args, "database_id")?,
                    num_slow_queries: diagnostics::normalize_num_slow_queries(
                        args.get("num_slow_queries"),
                    ),
                    target_table_name: diagnostics::normalize_target_table_name(
                        args.get("target_table_name"),
                    ),
                })
            }
            other => {
                return Err(RpcError::internal(format!(
                    "Tool '{other}' is registered without a handler"
                )));
            }
        })
    }

    pub async fn execute(self, client: &MetabaseClient) -> Result<Value, RpcError> {
        match self {
            ToolRequest::ListDashboards => Ok(client.get("/api/dashboard").await?),
            ToolRequest::ListCards => Ok(client.get("/api/card").await?),
            ToolRequest::ListDatabases => Ok(client.get("/api/database").await?),
            ToolRequest::ExecuteCard {
                card_id,
                parameters,
            } => {
                let body = match parameters {
                    Some(parameters) => json!({ "parameters": parameters }),
                    None => json!({}),
                };
                Ok(client
                    .post(&format!("/api/card/{card_id}/query"), body)
                    .await?)
            }
            ToolRequest::GetDashboardCards { dashboard_id } => {
                let dashboard = client.get(&format!("/api/dashboard/{dashboard_id}")).await?;
                Ok(dashboard_cards(dashboard))
            }
            ToolRequest::ExecuteQuery {
                database_id,
                query,
                native_parameters,
            } => Ok(client
                .post("/api/dataset", native_query_body(database_id, &query, native_parameters))
                .await?),
            ToolRequest::GetDatabaseSchema { database_id } => Ok(client
                .get(&format!("/api/database/{database_id}/metadata"))
                .await?),
            ToolRequest::PostgresDiagnostics(params) => {
                info!(
                    database_id = params.database_id,
                    num_slow_queries = params.num_slow_queries,
                    target_table_name = params.target_table_name.as_deref(),
                    "Running PostgreSQL performance diagnostics"
                );
                let report = diagnostics::diagnose(client, params).await;
                serde_json::to_value(report)
                    .map_err(|e| RpcError::internal(format!("Failed to encode report: {e}")))
            }
        }
    }
}

/// Body for `POST /api/dataset` running `query` natively.
pub fn native_query_body(database_id: u64, query: &str, parameters: Vec<Value>) -> Value {
    json!({
        "type": "native",
        "native": { "query": query },
        "parameters": parameters,
        "database": database_id
    })
}

fn dashboard_cards(mut dashboard: Value) -> Value {
    for key in ["cards", "dashcards"] {
        if let Some(cards) = dashboard.get_mut(key).map(Value::take) {
            if !cards.is_null() {
                return cards;
            }
        }
    }
    Value::Array(Vec::new())
}

/// Checks `args` against a tool input schema: required fields, declared
/// primitive types and `additionalProperties: false`.
pub fn validate_arguments(schema: &Value, args: &Map<String, Value>) -> Result<(), RpcError> {
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if args.get(key).is_none_or(Value::is_null) {
                return Err(RpcError::invalid_params(format!(
                    "Missing required field '{key}'"
                ))
                .with_field(key));
            }
        }
    }

    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));
    for (key, value) in args {
        let Some(property) = properties.get(key) else {
            if closed {
                return Err(
                    RpcError::invalid_params(format!("Unexpected field '{key}'")).with_field(key),
                );
            }
            continue;
        };
        if value.is_null() {
            continue;
        }
        let Some(expected) = property.get("type") else {
            continue;
        };
        let allowed: Vec<&str> = match expected {
            Value::String(single) => vec![single.as_str()],
            Value::Array(many) => many.iter().filter_map(Value::as_str).collect(),
            _ => continue,
        };
        if !allowed.iter().any(|ty| matches_type(ty, value)) {
            return Err(RpcError::invalid_params(format!(
                "'{key}' must be of type {} (got {})",
                allowed.join(" | "),
                json_type_name(value)
            ))
            .with_field(key));
        }
    }
    Ok(())
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn required_id(args: &Map<String, Value>, key: &str) -> Result<u64, RpcError> {
    let invalid = || {
        RpcError::invalid_params(format!("'{key}' must be a positive integer")).with_field(key)
    };
    let value = args.get(key).ok_or_else(|| {
        RpcError::invalid_params(format!("Missing required field '{key}'")).with_field(key)
    })?;
    let id = match value.as_u64() {
        Some(id) => id,
        None => match value.as_f64() {
            Some(raw) if raw.fract() == 0.0 && raw >= 1.0 && raw <= u64::MAX as f64 => raw as u64,
            _ => return Err(invalid()),
        },
    };
    if id == 0 {
        return Err(invalid());
    }
    Ok(id)
}

fn required_string(args: &Map<String, Value>, key: &str) -> Result<String, RpcError> {
    match args.get(key) {
        Some(Value::String(v)) if !v.trim().is_empty() => Ok(v.clone()),
        Some(Value::String(_)) => Err(
            RpcError::invalid_params(format!("'{key}' must not be empty")).with_field(key),
        ),
        Some(_) => Err(
            RpcError::invalid_params(format!("'{key}' must be a string")).with_field(key),
        ),
        None => Err(
            RpcError::invalid_params(format!("Missing required field '{key}'")).with_field(key),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthMethod, RuntimeConfig};
    use crate::error::ErrorKind;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn client(base_url: String) -> MetabaseClient {
        MetabaseClient::new(&RuntimeConfig {
            base_url,
            auth: AuthMethod::ApiKey("mb_key".to_string()),
        })
    }

    #[test]
    fn registry_exposes_exactly_the_eight_tools() {
        let names: Vec<&str> = tool_definitions().iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec![
                "list_dashboards",
                "list_cards",
                "list_databases",
                "execute_card",
                "get_dashboard_cards",
                "execute_query",
                "get_database_schema",
                "get_postgres_performance_diagnostics",
            ]
        );
    }

    #[test]
    fn diagnostics_schema_declares_expected_fields() {
        let tool = find_tool("get_postgres_performance_diagnostics").unwrap();
        let properties = tool.input_schema["properties"].as_object().unwrap();
        for field in ["database_id", "num_slow_queries", "target_table_name"] {
            assert!(properties.contains_key(field), "missing {field}");
        }
        assert_eq!(tool.input_schema["required"], json!(["database_id"]));
        assert!(properties["num_slow_queries"].get("type").is_none());
    }

    #[test]
    fn execute_query_schema_requires_database_and_query() {
        let tool = find_tool("execute_query").unwrap();
        assert_eq!(tool.input_schema["required"], json!(["database_id", "query"]));
        assert_eq!(tool.input_schema["properties"]["native_parameters"]["type"], "array");
    }

    #[test]
    fn every_required_field_is_reported_when_missing() {
        for tool in tool_definitions() {
            let Some(first) = tool.input_schema["required"][0].as_str() else {
                assert!(ToolRequest::parse(tool.name, &Map::new()).is_ok());
                continue;
            };
            let err = ToolRequest::parse(tool.name, &Map::new()).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidParams, "{}", tool.name);
            assert!(err.message.contains(first), "{}: {}", tool.name, err.message);
            assert_eq!(err.field.as_deref(), Some(first));
        }
    }

    #[test]
    fn unknown_tool_is_invalid_request() {
        let err = ToolRequest::parse("drop_everything", &Map::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }

    #[test]
    fn mistyped_argument_names_field_and_constraint() {
        let err = ToolRequest::parse("execute_card", &args(json!({ "card_id": "7" }))).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParams);
        assert_eq!(err.field.as_deref(), Some("card_id"));
        assert_eq!(err.message, "'card_id' must be of type number (got string)");
    }

    #[test]
    fn unexpected_argument_is_rejected() {
        let err =
            ToolRequest::parse("list_cards", &args(json!({ "collection": 3 }))).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParams);
        assert_eq!(err.field.as_deref(), Some("collection"));
    }

    #[test]
    fn ids_must_be_positive_integers() {
        for bad in [json!(0), json!(-3), json!(1.5)] {
            let err =
                ToolRequest::parse("get_database_schema", &args(json!({ "database_id": bad })))
                    .unwrap_err();
            assert_eq!(err.field.as_deref(), Some("database_id"));
        }
        let ok = ToolRequest::parse("get_database_schema", &args(json!({ "database_id": 4.0 })))
            .unwrap();
        assert_eq!(ok, ToolRequest::GetDatabaseSchema { database_id: 4 });
    }

    #[test]
    fn blank_query_is_rejected() {
        let err = ToolRequest::parse(
            "execute_query",
            &args(json!({ "database_id": 1, "query": "   " })),
        )
        .unwrap_err();
        assert_eq!(err.field.as_deref(), Some("query"));
    }

    #[test]
    fn diagnostics_arguments_are_normalized() {
        let request = ToolRequest::parse(
            "get_postgres_performance_diagnostics",
            &args(json!({
                "database_id": 2,
                "num_slow_queries": "abc",
                "target_table_name": "  "
            })),
        )
        .unwrap();
        assert_eq!(
            request,
            ToolRequest::PostgresDiagnostics(DiagnosticsParams {
                database_id: 2,
                num_slow_queries: 10,
                target_table_name: None,
            })
        );
    }

    #[test]
    fn native_query_body_matches_dataset_contract() {
        let body = native_query_body(3, "SELECT 1", vec![json!({ "type": "text" })]);
        assert_eq!(
            body,
            json!({
                "type": "native",
                "native": { "query": "SELECT 1" },
                "parameters": [{ "type": "text" }],
                "database": 3
            })
        );
    }

    #[test]
    fn dashboard_cards_prefers_cards_then_dashcards() {
        assert_eq!(
            dashboard_cards(json!({ "id": 1, "cards": [{ "id": 10 }] })),
            json!([{ "id": 10 }])
        );
        assert_eq!(
            dashboard_cards(json!({ "id": 1, "dashcards": [{ "id": 11 }] })),
            json!([{ "id": 11 }])
        );
        assert_eq!(dashboard_cards(json!({ "id": 1 })), json!([]));
    }

    #[tokio::test]
    async fn execute_card_posts_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/card/7/query"))
            .and(body_json(json!({ "parameters": { "region": "emea" } })))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({ "row_count": 2 })))
            .expect(1)
            .mount(&server)
            .await;

        let request = ToolRequest::parse(
            "execute_card",
            &args(json!({ "card_id": 7, "parameters": { "region": "emea" } })),
        )
        .unwrap();
        let result = request.execute(&client(server.uri())).await.unwrap();
        assert_eq!(result, json!({ "row_count": 2 }));
    }

    #[tokio::test]
    async fn execute_query_defaults_native_parameters_to_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/dataset"))
            .and(body_json(json!({
                "type": "native",
                "native": { "query": "SELECT count(*) FROM orders" },
                "parameters": [],
                "database": 5
            })))
            .respond_with(
                ResponseTemplate::new(202).set_body_json(json!({ "status": "completed" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let request = ToolRequest::parse(
            "execute_query",
            &args(json!({ "database_id": 5, "query": "SELECT count(*) FROM orders" })),
        )
        .unwrap();
        request.execute(&client(server.uri())).await.unwrap();
    }

    #[tokio::test]
    async fn get_dashboard_cards_returns_only_cards() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/dashboard/12"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 12,
                "name": "Revenue",
                "cards": [{ "id": 1, "card_id": 30 }]
            })))
            .mount(&server)
            .await;

        let result = ToolRequest::GetDashboardCards { dashboard_id: 12 }
            .execute(&client(server.uri()))
            .await
            .unwrap();
        assert_eq!(result, json!([{ "id": 1, "card_id": 30 }]));
    }

    #[tokio::test]
    async fn upstream_failure_becomes_internal_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/database/9/metadata"))
            .respond_with(
                ResponseTemplate::new(403).set_body_json(json!({ "message": "Forbidden" })),
            )
            .mount(&server)
            .await;

        let err = ToolRequest::GetDatabaseSchema { database_id: 9 }
            .execute(&client(server.uri()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InternalError);
        assert!(err.message.contains("403"));
    }
}
