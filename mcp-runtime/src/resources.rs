use std::str::FromStr;

use serde_json::{Value, json};

use crate::client::MetabaseClient;
use crate::error::RpcError;
use crate::util::to_pretty_json;

pub const RESOURCE_SCHEME: &str = "metabase://";
const MIME_TYPE: &str = "application/json";

/// `metabase://{dashboard|card|database}/{id}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceUri {
    Dashboard(u64),
    Card(u64),
    Database(u64),
}

impl ResourceUri {
    pub fn api_path(&self) -> String {
        match self {
            ResourceUri::Dashboard(id) => format!("/api/dashboard/{id}"),
            ResourceUri::Card(id) => format!("/api/card/{id}"),
            ResourceUri::Database(id) => format!("/api/database/{id}"),
        }
    }
}

impl FromStr for ResourceUri {
    type Err = RpcError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let invalid = || RpcError::invalid_request(format!("Invalid resource URI '{uri}'"));
        let rest = uri.strip_prefix(RESOURCE_SCHEME).ok_or_else(invalid)?;
        let (kind, id) = rest.split_once('/').ok_or_else(invalid)?;
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let id: u64 = id.parse().map_err(|_| invalid())?;
        match kind {
            "dashboard" => Ok(ResourceUri::Dashboard(id)),
            "card" => Ok(ResourceUri::Card(id)),
            "database" => Ok(ResourceUri::Database(id)),
            _ => Err(invalid()),
        }
    }
}

/// One resource descriptor per dashboard currently visible upstream.
pub async fn list_resources(client: &MetabaseClient) -> Result<Value, RpcError> {
    let dashboards = client.get("/api/dashboard").await?;
    let resources: Vec<Value> = dashboards
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(|dashboard| {
            let id = dashboard.get("id").and_then(Value::as_u64)?;
            let name = dashboard
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("Dashboard {id}"));
            let description = dashboard
                .get("description")
                .and_then(Value::as_str)
                .filter(|d| !d.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("Metabase dashboard: {name}"));
            Some(json!({
                "uri": format!("{RESOURCE_SCHEME}dashboard/{id}"),
                "mimeType": MIME_TYPE,
                "name": name,
                "description": description
            }))
        })
        .collect();
    Ok(json!({ "resources": resources }))
}

pub fn resource_templates_payload() -> Value {
    json!({
        "resourceTemplates": [
            {
                "uriTemplate": "metabase://dashboard/{id}",
                "name": "Dashboard by ID",
                "mimeType": MIME_TYPE,
                "description": "Get a Metabase dashboard by its ID"
            },
            {
                "uriTemplate": "metabase://card/{id}",
                "name": "Card by ID",
                "mimeType": MIME_TYPE,
                "description": "Get a Metabase question/card by its ID"
            },
            {
                "uriTemplate": "metabase://database/{id}",
                "name": "Database by ID",
                "mimeType": MIME_TYPE,
                "description": "Get a Metabase database by its ID"
            }
        ]
    })
}

pub async fn read_resource(client: &MetabaseClient, params: &Value) -> Result<Value, RpcError> {
    let uri = params
        .get("uri")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            RpcError::invalid_params("resources/read requires string field 'uri'").with_field("uri")
        })?;
    let resource: ResourceUri = uri.parse()?;
    let payload = client.get(&resource.api_path()).await?;

    Ok(json!({
        "contents": [{
            "uri": uri,
            "mimeType": MIME_TYPE,
            "text": to_pretty_json(&payload)
        }]
    }))
}
