use serde_json::Value;

use crate::errors::{AuthzError, AuthzResult};

pub const IDS_FIELD: &str = "ids";

/// Object ids a request addresses: the first path parameter when present,
/// otherwise the `ids` field of a JSON body. Always a list, in first-seen
/// order without duplicates.
pub fn extract_object_ids(path_param: Option<&str>, body: Option<&Value>) -> AuthzResult<Vec<String>> {
    if let Some(id) = path_param.map(str::trim).filter(|id| !id.is_empty()) {
        return Ok(vec![id.to_string()]);
    }
    let Some(field) = body.and_then(|body| body.get(IDS_FIELD)) else {
        return Ok(Vec::new());
    };

    let raw: Vec<String> = match field {
        Value::Array(items) => items.iter().map(id_from_value).collect::<AuthzResult<_>>()?,
        single => vec![id_from_value(single)?],
    };
    let mut ids: Vec<String> = Vec::with_capacity(raw.len());
    for id in raw {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}

fn id_from_value(value: &Value) -> AuthzResult<String> {
    match value {
        Value::String(id) if !id.is_empty() => Ok(id.clone()),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(AuthzError::InvalidRequest(format!(
            "object ids must be non-empty strings or numbers, got {other}"
        ))),
    }
}
