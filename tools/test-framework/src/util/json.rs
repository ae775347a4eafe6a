/*!
   Lookups in JSON documents whose exact nesting varies between
   binary versions.
*/

use serde_json::Value;

/// The first field named `name`, searched depth-first.
pub fn find_field<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    match value {
        Value::Object(object) => object
            .get(name)
            .or_else(|| object.values().find_map(|v| find_field(v, name))),
        Value::Array(values) => values.iter().find_map(|v| find_field(v, name)),
        _ => None,
    }
}

pub fn find_str<'a>(value: &'a Value, name: &str) -> Option<&'a str> {
    find_field(value, name).and_then(|v| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finds_nested_fields() {
        let value = json!({
            "result": { "CreateClient": { "client_id": "07-tendermint-3" } },
            "status": "success",
        });

        assert_eq!(find_str(&value, "client_id"), Some("07-tendermint-3"));
        assert_eq!(find_str(&value, "status"), Some("success"));
        assert!(find_field(&value, "connection_id").is_none());
    }
}
