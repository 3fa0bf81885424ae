//! `{{param}}` substitution, shared by the AI worker's prompt templating
//! and the orchestrator's step-config interpolation (Section 4.3.5,
//! 4.4). A single implementation so the interpolation-purity invariant
//! (Section 8, invariant 6) has exactly one place to hold.

use serde_json::Value;
use std::collections::HashMap;

/// Replace every `{{name}}` occurrence in `template` with the string
/// form of `params[name]`. Missing params are left as the literal
/// `{{name}}` placeholder (interpolation never errors).
pub fn interpolate_string(template: &str, params: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(end) = template[i..].find("}}") {
                let name = template[i + 2..i + end].trim();
                if let Some(value) = params.get(name) {
                    out.push_str(value);
                    i += end + 2;
                    continue;
                }
            }
        }
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// Coerce an input map's JSON values into strings suitable for
/// `interpolate_string`.
pub fn stringify_params(input: &Value) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Value::Object(map) = input {
        for (k, v) in map {
            let s = match v {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            params.insert(k.clone(), s);
        }
    }
    params
}

/// Walk a JSON value, interpolating every string (including strings
/// nested inside arrays/objects); non-string values pass through
/// unchanged (Section 4.4's config interpolation step).
pub fn interpolate_value(value: &Value, params: &HashMap<String, String>) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate_string(s, params)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| interpolate_value(v, params)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, params)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_params() {
        let mut params = HashMap::new();
        params.insert("location".to_string(), "Mooresville, NC".to_string());
        assert_eq!(
            interpolate_string("Weather for {{location}}", &params),
            "Weather for Mooresville, NC"
        );
    }

    #[test]
    fn leaves_unknown_placeholders_untouched() {
        let params = HashMap::new();
        assert_eq!(interpolate_string("Hi {{name}}", &params), "Hi {{name}}");
    }

    #[test]
    fn interpolation_is_idempotent() {
        let mut params = HashMap::new();
        params.insert("feedUrl".to_string(), "https://example.com/feed".to_string());
        let once = interpolate_string("{{feedUrl}}", &params);
        let twice = interpolate_string(&once, &params);
        assert_eq!(once, twice);
        assert_eq!(once, "https://example.com/feed");
    }

    #[test]
    fn interpolates_nested_config_values() {
        let mut params = HashMap::new();
        params.insert("feedUrl".to_string(), "https://example.com/feed".to_string());
        let config = serde_json::json!({"urls": ["{{feedUrl}}"], "timeout": 5000});
        let interpolated = interpolate_value(&config, &params);
        assert_eq!(interpolated["urls"][0], "https://example.com/feed");
        assert_eq!(interpolated["timeout"], 5000);
    }
}
