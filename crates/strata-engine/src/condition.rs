use serde_json::Value;
use tracing::warn;

/// Look up a dot-separated path inside a JSON value.
///
/// Object keys are matched by name; numeric segments index into arrays.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Evaluate a step condition against the run's condition context.
///
/// Supported expressions:
/// - `path == "value"`: exact match
/// - `path != "value"`: not equal
/// - `path contains "substr"`: substring match
/// - `path exists`: the path resolves to a non-null value
///
/// Non-string values compare by their JSON text, so `flag == true` works.
/// Returns `false` for unparseable expressions.
pub fn evaluate_condition(expr: &str, context: &Value) -> bool {
    let expr = expr.trim();

    // path contains "value"
    if let Some((path, substr)) = parse_operator(expr, " contains ") {
        return resolve_text(context, path).is_some_and(|s| s.contains(substr));
    }

    // path != "value"
    if let Some((path, value)) = parse_operator(expr, "!=") {
        return resolve_text(context, path).is_some_and(|s| s != value);
    }

    // path == "value"
    if let Some((path, value)) = parse_operator(expr, "==") {
        return resolve_text(context, path).is_some_and(|s| s == value);
    }

    // path exists
    if let Some(path) = expr.strip_suffix(" exists") {
        return lookup_path(context, path.trim()).is_some_and(|v| !v.is_null());
    }

    warn!(expr, "Unparseable step condition");
    false
}

fn resolve_text(context: &Value, path: &str) -> Option<String> {
    lookup_path(context, path).map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Parse `path OP "value"` expressions, returning (path, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (path, val) = expr.split_once(op)?;
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    Some((path, val.trim().trim_matches('"')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "validate": {
                "status": "completed",
                "output": {"valid": true, "reason": "all fields present", "count": 3}
            },
            "global": {"region": "eu-west"},
            "items": [{"name": "first"}]
        })
    }

    #[test]
    fn test_lookup_path() {
        let c = ctx();
        assert_eq!(lookup_path(&c, "validate.output.count"), Some(&json!(3)));
        assert_eq!(lookup_path(&c, "items.0.name"), Some(&json!("first")));
        assert!(lookup_path(&c, "validate.output.missing").is_none());
        assert!(lookup_path(&c, "items.7").is_none());
        assert_eq!(lookup_path(&c, ""), Some(&c));
    }

    #[test]
    fn test_condition_equals() {
        let c = ctx();
        assert!(evaluate_condition(r#"validate.status == "completed""#, &c));
        assert!(!evaluate_condition(r#"validate.status == "failed""#, &c));
        assert!(evaluate_condition("validate.output.valid == true", &c));
        assert!(evaluate_condition("validate.output.count == 3", &c));
    }

    #[test]
    fn test_condition_not_equals() {
        let c = ctx();
        assert!(evaluate_condition(r#"global.region != "us-east""#, &c));
        assert!(!evaluate_condition(r#"global.region != "eu-west""#, &c));
    }

    #[test]
    fn test_condition_contains() {
        let c = ctx();
        assert!(evaluate_condition(r#"validate.output.reason contains "fields""#, &c));
        assert!(!evaluate_condition(r#"validate.output.reason contains "missing""#, &c));
    }

    #[test]
    fn test_condition_exists() {
        let c = ctx();
        assert!(evaluate_condition("validate.output exists", &c));
        assert!(!evaluate_condition("nothing.here exists", &c));
    }

    #[test]
    fn test_condition_missing_key() {
        let c = ctx();
        assert!(!evaluate_condition(r#"missing == "value""#, &c));
        assert!(!evaluate_condition(r#"missing != "value""#, &c));
    }

    #[test]
    fn test_condition_invalid_expr() {
        assert!(!evaluate_condition("this is not valid", &ctx()));
    }
}
