//! Hot-reload prefix matching.
//!
//! Adapters declare the config path prefixes they care about; when a
//! `config.put` lands, the gateway diffs old vs new under each declared
//! prefix and restarts only the adapters whose subtree changed.

use serde_json::Value;

/// Resolves a dotted path like `channels.telegram` inside a JSON document.
pub fn config_value_at_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Returns the subset of `candidate_prefixes` whose subtree differs between
/// `old` and `new`. Missing-on-both-sides counts as unchanged.
pub fn changed_config_prefixes<'a>(
    old: &Value,
    new: &Value,
    candidate_prefixes: &'a [String],
) -> Vec<&'a str> {
    candidate_prefixes
        .iter()
        .filter(|prefix| {
            let before = config_value_at_path(old, prefix);
            let after = config_value_at_path(new, prefix);
            before != after
        })
        .map(String::as_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{changed_config_prefixes, config_value_at_path};

    #[test]
    fn unit_config_value_at_path_walks_nested_objects() {
        let root = json!({"channels": {"telegram": {"enabled": true}}});
        assert_eq!(
            config_value_at_path(&root, "channels.telegram.enabled"),
            Some(&json!(true))
        );
        assert_eq!(config_value_at_path(&root, "channels.discord"), None);
        assert_eq!(config_value_at_path(&root, ""), None);
    }

    #[test]
    fn functional_changed_prefixes_reports_only_mutated_subtrees() {
        let old = json!({
            "channels": {
                "telegram": {"enabled": true},
                "discord": {"enabled": true}
            },
            "gateway": {"bind": "127.0.0.1:9630"}
        });
        let new = json!({
            "channels": {
                "telegram": {"enabled": false},
                "discord": {"enabled": true}
            },
            "gateway": {"bind": "127.0.0.1:9630"}
        });
        let prefixes = vec![
            "channels.telegram".to_string(),
            "channels.discord".to_string(),
            "gateway".to_string(),
        ];
        assert_eq!(
            changed_config_prefixes(&old, &new, &prefixes),
            vec!["channels.telegram"]
        );
    }

    #[test]
    fn regression_absent_prefix_on_both_sides_is_unchanged() {
        let old = json!({});
        let new = json!({});
        let prefixes = vec!["channels.signal".to_string()];
        assert!(changed_config_prefixes(&old, &new, &prefixes).is_empty());
    }
}
