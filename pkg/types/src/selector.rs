use std::collections::HashMap;

/// Label-selector predicate shared by controllers and the store's list
/// path: a resource matches iff every selector key is present in its
/// labels with an equal value.
pub fn matches(selector: &HashMap<String, String>, labels: &HashMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}
