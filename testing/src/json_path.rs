//! Path-addressed edits on `serde_json::Value`, mirroring the JSONB
//! operators used by the Postgres document adapter.
//!
//! Object segments are keys; on arrays a segment must be a decimal index.
//! Intermediate objects are created on write, like `jsonb_set` with
//! `create_missing` over nested `||` merges.

use serde_json::{Map, Value};

/// Read the value at `path`.
#[must_use]
pub fn get<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn get_mut<'a>(root: &'a mut Value, path: &[String]) -> Option<&'a mut Value> {
    path.iter().try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(move |i| items.get_mut(i)),
        _ => None,
    })
}

/// Write `value` at `path`, creating intermediate objects.
///
/// # Errors
///
/// Returns a message if the path crosses a scalar or an out-of-range index.
pub fn set(root: &mut Value, path: &[String], value: Value) -> Result<(), String> {
    let Some((last, parents)) = path.split_last() else {
        *root = value;
        return Ok(());
    };

    let mut current = root;
    for segment in parents {
        current = match current {
            Value::Object(map) => map
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => {
                let index = parse_index(segment)?;
                items
                    .get_mut(index)
                    .ok_or_else(|| format!("index {index} out of range"))?
            }
            _ => return Err(format!("cannot descend into scalar at {segment}")),
        };
    }

    match current {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = parse_index(last)?;
            let slot = items
                .get_mut(index)
                .ok_or_else(|| format!("index {index} out of range"))?;
            *slot = value;
            Ok(())
        }
        _ => Err(format!("cannot set {last} on a scalar")),
    }
}

/// Remove the value at `path`; returns what was there.
pub fn remove(root: &mut Value, path: &[String]) -> Option<Value> {
    let (last, parents) = path.split_last()?;
    match get_mut(root, parents)? {
        Value::Object(map) => map.remove(last),
        Value::Array(items) => {
            let index = last.parse::<usize>().ok()?;
            (index < items.len()).then(|| items.remove(index))
        }
        _ => None,
    }
}

/// Append to the array at `path`, creating it if absent.
///
/// # Errors
///
/// Returns a message if the target exists and is not an array.
pub fn push(root: &mut Value, path: &[String], value: Value) -> Result<(), String> {
    match get_mut(root, path) {
        Some(Value::Array(items)) => {
            items.push(value);
            Ok(())
        }
        Some(Value::Null) | None => set(root, path, Value::Array(vec![value])),
        Some(_) => Err(format!("{} is not an array", path.join("."))),
    }
}

/// Remove the last element of the array at `path`.
pub fn pop_last(root: &mut Value, path: &[String]) -> Option<Value> {
    match get_mut(root, path)? {
        Value::Array(items) => items.pop(),
        _ => None,
    }
}

fn parse_index(segment: &str) -> Result<usize, String> {
    segment
        .parse::<usize>()
        .map_err(|_| format!("{segment} is not an array index"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use certflow_core::store::path;
    use serde_json::json;

    #[test]
    fn set_creates_intermediate_objects() {
        let mut doc = json!({});
        set(&mut doc, &path(["timeline", "submittedAt"]), json!("t")).unwrap();
        assert_eq!(doc, json!({ "timeline": { "submittedAt": "t" } }));
    }

    #[test]
    fn array_index_segments() {
        let mut doc = json!({ "paymentHistory": [{ "status": "pending" }] });
        set(&mut doc, &path(["paymentHistory", "0", "status"]), json!("completed")).unwrap();
        assert_eq!(get(&doc, &path(["paymentHistory", "0", "status"])), Some(&json!("completed")));
        assert!(set(&mut doc, &path(["paymentHistory", "3", "status"]), json!("x")).is_err());
    }

    #[test]
    fn push_and_pop() {
        let mut doc = json!({});
        push(&mut doc, &path(["reviews"]), json!(1)).unwrap();
        push(&mut doc, &path(["reviews"]), json!(2)).unwrap();
        assert_eq!(pop_last(&mut doc, &path(["reviews"])), Some(json!(2)));
        assert_eq!(doc, json!({ "reviews": [1] }));
    }

    #[test]
    fn remove_returns_previous() {
        let mut doc = json!({ "certificate": { "n": 1 } });
        assert_eq!(remove(&mut doc, &path(["certificate"])), Some(json!({ "n": 1 })));
        assert_eq!(remove(&mut doc, &path(["certificate"])), None);
    }
}
