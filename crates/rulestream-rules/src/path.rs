//! Field path resolution over payloads
//!
//! Paths are dotted segments (`alert.tags.0`), with `[n]` accepted as an
//! index suffix (`alert.tags[0]`). A leading `trigger.` refers to the payload
//! root and is dropped. Resolution never fails: anything that does not lead
//! to a value is absent (`None`). A present `null` is `Some(Value::Null)`.

use serde_json::Value;

const PAYLOAD_ROOT: &str = "trigger";

/// One step of a field path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Mapping key; also used as a list index when it parses as one
    Key(String),
    /// Explicit `[n]` list index
    Index(usize),
}

/// Split a field path into segments.
///
/// Malformed bracket suffixes are kept as literal key text so that they
/// simply fail to resolve.
pub fn parse_path(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();

    for part in path.split('.') {
        let (name, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };

        if !name.is_empty() {
            segments.push(Segment::Key(name.to_string()));
        }

        while let Some(stripped) = rest.strip_prefix('[') {
            match stripped.find(']') {
                Some(end) => match stripped[..end].trim().parse::<usize>() {
                    Ok(index) => {
                        segments.push(Segment::Index(index));
                        rest = &stripped[end + 1..];
                    }
                    Err(_) => {
                        segments.push(Segment::Key(rest.to_string()));
                        rest = "";
                    }
                },
                None => {
                    segments.push(Segment::Key(rest.to_string()));
                    rest = "";
                }
            }
        }

        if !rest.is_empty() {
            segments.push(Segment::Key(rest.to_string()));
        }
    }

    if matches!(segments.first(), Some(Segment::Key(k)) if k == PAYLOAD_ROOT) {
        segments.remove(0);
    }

    segments
}

/// Resolve `path` against `payload`
pub fn resolve<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    resolve_segments(payload, &parse_path(path))
}

/// Recursive descent over pre-parsed segments
pub fn resolve_segments<'a>(value: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let Some((head, tail)) = segments.split_first() else {
        return Some(value);
    };

    let next = match (value, head) {
        (Value::Object(map), Segment::Key(key)) => map.get(key.as_str()),
        (Value::Array(items), Segment::Key(key)) => {
            key.parse::<usize>().ok().and_then(|i| items.get(i))
        }
        (Value::Array(items), Segment::Index(i)) => items.get(*i),
        _ => None,
    }?;

    resolve_segments(next, tail)
}
