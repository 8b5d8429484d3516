//! Attribute references between declarations
//!
//! A string attribute may embed `${<resource>.<attribute>[.<path>...]}`.
//! Each embedded reference is a dependency edge. At execution time the
//! reference is replaced by the committed value of the referenced
//! resource's attribute. A string that consists of exactly one reference
//! takes the referenced value with its type intact; otherwise values are
//! interpolated as text.

use std::fmt;

use crate::value::AttrValue;

/// A parsed `${resource.path}` reference
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reference {
    /// Logical name of the referenced resource
    pub resource: String,
    /// Attribute path inside that resource (at least one segment)
    pub path: Vec<String>,
}

impl Reference {
    /// Parse the inside of `${...}` (or an output expression)
    pub fn parse(expr: &str) -> Result<Self, String> {
        let mut parts = expr.trim().split('.');
        let resource = parts.next().unwrap_or_default().to_string();
        let path: Vec<String> = parts.map(str::to_string).collect();

        if resource.is_empty() || path.is_empty() || path.iter().any(String::is_empty) {
            return Err(format!(
                "malformed reference `{}`: expected <resource>.<attribute>",
                expr
            ));
        }

        Ok(Self { resource, path })
    }

    pub fn path_segments(&self) -> Vec<&str> {
        self.path.iter().map(String::as_str).collect()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.path.join("."))
    }
}

/// Split a string into literal text and references
enum Segment<'a> {
    Text(&'a str),
    Ref(Reference),
}

fn segments(s: &str) -> Result<Vec<Segment<'_>>, String> {
    let mut out = Vec::new();
    let mut rest = s;

    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            // No closing brace: the remainder is plain text
            break;
        };
        if start > 0 {
            out.push(Segment::Text(&rest[..start]));
        }
        let inner = &rest[start + 2..start + 2 + len];
        out.push(Segment::Ref(Reference::parse(inner)?));
        rest = &rest[start + 2 + len + 1..];
    }

    if !rest.is_empty() {
        out.push(Segment::Text(rest));
    }
    Ok(out)
}

/// Collect every reference inside a value, recursing into lists and maps
pub fn collect(value: &AttrValue, out: &mut Vec<Reference>) -> Result<(), String> {
    match value {
        AttrValue::String(s) => {
            for segment in segments(s)? {
                if let Segment::Ref(r) = segment {
                    out.push(r);
                }
            }
            Ok(())
        }
        AttrValue::List(items) => items.iter().try_for_each(|item| collect(item, out)),
        AttrValue::Map(map) => map.values().try_for_each(|item| collect(item, out)),
        AttrValue::Bool(_) | AttrValue::Number(_) => Ok(()),
    }
}

/// Replace references with resolved values
///
/// Returns the first reference the resolver could not satisfy.
pub fn interpolate<F>(value: &AttrValue, resolve: &F) -> Result<AttrValue, Reference>
where
    F: Fn(&Reference) -> Option<AttrValue>,
{
    match value {
        AttrValue::String(s) => {
            // References were validated by the loader; a parse failure here
            // means the value carries no references.
            let Ok(parts) = segments(s) else {
                return Ok(value.clone());
            };

            if let [Segment::Ref(r)] = parts.as_slice() {
                return resolve(r).ok_or_else(|| r.clone());
            }

            let mut text = String::with_capacity(s.len());
            for part in parts {
                match part {
                    Segment::Text(t) => text.push_str(t),
                    Segment::Ref(r) => {
                        let resolved = resolve(&r).ok_or(r)?;
                        text.push_str(&resolved.to_string());
                    }
                }
            }
            Ok(AttrValue::String(text))
        }
        AttrValue::List(items) => items
            .iter()
            .map(|item| interpolate(item, resolve))
            .collect::<Result<Vec<_>, _>>()
            .map(AttrValue::List),
        AttrValue::Map(map) => map
            .iter()
            .map(|(k, v)| interpolate(v, resolve).map(|v| (k.clone(), v)))
            .collect::<Result<_, _>>()
            .map(AttrValue::Map),
        AttrValue::Bool(_) | AttrValue::Number(_) => Ok(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference() {
        let r = Reference::parse("db.network.address").unwrap();
        assert_eq!(r.resource, "db");
        assert_eq!(r.path, vec!["network", "address"]);
        assert_eq!(r.to_string(), "db.network.address");

        assert!(Reference::parse("db").is_err());
        assert!(Reference::parse("db..x").is_err());
        assert!(Reference::parse("").is_err());
    }

    #[test]
    fn test_collect_nested() {
        let value = AttrValue::List(vec![
            AttrValue::from("host=${db.address}:${db.port}"),
            AttrValue::from(3),
            AttrValue::from("no refs here ${ unterminated"),
        ]);
        let mut refs = Vec::new();
        collect(&value, &mut refs).unwrap();
        assert_eq!(refs.len(), 2);
        assert!(refs.iter().all(|r| r.resource == "db"));
    }

    #[test]
    fn test_interpolate_keeps_type_for_whole_reference() {
        let resolve = |r: &Reference| match r.to_string().as_str() {
            "db.port" => Some(AttrValue::from(5432)),
            "db.address" => Some(AttrValue::from("10.0.0.7")),
            _ => None,
        };

        let whole = interpolate(&AttrValue::from("${db.port}"), &resolve).unwrap();
        assert_eq!(whole, AttrValue::from(5432));

        let mixed = interpolate(&AttrValue::from("${db.address}:${db.port}"), &resolve).unwrap();
        assert_eq!(mixed, AttrValue::from("10.0.0.7:5432"));

        let missing = interpolate(&AttrValue::from("${db.user}"), &resolve).unwrap_err();
        assert_eq!(missing.to_string(), "db.user");
    }
}
