// src/cache/tag.rs
// Cache tags, query ids and how they are derived from a query

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use super::errors::{TagIndexError, TagIndexResult};

/// Name of the response header carrying the space-delimited tag list
pub const CACHE_TAGS_HEADER: &str = "X-Cache-Tags";

/// A label for a unit of upstream content.
///
/// Tags travel space-delimited in a header, so a tag is never empty and
/// never contains whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheTag(String);

impl CacheTag {
    pub fn new(tag: impl Into<String>) -> TagIndexResult<Self> {
        let tag = tag.into();
        if tag.is_empty() || tag.chars().any(char::is_whitespace) {
            return Err(TagIndexError::InvalidTag(tag));
        }
        Ok(Self(tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CacheTag {
    type Error = TagIndexError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CacheTag> for String {
    fn from(tag: CacheTag) -> Self {
        tag.0
    }
}

impl FromStr for CacheTag {
    type Err = TagIndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for CacheTag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint of a query's defining inputs. Not a secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueryId(String);

impl QueryId {
    pub fn new(id: impl Into<String>) -> TagIndexResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(TagIndexError::InvalidQueryId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for QueryId {
    type Error = TagIndexError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueryId> for String {
    fn from(id: QueryId) -> Self {
        id.0
    }
}

impl FromStr for QueryId {
    type Err = TagIndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for QueryId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse the value of the `X-Cache-Tags` header.
///
/// `"tag-a tag-2 other-tag"` becomes three tags. A missing or blank header
/// yields an empty list; repeated separators are skipped.
pub fn parse_tag_header(header: Option<&str>) -> Vec<CacheTag> {
    header
        .unwrap_or_default()
        .split_whitespace()
        .map(|token| CacheTag(token.to_string()))
        .collect()
}

/// Derive the id of a query from its text, variables and optional request headers.
///
/// The digest is SHA-256 over, in order: the query text with comments and
/// insignificant whitespace outside string literals removed, the variables as key-sorted JSON (empty
/// when absent) and, if present, the headers as key-sorted JSON. Each part is
/// terminated by a NUL byte.
pub fn derive_query_id(
    query: &str,
    variables: Option<&Value>,
    headers: Option<&Value>,
) -> TagIndexResult<QueryId> {
    let mut hasher = Sha256::new();

    hasher.update(canonical_query_text(query).as_bytes());
    hasher.update([0u8]);

    if let Some(variables) = variables {
        hasher.update(serde_json::to_string(&canonical_json(variables))?.as_bytes());
    }
    hasher.update([0u8]);

    if let Some(headers) = headers {
        hasher.update(serde_json::to_string(&canonical_json(headers))?.as_bytes());
        hasher.update([0u8]);
    }

    Ok(QueryId(format!("{:x}", hasher.finalize())))
}

/// Rebuild a JSON value with every object's keys in sorted order.
fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonical_json(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

/// GraphQL punctuators; whitespace next to one of these carries no meaning.
fn is_punctuator(c: char) -> bool {
    matches!(
        c,
        '!' | '$' | '&' | '(' | ')' | '.' | ':' | '=' | '@' | '[' | ']' | '{' | '|' | '}' | '"'
    )
}

/// Normalize query text outside `"`-delimited strings.
///
/// `#` comments and commas count as whitespace. A whitespace run becomes a
/// single space only when it separates two non-punctuator tokens, so
/// `{post{id}}` and `{ post { id } }` normalize to the same text.
fn canonical_query_text(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut in_string = false;
    let mut in_comment = false;
    let mut escaped = false;
    let mut pending_space = false;

    for c in query.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        if in_comment {
            if c == '\n' || c == '\r' {
                in_comment = false;
                pending_space = true;
            }
            continue;
        }

        if c == '#' {
            in_comment = true;
            pending_space = true;
            continue;
        }

        if c.is_whitespace() || c == ',' {
            // commas are insignificant in GraphQL documents
            pending_space = true;
            continue;
        }

        if pending_space {
            if let Some(prev) = out.chars().last() {
                if !is_punctuator(prev) && !is_punctuator(c) {
                    out.push(' ');
                }
            }
        }
        pending_space = false;
        out.push(c);
        if c == '"' {
            in_string = true;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_header() {
        let tags = parse_tag_header(Some("tag-a tag-2 other-tag"));
        let tags: Vec<&str> = tags.iter().map(CacheTag::as_str).collect();
        assert_eq!(tags, vec!["tag-a", "tag-2", "other-tag"]);
    }

    #[test]
    fn test_parse_missing_header() {
        assert!(parse_tag_header(None).is_empty());
        assert!(parse_tag_header(Some("")).is_empty());
        assert!(parse_tag_header(Some("   ")).is_empty());
    }

    #[test]
    fn test_parse_header_skips_repeated_separators() {
        let tags = parse_tag_header(Some(" a  b\tc "));
        assert_eq!(tags.len(), 3);
    }

    #[test]
    fn test_tag_validation() {
        assert!(CacheTag::new("N4Xz8").is_ok());
        assert!(matches!(CacheTag::new(""), Err(TagIndexError::InvalidTag(_))));
        assert!(matches!(CacheTag::new("a b"), Err(TagIndexError::InvalidTag(_))));
        assert!("x\ny".parse::<CacheTag>().is_err());
    }

    #[test]
    fn test_query_id_validation() {
        assert!(matches!(QueryId::new(""), Err(TagIndexError::InvalidQueryId)));
        assert_eq!(QueryId::new("abc").unwrap().as_str(), "abc");
    }

    #[test]
    fn test_tag_deserialization_validates() {
        let tags: Vec<CacheTag> = serde_json::from_value(json!(["a", "b"])).unwrap();
        assert_eq!(tags.len(), 2);
        assert!(serde_json::from_value::<CacheTag>(json!("has space")).is_err());
    }

    #[test]
    fn test_query_id_is_deterministic() {
        let query = "query { allPosts { id title } }";
        let vars = json!({ "first": 10, "locale": "en" });
        let a = derive_query_id(query, Some(&vars), None).unwrap();
        let b = derive_query_id(query, Some(&vars), None).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_query_id_ignores_key_order() {
        let query = "query Post($id: ItemId) { post(filter: { id: { eq: $id } }) { title } }";
        let a: Value = serde_json::from_str(r#"{"id":"1","opts":{"a":1,"b":2}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"opts":{"b":2,"a":1},"id":"1"}"#).unwrap();
        assert_eq!(
            derive_query_id(query, Some(&a), None).unwrap(),
            derive_query_id(query, Some(&b), None).unwrap()
        );
    }

    #[test]
    fn test_query_id_ignores_formatting() {
        let compact = "query { allPosts(first: 10) { id } }";
        let pretty = "query {\n  allPosts(first: 10) {\n    id\n  }\n}\n";
        assert_eq!(
            derive_query_id(compact, None, None).unwrap(),
            derive_query_id(pretty, None, None).unwrap()
        );
    }

    #[test]
    fn test_query_id_ignores_spacing_around_punctuators() {
        let tight = "{post(id:1){title,author{name}}}";
        let loose = "{ post ( id : 1 ) { title author { name } } }";
        assert_eq!(
            derive_query_id(tight, None, None).unwrap(),
            derive_query_id(loose, None, None).unwrap()
        );
        assert_eq!(canonical_query_text(loose), "{post(id:1){title author{name}}}");
    }

    #[test]
    fn test_query_id_ignores_comments() {
        let plain = "query Posts { allPosts { id } }";
        let commented = "# list page\nquery Posts { # every post\n  allPosts { id }\n}";
        assert_eq!(
            derive_query_id(plain, None, None).unwrap(),
            derive_query_id(commented, None, None).unwrap()
        );
        assert_eq!(
            canonical_query_text(r##"{ post(slug: "#not-a-comment") { id } }"##),
            r##"{post(slug:"#not-a-comment"){id}}"##
        );
    }

    #[test]
    fn test_query_id_keeps_string_literals() {
        let a = derive_query_id(r#"{ post(slug: "a  b") { id } }"#, None, None).unwrap();
        let b = derive_query_id(r#"{ post(slug: "a b") { id } }"#, None, None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_query_id_varies_with_inputs() {
        let query = "{ allPosts { id } }";
        let base = derive_query_id(query, None, None).unwrap();
        let with_vars = derive_query_id(query, Some(&json!({ "first": 1 })), None).unwrap();
        let with_headers = derive_query_id(
            query,
            None,
            Some(&json!({ "X-Include-Drafts": "true" })),
        )
        .unwrap();
        assert_ne!(base, with_vars);
        assert_ne!(base, with_headers);
        assert_ne!(with_vars, with_headers);
    }
}
