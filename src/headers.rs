//! Ordered, case-insensitive multi-value header store
//!
//! Both [`ClientRequest`](crate::ClientRequest) and
//! [`ServerResponse`](crate::ServerResponse) keep two of these: one for the
//! general headers and one for the headers that describe the body.
use crate::errors::Result;
use crate::{COLON_SPACE, CR_LF};
use http::{HeaderMap, HeaderName, HeaderValue};

/// Headers that describe the message body rather than the message itself.
const CONTENT_HEADERS: &[&str] = &[
  "allow",
  "content-disposition",
  "content-encoding",
  "content-language",
  "content-length",
  "content-location",
  "content-md5",
  "content-range",
  "content-type",
  "expires",
  "last-modified",
];

/// Rendered as one line per value, never joined.
const SET_COOKIE: &str = "set-cookie";
/// Separator for every other multi-valued header.
const VALUE_SEPARATOR: &str = ";";

/// Returns true when `name` belongs in the content-header collection.
pub fn is_content_header(name: &str) -> bool {
  CONTENT_HEADERS
    .iter()
    .any(|h| h.eq_ignore_ascii_case(name.trim()))
}

/// Mapping from a case-insensitive header name to its ordered values.
///
/// Insertion order of names is kept, and the spelling of the first insertion
/// wins when the collection is rendered.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeaderCollection {
  entries: Vec<(String, Vec<String>)>,
}

impl HeaderCollection {
  /// Create an empty collection
  pub fn new() -> Self {
    Self::default()
  }

  fn position(&self, name: &str) -> Option<usize> {
    self
      .entries
      .iter()
      .position(|(k, _)| k.eq_ignore_ascii_case(name))
  }

  /// Append a value, keeping any already stored under the same name.
  pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    match self.position(&name) {
      Some(idx) => self.entries[idx].1.push(value),
      None => self.entries.push((name, vec![value])),
    }
  }

  /// Replace every value stored under `name` with `value`.
  pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    match self.position(&name) {
      Some(idx) => self.entries[idx].1 = vec![value],
      None => self.entries.push((name, vec![value])),
    }
  }

  /// All values for `name`, in arrival order.
  pub fn get(&self, name: &str) -> Option<&[String]> {
    self
      .position(name)
      .map(|idx| self.entries[idx].1.as_slice())
  }

  /// The first value for `name`.
  pub fn get_first(&self, name: &str) -> Option<&str> {
    self
      .get(name)
      .and_then(|values| values.first())
      .map(String::as_str)
  }

  /// Returns true if `name` is present.
  pub fn contains(&self, name: &str) -> bool {
    self.position(name).is_some()
  }

  /// Remove `name`, returning its values.
  pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
    self.position(name).map(|idx| self.entries.remove(idx).1)
  }

  /// Iterate over `(name, values)` pairs in insertion order.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
    self
      .entries
      .iter()
      .map(|(k, v)| (k.as_str(), v.as_slice()))
  }

  /// Number of distinct header names.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Returns true if no headers are stored.
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Wire lines for this collection, `Set-Cookie` split, others joined.
  pub fn lines(&self) -> Vec<(&str, String)> {
    let mut lines = Vec::with_capacity(self.entries.len());
    for (name, values) in &self.entries {
      if name.eq_ignore_ascii_case(SET_COOKIE) {
        for v in values {
          lines.push((name.as_str(), v.clone()));
        }
      } else {
        lines.push((name.as_str(), values.join(VALUE_SEPARATOR)));
      }
    }
    lines
  }

  /// Append the rendered header lines to `buf`.
  pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
    for (name, value) in self.lines() {
      buf.extend(name.as_bytes());
      buf.extend(COLON_SPACE);
      buf.extend(value.as_bytes());
      buf.extend(CR_LF);
    }
  }

  /// Copy every value into `map`, one `HeaderMap` entry per stored value.
  pub(crate) fn append_to(&self, map: &mut HeaderMap) -> Result<()> {
    for (name, values) in &self.entries {
      let name = HeaderName::from_bytes(name.as_bytes())?;
      for v in values {
        map.append(name.clone(), HeaderValue::from_str(v)?);
      }
    }
    Ok(())
  }

  /// Split a `HeaderMap` into general and content headers.
  pub(crate) fn split_header_map(map: &HeaderMap) -> (HeaderCollection, HeaderCollection) {
    let mut general = HeaderCollection::new();
    let mut content = HeaderCollection::new();
    for (name, value) in map.iter() {
      let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
      if is_content_header(name.as_str()) {
        content.add(name.as_str(), value);
      } else {
        general.add(name.as_str(), value);
      }
    }
    (general, content)
  }
}

/// Split a raw header line on its first `:`.
pub(crate) fn split_header_line(line: &str) -> Option<(&str, &str)> {
  let line = line.trim_end_matches(['\r', '\n']);
  let (name, value) = line.split_once(':')?;
  let name = name.trim();
  if name.is_empty() {
    return None;
  }
  Some((name, value.trim()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn lookup_ignores_case() {
    let mut headers = HeaderCollection::new();
    headers.add("Content-Type", "text/html");
    assert_eq!(headers.get_first("content-type"), Some("text/html"));
    assert!(headers.contains("CONTENT-TYPE"));
    headers.set("content-TYPE", "application/json");
    assert_eq!(headers.len(), 1);
    assert_eq!(headers.get_first("Content-Type"), Some("application/json"));
  }

  #[test]
  fn set_cookie_lines_are_never_joined() {
    let mut headers = HeaderCollection::new();
    headers.add("Set-Cookie", "a=1; Path=/");
    headers.add("set-cookie", "b=2");
    headers.add("Accept", "text/html");
    headers.add("accept", "application/json");
    let mut raw = Vec::new();
    headers.write_to(&mut raw);
    assert_eq!(
      String::from_utf8(raw).unwrap(),
      "Set-Cookie: a=1; Path=/\r\nSet-Cookie: b=2\r\nAccept: text/html;application/json\r\n"
    );
  }

  #[test]
  fn content_headers_are_classified_by_table() {
    for name in ["Content-Length", "content-type", "Expires", "Last-Modified", "Allow"] {
      assert!(is_content_header(name), "{name}");
    }
    for name in ["Host", "Upgrade", "Set-Cookie", "Content"] {
      assert!(!is_content_header(name), "{name}");
    }
  }

  #[test]
  fn header_line_splits_on_first_colon() {
    assert_eq!(
      split_header_line("Host: example.com:8443\r\n"),
      Some(("Host", "example.com:8443"))
    );
    assert_eq!(split_header_line("X-Empty:"), Some(("X-Empty", "")));
    assert_eq!(split_header_line("no separator"), None);
    assert_eq!(split_header_line(": value"), None);
  }

  #[test]
  fn header_map_split_keeps_values() {
    let mut map = HeaderMap::new();
    map.append("set-cookie", HeaderValue::from_static("a=1"));
    map.append("set-cookie", HeaderValue::from_static("b=2"));
    map.insert("content-length", HeaderValue::from_static("5"));
    let (general, content) = HeaderCollection::split_header_map(&map);
    assert_eq!(general.get("Set-Cookie").map(|v| v.len()), Some(2));
    assert_eq!(content.get_first("Content-Length"), Some("5"));

    let mut back = HeaderMap::new();
    general.append_to(&mut back).unwrap();
    content.append_to(&mut back).unwrap();
    assert_eq!(back.get_all("set-cookie").iter().count(), 2);
  }
}
