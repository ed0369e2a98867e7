//! Canonical keys: deterministic strings derived from request and response
//! fragments, used as decision-tree edge labels. Capture and the emitted
//! mock must agree on these byte-for-byte, so the emitted helpers in
//! [`crate::emit`] are textual twins of the functions here.

use http::HeaderMap;
use http::uri::Authority;
use tracing::error;

/// Headers that are transport-owned, regenerated by the emitted mock, or
/// plain nondeterministic. They never participate in response comparison
/// and never appear in emitted code.
const STRIPPED_HEADERS: &[&str] = &[
	"date",
	"content-type",
	"content-length",
	"server",
	"connection",
	"keep-alive",
	"cache-control",
	"expires",
];

/// JSON-encode a raw query string as a name → values multimap. Keys appear
/// in order of first occurrence, values in wire order. The empty query is
/// `{}`.
pub fn canon_query(raw: &str) -> String {
	let mut map = serde_json::Map::new();
	for (name, value) in url::form_urlencoded::parse(raw.as_bytes()) {
		map
			.entry(name.into_owned())
			.or_insert_with(|| serde_json::Value::Array(Vec::new()))
			.as_array_mut()
			.expect("query entries are always arrays")
			.push(serde_json::Value::String(value.into_owned()));
	}
	match serde_json::to_string(&map) {
		Ok(s) => s,
		Err(e) => {
			error!("failed to encode query multimap: {e}");
			String::new()
		},
	}
}

/// Canonicalize body bytes. A JSON *object* is re-marshaled (stable key
/// order via `preserve_order`); anything else is kept as its raw bytes,
/// lossily decoded. Empty input is the empty string.
pub fn canon_body(bytes: &[u8]) -> String {
	if bytes.is_empty() {
		return String::new();
	}
	match serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(bytes) {
		Ok(map) => serde_json::to_string(&map).unwrap_or_else(|e| {
			error!("failed to re-encode JSON body: {e}");
			String::from_utf8_lossy(bytes).into_owned()
		}),
		Err(_) => String::from_utf8_lossy(bytes).into_owned(),
	}
}

/// Response headers minus the stripped set, sorted by name then value so
/// that equal header sets compare equal regardless of wire order.
pub fn canon_headers(headers: &HeaderMap) -> Vec<(String, String)> {
	let mut out: Vec<(String, String)> = headers
		.iter()
		.filter(|(name, _)| !STRIPPED_HEADERS.contains(&name.as_str()))
		.map(|(name, value)| {
			(
				name.as_str().to_string(),
				String::from_utf8_lossy(value.as_bytes()).into_owned(),
			)
		})
		.collect();
	out.sort();
	out
}

/// The host dimension of the tree: `host:port`, with the default port
/// filled in from the scheme when the client did not send one. No scheme
/// prefix; the emitted host→port table uses the same form.
pub fn host_key(authority: &Authority, tls: bool) -> String {
	match authority.port() {
		Some(_) => authority.to_string(),
		None => format!("{}:{}", authority, if tls { 443 } else { 80 }),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn authority(s: &str) -> Authority {
		s.parse().unwrap()
	}

	#[test]
	fn query_preserves_insertion_order_and_multi_values() {
		assert_eq!(canon_query("b=2&a=1&a=3"), r#"{"b":["2"],"a":["1","3"]}"#);
	}

	#[test]
	fn query_empty_is_empty_object() {
		assert_eq!(canon_query(""), "{}");
	}

	#[test]
	fn query_percent_decodes() {
		assert_eq!(canon_query("q=a%20b"), r#"{"q":["a b"]}"#);
	}

	#[test]
	fn body_empty() {
		assert_eq!(canon_body(b""), "");
	}

	#[test]
	fn body_json_object_is_remarshaled() {
		assert_eq!(canon_body(b"{\"foo\": \"bar\"}"), r#"{"foo":"bar"}"#);
		assert_eq!(
			canon_body(b"{ \"b\" : 1 , \"a\" : 2 }"),
			r#"{"b":1,"a":2}"#,
			"object key order follows the input, not a sort"
		);
	}

	#[test]
	fn body_non_object_is_raw() {
		assert_eq!(canon_body(b"not json"), "not json");
		assert_eq!(canon_body(b"[1,2]"), "[1,2]");
		assert_eq!(canon_body(b"42"), "42");
	}

	#[test]
	fn headers_strip_and_sort() {
		let mut h = HeaderMap::new();
		h.insert("Date", "Mon, 01 Jan 2024 00:00:00 GMT".parse().unwrap());
		h.insert("Content-Type", "application/json".parse().unwrap());
		h.insert("Content-Length", "13".parse().unwrap());
		h.insert("X-Foo", "foo".parse().unwrap());
		h.append("Set-Cookie", "b=2".parse().unwrap());
		h.append("Set-Cookie", "a=1".parse().unwrap());
		assert_eq!(
			canon_headers(&h),
			vec![
				("set-cookie".to_string(), "a=1".to_string()),
				("set-cookie".to_string(), "b=2".to_string()),
				("x-foo".to_string(), "foo".to_string()),
			]
		);
	}

	#[test]
	fn host_key_fills_default_port() {
		assert_eq!(host_key(&authority("example.com"), true), "example.com:443");
		assert_eq!(host_key(&authority("example.com"), false), "example.com:80");
		assert_eq!(
			host_key(&authority("example.com:8443"), true),
			"example.com:8443"
		);
	}
}
