//! Lowering from the decision tree to the source text of a standalone
//! multi-server mock binary. The dispatch logic of the emitted program is
//! the tree itself: one server per host, one route per path, then nested
//! method / query / request-body branches ending in captured responses.
//!
//! The target language is Rust (tokio + axum + serde_json + url; the
//! standard library alone has no HTTP server). Emission is deterministic:
//! the same tree renders to the same bytes, with children visited in
//! lexicographic key order at every level.

use std::fmt::Write as _;

use crate::tree::{HostNode, MethodNode, PathNode, QueryNode, RespLeaf, Tree};

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
	#[error("source formatting failed: {0}")]
	Fmt(#[from] std::fmt::Error),
	#[error("mock port space exhausted: {0} hosts starting at port {1}")]
	PortSpace(usize, u16),
}

/// Render the whole mock program. `mock_begin_port` is the port of the
/// lexicographically first host; each further host gets the next port.
pub fn render(tree: &Tree, mock_begin_port: u16) -> Result<String, EmitError> {
	let mut w = Writer::new();

	w.line("// Generated by stubgen: standalone mock servers reproducing captured")?;
	w.line("// upstream responses. Dependency and port tables are at the end of the file.")?;
	w.line("")?;
	w.line("use std::net::SocketAddr;")?;
	w.line("")?;
	w.line("use axum::Router;")?;
	w.line("use axum::body::Body;")?;
	w.line("use axum::extract::{ConnectInfo, Request};")?;
	w.line("use axum::http::Response;")?;
	w.line("use axum::routing::any;")?;
	w.line("")?;
	w.raw(HELPERS);

	let mut ports: Vec<(&str, u16)> = Vec::new();
	for (i, host) in tree.hosts.keys().enumerate() {
		let port = (mock_begin_port as u32).checked_add(i as u32).filter(|p| *p <= u16::MAX as u32);
		match port {
			Some(port) => ports.push((host, port as u16)),
			None => return Err(EmitError::PortSpace(tree.hosts.len(), mock_begin_port)),
		}
	}

	w.line("#[tokio::main]")?;
	w.line("async fn main() {")?;
	w.push();
	for ((host, node), (_, port)) in tree.hosts.iter().zip(&ports) {
		emit_host(&mut w, host, node, *port)?;
	}
	emit_signal_wait(&mut w)?;
	w.pop();
	w.line("}")?;

	emit_trailer(&mut w, &ports)?;
	Ok(w.finish())
}

/// Textual twins of [`crate::canon`]: the mock must canonicalize incoming
/// requests exactly the way capture did, or nothing would ever match.
const HELPERS: &str = r#"fn canon_query(query: &str) -> String {
	let mut map = serde_json::Map::new();
	for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
		map.entry(name.into_owned())
			.or_insert_with(|| serde_json::Value::Array(Vec::new()))
			.as_array_mut()
			.expect("query entries are always arrays")
			.push(serde_json::Value::String(value.into_owned()));
	}
	serde_json::to_string(&map).unwrap_or_default()
}

fn canon_body(bytes: &[u8]) -> String {
	if bytes.is_empty() {
		return String::new();
	}
	match serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(bytes) {
		Ok(map) => serde_json::to_string(&map).unwrap_or_default(),
		Err(_) => String::from_utf8_lossy(bytes).into_owned(),
	}
}

fn log_request(remote: SocketAddr, method: &axum::http::Method, port: u16, uri: &axum::http::Uri) {
	println!("{remote} {method} :{port} {uri}");
}

"#;

fn emit_host(w: &mut Writer, host: &str, node: &HostNode, port: u16) -> Result<(), EmitError> {
	w.line(&format!("// {host}"))?;
	w.line("{")?;
	w.push();
	w.line("let mut router = Router::new();")?;
	for (path, path_node) in &node.paths {
		emit_path(w, path, path_node, port)?;
	}
	w.line(&format!(
		"let listener = tokio::net::TcpListener::bind({}).await.unwrap();",
		lit(&format!("0.0.0.0:{port}"))
	))?;
	w.line("tokio::spawn(async move {")?;
	w.push();
	w.line("axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())")?;
	w.push();
	w.line(".await")?;
	w.line(".unwrap();")?;
	w.pop();
	w.pop();
	w.line("});")?;
	w.pop();
	w.line("}")?;
	Ok(())
}

fn emit_path(w: &mut Writer, path: &str, node: &PathNode, port: u16) -> Result<(), EmitError> {
	w.line("router = router.route(")?;
	w.push();
	w.line(&format!("{},", lit(path)))?;
	w.line("any(|ConnectInfo(remote): ConnectInfo<SocketAddr>, request: Request| async move {")?;
	w.push();
	w.line(&format!(
		"log_request(remote, request.method(), {port}, request.uri());"
	))?;
	w.line("let method = request.method().clone();")?;
	w.line("let query = request.uri().query().unwrap_or(\"\").to_string();")?;
	for (i, (method, method_node)) in node.methods.iter().enumerate() {
		let opener = if i == 0 { "if" } else { "} else if" };
		w.line(&format!("{opener} method == {} {{", lit(method)))?;
		w.push();
		emit_method(w, method_node)?;
		w.pop();
	}
	w.line("}")?;
	w.line("Response::builder().status(404).body(Body::empty()).unwrap()")?;
	w.pop();
	w.line("}),")?;
	w.pop();
	w.line(");")?;
	Ok(())
}

fn emit_method(w: &mut Writer, node: &MethodNode) -> Result<(), EmitError> {
	for (i, (query, query_node)) in node.queries.iter().enumerate() {
		let first = i == 0;
		if first {
			// The one-time body read: hoisted before the query chain so
			// every sibling branch shares the binding.
			w.line("let bytes = match axum::body::to_bytes(request.into_body(), usize::MAX).await {")?;
			w.push();
			w.line("Ok(bytes) => bytes,")?;
			w.line("Err(_) => return Response::builder().status(400).body(Body::empty()).unwrap(),")?;
			w.pop();
			w.line("};")?;
			w.line("let body = canon_body(&bytes);")?;
		}
		let opener = if first { "if" } else { "} else if" };
		w.line(&format!("{opener} canon_query(&query) == {} {{", lit(query)))?;
		w.push();
		emit_query(w, query_node)?;
		w.pop();
	}
	w.line("}")?;
	Ok(())
}

fn emit_query(w: &mut Writer, node: &QueryNode) -> Result<(), EmitError> {
	for (i, (req_body, body_node)) in node.bodies.iter().enumerate() {
		let opener = if i == 0 { "if" } else { "} else if" };
		w.line(&format!("{opener} body == {} {{", lit(req_body)))?;
		w.push();
		// Siblings here are distinct responses to one request; the first
		// emitted branch wins at replay, the rest stay as a record.
		for leaf in body_node.responses.values() {
			emit_resp(w, leaf)?;
		}
		w.pop();
	}
	w.line("}")?;
	Ok(())
}

fn emit_resp(w: &mut Writer, leaf: &RespLeaf) -> Result<(), EmitError> {
	w.line(&format!(
		"let response = Response::builder().status({});",
		leaf.status
	))?;
	for (name, value) in &leaf.headers {
		w.line(&format!(
			"let response = response.header({}, {});",
			lit(name),
			lit(value)
		))?;
	}
	w.line(&format!(
		"return response.body(Body::from({})).unwrap();",
		lit(&leaf.body)
	))?;
	Ok(())
}

fn emit_signal_wait(w: &mut Writer) -> Result<(), EmitError> {
	w.line("let mut interrupt =")?;
	w.push();
	w.line("tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).unwrap();")?;
	w.pop();
	w.line("let mut terminate =")?;
	w.push();
	w.line("tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).unwrap();")?;
	w.pop();
	w.line("let mut quit = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::quit()).unwrap();")?;
	w.line("tokio::select! {")?;
	w.push();
	w.line("_ = interrupt.recv() => {}")?;
	w.line("_ = terminate.recv() => {}")?;
	w.line("_ = quit.recv() => {}")?;
	w.pop();
	w.line("}")?;
	Ok(())
}

fn emit_trailer(w: &mut Writer, ports: &[(&str, u16)]) -> Result<(), EmitError> {
	w.line("")?;
	w.line("// Build with:")?;
	w.line("//")?;
	w.line("//   [dependencies]")?;
	w.line("//   axum = \"0.8\"")?;
	w.line("//   serde_json = { version = \"1.0\", features = [\"preserve_order\"] }")?;
	w.line("//   tokio = { version = \"1\", features = [\"full\"] }")?;
	w.line("//   url = \"2.5\"")?;
	w.line("//")?;
	w.line("// Mock port assignment:")?;
	w.line("//")?;
	if ports.is_empty() {
		w.line("//   (no hosts captured)")?;
	}
	for (host, port) in ports {
		w.line(&format!("//   {host} -> 0.0.0.0:{port}"))?;
	}
	Ok(())
}

/// Escape a string as a Rust literal. Debug formatting handles quotes,
/// backslashes, and control characters.
fn lit(s: &str) -> String {
	format!("{s:?}")
}

struct Writer {
	out: String,
	indent: usize,
}

impl Writer {
	fn new() -> Self {
		Writer {
			out: String::new(),
			indent: 0,
		}
	}

	fn line(&mut self, s: &str) -> Result<(), EmitError> {
		if !s.is_empty() {
			for _ in 0..self.indent {
				self.out.write_char('\t')?;
			}
			self.out.write_str(s)?;
		}
		self.out.write_char('\n')?;
		Ok(())
	}

	fn raw(&mut self, s: &str) {
		self.out.push_str(s);
	}

	fn push(&mut self) {
		self.indent += 1;
	}

	fn pop(&mut self) {
		self.indent -= 1;
	}

	fn finish(self) -> String {
		self.out
	}
}

#[cfg(test)]
mod tests {
	use bytes::Bytes;
	use http::{HeaderMap, Method, StatusCode};

	use super::*;
	use crate::flow::{Flow, RequestSnapshot, ResponseSnapshot};
	use crate::tree::Tree;

	fn flow(
		authority: &str,
		method: Method,
		path: &str,
		query: &str,
		req_body: &[u8],
		status: u16,
		headers: &[(&str, &str)],
		resp_body: &[u8],
	) -> Flow {
		let mut header_map = HeaderMap::new();
		for (name, value) in headers {
			header_map.append(
				http::HeaderName::try_from(*name).unwrap(),
				value.parse().unwrap(),
			);
		}
		let mut flow = Flow::new(RequestSnapshot {
			tls: false,
			authority: authority.parse().unwrap(),
			method,
			path: path.to_string(),
			query: query.to_string(),
			body: Bytes::copy_from_slice(req_body),
		});
		flow.response = Some(ResponseSnapshot {
			status: StatusCode::from_u16(status).unwrap(),
			headers: header_map,
			body: Bytes::copy_from_slice(resp_body),
		});
		flow
	}

	#[test]
	fn rendering_is_deterministic() {
		let flows = vec![
			flow("b:80", Method::GET, "/x", "a=1", b"", 200, &[], b"one"),
			flow("a:80", Method::POST, "/y", "", b"{\"k\":1}", 201, &[], b"two"),
		];
		let first = render(&Tree::build(&flows), 8080).unwrap();
		let second = render(&Tree::build(&flows), 8080).unwrap();
		assert_eq!(first, second);
	}

	#[test]
	fn two_hosts_get_consecutive_ports_and_stripped_headers() {
		let flows = vec![
			flow(
				"localhost:8080",
				Method::GET,
				"/",
				"",
				b"",
				200,
				&[("Content-Type", "application/json")],
				b"{\"foo\":\"bar\"}",
			),
			flow(
				"localhost:8081",
				Method::GET,
				"/hoge",
				"",
				b"",
				200,
				&[("Content-Type", "application/json"), ("X-Foo", "foo")],
				b"{\"foo\":\"bar\"}",
			),
		];
		let src = render(&Tree::build(&flows), 8080).unwrap();

		assert!(src.contains(r#"tokio::net::TcpListener::bind("0.0.0.0:8080")"#));
		assert!(src.contains(r#"tokio::net::TcpListener::bind("0.0.0.0:8081")"#));
		assert!(src.contains(r#"router.route("#));
		assert!(src.contains(r#""/hoge","#));
		assert!(src.contains(r#".header("x-foo", "foo")"#));
		assert!(!src.contains("content-type"), "stripped header leaked");
		assert!(src.contains("//   localhost:8080 -> 0.0.0.0:8080"));
		assert!(src.contains("//   localhost:8081 -> 0.0.0.0:8081"));
	}

	#[test]
	fn sibling_query_branches_share_one_body_read() {
		let flows = vec![
			flow("h:80", Method::GET, "/", "", b"", 200, &[], b"{\"foo\":\"bar\"}"),
			flow("h:80", Method::GET, "/", "v=1", b"", 200, &[], b"{\"foo\":\"baz\"}"),
		];
		let src = render(&Tree::build(&flows), 8080).unwrap();

		assert_eq!(src.matches("axum::body::to_bytes").count(), 1);
		// `{"` sorts before `{}`, so the keyed query is the first branch.
		assert!(src.contains(r#"if canon_query(&query) == "{\"v\":[\"1\"]}" {"#));
		assert!(src.contains(r#"} else if canon_query(&query) == "{}" {"#));
	}

	#[test]
	fn request_body_siblings_carry_their_statuses() {
		let flows = vec![
			flow(
				"h:80",
				Method::POST,
				"/api",
				"",
				b"{\"token\":\"abc\"}",
				200,
				&[],
				b"{\"ok\":true}",
			),
			flow(
				"h:80",
				Method::POST,
				"/api",
				"",
				b"{\"token\":\"xyz\"}",
				401,
				&[],
				b"{\"err\":\"no\"}",
			),
		];
		let src = render(&Tree::build(&flows), 8080).unwrap();

		assert!(src.contains(r#"if body == "{\"token\":\"abc\"}" {"#));
		assert!(src.contains(r#"} else if body == "{\"token\":\"xyz\"}" {"#));
		assert!(src.contains("Response::builder().status(200);"));
		assert!(src.contains("Response::builder().status(401);"));
	}

	#[test]
	fn non_json_bodies_compare_literally() {
		let flows = vec![flow(
			"h:80",
			Method::POST,
			"/",
			"",
			b"not json",
			200,
			&[],
			b"also not json",
		)];
		let src = render(&Tree::build(&flows), 8080).unwrap();
		assert!(src.contains(r#"if body == "not json" {"#));
		assert!(src.contains(r#"return response.body(Body::from("also not json")).unwrap();"#));
	}

	#[test]
	fn children_appear_in_lexicographic_order() {
		let flows = vec![
			flow("bbb:80", Method::GET, "/", "", b"", 200, &[], b"x"),
			flow("aaa:80", Method::GET, "/", "", b"", 200, &[], b"x"),
		];
		let src = render(&Tree::build(&flows), 8080).unwrap();

		let a = src.find("// aaa:80").unwrap();
		let b = src.find("// bbb:80").unwrap();
		assert!(a < b);
		assert!(src.contains("//   aaa:80 -> 0.0.0.0:8080"));
		assert!(src.contains("//   bbb:80 -> 0.0.0.0:8081"));
	}

	#[test]
	fn empty_tree_still_renders_a_waiting_main() {
		let src = render(&Tree::default(), 8080).unwrap();
		assert!(src.contains("async fn main() {"));
		assert!(src.contains("tokio::signal::unix::SignalKind::interrupt()"));
		assert!(!src.contains("Router::new"));
		assert!(src.contains("//   (no hosts captured)"));
	}

	#[test]
	fn string_literals_are_escaped() {
		let flows = vec![flow(
			"h:80",
			Method::GET,
			"/",
			"",
			b"",
			200,
			&[],
			b"a \"quoted\"\nline\\",
		)];
		let src = render(&Tree::build(&flows), 8080).unwrap();
		assert!(src.contains(r#""a \"quoted\"\nline\\""#));
	}

	#[test]
	fn duplicate_flows_emit_once() {
		let a = flow("h:80", Method::GET, "/", "", b"", 200, &[], b"same");
		let b = flow("h:80", Method::GET, "/", "", b"", 200, &[], b"same");
		let src = render(&Tree::build(&[a, b]), 8080).unwrap();
		assert_eq!(src.matches(r#"Body::from("same")"#).count(), 1);
	}
}
