//! Captured transactions and the table that holds them during a run.

use std::collections::HashMap;

use bytes::Bytes;
use http::uri::Authority;
use http::{HeaderMap, Method, StatusCode};
use parking_lot::Mutex;

/// One captured request, frozen at the moment the request hook ran. The
/// body arrives later, once the teed stream has been fully relayed.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
	/// True when the request arrived through an intercepted TLS tunnel.
	pub tls: bool,
	/// Authority exactly as the client addressed it (port included only
	/// when the client sent one).
	pub authority: Authority,
	pub method: Method,
	pub path: String,
	/// Raw query string, without the leading `?`.
	pub query: String,
	pub body: Bytes,
}

/// The response half of a flow. Status and headers are recorded when the
/// response hook runs; the body is filled in when its tee completes.
#[derive(Debug, Clone)]
pub struct ResponseSnapshot {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
}

/// One request/response pair. Flows with `response: None` never made it
/// back from the upstream and are skipped at render time.
#[derive(Debug, Clone)]
pub struct Flow {
	pub id: String,
	pub request: RequestSnapshot,
	pub response: Option<ResponseSnapshot>,
}

impl Flow {
	pub fn new(request: RequestSnapshot) -> Self {
		Flow {
			id: new_flow_id(),
			request,
			response: None,
		}
	}
}

/// 128 uniformly random bits, rendered as 32 lowercase hex characters.
fn new_flow_id() -> String {
	format!("{:032x}", rand::random::<u128>())
}

/// Concurrency-safe flow table. Lives for the whole capture run; there is
/// no TTL and no eviction.
#[derive(Debug, Default)]
pub struct FlowStore {
	flows: Mutex<HashMap<String, Flow>>,
}

impl FlowStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert or overwrite a flow.
	pub fn put(&self, flow: Flow) {
		self.flows.lock().insert(flow.id.clone(), flow);
	}

	/// Attach the captured request body to an existing flow.
	pub fn set_request_body(&self, id: &str, body: Bytes) {
		if let Some(flow) = self.flows.lock().get_mut(id) {
			flow.request.body = body;
		}
	}

	/// Attach the response to an existing flow. The body may still be
	/// empty at this point; `set_response_body` completes it.
	pub fn add_response(&self, id: &str, response: ResponseSnapshot) {
		if let Some(flow) = self.flows.lock().get_mut(id) {
			flow.response = Some(response);
		}
	}

	pub fn set_response_body(&self, id: &str, body: Bytes) {
		if let Some(flow) = self.flows.lock().get_mut(id)
			&& let Some(response) = flow.response.as_mut()
		{
			response.body = body;
		}
	}

	pub fn len(&self) -> usize {
		self.flows.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.flows.lock().is_empty()
	}

	/// Immutable view of everything captured so far. Taken by the
	/// synthesizer after the proxy has drained, so it is definitionally
	/// consistent.
	pub fn snapshot(&self) -> Vec<Flow> {
		self.flows.lock().values().cloned().collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request(path: &str) -> RequestSnapshot {
		RequestSnapshot {
			tls: false,
			authority: "localhost:8080".parse().unwrap(),
			method: Method::GET,
			path: path.to_string(),
			query: String::new(),
			body: Bytes::new(),
		}
	}

	#[test]
	fn response_is_added_read_modify_write() {
		let store = FlowStore::new();
		let flow = Flow::new(request("/"));
		let id = flow.id.clone();
		store.put(flow);

		store.add_response(
			&id,
			ResponseSnapshot {
				status: StatusCode::OK,
				headers: HeaderMap::new(),
				body: Bytes::new(),
			},
		);
		store.set_response_body(&id, Bytes::from_static(b"hello"));

		let flows = store.snapshot();
		assert_eq!(flows.len(), 1);
		let resp = flows[0].response.as_ref().unwrap();
		assert_eq!(resp.status, StatusCode::OK);
		assert_eq!(resp.body, Bytes::from_static(b"hello"));
	}

	#[test]
	fn flow_ids_are_canonical_hex() {
		let flow = Flow::new(request("/"));
		assert_eq!(flow.id.len(), 32);
		assert!(flow.id.chars().all(|c| c.is_ascii_hexdigit()));
	}

	#[test]
	fn body_updates_for_unknown_ids_are_ignored() {
		let store = FlowStore::new();
		store.set_request_body("missing", Bytes::from_static(b"x"));
		store.set_response_body("missing", Bytes::from_static(b"x"));
		assert!(store.is_empty());
	}
}
