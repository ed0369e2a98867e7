//! The decision tree: a six-level prefix-shared structure keyed by host,
//! path, method, canonical query, canonical request body, and a synthetic
//! response key. Children live in `BTreeMap`s, so every traversal is in
//! lexicographic key order and emission is reproducible byte-for-byte.

use std::collections::BTreeMap;

use tracing::warn;

use crate::canon;
use crate::flow::Flow;

#[derive(Debug, Default)]
pub struct Tree {
	pub hosts: BTreeMap<String, HostNode>,
}

#[derive(Debug, Default)]
pub struct HostNode {
	pub paths: BTreeMap<String, PathNode>,
}

#[derive(Debug, Default)]
pub struct PathNode {
	pub methods: BTreeMap<String, MethodNode>,
}

#[derive(Debug, Default)]
pub struct MethodNode {
	pub queries: BTreeMap<String, QueryNode>,
}

#[derive(Debug, Default)]
pub struct QueryNode {
	pub bodies: BTreeMap<String, ReqBodyNode>,
}

#[derive(Debug, Default)]
pub struct ReqBodyNode {
	pub responses: BTreeMap<String, RespLeaf>,
}

/// Terminal node: one observed response. Headers are already stripped and
/// sorted, the body canonicalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespLeaf {
	pub status: u16,
	pub headers: Vec<(String, String)>,
	pub body: String,
}

impl RespLeaf {
	/// The edge label for this leaf. Distinct responses to an identical
	/// request stay siblings; byte-identical responses collapse, which is
	/// what makes tree building idempotent over duplicate flows.
	fn key(&self) -> String {
		let headers = self
			.headers
			.iter()
			.map(|(name, value)| format!("{name}:{value}"))
			.collect::<Vec<_>>()
			.join("\n");
		format!("{}\n{}\n{}", self.status, headers, self.body)
	}
}

impl Tree {
	/// Fold a flow snapshot into a tree. Flows that never received a
	/// response are logged and skipped.
	pub fn build(flows: &[Flow]) -> Tree {
		let mut tree = Tree::default();
		for flow in flows {
			tree.insert(flow);
		}
		tree
	}

	/// Merge one flow. Append-only: existing subtrees are reused, never
	/// mutated.
	pub fn insert(&mut self, flow: &Flow) {
		let Some(response) = &flow.response else {
			warn!(
				id = %flow.id,
				method = %flow.request.method,
				path = %flow.request.path,
				"flow has no response, skipping"
			);
			return;
		};

		let leaf = RespLeaf {
			status: response.status.as_u16(),
			headers: canon::canon_headers(&response.headers),
			body: canon::canon_body(&response.body),
		};

		self
			.hosts
			.entry(canon::host_key(&flow.request.authority, flow.request.tls))
			.or_default()
			.paths
			.entry(flow.request.path.clone())
			.or_default()
			.methods
			.entry(flow.request.method.as_str().to_string())
			.or_default()
			.queries
			.entry(canon::canon_query(&flow.request.query))
			.or_default()
			.bodies
			.entry(canon::canon_body(&flow.request.body))
			.or_default()
			.responses
			.entry(leaf.key())
			.or_insert(leaf);
	}

	pub fn is_empty(&self) -> bool {
		self.hosts.is_empty()
	}
}
