//! The interception engine: a forward proxy that hooks every decoded
//! request and response into the flow store while relaying the live
//! streams untouched. CONNECT tunnels are MITMed with per-host leaves
//! minted by the [`crate::ca`] module when root material was supplied,
//! and blindly tunneled otherwise.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;

use bytes::Bytes;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{HeaderName, Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::ca::{self, CertAuthority};
use crate::flow::{Flow, FlowStore, RequestSnapshot, ResponseSnapshot};
use crate::tee::{self, CaptureInterrupted, TeeBody};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
	#[error("failed to bind {addr}: {source}")]
	Listen {
		addr: SocketAddr,
		#[source]
		source: std::io::Error,
	},
	#[error("upstream TLS configuration: {0}")]
	Tls(#[from] rustls::Error),
	/// The upstream never answered; the client gets a 502 and the flow
	/// stays response-less.
	#[error("upstream request failed: {0}")]
	Upstream(#[source] hyper_util::client::legacy::Error),
	/// A teed body ended before its stream did; the flow keeps the
	/// partial bytes.
	#[error("body capture: {0}")]
	Capture(#[from] CaptureInterrupted),
}

type ProxyBody = BoxBody<Bytes, hyper::Error>;
type UpstreamClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, TeeBody<Incoming>>;

/// Connection headers are a property of each hop, not of the exchange;
/// they never reach the upstream.
static HOP_HEADERS: std::sync::LazyLock<[HeaderName; 9]> = std::sync::LazyLock::new(|| {
	[
		http::header::CONNECTION,
		HeaderName::from_static("proxy-connection"),
		HeaderName::from_static("keep-alive"),
		http::header::PROXY_AUTHENTICATE,
		http::header::PROXY_AUTHORIZATION,
		http::header::TE,
		http::header::TRAILER,
		http::header::TRANSFER_ENCODING,
		http::header::UPGRADE,
	]
});

/// A bound, not-yet-serving proxy.
pub struct Proxy {
	listener: TcpListener,
	addr: SocketAddr,
	inner: Arc<Inner>,
	shutdown: CancellationToken,
	tracker: TaskTracker,
}

struct Inner {
	store: Arc<FlowStore>,
	ca: Option<Arc<CertAuthority>>,
	client: UpstreamClient,
	shutdown: CancellationToken,
	tracker: TaskTracker,
}

impl Proxy {
	/// Bind the listener and build the upstream client. `ca` enables
	/// HTTPS interception; without it CONNECT degrades to a blind tunnel.
	pub async fn bind(addr: SocketAddr, ca: Option<CertAuthority>) -> Result<Proxy, ProxyError> {
		let listener = TcpListener::bind(addr)
			.await
			.map_err(|source| ProxyError::Listen { addr, source })?;
		let addr = listener
			.local_addr()
			.map_err(|source| ProxyError::Listen { addr, source })?;

		let mut roots = rustls::RootCertStore::empty();
		let loaded = rustls_native_certs::load_native_certs();
		for err in &loaded.errors {
			debug!("skipping native root: {err}");
		}
		for cert in loaded.certs {
			let _ = roots.add(cert);
		}
		let tls = rustls::ClientConfig::builder_with_provider(ca::provider())
			.with_safe_default_protocol_versions()?
			.with_root_certificates(roots)
			.with_no_client_auth();
		let connector = hyper_rustls::HttpsConnectorBuilder::new()
			.with_tls_config(tls)
			.https_or_http()
			.enable_http1()
			.build();
		let client = Client::builder(TokioExecutor::new()).build(connector);

		let shutdown = CancellationToken::new();
		let tracker = TaskTracker::new();
		Ok(Proxy {
			listener,
			addr,
			inner: Arc::new(Inner {
				store: Arc::new(FlowStore::new()),
				ca: ca.map(Arc::new),
				client,
				shutdown: shutdown.clone(),
				tracker: tracker.clone(),
			}),
			shutdown,
			tracker,
		})
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.addr
	}

	pub fn store(&self) -> Arc<FlowStore> {
		self.inner.store.clone()
	}

	/// Cancelling this token stops the accept loop and drains in-flight
	/// connections.
	pub fn shutdown_handle(&self) -> CancellationToken {
		self.shutdown.clone()
	}

	/// Accept connections until shutdown, then drain every connection and
	/// body-capture task and return the consistent flow snapshot.
	pub async fn serve(self) -> Vec<Flow> {
		info!("proxy listening on {}", self.addr);
		loop {
			tokio::select! {
				_ = self.shutdown.cancelled() => break,
				accepted = self.listener.accept() => match accepted {
					Ok((stream, peer)) => {
						let inner = self.inner.clone();
						self.tracker.spawn(inner.serve_connection(stream, peer));
					},
					Err(e) => warn!("accept failed: {e}"),
				},
			}
		}
		drop(self.listener);
		info!("draining in-flight connections");
		self.tracker.close();
		self.tracker.wait().await;
		self.inner.store.snapshot()
	}
}

impl Inner {
	async fn serve_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
		let inner = self.clone();
		let service = service_fn(move |req| {
			let inner = inner.clone();
			async move { Ok::<_, Infallible>(inner.handle(req, peer).await) }
		});
		let conn = http1::Builder::new()
			.serve_connection(TokioIo::new(stream), service)
			.with_upgrades();
		let mut conn = pin!(conn);
		tokio::select! {
			res = conn.as_mut() => {
				if let Err(e) = res {
					debug!("connection from {peer} ended: {e}");
				}
			},
			_ = self.shutdown.cancelled() => {
				conn.as_mut().graceful_shutdown();
				if let Err(e) = conn.as_mut().await {
					debug!("connection from {peer} ended during drain: {e}");
				}
			},
		}
	}

	async fn handle(self: Arc<Self>, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
		if req.method() == Method::CONNECT {
			return self.handle_connect(req);
		}
		// A plain forward-proxy request arrives in absolute form.
		let Some(authority) = req.uri().authority().cloned() else {
			warn!("request from {peer} has no authority: {}", req.uri());
			return status_response(StatusCode::BAD_REQUEST);
		};
		let tls = req.uri().scheme() == Some(&Scheme::HTTPS);
		self.handle_proxied(req, authority, tls).await
	}

	/// Intercept a CONNECT: answer 200, then either terminate TLS with a
	/// minted leaf and keep hooking the decrypted requests, or relay
	/// bytes blindly when no CA (or no mintable leaf) is available.
	fn handle_connect(self: Arc<Self>, req: Request<Incoming>) -> Response<ProxyBody> {
		let Some(authority) = req.uri().authority().cloned() else {
			warn!("CONNECT without authority: {}", req.uri());
			return status_response(StatusCode::BAD_REQUEST);
		};

		let mitm = match &self.ca {
			Some(ca) => match ca.server_config(authority.host()) {
				Ok(config) => Some(config),
				Err(e) => {
					warn!("minting for {} failed, tunneling blindly: {e}", authority.host());
					None
				},
			},
			None => None,
		};

		let inner = self.clone();
		self.tracker.spawn(async move {
			let upgraded = match hyper::upgrade::on(req).await {
				Ok(upgraded) => upgraded,
				Err(e) => {
					debug!("CONNECT upgrade for {authority} failed: {e}");
					return;
				},
			};
			match mitm {
				Some(config) => inner.serve_mitm(upgraded, authority, config).await,
				None => tunnel(upgraded, authority).await,
			}
		});

		status_response(StatusCode::OK)
	}

	/// Terminate the client's TLS with the minted leaf and serve the
	/// decrypted stream through the same hooks as plain traffic.
	async fn serve_mitm(
		self: Arc<Self>,
		upgraded: hyper::upgrade::Upgraded,
		authority: Authority,
		config: Arc<rustls::ServerConfig>,
	) {
		let tls = match TlsAcceptor::from(config).accept(TokioIo::new(upgraded)).await {
			Ok(tls) => tls,
			Err(e) => {
				debug!("TLS handshake with client for {authority} failed: {e}");
				return;
			},
		};

		let inner = self.clone();
		let target = authority.clone();
		let service = service_fn(move |req| {
			let inner = inner.clone();
			let authority = target.clone();
			async move { Ok::<_, Infallible>(inner.handle_proxied(req, authority, true).await) }
		});
		let conn = http1::Builder::new().serve_connection(TokioIo::new(tls), service);
		let mut conn = pin!(conn);
		tokio::select! {
			res = conn.as_mut() => {
				if let Err(e) = res {
					debug!("intercepted connection for {authority} ended: {e}");
				}
			},
			_ = self.shutdown.cancelled() => {
				conn.as_mut().graceful_shutdown();
				if let Err(e) = conn.as_mut().await {
					debug!("intercepted connection for {authority} ended during drain: {e}");
				}
			},
		}
	}

	/// The request and response hooks. Bodies are teed, so the live
	/// exchange streams through while tracked tasks deliver the captured
	/// bytes into the store.
	async fn handle_proxied(
		self: Arc<Self>,
		req: Request<Incoming>,
		authority: Authority,
		tls: bool,
	) -> Response<ProxyBody> {
		let (parts, body) = req.into_parts();
		let (live_body, captured) = tee::tee(body);

		let path = parts.uri.path().to_string();
		let query = parts.uri.query().unwrap_or("").to_string();
		let method = parts.method.clone();

		let flow = Flow::new(RequestSnapshot {
			tls,
			authority: authority.clone(),
			method: method.clone(),
			path: path.clone(),
			query,
			body: Bytes::new(),
		});
		let id = flow.id.clone();
		self.store.put(flow);
		{
			let store = self.store.clone();
			let id = id.clone();
			self.tracker.spawn(async move {
				let bytes = match captured.bytes().await {
					Ok(bytes) => bytes,
					Err(interrupted) => {
						let partial = interrupted.partial.clone();
						let err = ProxyError::Capture(interrupted);
						warn!("request body for flow {id}: {err}");
						partial
					},
				};
				store.set_request_body(&id, bytes);
			});
		}

		let path_and_query = parts
			.uri
			.path_and_query()
			.cloned()
			.unwrap_or_else(|| PathAndQuery::from_static("/"));
		let uri = Uri::builder()
			.scheme(if tls { Scheme::HTTPS } else { Scheme::HTTP })
			.authority(authority.clone())
			.path_and_query(path_and_query)
			.build();
		let uri = match uri {
			Ok(uri) => uri,
			Err(e) => {
				warn!("cannot rebuild upstream URI for {authority}{path}: {e}");
				return status_response(StatusCode::BAD_REQUEST);
			},
		};

		let mut builder = Request::builder()
			.method(method.clone())
			.uri(uri)
			.version(Version::HTTP_11);
		if let Some(headers) = builder.headers_mut() {
			for (name, value) in parts.headers.iter() {
				if !HOP_HEADERS.contains(name) {
					headers.append(name.clone(), value.clone());
				}
			}
		}
		let upstream_req = match builder.body(live_body) {
			Ok(req) => req,
			Err(e) => {
				warn!("cannot rebuild upstream request for {authority}{path}: {e}");
				return status_response(StatusCode::BAD_REQUEST);
			},
		};

		let response = match self.client.request(upstream_req).await {
			Ok(response) => response,
			Err(e) => {
				let err = ProxyError::Upstream(e);
				warn!("{method} {authority}{path}: {err}");
				return status_response(StatusCode::BAD_GATEWAY);
			},
		};
		debug!("{method} {authority}{path} -> {}", response.status());

		let (resp_parts, resp_body) = response.into_parts();
		self.store.add_response(
			&id,
			ResponseSnapshot {
				status: resp_parts.status,
				headers: resp_parts.headers.clone(),
				body: Bytes::new(),
			},
		);
		let (live_resp, captured_resp) = tee::tee(resp_body);
		{
			let store = self.store.clone();
			self.tracker.spawn(async move {
				let bytes = match captured_resp.bytes().await {
					Ok(bytes) => bytes,
					Err(interrupted) => {
						let partial = interrupted.partial.clone();
						let err = ProxyError::Capture(interrupted);
						warn!("response body for flow {id}: {err}");
						partial
					},
				};
				store.set_response_body(&id, bytes);
			});
		}

		Response::from_parts(resp_parts, live_resp.boxed())
	}
}

/// Relay an un-intercepted CONNECT tunnel byte for byte.
async fn tunnel(upgraded: hyper::upgrade::Upgraded, authority: Authority) {
	let target = match authority.port() {
		Some(_) => authority.to_string(),
		None => format!("{authority}:443"),
	};
	let mut upstream = match TcpStream::connect(target.as_str()).await {
		Ok(upstream) => upstream,
		Err(e) => {
			warn!("tunnel to {target} failed: {e}");
			return;
		},
	};
	let mut client = TokioIo::new(upgraded);
	if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
		debug!("tunnel to {target} closed: {e}");
	}
}

fn status_response(status: StatusCode) -> Response<ProxyBody> {
	Response::builder()
		.status(status)
		.body(empty())
		.expect("static response must build")
}

fn empty() -> ProxyBody {
	Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}
