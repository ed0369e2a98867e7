use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use stubgen::{CertAuthority, Proxy, Tree, emit};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
	name = "stubgen",
	version,
	about = "Recording HTTP(S) proxy that emits mock servers for the traffic it saw"
)]
struct Args {
	/// Listening host
	#[arg(short = 'H', long, default_value = "0.0.0.0")]
	host: String,

	/// Listening port
	#[arg(short = 'p', long, default_value_t = 8888)]
	port: u16,

	/// Enable debug logging
	#[arg(short = 'd', long)]
	debug: bool,

	/// First port used by the emitted mocks; each further host gets the next one
	#[arg(short = 'm', long, default_value_t = 8080)]
	mock_begin_port: u16,

	/// PEM root certificate; together with --key, enables HTTPS interception
	#[arg(long)]
	cert: Option<PathBuf>,

	/// PEM PKCS#1 root key
	#[arg(long)]
	key: Option<PathBuf>,

	/// Output file for the emitted source (defaults to stdout)
	#[arg(short = 'o', long)]
	out: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
		tracing_subscriber::EnvFilter::new(if args.debug { "debug" } else { "info" })
	});
	tracing_subscriber::fmt().with_env_filter(filter).init();

	// Library code passes crypto providers explicitly; this covers any
	// dependency that consults the process default.
	rustls::crypto::aws_lc_rs::default_provider()
		.install_default()
		.ok();

	let ca = match (&args.cert, &args.key) {
		(Some(cert), Some(key)) => {
			let cert_pem =
				std::fs::read(cert).with_context(|| format!("reading {}", cert.display()))?;
			let key_pem = std::fs::read(key).with_context(|| format!("reading {}", key.display()))?;
			Some(CertAuthority::load(&cert_pem, &key_pem).context("loading root CA")?)
		},
		(None, None) => {
			info!("no root CA configured; CONNECT tunnels will pass through unrecorded");
			None
		},
		_ => anyhow::bail!("--cert and --key must be given together"),
	};

	let addr: SocketAddr = format!("{}:{}", args.host, args.port)
		.parse()
		.with_context(|| format!("invalid listen address {}:{}", args.host, args.port))?;
	let proxy = Proxy::bind(addr, ca).await?;
	let shutdown = proxy.shutdown_handle();
	let serving = tokio::spawn(proxy.serve());

	wait_for_signal().await?;
	shutdown.cancel();
	let flows = serving.await.context("proxy task panicked")?;
	info!("captured {} flows, rendering mock servers", flows.len());

	let tree = Tree::build(&flows);
	let source = emit::render(&tree, args.mock_begin_port)?;
	match &args.out {
		Some(path) => {
			write_output(path, &source).with_context(|| format!("writing {}", path.display()))?;
			info!("wrote {}", path.display());
		},
		None => print!("{source}"),
	}
	Ok(())
}

async fn wait_for_signal() -> anyhow::Result<()> {
	use tokio::signal::unix::{SignalKind, signal};
	let mut interrupt = signal(SignalKind::interrupt())?;
	let mut terminate = signal(SignalKind::terminate())?;
	let mut quit = signal(SignalKind::quit())?;
	tokio::select! {
		_ = interrupt.recv() => info!("received SIGINT, shutting down"),
		_ = terminate.recv() => info!("received SIGTERM, shutting down"),
		_ = quit.recv() => info!("received SIGQUIT, shutting down"),
	}
	Ok(())
}

fn write_output(path: &Path, source: &str) -> std::io::Result<()> {
	use std::io::Write;
	use std::os::unix::fs::OpenOptionsExt;

	let mut file = std::fs::OpenOptions::new()
		.write(true)
		.create(true)
		.truncate(true)
		.mode(0o644)
		.open(path)?;
	file.write_all(source.as_bytes())
}
