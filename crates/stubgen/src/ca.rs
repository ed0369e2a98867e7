//! Certificate authority: parses user-supplied root material and mints
//! per-host leaf certificates on demand, so the proxy can pose as any
//! server a client CONNECTs to while chaining to a single trust anchor.

use std::collections::HashMap;
use std::sync::Arc;

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{ExtendedKeyUsage, KeyUsage, SubjectAlternativeName};
use openssl::x509::{X509, X509Builder, X509NameBuilder};
use parking_lot::Mutex;
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// Leaves are backdated to a fixed epoch (2020-01-01T00:00:00Z) so clock
/// skew between proxy and client cannot make a fresh leaf "not yet valid".
const LEAF_NOT_BEFORE_UNIX: i64 = 1_577_836_800;
/// Leaf lifetime from now.
const LEAF_VALIDITY_DAYS: u32 = 730;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
	#[error("invalid root material: {0}")]
	BadRootMaterial(String),
	#[error("leaf key generation: {0}")]
	KeyGen(openssl::error::ErrorStack),
	#[error("leaf signing: {0}")]
	Sign(openssl::error::ErrorStack),
	#[error("leaf encoding: {0}")]
	Encode(openssl::error::ErrorStack),
	#[error("server config: {0}")]
	Tls(#[from] rustls::Error),
}

/// A freshly minted leaf certificate and its private key.
pub struct MintedLeaf {
	pub cert: X509,
	pub key: PKey<Private>,
}

/// Parsed root CA plus a cache of leaf-backed server configs keyed by
/// normalized hostname. The root key is read-only after load.
pub struct CertAuthority {
	root_cert: X509,
	root_key: PKey<Private>,
	root_der: CertificateDer<'static>,
	leaves: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

/// The one crypto provider this crate uses. Passed explicitly everywhere
/// so nothing depends on a process-wide default being installed.
pub fn provider() -> Arc<rustls::crypto::CryptoProvider> {
	Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Strip a `:port` suffix, IDNA-normalize to ASCII, lowercase.
fn normalize_host(host: &str) -> String {
	let bare = match host.parse::<http::uri::Authority>() {
		Ok(authority) => authority.host().to_string(),
		Err(_) => host.to_string(),
	};
	idna::domain_to_ascii(&bare)
		.unwrap_or(bare)
		.to_ascii_lowercase()
}

impl CertAuthority {
	/// Parse a PEM `CERTIFICATE` and a PEM PKCS#1 `RSA PRIVATE KEY`.
	pub fn load(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, CaError> {
		let root_cert = X509::from_pem(cert_pem)
			.map_err(|e| CaError::BadRootMaterial(format!("certificate: {e}")))?;
		let rsa = Rsa::private_key_from_pem(key_pem)
			.map_err(|e| CaError::BadRootMaterial(format!("key: {e}")))?;
		let root_key =
			PKey::from_rsa(rsa).map_err(|e| CaError::BadRootMaterial(format!("key: {e}")))?;
		let root_der = CertificateDer::from(
			root_cert
				.to_der()
				.map_err(|e| CaError::BadRootMaterial(format!("certificate: {e}")))?,
		);
		Ok(CertAuthority {
			root_cert,
			root_key,
			root_der,
			leaves: Mutex::new(HashMap::new()),
		})
	}

	pub fn root_cert(&self) -> &X509 {
		&self.root_cert
	}

	/// Mint a leaf usable as a TLS server certificate for `host`.
	///
	/// Serial is uniform in `[0, 2^128)`; issuer is copied from the root;
	/// subject CN is `*.host`; SANs are `{host, *.host}`; the key pair is
	/// a fresh RSA-2048.
	pub fn mint(&self, host: &str) -> Result<MintedLeaf, CaError> {
		let host = normalize_host(host);

		let rsa = Rsa::generate(2048).map_err(CaError::KeyGen)?;
		let key = PKey::from_rsa(rsa).map_err(CaError::KeyGen)?;

		let mut builder = X509Builder::new().map_err(CaError::Sign)?;
		builder.set_version(2).map_err(CaError::Sign)?;

		let serial = {
			let mut serial = BigNum::new().map_err(CaError::Sign)?;
			serial
				.rand(128, MsbOption::MAYBE_ZERO, false)
				.map_err(CaError::Sign)?;
			serial.to_asn1_integer().map_err(CaError::Sign)?
		};
		builder.set_serial_number(&serial).map_err(CaError::Sign)?;

		let subject = {
			let mut name = X509NameBuilder::new().map_err(CaError::Sign)?;
			name
				.append_entry_by_nid(Nid::COMMONNAME, &format!("*.{host}"))
				.map_err(CaError::Sign)?;
			name.build()
		};
		builder.set_subject_name(&subject).map_err(CaError::Sign)?;
		builder
			.set_issuer_name(self.root_cert.subject_name())
			.map_err(CaError::Sign)?;

		let not_before = Asn1Time::from_unix(LEAF_NOT_BEFORE_UNIX).map_err(CaError::Sign)?;
		let not_after = Asn1Time::days_from_now(LEAF_VALIDITY_DAYS).map_err(CaError::Sign)?;
		builder.set_not_before(&not_before).map_err(CaError::Sign)?;
		builder.set_not_after(&not_after).map_err(CaError::Sign)?;

		builder.set_pubkey(&key).map_err(CaError::Sign)?;

		let san = SubjectAlternativeName::new()
			.dns(&host)
			.dns(&format!("*.{host}"))
			.build(&builder.x509v3_context(Some(&self.root_cert), None))
			.map_err(CaError::Sign)?;
		builder.append_extension(san).map_err(CaError::Sign)?;
		let key_usage = KeyUsage::new()
			.digital_signature()
			.key_encipherment()
			.build()
			.map_err(CaError::Sign)?;
		builder.append_extension(key_usage).map_err(CaError::Sign)?;
		let ext_key_usage = ExtendedKeyUsage::new()
			.server_auth()
			.build()
			.map_err(CaError::Sign)?;
		builder.append_extension(ext_key_usage).map_err(CaError::Sign)?;

		builder
			.sign(&self.root_key, MessageDigest::sha256())
			.map_err(CaError::Sign)?;

		Ok(MintedLeaf {
			cert: builder.build(),
			key,
		})
	}

	/// A rustls server config presenting a leaf for `host`, chained to the
	/// root. Configs are cached per normalized host; serials are random,
	/// so re-minting would be equally sound.
	pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, CaError> {
		let host = normalize_host(host);
		if let Some(config) = self.leaves.lock().get(&host) {
			return Ok(config.clone());
		}

		let leaf = self.mint(&host)?;
		let cert_der = CertificateDer::from(leaf.cert.to_der().map_err(CaError::Encode)?);
		let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
			leaf.key.private_key_to_pkcs8().map_err(CaError::Encode)?,
		));

		let mut config = ServerConfig::builder_with_provider(provider())
			.with_safe_default_protocol_versions()?
			.with_no_client_auth()
			.with_single_cert(vec![cert_der, self.root_der.clone()], key_der)?;
		config.alpn_protocols = vec![b"http/1.1".to_vec()];

		let config = Arc::new(config);
		self.leaves.lock().insert(host, config.clone());
		Ok(config)
	}
}
