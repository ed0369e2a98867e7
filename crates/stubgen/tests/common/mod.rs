//! Shared fixtures: a small axum origin server and root CA material in
//! the same shape `xtask gen-ca` produces.

use std::net::SocketAddr;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::BasicConstraints;
use openssl::x509::{X509Builder, X509NameBuilder};

pub async fn start_origin() -> SocketAddr {
	let router = Router::new()
		.route(
			"/",
			get(|| async {
				(
					StatusCode::OK,
					[("content-type", "application/json"), ("x-foo", "foo")],
					"{\"foo\":\"bar\"}",
				)
			}),
		)
		.route(
			"/api",
			post(|body: String| async move {
				if body == "{\"token\":\"abc\"}" {
					(StatusCode::OK, "{\"ok\":true}")
				} else {
					(StatusCode::UNAUTHORIZED, "{\"err\":\"no\"}")
				}
			}),
		);

	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		axum::serve(listener, router).await.unwrap();
	});
	addr
}

pub fn test_root() -> (Vec<u8>, Vec<u8>) {
	let rsa = Rsa::generate(2048).unwrap();
	let key = PKey::from_rsa(rsa).unwrap();

	let mut builder = X509Builder::new().unwrap();
	builder.set_version(2).unwrap();
	let serial = {
		let mut serial = BigNum::new().unwrap();
		serial.rand(128, MsbOption::MAYBE_ZERO, false).unwrap();
		serial.to_asn1_integer().unwrap()
	};
	builder.set_serial_number(&serial).unwrap();
	let name = {
		let mut name = X509NameBuilder::new().unwrap();
		name
			.append_entry_by_nid(Nid::COMMONNAME, "stubgen test ca")
			.unwrap();
		name.build()
	};
	builder.set_subject_name(&name).unwrap();
	builder.set_issuer_name(&name).unwrap();
	builder
		.set_not_before(&Asn1Time::days_from_now(0).unwrap())
		.unwrap();
	builder
		.set_not_after(&Asn1Time::days_from_now(365).unwrap())
		.unwrap();
	builder.set_pubkey(&key).unwrap();
	builder
		.append_extension(BasicConstraints::new().critical().ca().build().unwrap())
		.unwrap();
	builder.sign(&key, MessageDigest::sha256()).unwrap();
	let cert = builder.build();

	(
		cert.to_pem().unwrap(),
		key.rsa().unwrap().private_key_to_pem().unwrap(),
	)
}
