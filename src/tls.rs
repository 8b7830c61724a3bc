//! TLS transport, §4.C "TLS". Grounded on `shard_connection.cpp`'s
//! libevent `bufferevent_openssl` setup: one `TlsConnector` is built
//! from `TlsOptions` at startup, then reused to wrap every connection's
//! `TcpStream` after the handshake.

use std::io::BufReader;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::config::TlsOptions;
use crate::errors::EngineError;

/// Accepts any server certificate without checking it. Benchmark
/// targets are routinely stood up with self-signed certs; without this,
/// `--tls` would be unusable unless `--tls-ca-cert` is always supplied.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, EngineError> {
    let data = std::fs::read(path).map_err(|e| EngineError::Tls(0, format!("reading {path}: {e}")))?;
    let mut reader = BufReader::new(&data[..]);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EngineError::Tls(0, format!("parsing certs in {path}: {e}")))
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, EngineError> {
    let data = std::fs::read(path).map_err(|e| EngineError::Tls(0, format!("reading {path}: {e}")))?;
    let mut reader = BufReader::new(&data[..]);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| EngineError::Tls(0, format!("parsing key in {path}: {e}")))?
        .ok_or_else(|| EngineError::Tls(0, format!("no private key found in {path}")))
}

/// Builds the one `TlsConnector` shared by every connection this run
/// opens. Called once at startup; a run with `tls.enabled == false`
/// never calls it.
pub fn build_connector(tls: &TlsOptions) -> Result<TlsConnector, EngineError> {
    let verifier_stage = ClientConfig::builder();

    let cert_stage = if let Some(ca_path) = &tls.ca_cert_path {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path)? {
            roots.add(cert).map_err(|e| EngineError::Tls(0, format!("adding CA cert: {e}")))?;
        }
        verifier_stage.with_root_certificates(roots)
    } else {
        verifier_stage.dangerous().with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
    };

    let client_config = match (&tls.cert_path, &tls.key_path) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            cert_stage
                .with_client_auth_cert(certs, key)
                .map_err(|e| EngineError::Tls(0, format!("client cert/key: {e}")))?
        }
        _ => cert_stage.with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(client_config)))
}

/// Completes a TLS handshake over an already-connected `TcpStream`.
pub async fn connect(
    connector: &TlsConnector,
    stream: TcpStream,
    sni: &str,
    conn_id: usize,
) -> Result<TlsStream<TcpStream>, EngineError> {
    let server_name = ServerName::try_from(sni.to_string())
        .map_err(|e| EngineError::Tls(conn_id, format!("invalid SNI host \"{sni}\": {e}")))?;
    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| EngineError::Tls(conn_id, e.to_string()))
}
