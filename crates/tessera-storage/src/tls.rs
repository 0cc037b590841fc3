// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! TLS for the client/server backend.
//!
//! `sslmode` keeps its libpq meaning. `disable` never encrypts. `allow` and
//! `prefer` use TLS when the server offers it. `require` insists on TLS but
//! only checks the certificate when `sslrootcert` is set, and then behaves
//! like `verify-ca`. `verify-ca` checks the chain. `verify-full` also checks
//! that the certificate names the host.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tessera_core::TesseraError;
use tokio_postgres::config::SslMode as WireMode;
use tokio_postgres_rustls::MakeRustlsConnect;

/// Accepted `storage.postgres.sslmode` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SslMode {
    Disable,
    Allow,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl FromStr for SslMode {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "allow" => Ok(SslMode::Allow),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(TesseraError::Config(format!(
                "storage.postgres.sslmode `{other}` is not supported"
            ))),
        }
    }
}

impl SslMode {
    /// The negotiation mode the driver understands. The driver has no
    /// plaintext-first mode, so `allow` negotiates like `prefer`.
    pub(crate) fn wire(self) -> WireMode {
        match self {
            SslMode::Disable => WireMode::Disable,
            SslMode::Allow | SslMode::Prefer => WireMode::Prefer,
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => WireMode::Require,
        }
    }

    pub(crate) fn wire_name(self) -> &'static str {
        match self.wire() {
            WireMode::Disable => "disable",
            WireMode::Prefer => "prefer",
            _ => "require",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verification {
    EncryptOnly,
    Chain,
    ChainAndHost,
}

fn verification(mode: SslMode, has_root_cert: bool) -> Option<Verification> {
    match mode {
        SslMode::Disable => None,
        SslMode::Allow | SslMode::Prefer | SslMode::Require if !has_root_cert => {
            Some(Verification::EncryptOnly)
        }
        SslMode::Allow | SslMode::Prefer | SslMode::Require | SslMode::VerifyCa => {
            Some(Verification::Chain)
        }
        SslMode::VerifyFull => Some(Verification::ChainAndHost),
    }
}

/// Build the TLS connector for `mode`, or `None` when TLS is off.
///
/// Trust anchors are the Mozilla roots plus every certificate in
/// `root_cert` (PEM), if given.
pub(crate) fn connector(
    mode: SslMode,
    root_cert: Option<&Path>,
) -> Result<Option<MakeRustlsConnect>, TesseraError> {
    let Some(verification) = verification(mode, root_cert.is_some()) else {
        return Ok(None);
    };

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?;

    let config = match verification {
        Verification::EncryptOnly => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(EncryptOnly(provider)))
            .with_no_client_auth(),
        Verification::Chain => {
            let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots(root_cert)?), provider)
                .build()
                .map_err(tls_err)?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(ChainOnly(inner)))
                .with_no_client_auth()
        }
        Verification::ChainAndHost => builder
            .with_root_certificates(roots(root_cert)?)
            .with_no_client_auth(),
    };
    Ok(Some(MakeRustlsConnect::new(config)))
}

fn roots(extra: Option<&Path>) -> Result<RootCertStore, TesseraError> {
    let mut store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    if let Some(path) = extra {
        let unreadable = |e: rustls::pki_types::pem::Error| {
            TesseraError::Config(format!(
                "cannot read storage.postgres.sslrootcert {}: {e}",
                path.display()
            ))
        };
        for cert in CertificateDer::pem_file_iter(path).map_err(unreadable)? {
            store.add(cert.map_err(unreadable)?).map_err(tls_err)?;
        }
    }
    Ok(store)
}

fn tls_err(e: impl std::fmt::Display) -> TesseraError {
    TesseraError::Config(format!("invalid TLS settings: {e}"))
}

/// Accepts any certificate; the handshake signatures are still checked.
#[derive(Debug)]
struct EncryptOnly(Arc<CryptoProvider>);

impl ServerCertVerifier for EncryptOnly {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Full chain verification that tolerates a host name mismatch.
#[derive(Debug)]
struct ChainOnly(Arc<WebPkiServerVerifier>);

impl ServerCertVerifier for ChainOnly {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .0
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(err)) if is_name_mismatch(&err) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_verify_schemes()
    }
}

/// Newer rustls releases report the mismatch as a variant carrying the
/// expected and presented names.
fn is_name_mismatch(err: &CertificateError) -> bool {
    matches!(err, CertificateError::NotValidForName) || format!("{err:?}").starts_with("NotValidForName")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_libpq_mode() {
        for (name, mode) in [
            ("disable", SslMode::Disable),
            ("allow", SslMode::Allow),
            ("prefer", SslMode::Prefer),
            ("require", SslMode::Require),
            ("verify-ca", SslMode::VerifyCa),
            ("Verify-Full", SslMode::VerifyFull),
        ] {
            assert_eq!(name.parse::<SslMode>().unwrap(), mode);
        }
        assert!("sometimes".parse::<SslMode>().is_err());
    }

    #[test]
    fn wire_modes_collapse_to_driver_set() {
        assert_eq!(SslMode::Allow.wire_name(), "prefer");
        assert_eq!(SslMode::VerifyCa.wire_name(), "require");
        assert_eq!(SslMode::Disable.wire_name(), "disable");
    }

    #[test]
    fn root_cert_upgrades_require_to_chain_checks() {
        assert_eq!(verification(SslMode::Require, false), Some(Verification::EncryptOnly));
        assert_eq!(verification(SslMode::Require, true), Some(Verification::Chain));
        assert_eq!(verification(SslMode::VerifyCa, false), Some(Verification::Chain));
        assert_eq!(verification(SslMode::VerifyFull, false), Some(Verification::ChainAndHost));
        assert_eq!(verification(SslMode::Disable, true), None);
    }

    #[test]
    fn connector_is_built_for_tls_modes_only() {
        assert!(connector(SslMode::Disable, None).unwrap().is_none());
        assert!(connector(SslMode::Require, None).unwrap().is_some());
        assert!(connector(SslMode::VerifyCa, None).unwrap().is_some());
        assert!(connector(SslMode::VerifyFull, None).unwrap().is_some());
    }

    #[test]
    fn unreadable_root_cert_is_a_config_error() {
        let err = connector(SslMode::VerifyFull, Some(Path::new("/nonexistent/root.pem")))
            .err()
            .expect("missing file must fail");
        assert!(matches!(err, TesseraError::Config(ref m) if m.contains("sslrootcert")));
    }
}
