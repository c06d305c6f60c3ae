//! Certificate trust for peer sync.
//!
//! Peers authenticate each other with self-signed certificates and
//! trust-on-first-use (TOFU) pinning: the first connection records the
//! peer certificate's SHA-256 fingerprint, every later connection must
//! present a certificate with the same fingerprint. There is no CA chain
//! anywhere in the protocol.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::DigitallySignedStruct;
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use sha2::{Digest, Sha256};

use crate::error::{SyncError, SyncResult};

/// Certificate validity period (10 years in days)
pub const CERT_VALIDITY_DAYS: u32 = 3650;

/// SHA-256 fingerprint of a DER certificate, in the wire format
/// "SHA256:aa:bb:..." used throughout the protocol.
pub fn fingerprint_from_der(der_data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(der_data);
    let digest = hasher.finalize();
    let hex_parts: Vec<String> = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("SHA256:{}", hex_parts.join(":"))
}

/// Fingerprint of a PEM-encoded certificate.
pub fn fingerprint_from_pem(pem_data: &[u8]) -> SyncResult<String> {
    let pem_str = std::str::from_utf8(pem_data)
        .map_err(|e| SyncError::Certificate(format!("invalid PEM encoding: {}", e)))?;

    let start_marker = "-----BEGIN CERTIFICATE-----";
    let end_marker = "-----END CERTIFICATE-----";
    let start = pem_str
        .find(start_marker)
        .ok_or_else(|| SyncError::Certificate("no certificate found in PEM".to_string()))?
        + start_marker.len();
    let end = pem_str
        .find(end_marker)
        .ok_or_else(|| SyncError::Certificate("invalid PEM format".to_string()))?;

    let base64_content: String = pem_str[start..end]
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    use base64::Engine;
    let der_data = base64::engine::general_purpose::STANDARD
        .decode(&base64_content)
        .map_err(|e| SyncError::Certificate(format!("invalid base64 in PEM: {}", e)))?;

    Ok(fingerprint_from_der(&der_data))
}

pub fn fingerprint_of_file(cert_path: &Path) -> SyncResult<String> {
    let pem_data = fs::read(cert_path)?;
    fingerprint_from_pem(&pem_data)
}

/// Fingerprints compare case-insensitively; peers may hex-encode either way.
pub fn fingerprints_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Certificate verifier that checks nothing but the pinned fingerprint.
///
/// With no pin configured (first contact) any certificate is accepted;
/// either way the observed fingerprint is recorded so the caller can pin
/// it after the request succeeds.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    pinned: Option<String>,
    observed: Mutex<Option<String>>,
    provider: Arc<CryptoProvider>,
}

impl PinnedCertVerifier {
    pub fn new(pinned: Option<String>) -> Self {
        Self {
            pinned,
            observed: Mutex::new(None),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    /// Fingerprint presented by the peer in the most recent handshake.
    pub fn observed_fingerprint(&self) -> Option<String> {
        self.observed.lock().ok().and_then(|g| g.clone())
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let actual = fingerprint_from_der(end_entity.as_ref());
        if let Ok(mut guard) = self.observed.lock() {
            *guard = Some(actual.clone());
        }
        match &self.pinned {
            None => Ok(ServerCertVerified::assertion()),
            Some(expected) if fingerprints_match(expected, &actual) => {
                Ok(ServerCertVerified::assertion())
            }
            Some(expected) => Err(rustls::Error::General(format!(
                "certificate fingerprint mismatch: expected {}, got {}. \
                 This could indicate a man-in-the-middle attack or the peer \
                 regenerated their certificate.",
                expected, actual
            ))),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// TLS client config that verifies peers through the given pin.
pub fn client_tls_config(verifier: Arc<PinnedCertVerifier>) -> SyncResult<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| SyncError::Certificate(format!("TLS config: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(config)
}

/// Generate a self-signed certificate and private key, written to the
/// given paths as PEM.
pub fn generate_self_signed_cert(
    cert_path: &Path,
    key_path: &Path,
    common_name: &str,
    device_id: Option<&str>,
) -> SyncResult<(String, String)> {
    use rcgen::{CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, SanType};

    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    if let Some(id) = device_id {
        dn.push(DnType::OrganizationalUnitName, id);
    }
    params.distinguished_name = dn;

    params.not_before = rcgen::date_time_ymd(2024, 1, 1);
    params.not_after = rcgen::date_time_ymd(2034, 1, 1);

    params.subject_alt_names = vec![
        SanType::DnsName(
            common_name
                .try_into()
                .map_err(|e| SyncError::Certificate(format!("invalid common name: {}", e)))?,
        ),
        SanType::DnsName("localhost".try_into().map_err(|e| {
            SyncError::Certificate(format!("invalid SAN: {}", e))
        })?),
    ];

    // End-entity certificate, never a CA
    params.is_ca = IsCa::NoCa;

    let key_pair = KeyPair::generate()
        .map_err(|e| SyncError::Certificate(format!("failed to generate key pair: {}", e)))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| SyncError::Certificate(format!("failed to generate certificate: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    fs::create_dir_all(cert_path.parent().unwrap_or(Path::new(".")))?;
    fs::write(cert_path, &cert_pem)?;
    fs::write(key_path, &key_pem)?;

    // The key file must not be world-readable
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(key_path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(key_path, perms)?;
    }

    Ok((cert_pem, key_pem))
}

/// Make sure this device has a server certificate, generating one on first
/// use. Returns (cert_path, key_path, fingerprint).
pub fn ensure_server_certificate(
    certs_dir: &Path,
    device_name: &str,
    device_id: &str,
    force_regenerate: bool,
) -> SyncResult<(PathBuf, PathBuf, String)> {
    let cert_path = certs_dir.join("server.crt");
    let key_path = certs_dir.join("server.key");

    if force_regenerate || !cert_path.exists() || !key_path.exists() {
        generate_self_signed_cert(&cert_path, &key_path, device_name, Some(device_id))?;
    }

    let fingerprint = fingerprint_of_file(&cert_path)?;
    Ok((cert_path, key_path, fingerprint))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_format() {
        let fingerprint = fingerprint_from_der(&[0u8; 32]);
        assert!(fingerprint.starts_with("SHA256:"));
        let parts: Vec<&str> = fingerprint[7..].split(':').collect();
        assert_eq!(parts.len(), 32);
        assert!(parts.iter().all(|p| p.len() == 2));
    }

    #[test]
    fn test_fingerprints_match_case_insensitive() {
        assert!(fingerprints_match("SHA256:AB:cd", "sha256:ab:CD"));
        assert!(!fingerprints_match("SHA256:ab", "SHA256:ac"));
    }

    #[test]
    fn test_generated_cert_roundtrips_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("server.crt");
        let key_path = dir.path().join("server.key");

        let (cert_pem, _key_pem) =
            generate_self_signed_cert(&cert_path, &key_path, "test-device", Some("abc123"))
                .unwrap();

        let from_pem = fingerprint_from_pem(cert_pem.as_bytes()).unwrap();
        let from_file = fingerprint_of_file(&cert_path).unwrap();
        assert_eq!(from_pem, from_file);
        assert!(from_pem.starts_with("SHA256:"));
    }

    #[test]
    fn test_ensure_server_certificate_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let (_, _, fp1) =
            ensure_server_certificate(dir.path(), "device", "abc", false).unwrap();
        let (_, _, fp2) =
            ensure_server_certificate(dir.path(), "device", "abc", false).unwrap();
        assert_eq!(fp1, fp2);

        let (_, _, fp3) = ensure_server_certificate(dir.path(), "device", "abc", true).unwrap();
        assert_ne!(fp1, fp3);
    }

    #[test]
    fn test_pinned_verifier_records_observation() {
        let verifier = PinnedCertVerifier::new(None);
        assert!(verifier.observed_fingerprint().is_none());

        let cert = CertificateDer::from(vec![1u8, 2, 3]);
        let name = ServerName::try_from("localhost").unwrap();
        let result = verifier.verify_server_cert(&cert, &[], &name, &[], UnixTime::now());
        assert!(result.is_ok());
        assert_eq!(
            verifier.observed_fingerprint().unwrap(),
            fingerprint_from_der(&[1, 2, 3])
        );
    }

    #[test]
    fn test_pinned_verifier_rejects_mismatch() {
        let pinned = fingerprint_from_der(&[9u8; 4]);
        let verifier = PinnedCertVerifier::new(Some(pinned.clone()));

        let cert = CertificateDer::from(vec![1u8, 2, 3]);
        let name = ServerName::try_from("localhost").unwrap();
        let result = verifier.verify_server_cert(&cert, &[], &name, &[], UnixTime::now());
        assert!(result.is_err());

        // The matching certificate passes, regardless of case
        let verifier = PinnedCertVerifier::new(Some(pinned.to_uppercase()));
        let cert = CertificateDer::from(vec![9u8; 4]);
        let result = verifier.verify_server_cert(&cert, &[], &name, &[], UnixTime::now());
        assert!(result.is_ok());
    }
}
