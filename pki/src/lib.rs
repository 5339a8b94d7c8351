//! Ephemeral, session-scoped PKI for the control plane.
//!
//! One call mints a CA and two leaf certificates. The CA signing key never
//! leaves [`SessionPki::generate`]: once the leaves are signed it is
//! zeroized and dropped, so no further certificates can be issued even by a
//! compromised proxy process.

use anyhow::Context;
use anyhow::Result;
use rcgen::BasicConstraints;
use rcgen::CertificateParams;
use rcgen::DistinguishedName;
use rcgen::DnType;
use rcgen::ExtendedKeyUsagePurpose;
use rcgen::IsCa;
use rcgen::KeyPair;
use rcgen::KeyUsagePurpose;
use rcgen::PKCS_ED25519;
use rcgen::SanType;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;
use zeroize::Zeroizing;

pub const CA_CERT_FILE: &str = "ca.pem";
pub const CLIENT_CERT_FILE: &str = "client-cert.pem";
pub const CLIENT_KEY_FILE: &str = "client-key.pem";

/// The PEM artifacts of one session. The CA private key is intentionally
/// absent: it is destroyed before this struct exists.
pub struct SessionPki {
    pub ca_cert_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
    pub client_cert_pem: String,
    pub client_key_pem: String,
}

impl std::fmt::Debug for SessionPki {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material must not end up in logs.
        f.debug_struct("SessionPki").finish_non_exhaustive()
    }
}

impl SessionPki {
    /// Generate the session CA plus the server and client leaves. All keys
    /// are Ed25519 and every certificate expires after `lifetime`.
    ///
    /// The server leaf is pinned to `127.0.0.1` (the control API is only
    /// ever dialed over the host loopback) and restricted to serverAuth;
    /// the client leaf is restricted to clientAuth.
    pub fn generate(lifetime: Duration) -> Result<Self> {
        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before
            + time::Duration::try_from(lifetime).context("session lifetime out of range")?;

        let ca_key = KeyPair::generate_for(&PKCS_ED25519).context("generate CA key")?;
        // The only reachable copy of the CA key outside `ca_key` itself;
        // scrubbed when this function returns.
        let ca_key_der = Zeroizing::new(ca_key.serialize_der());

        let mut ca_params = CertificateParams::default();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        ca_params.not_before = not_before;
        ca_params.not_after = not_after;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "vibepit session CA");
        ca_params.distinguished_name = dn;
        let ca_cert = ca_params
            .self_signed(&ca_key)
            .context("self-sign session CA")?;

        let server_key = KeyPair::generate_for(&PKCS_ED25519).context("generate server key")?;
        let mut server_params = CertificateParams::new(Vec::new())
            .context("create server certificate params")?;
        server_params
            .subject_alt_names
            .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        server_params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        server_params.not_before = not_before;
        server_params.not_after = not_after;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "vibepit control api");
        server_params.distinguished_name = dn;
        let server_cert = server_params
            .signed_by(&server_key, &ca_cert, &ca_key)
            .context("sign server certificate")?;

        let client_key = KeyPair::generate_for(&PKCS_ED25519).context("generate client key")?;
        let mut client_params = CertificateParams::new(Vec::new())
            .context("create client certificate params")?;
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        client_params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        client_params.not_before = not_before;
        client_params.not_after = not_after;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "vibepit control client");
        client_params.distinguished_name = dn;
        let client_cert = client_params
            .signed_by(&client_key, &ca_cert, &ca_key)
            .context("sign client certificate")?;

        drop(ca_key);
        drop(ca_key_der);

        Ok(Self {
            ca_cert_pem: ca_cert.pem(),
            server_cert_pem: server_cert.pem(),
            server_key_pem: server_key.serialize_pem(),
            client_cert_pem: client_cert.pem(),
            client_key_pem: client_key.serialize_pem(),
        })
    }

    /// Persist the client-side credentials for other host processes. The
    /// directory is created with mode 0700 and each file with mode 0600;
    /// existing files are never overwritten silently.
    pub fn write_client_credentials(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        restrict_dir_permissions(dir)?;
        write_private_file(&dir.join(CA_CERT_FILE), self.ca_cert_pem.as_bytes())?;
        write_private_file(&dir.join(CLIENT_CERT_FILE), self.client_cert_pem.as_bytes())?;
        write_private_file(&dir.join(CLIENT_KEY_FILE), self.client_key_pem.as_bytes())?;
        Ok(())
    }
}

fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = open_create_new_with_mode(path, 0o600)?;
    file.write_all(contents)
        .with_context(|| format!("write {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("fsync {}", path.display()))?;
    Ok(())
}

#[cfg(unix)]
fn restrict_dir_permissions(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("restrict permissions on {}", dir.display()))
}

#[cfg(not(unix))]
fn restrict_dir_permissions(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn open_create_new_with_mode(path: &Path, mode: u32) -> Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
        .with_context(|| format!("create {}", path.display()))
}

#[cfg(not(unix))]
fn open_create_new_with_mode(path: &Path, _mode: u32) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("create {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use pretty_assertions::assert_ne;

    fn ensure_crypto_provider() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    fn parse_certs(pem: &str) -> Vec<rustls_pki_types::CertificateDer<'static>> {
        rustls_pemfile::certs(&mut pem.as_bytes())
            .collect::<std::io::Result<Vec<_>>>()
            .unwrap()
    }

    fn parse_key(pem: &str) -> rustls_pki_types::PrivateKeyDer<'static> {
        rustls_pemfile::private_key(&mut pem.as_bytes())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn server_pair_builds_a_rustls_server_config() {
        ensure_crypto_provider();
        let pki = SessionPki::generate(Duration::from_secs(3600)).unwrap();
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                parse_certs(&pki.server_cert_pem),
                parse_key(&pki.server_key_pem),
            );
        assert!(config.is_ok());
    }

    #[test]
    fn client_pair_builds_a_rustls_client_config() {
        ensure_crypto_provider();
        let pki = SessionPki::generate(Duration::from_secs(3600)).unwrap();
        let mut roots = rustls::RootCertStore::empty();
        for cert in parse_certs(&pki.ca_cert_pem) {
            roots.add(cert).unwrap();
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(
                parse_certs(&pki.client_cert_pem),
                parse_key(&pki.client_key_pem),
            );
        assert!(config.is_ok());
    }

    #[test]
    fn two_sessions_mint_distinct_material() {
        let a = SessionPki::generate(Duration::from_secs(60)).unwrap();
        let b = SessionPki::generate(Duration::from_secs(60)).unwrap();
        assert_ne!(a.ca_cert_pem, b.ca_cert_pem);
        assert_ne!(a.server_key_pem, b.server_key_pem);
        assert_ne!(a.client_key_pem, b.client_key_pem);
    }

    #[test]
    fn artifacts_are_pem_encoded() {
        let pki = SessionPki::generate(Duration::from_secs(60)).unwrap();
        for pem in [
            &pki.ca_cert_pem,
            &pki.server_cert_pem,
            &pki.client_cert_pem,
        ] {
            assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
        }
        assert!(pki.server_key_pem.contains("PRIVATE KEY"));
        assert!(pki.client_key_pem.contains("PRIVATE KEY"));
    }

    #[cfg(unix)]
    #[test]
    fn credential_directory_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let pki = SessionPki::generate(Duration::from_secs(60)).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("session-1");
        pki.write_client_credentials(&dir).unwrap();

        let dir_mode = fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        for name in [CA_CERT_FILE, CLIENT_CERT_FILE, CLIENT_KEY_FILE] {
            let mode = fs::metadata(dir.join(name)).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600, "unexpected mode on {name}");
        }
    }

    #[test]
    fn existing_credentials_are_not_overwritten() {
        let pki = SessionPki::generate(Duration::from_secs(60)).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("session-1");
        pki.write_client_credentials(&dir).unwrap();
        assert!(pki.write_client_credentials(&dir).is_err());
    }
}
