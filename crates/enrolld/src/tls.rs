use std::{
    fs,
    io::BufReader,
    net::IpAddr,
    path::Path,
    sync::Arc,
};

use anyhow::Context;
use rustls::{
    server::{
        ParsedCertificate,
        WebPkiClientVerifier,
    },
    RootCertStore,
    ServerConnection,
};
use rustls_pki_types::{
    CertificateDer,
    PrivateKeyDer,
    ServerName,
};

/// Generates a self-signed certificate/key pair when none is configured,
/// so a fresh install can accept enrollments out of the box.
pub fn ensure_server_identity(cert: &Path, key: &Path, hostname: &str) -> anyhow::Result<()> {
    if cert.is_file() && key.is_file() {
        return Ok(());
    }
    tracing::info!(
        "No certificate/key pair at {}; generating a self-signed identity.",
        cert.display()
    );
    let certified = rcgen::generate_simple_self_signed(vec![hostname.to_owned()])?;
    if let Some(parent) = cert.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(cert, certified.cert.pem()).with_context(|| format!("writing {}", cert.display()))?;
    fs::write(key, certified.key_pair.serialize_pem())
        .with_context(|| format!("writing {}", key.display()))?;
    Ok(())
}

/// Builds the server-side TLS configuration. When a CA bundle is given,
/// clients must present a certificate chaining to it.
pub fn build_server_config(
    cert_path: &Path,
    key_path: &Path,
    ca_path: Option<&Path>,
) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let builder = rustls::ServerConfig::builder();
    let config = match ca_path {
        Some(ca) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca)? {
                roots.add(cert)?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .context("building the client certificate verifier")?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        },
        None => builder.with_no_client_auth().with_single_cert(certs, key)?,
    };
    Ok(Arc::new(config))
}

pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        fs::File::open(path).with_context(|| format!("opening {}", path.display()))?,
    );
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .with_context(|| format!("parsing certificates from {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates in {}", path.display());
    Ok(certs)
}

pub fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        fs::File::open(path).with_context(|| format!("opening {}", path.display()))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("parsing private key from {}", path.display()))?
        .with_context(|| format!("no private key in {}", path.display()))
}

/// Host verification: the client certificate must carry a subject name
/// matching the peer address (an IP subjectAltName, or a dNSName equal to
/// its textual form).
pub fn peer_matches_certificate(conn: &ServerConnection, peer: IpAddr) -> bool {
    let Some(certs) = conn.peer_certificates() else {
        return false;
    };
    let Some(end_entity) = certs.first() else {
        return false;
    };
    let Ok(parsed) = ParsedCertificate::try_from(end_entity) else {
        return false;
    };
    let name = ServerName::IpAddress(peer.into());
    rustls::client::verify_server_name(&parsed, &name).is_ok()
}
