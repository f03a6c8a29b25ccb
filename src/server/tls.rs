//! Server-side TLS endpoints: server identity, trust anchors, CRL checking
//! and certificate-to-name mapping of authenticated clients.

use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, warn};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod, SslVerifyMode};
use openssl::x509::{CrlStatus, X509Crl, X509};

use crate::error::{Error, Result};
use crate::transport::tls::TlsTransport;

/// How a CTN entry derives the NETCONF username from a matched certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CtnMapType {
    /// The entry itself names the user.
    Specified,
    SanRfc822,
    SanDns,
    SanIp,
    /// First SAN of any supported kind.
    SanAny,
    CommonName,
}

/// One certificate-to-name entry; entries apply in ascending id order and the
/// first match wins.
#[derive(Clone, Debug)]
pub struct CtnEntry {
    pub id: u32,
    /// Hex SHA-256 certificate fingerprint (colons optional); `None` matches
    /// any certificate.
    pub fingerprint: Option<String>,
    pub map_type: CtnMapType,
    /// Username for [`CtnMapType::Specified`].
    pub name: Option<String>,
}

/// One named TLS listening endpoint.
pub(crate) struct TlsEndpoint {
    pub(crate) name: String,
    pub(crate) cert: Option<PathBuf>,
    pub(crate) key: Option<PathBuf>,
    pub(crate) ca: Option<PathBuf>,
    pub(crate) crl: Option<PathBuf>,
    pub(crate) ctn: Vec<CtnEntry>,
}

impl TlsEndpoint {
    pub(crate) fn new(name: impl Into<String>) -> TlsEndpoint {
        TlsEndpoint {
            name: name.into(),
            cert: None,
            key: None,
            ca: None,
            crl: None,
            ctn: Vec::new(),
        }
    }

    pub(crate) fn add_ctn(&mut self, entry: CtnEntry) {
        self.ctn.retain(|e| e.id != entry.id);
        self.ctn.push(entry);
        self.ctn.sort_by_key(|e| e.id);
    }

    pub(crate) fn del_ctn(&mut self, id: u32) {
        self.ctn.retain(|e| e.id != id);
    }
}

fn normalize_fingerprint(fp: &str) -> String {
    fp.chars().filter(|c| *c != ':').collect::<String>().to_ascii_lowercase()
}

fn cert_fingerprint(cert: &X509) -> Result<String> {
    let digest = cert
        .digest(MessageDigest::sha256())
        .map_err(|e| Error::other("certificate digest", e))?;
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        out.push_str(&format!("{byte:02x}"));
    }
    Ok(out)
}

fn san_value(cert: &X509, map_type: CtnMapType) -> Option<String> {
    let names = cert.subject_alt_names()?;
    for name in names.iter() {
        match map_type {
            CtnMapType::SanRfc822 => {
                if let Some(email) = name.email() {
                    return Some(email.to_string());
                }
            }
            CtnMapType::SanDns => {
                if let Some(dns) = name.dnsname() {
                    return Some(dns.to_string());
                }
            }
            CtnMapType::SanIp => {
                if let Some(ip) = name.ipaddress() {
                    return format_ip(ip);
                }
            }
            CtnMapType::SanAny => {
                if let Some(email) = name.email() {
                    return Some(email.to_string());
                }
                if let Some(dns) = name.dnsname() {
                    return Some(dns.to_string());
                }
                if let Some(ip) = name.ipaddress() {
                    return format_ip(ip);
                }
            }
            CtnMapType::Specified | CtnMapType::CommonName => return None,
        }
    }
    None
}

fn format_ip(bytes: &[u8]) -> Option<String> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(std::net::Ipv4Addr::from(octets).to_string())
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(std::net::Ipv6Addr::from(octets).to_string())
        }
        _ => None,
    }
}

fn common_name(cert: &X509) -> Option<String> {
    let entry = cert.subject_name().entries_by_nid(Nid::COMMONNAME).next()?;
    entry.data().as_utf8().ok().map(|s| s.to_string())
}

/// Map a verified client certificate to a NETCONF username: lowest-id entry
/// whose fingerprint and map rule both apply; no match means the client is
/// not authenticated.
pub(crate) fn map_cert_to_name(entries: &[CtnEntry], cert: &X509) -> Result<String> {
    let fingerprint = cert_fingerprint(cert)?;
    for entry in entries {
        if let Some(want) = &entry.fingerprint {
            if normalize_fingerprint(want) != fingerprint {
                continue;
            }
        }
        let name = match entry.map_type {
            CtnMapType::Specified => entry.name.clone(),
            CtnMapType::CommonName => common_name(cert),
            other => san_value(cert, other),
        };
        if let Some(name) = name {
            debug!("ctn entry {} mapped client certificate to {name}", entry.id);
            return Ok(name);
        }
    }
    Err(Error::AuthenticationFailed("no matching cert-to-name entry".into()))
}

/// Establish TLS transport in the server role on an accepted socket: TLS
/// handshake, client certificate verification (trust anchors plus optional
/// CRL), then certificate-to-name mapping.
pub(crate) fn accept_session(
    cert: Option<&PathBuf>,
    key: Option<&PathBuf>,
    ca: Option<&PathBuf>,
    crl: Option<&PathBuf>,
    ctn: &[CtnEntry],
    stream: TcpStream,
    timeout_ms: i32,
) -> Result<(TlsTransport, String)> {
    let (cert, key) = match (cert, key) {
        (Some(cert), Some(key)) => (cert, key),
        _ => return Err(Error::InvalidArgument("endpoint has no server certificate".into())),
    };
    let mut acceptor = SslAcceptor::mozilla_intermediate(SslMethod::tls())
        .map_err(|e| Error::other("tls init", e))?;
    acceptor
        .set_certificate_chain_file(cert)
        .map_err(|e| Error::other("server certificate", e))?;
    acceptor
        .set_private_key_file(key, SslFiletype::PEM)
        .map_err(|e| Error::other("server key", e))?;
    acceptor.check_private_key().map_err(|e| Error::other("server key", e))?;
    if let Some(ca) = ca {
        acceptor.set_ca_file(ca).map_err(|e| Error::other("trust anchors", e))?;
    }
    let crl = match crl {
        Some(path) => {
            let pem = std::fs::read(path).map_err(Error::Transport)?;
            Some(X509Crl::from_pem(&pem).map_err(|e| Error::other("crl", e))?)
        }
        None => None,
    };
    acceptor.set_verify_callback(
        SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
        move |preverified, ctx| {
            if !preverified {
                return false;
            }
            if let (Some(crl), Some(cert)) = (&crl, ctx.current_cert()) {
                if let CrlStatus::Revoked(_) = crl.get_by_serial(cert.serial_number()) {
                    warn!("client certificate is revoked");
                    return false;
                }
            }
            true
        },
    );
    let acceptor = acceptor.build();

    if timeout_ms > 0 {
        let t = Some(Duration::from_millis(timeout_ms as u64));
        stream.set_read_timeout(t).map_err(Error::Transport)?;
        stream.set_write_timeout(t).map_err(Error::Transport)?;
    }
    let tls = acceptor
        .accept(stream)
        .map_err(|e| Error::AuthenticationFailed(format!("tls handshake: {e}")))?;
    let transport = TlsTransport::new(tls)?;
    let peer = transport
        .peer_certificate()
        .ok_or_else(|| Error::AuthenticationFailed("no client certificate".into()))?;
    let username = map_cert_to_name(ctn, &peer)?;
    Ok((transport, username))
}
