//! TLS configuration objects.
//!
//! A config is shared (`Arc`), lock-protected, and freezes on first use:
//! once a dialer or listener has started a connection with it, every
//! setter fails with `Busy`.

use std::path::Path;

use parking_lot::Mutex;

use hawser_core::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

/// How the peer certificate is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsAuthMode {
    /// No verification at all.
    None,
    /// Verify when presented, tolerate absence.
    Optional,
    /// Require a verified certificate.
    Required,
}

#[derive(Debug, Clone)]
pub struct OwnCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CaChain {
    pub chain_pem: String,
    pub crl_pem: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Psk {
    pub identity: String,
    pub key: Vec<u8>,
}

#[derive(Debug)]
struct ConfigState {
    busy: bool,
    server_name: Option<String>,
    ca_chain: Option<CaChain>,
    own_cert: Option<OwnCert>,
    psk: Option<Psk>,
    min_version: TlsVersion,
    max_version: TlsVersion,
    auth_mode: TlsAuthMode,
}

/// Shared TLS configuration. Create with [`TlsConfig::new`], hand the
/// `Arc` to dialers/listeners, and configure before the first connection
/// attempt.
#[derive(Debug)]
pub struct TlsConfig {
    mode: TlsMode,
    st: Mutex<ConfigState>,
}

impl TlsConfig {
    #[must_use]
    pub fn new(mode: TlsMode) -> Self {
        // Servers default to not requiring client certs; clients always
        // verify the server.
        let auth_mode = match mode {
            TlsMode::Client => TlsAuthMode::Required,
            TlsMode::Server => TlsAuthMode::None,
        };
        Self {
            mode,
            st: Mutex::new(ConfigState {
                busy: false,
                server_name: None,
                ca_chain: None,
                own_cert: None,
                psk: None,
                min_version: TlsVersion::Tls12,
                max_version: TlsVersion::Tls13,
                auth_mode,
            }),
        }
    }

    #[must_use]
    pub fn mode(&self) -> TlsMode {
        self.mode
    }

    /// Freeze the config; called by the adapter on first connection use.
    pub(crate) fn mark_busy(&self) {
        self.st.lock().busy = true;
    }

    fn set_with<T>(&self, f: impl FnOnce(&mut ConfigState) -> Result<T>) -> Result<T> {
        let mut st = self.st.lock();
        if st.busy {
            return Err(Error::Busy);
        }
        f(&mut st)
    }

    /// SNI name (clients) / expected name (verification).
    pub fn set_server_name(&self, name: &str) -> Result<()> {
        self.set_with(|st| {
            st.server_name = Some(name.to_string());
            Ok(())
        })
    }

    /// Install the CA chain, optionally with a revocation list.
    pub fn set_ca_chain(&self, chain_pem: &str, crl_pem: Option<&str>) -> Result<()> {
        self.set_with(|st| {
            st.ca_chain = Some(CaChain {
                chain_pem: chain_pem.to_string(),
                crl_pem: crl_pem.map(str::to_string),
            });
            Ok(())
        })
    }

    /// Install our certificate and key. Settable at most once.
    pub fn set_own_cert(&self, cert_pem: &str, key_pem: &str, passphrase: Option<&str>) -> Result<()> {
        self.set_with(|st| {
            if st.own_cert.is_some() {
                return Err(Error::Busy);
            }
            st.own_cert = Some(OwnCert {
                cert_pem: cert_pem.to_string(),
                key_pem: key_pem.to_string(),
                passphrase: passphrase.map(str::to_string),
            });
            Ok(())
        })
    }

    /// Load the CA chain from a PEM file; a CRL in the same file is
    /// recognized and split out.
    pub fn set_ca_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let pem = std::fs::read_to_string(path)?;
        if pem.contains("-----BEGIN X509 CRL-----") {
            self.set_ca_chain(&pem, Some(&pem))
        } else {
            self.set_ca_chain(&pem, None)
        }
    }

    /// Load our certificate and key from one PEM file.
    pub fn set_cert_key_file(&self, path: impl AsRef<Path>, passphrase: Option<&str>) -> Result<()> {
        let pem = std::fs::read_to_string(path)?;
        self.set_own_cert(&pem, &pem, passphrase)
    }

    /// Pre-shared key.
    pub fn set_psk(&self, identity: &str, key: &[u8]) -> Result<()> {
        self.set_with(|st| {
            st.psk = Some(Psk {
                identity: identity.to_string(),
                key: key.to_vec(),
            });
            Ok(())
        })
    }

    pub fn set_version_range(&self, min: TlsVersion, max: TlsVersion) -> Result<()> {
        if min > max {
            return Err(Error::Inval);
        }
        self.set_with(|st| {
            st.min_version = min;
            st.max_version = max;
            Ok(())
        })
    }

    pub fn set_auth_mode(&self, mode: TlsAuthMode) -> Result<()> {
        self.set_with(|st| {
            st.auth_mode = mode;
            Ok(())
        })
    }

    // Engine-facing accessors.

    #[must_use]
    pub fn server_name(&self) -> Option<String> {
        self.st.lock().server_name.clone()
    }

    #[must_use]
    pub fn ca_chain(&self) -> Option<CaChain> {
        self.st.lock().ca_chain.clone()
    }

    #[must_use]
    pub fn own_cert(&self) -> Option<OwnCert> {
        self.st.lock().own_cert.clone()
    }

    #[must_use]
    pub fn psk(&self) -> Option<Psk> {
        self.st.lock().psk.clone()
    }

    #[must_use]
    pub fn version_range(&self) -> (TlsVersion, TlsVersion) {
        let st = self.st.lock();
        (st.min_version, st.max_version)
    }

    #[must_use]
    pub fn auth_mode(&self) -> TlsAuthMode {
        self.st.lock().auth_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setters_refused_once_busy() {
        let cfg = TlsConfig::new(TlsMode::Client);
        cfg.set_server_name("example.com").unwrap();
        cfg.mark_busy();
        assert_eq!(cfg.set_server_name("other"), Err(Error::Busy));
        assert_eq!(cfg.server_name().as_deref(), Some("example.com"));
    }

    #[test]
    fn test_own_cert_set_once() {
        let cfg = TlsConfig::new(TlsMode::Server);
        cfg.set_own_cert("CERT", "KEY", None).unwrap();
        assert_eq!(cfg.set_own_cert("CERT2", "KEY2", None), Err(Error::Busy));
    }

    #[test]
    fn test_version_range_validated() {
        let cfg = TlsConfig::new(TlsMode::Client);
        assert_eq!(
            cfg.set_version_range(TlsVersion::Tls13, TlsVersion::Tls12),
            Err(Error::Inval)
        );
        cfg.set_version_range(TlsVersion::Tls12, TlsVersion::Tls13)
            .unwrap();
    }

    #[test]
    fn test_default_auth_modes() {
        assert_eq!(
            TlsConfig::new(TlsMode::Client).auth_mode(),
            TlsAuthMode::Required
        );
        assert_eq!(
            TlsConfig::new(TlsMode::Server).auth_mode(),
            TlsAuthMode::None
        );
    }
}
