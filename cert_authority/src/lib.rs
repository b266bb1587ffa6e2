// Copyright 2026 BuildCache Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]

//! Issues a short-lived self-signed CA at startup, then mints per-host leaf certificates on
//! demand so the intercept proxy's bridge can impersonate an HTTPS origin after hijacking a
//! CONNECT. Leaves are memoized for the process lifetime, keyed by their exact SAN set.

use std::collections::HashMap;
use std::sync::Arc;

use async_oncecell::OnceCell;
use parking_lot::Mutex;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration as TimeDuration, OffsetDateTime};

const CA_LIFETIME_HOURS: i64 = 24;
const LEAF_LIFETIME_HOURS: i64 = 24;
const ORGANIZATION: &str = "BuildCache";

/// A minted leaf certificate and its private key, ready to hand to a rustls `ServerConfig`.
#[derive(Clone)]
pub struct LeafCert {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: Arc<PrivateKeyDer<'static>>,
}

impl LeafCert {
    /// Builds a rustls server config presenting this leaf, for use by the one hijacked TLS
    /// session this leaf was minted for.
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>, String> {
        let key = self.key.clone_key();
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.cert_chain.clone(), key)
            .map_err(|e| format!("failed to build TLS server config: {e}"))?;
        Ok(Arc::new(config))
    }
}

struct CaMaterial {
    params: CertificateParams,
    cert: Certificate,
    key: KeyPair,
}

/// Holds the process's signing CA and memoizes leaves minted from it.
pub struct CertAuthority {
    ca: CaMaterial,
    leaves: Mutex<HashMap<Vec<String>, Arc<OnceCell<LeafCert>>>>,
}

impl CertAuthority {
    /// Generates a fresh ECDSA CA keypair and a self-signed certificate valid for 24 hours.
    pub fn generate() -> Result<CertAuthority, String> {
        // rustls 0.23 requires a process-wide crypto provider before any ServerConfig can be
        // built; install the one this workspace compiles in (idempotent: a second caller's
        // install attempt failing because one is already installed is not an error).
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, ORGANIZATION);
        dn.push(DnType::CommonName, format!("{ORGANIZATION} Local CA"));

        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before + TimeDuration::hours(CA_LIFETIME_HOURS);

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| format!("failed to build CA cert params: {e}"))?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name = dn;
        params.not_before = not_before;
        params.not_after = not_after;

        let key = KeyPair::generate().map_err(|e| format!("failed to generate CA key: {e}"))?;
        let cert = params
            .clone()
            .self_signed(&key)
            .map_err(|e| format!("failed to self-sign CA cert: {e}"))?;

        Ok(CertAuthority {
            ca: CaMaterial { params, cert, key },
            leaves: Mutex::new(HashMap::new()),
        })
    }

    /// The CA certificate in PEM form, for clients to add to their trust store explicitly.
    pub fn ca_cert_pem(&self) -> String {
        self.ca.cert.pem()
    }

    /// Mints (or returns a memoized) leaf certificate whose `SubjectAltNames` exactly equal
    /// `hosts`. Concurrent requests for the same host set are coalesced onto a single mint.
    pub async fn issue(&self, hosts: &[String]) -> Result<LeafCert, String> {
        let key = hosts.to_vec();
        let cell = {
            let mut leaves = self.leaves.lock();
            leaves.entry(key).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };

        cell.get_or_try_init(async { self.mint(hosts) }).await.map(|leaf| leaf.clone())
    }

    fn mint(&self, hosts: &[String]) -> Result<LeafCert, String> {
        let mut params = CertificateParams::new(hosts.to_vec())
            .map_err(|e| format!("failed to build leaf cert params for {hosts:?}: {e}"))?;

        let mut dn = DistinguishedName::new();
        if let Some(first_host) = hosts.first() {
            dn.push(DnType::CommonName, first_host.clone());
        }
        params.distinguished_name = dn;

        let not_before = OffsetDateTime::now_utc();
        params.not_before = not_before;
        params.not_after = not_before + TimeDuration::hours(LEAF_LIFETIME_HOURS);

        let leaf_key = KeyPair::generate()
            .map_err(|e| format!("failed to generate leaf key for {hosts:?}: {e}"))?;
        let issuer = rcgen::Issuer::new(&self.ca.params, &self.ca.key);
        let leaf_cert = params
            .signed_by(&leaf_key, &issuer)
            .map_err(|e| format!("failed to sign leaf cert for {hosts:?}: {e}"))?;

        let key_der: PrivateKeyDer<'static> =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        Ok(LeafCert {
            cert_chain: vec![leaf_cert.der().clone()],
            key: Arc::new(key_der),
        })
    }
}

/// Best-effort installation of the CA into the host's trust store. Failure is logged as a
/// warning and is never fatal: clients may still be configured to trust the CA explicitly.
/// Platform-specific by nature, so this is a pluggable side effect with a no-op fallback for
/// platforms (or sandboxes) where there's nothing sensible to do.
pub fn install_to_os_trust_store(ca_pem: &str) {
    match try_install(ca_pem) {
        Ok(()) => log::info!("installed local CA into the OS trust store"),
        Err(e) => log::warn!("could not install local CA into the OS trust store: {e}"),
    }
}

#[cfg(target_os = "linux")]
fn try_install(ca_pem: &str) -> Result<(), String> {
    let dest = std::path::Path::new("/usr/local/share/ca-certificates/buildcache-local-ca.crt");
    std::fs::write(dest, ca_pem).map_err(|e| format!("failed to write {dest:?}: {e}"))?;
    let status = std::process::Command::new("update-ca-certificates")
        .status()
        .map_err(|e| format!("failed to run update-ca-certificates: {e}"))?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("update-ca-certificates exited with {status}"))
    }
}

#[cfg(target_os = "macos")]
fn try_install(ca_pem: &str) -> Result<(), String> {
    let path = std::env::temp_dir().join(format!("buildcache-local-ca-{}.pem", std::process::id()));
    std::fs::write(&path, ca_pem).map_err(|e| format!("failed to write {path:?}: {e}"))?;
    let status = std::process::Command::new("security")
        .args([
            "add-trusted-cert",
            "-d",
            "-r",
            "trustRoot",
            "-k",
            "/Library/Keychains/System.keychain",
        ])
        .arg(&path)
        .status()
        .map_err(|e| format!("failed to run security add-trusted-cert: {e}"))?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("security add-trusted-cert exited with {status}"))
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn try_install(_ca_pem: &str) -> Result<(), String> {
    Err("no trust store installer for this platform".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issue_returns_a_cert_with_the_requested_sans() {
        let ca = CertAuthority::generate().unwrap();
        let leaf = ca.issue(&["example.test".to_string()]).await.unwrap();
        assert_eq!(leaf.cert_chain.len(), 1);
    }

    #[tokio::test]
    async fn issue_is_memoized_per_host_set() {
        let ca = CertAuthority::generate().unwrap();
        let hosts = vec!["example.test".to_string()];
        let a = ca.issue(&hosts).await.unwrap();
        let b = ca.issue(&hosts).await.unwrap();
        assert_eq!(a.cert_chain[0], b.cert_chain[0]);
    }

    #[tokio::test]
    async fn different_host_sets_mint_different_leaves() {
        let ca = CertAuthority::generate().unwrap();
        let a = ca.issue(&["a.test".to_string()]).await.unwrap();
        let b = ca.issue(&["b.test".to_string()]).await.unwrap();
        assert_ne!(a.cert_chain[0], b.cert_chain[0]);
    }

    #[test]
    fn ca_cert_pem_is_well_formed_pem() {
        let ca = CertAuthority::generate().unwrap();
        let pem = ca.ca_cert_pem();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
    }
}
