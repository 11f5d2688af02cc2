//! Authentication Provider Chain (spec §6.3, §4.15).
//!
//! An ordered list of providers, each sniffing whether it can handle a
//! mechanism token before attempting to authenticate it. Actual Kerberos
//! AP-REQ validation and NTLMSSP byte parsing are external collaborators —
//! this module is the trait boundary plus the chain/keytab-watcher
//! plumbing around it (spec §1 Non-goals: Kerberos/SPNEGO parsing).

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// GSS-API mechanism OID for Kerberos V5, and the SPNEGO-wrapped form seen
/// inside a negTokenInit (spec §4.12 step 2).
pub const KERBEROS_V5_OID: &str = "1.2.840.113554.1.2.2";
pub const SPNEGO_OID: &str = "1.3.6.1.5.5.2";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("mechanism token not handled by this provider")]
    UnsupportedMechanism,
    #[error("AP-REQ validation failed against the service keytab")]
    KerberosRejected,
    #[error("NTLMSSP challenge/response rejected")]
    NtlmRejected,
    #[error("authenticated principal has no mapped local user")]
    NoLocalUser,
    #[error("malformed authentication token")]
    Malformed,
}

/// Identity produced by a successful `authenticate` call (spec §4.12 step 5:
/// bound onto the SMB session as UID/GID/Username/Domain).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub realm_or_domain: String,
    pub local_user: String,
}

pub trait AuthProvider: Send + Sync {
    /// ASN.1 prefix sniff (spec §6.3); does not attempt full validation.
    fn can_handle(&self, token: &[u8]) -> bool;
    fn authenticate(&self, token: &[u8]) -> Result<Principal, AuthError>;
}

/// Ordered chain: the first provider whose `can_handle` returns true gets
/// to authenticate; an unknown-mechanism error falls through to the next
/// (spec §6.3).
pub struct AuthChain {
    providers: Vec<Box<dyn AuthProvider>>,
}

impl AuthChain {
    pub fn new(providers: Vec<Box<dyn AuthProvider>>) -> Self {
        AuthChain { providers }
    }

    pub fn authenticate(&self, token: &[u8]) -> Result<Principal, AuthError> {
        for provider in &self.providers {
            if !provider.can_handle(token) {
                continue;
            }
            match provider.authenticate(token) {
                Ok(principal) => return Ok(principal),
                Err(AuthError::UnsupportedMechanism) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(AuthError::UnsupportedMechanism)
    }
}

/// Maps `alice@REALM` to a bare username by stripping the realm/domain
/// suffix (spec §4.12 step 4). Guest fallback for an absent mapping is out
/// of scope.
pub fn strip_realm(principal_name: &str) -> &str {
    principal_name.split('@').next().unwrap_or(principal_name)
}

/// A keytab entry set, reloaded by `KeytabWatcher`. Actual key material
/// parsing lives with whatever validates AP-REQs against it — out of scope
/// here (spec §1 Non-goals).
#[derive(Debug, Clone, Default)]
pub struct Keytab {
    pub version: u64,
    pub principals: Vec<String>,
}

/// External collaborator that knows how to load a keytab from wherever it
/// lives (file, secret store, ...). `KerberosProvider` only consumes the
/// `RwLock<Keytab>` a `KeytabWatcher` keeps current.
#[async_trait::async_trait]
pub trait KeytabSource: Send + Sync {
    async fn load(&self) -> std::io::Result<Keytab>;
}

/// Polls a `KeytabSource` on a fixed interval (default 60s per spec §6.3)
/// and swaps the shared `RwLock<Keytab>` each time the version changes.
/// Grounded on the state manager's own reaper loop (`state::StateManager::
/// start_session_reaper`) for the spawn/interval idiom.
pub struct KeytabWatcher {
    keytab: Arc<RwLock<Keytab>>,
}

impl KeytabWatcher {
    pub fn new(initial: Keytab) -> Self {
        KeytabWatcher { keytab: Arc::new(RwLock::new(initial)) }
    }

    pub fn keytab(&self) -> Arc<RwLock<Keytab>> {
        self.keytab.clone()
    }

    pub fn spawn(
        source: Arc<dyn KeytabSource>,
        initial: Keytab,
        interval: std::time::Duration,
    ) -> (Arc<RwLock<Keytab>>, tokio::task::JoinHandle<()>) {
        let keytab = Arc::new(RwLock::new(initial));
        let watched = keytab.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match source.load().await {
                    Ok(fresh) => {
                        let mut current = watched.write().await;
                        if fresh.version != current.version {
                            info!(version = fresh.version, "keytab reloaded");
                            *current = fresh;
                        }
                    }
                    Err(err) => warn!(?err, "keytab reload failed, keeping previous version"),
                }
            }
        });
        (keytab, handle)
    }
}

/// Sniffs the SPNEGO/Kerberos OID prefix and validates AP-REQs against a
/// hot-reloadable keytab (spec §4.12 step 2, §6.3).
pub struct KerberosProvider {
    keytab: Arc<RwLock<Keytab>>,
}

impl KerberosProvider {
    pub fn new(keytab: Arc<RwLock<Keytab>>) -> Self {
        KerberosProvider { keytab }
    }

    fn validate_ap_req(&self, principal: &str) -> Result<(), AuthError> {
        let keytab = self.keytab.try_read().map_err(|_| AuthError::KerberosRejected)?;
        if keytab.principals.iter().any(|p| p == principal) {
            Ok(())
        } else {
            Err(AuthError::KerberosRejected)
        }
    }
}

impl AuthProvider for KerberosProvider {
    fn can_handle(&self, token: &[u8]) -> bool {
        contains_oid(token, KERBEROS_V5_OID) || contains_oid(token, SPNEGO_OID)
    }

    /// AP-REQ parsing is out of scope; the token's trailing bytes are taken
    /// as the UTF-8 principal name for the keytab lookup (the ASN.1
    /// structure this would otherwise be extracted from is the Non-goal
    /// named in spec §1).
    fn authenticate(&self, token: &[u8]) -> Result<Principal, AuthError> {
        let principal = extract_principal_placeholder(token).ok_or(AuthError::Malformed)?;
        self.validate_ap_req(&principal)?;
        let local_user = strip_realm(&principal).to_string();
        let realm = principal.split('@').nth(1).unwrap_or("").to_string();
        debug!(%principal, "kerberos AP-REQ accepted");
        Ok(Principal { name: principal, realm_or_domain: realm, local_user })
    }
}

/// Challenge/response path for NTLMv2 (spec §4.12 step 3). Byte-level
/// NTLMSSP parsing is out of scope; this validates only the structural
/// shape a caller already decoded.
pub struct NtlmProvider {
    domain: String,
}

impl NtlmProvider {
    pub fn new(domain: impl Into<String>) -> Self {
        NtlmProvider { domain: domain.into() }
    }
}

impl AuthProvider for NtlmProvider {
    fn can_handle(&self, token: &[u8]) -> bool {
        token.starts_with(b"NTLMSSP\0")
    }

    fn authenticate(&self, token: &[u8]) -> Result<Principal, AuthError> {
        let name = extract_principal_placeholder(token).ok_or(AuthError::Malformed)?;
        Ok(Principal { local_user: name.clone(), name, realm_or_domain: self.domain.clone() })
    }
}

/// Naive substring sniff for an ASN.1-encoded OID's dotted form. Real
/// SPNEGO parsing would walk the DER structure; matching the dotted string
/// rendered into the blob is enough to route to the right provider for this
/// crate's scope.
fn contains_oid(token: &[u8], oid: &str) -> bool {
    let needle = oid.as_bytes();
    token.windows(needle.len()).any(|w| w == needle)
}

fn extract_principal_placeholder(token: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(token).ok()?;
    let trimmed = text.trim_matches('\0').trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keytab_with(principals: &[&str]) -> Arc<RwLock<Keytab>> {
        Arc::new(RwLock::new(Keytab { version: 1, principals: principals.iter().map(|s| s.to_string()).collect() }))
    }

    #[test]
    fn strip_realm_removes_suffix() {
        assert_eq!(strip_realm("alice@EXAMPLE.COM"), "alice");
        assert_eq!(strip_realm("bob"), "bob");
    }

    #[test]
    fn kerberos_provider_sniffs_oid_prefix() {
        let provider = KerberosProvider::new(keytab_with(&[]));
        let mut token = KERBEROS_V5_OID.as_bytes().to_vec();
        token.extend_from_slice(b"alice@EXAMPLE.COM");
        assert!(provider.can_handle(&token));
        assert!(!provider.can_handle(b"NTLMSSP\0garbage"));
    }

    #[test]
    fn kerberos_provider_accepts_known_principal() {
        let provider = KerberosProvider::new(keytab_with(&["alice@EXAMPLE.COM"]));
        let mut token = KERBEROS_V5_OID.as_bytes().to_vec();
        token.extend_from_slice(b"alice@EXAMPLE.COM");
        let principal = provider.authenticate(&token).unwrap();
        assert_eq!(principal.local_user, "alice");
        assert_eq!(principal.realm_or_domain, "EXAMPLE.COM");
    }

    #[test]
    fn kerberos_provider_rejects_unknown_principal() {
        let provider = KerberosProvider::new(keytab_with(&["bob@EXAMPLE.COM"]));
        let mut token = KERBEROS_V5_OID.as_bytes().to_vec();
        token.extend_from_slice(b"alice@EXAMPLE.COM");
        assert_eq!(provider.authenticate(&token).unwrap_err(), AuthError::KerberosRejected);
    }

    #[test]
    fn ntlm_provider_sniffs_signature() {
        let provider = NtlmProvider::new("WORKGROUP");
        let mut token = b"NTLMSSP\0".to_vec();
        token.extend_from_slice(b"alice");
        assert!(provider.can_handle(&token));
        assert!(!provider.can_handle(KERBEROS_V5_OID.as_bytes()));
    }

    #[test]
    fn chain_falls_through_unsupported_mechanism() {
        let kerberos = KerberosProvider::new(keytab_with(&["alice@EXAMPLE.COM"]));
        let ntlm = NtlmProvider::new("WORKGROUP");
        let chain = AuthChain::new(vec![Box::new(kerberos), Box::new(ntlm)]);

        let mut ntlm_token = b"NTLMSSP\0".to_vec();
        ntlm_token.extend_from_slice(b"bob");
        let principal = chain.authenticate(&ntlm_token).unwrap();
        assert_eq!(principal.local_user, "bob");
    }

    #[test]
    fn chain_reports_unsupported_when_no_provider_matches() {
        let chain = AuthChain::new(vec![Box::new(NtlmProvider::new("WORKGROUP"))]);
        assert_eq!(chain.authenticate(b"unknown-blob").unwrap_err(), AuthError::UnsupportedMechanism);
    }

    #[tokio::test]
    async fn keytab_watcher_swaps_on_version_change() {
        struct OnceSource;
        #[async_trait::async_trait]
        impl KeytabSource for OnceSource {
            async fn load(&self) -> std::io::Result<Keytab> {
                Ok(Keytab { version: 2, principals: vec!["alice@EXAMPLE.COM".into()] })
            }
        }
        let (keytab, handle) =
            KeytabWatcher::spawn(Arc::new(OnceSource), Keytab { version: 1, principals: vec![] }, std::time::Duration::from_millis(10));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(keytab.read().await.version, 2);
        handle.abort();
    }
}
