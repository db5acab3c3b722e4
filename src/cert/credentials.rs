//! In-memory credential set with staging.
//!
//! ```text
//!   stage()          commit_staged()         confirm()
//!  ─────────▶ staged ───────────────▶ committed ─────────▶ previous dropped,
//!                     previous = old                     its id kept for revoke
//!                              │
//!                              └── rollback() ──▶ committed = previous
//! ```
//!
//! The transport only ever reads [`CredentialSet::active`], which is the
//! committed identity.  The previous identity stays in memory until the
//! new one has authenticated.

use core::fmt;

use crate::app::ports::TlsIdentity;

/// One certificate and its private key.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub certificate: String,
    pub private_key: String,
    /// Cloud-side identifier, needed to revoke this certificate later.
    /// Empty when unknown (e.g. factory-provisioned without an id).
    pub certificate_id: String,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("certificate_id", &self.certificate_id)
            .field("certificate_len", &self.certificate.len())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct CredentialSet {
    pub root_ca: String,
    pub endpoint: String,
    pub thing_name: String,
    committed: Option<Identity>,
    previous: Option<Identity>,
    staged: Option<Identity>,
    retired_certificate_id: Option<String>,
}

impl CredentialSet {
    pub fn new(root_ca: &str, endpoint: &str, thing_name: &str, committed: Option<Identity>) -> Self {
        Self {
            root_ca: root_ca.to_owned(),
            endpoint: endpoint.to_owned(),
            thing_name: thing_name.to_owned(),
            committed,
            ..Self::default()
        }
    }

    /// The identity the transport must present.
    pub fn active(&self) -> Option<&Identity> {
        self.committed.as_ref()
    }

    pub fn tls_identity(&self) -> Option<TlsIdentity<'_>> {
        self.committed.as_ref().map(|id| TlsIdentity {
            client_id: &self.thing_name,
            certificate: &id.certificate,
            private_key: &id.private_key,
            root_ca: &self.root_ca,
        })
    }

    /// Hold a new identity without exposing it to the transport.
    pub fn stage(&mut self, identity: Identity) {
        self.staged = Some(identity);
    }

    pub fn staged(&self) -> Option<&Identity> {
        self.staged.as_ref()
    }

    pub fn discard_staged(&mut self) {
        self.staged = None;
    }

    /// Swap the staged identity in, keeping the old one as `previous`.
    /// Returns `false` if nothing was staged.
    pub fn commit_staged(&mut self) -> bool {
        match self.staged.take() {
            Some(new) => {
                self.previous = self.committed.replace(new);
                true
            }
            None => false,
        }
    }

    /// The committed identity authenticated: release the previous one and
    /// remember its id for revocation.
    pub fn confirm(&mut self) {
        if let Some(old) = self.previous.take() {
            self.retired_certificate_id =
                (!old.certificate_id.is_empty()).then_some(old.certificate_id);
        }
    }

    /// The committed identity failed: put the previous one back.
    /// Returns `false` if there was nothing to roll back to.
    pub fn rollback(&mut self) -> bool {
        match self.previous.take() {
            Some(old) => {
                self.committed = Some(old);
                true
            }
            None => false,
        }
    }

    /// Replace the committed identity with the durably stored one.
    pub fn restore_committed(&mut self, stored: Identity) {
        self.committed = Some(stored);
        self.previous = None;
    }

    /// Id of the certificate replaced by the last confirmed rotation.
    pub fn retired_certificate_id(&self) -> Option<&str> {
        self.retired_certificate_id.as_deref()
    }

    pub fn clear_retired(&mut self) {
        self.retired_certificate_id = None;
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("thing_name", &self.thing_name)
            .field("endpoint", &self.endpoint)
            .field("committed", &self.committed)
            .field("staged", &self.staged.is_some())
            .field("previous", &self.previous.is_some())
            .finish_non_exhaustive()
    }
}
