//! Credential store — device identity persisted through a [`StoragePort`].
//!
//! ## NVS layout (namespace `aws`)
//!
//! | Key           | Content                                         |
//! |---------------|-------------------------------------------------|
//! | `certificate` | PEM-encoded device certificate                  |
//! | `private_key` | PEM-encoded private key                         |
//! | `root_ca`     | PEM-encoded CA certificate chain                |
//! | `endpoint`    | Broker host name                                |
//! | `thing_name`  | Device identity name                            |
//! | `cert_id`     | Cloud id of the stored certificate              |
//! | `onboarding`  | `1` while fleet provisioning is still pending   |
//! | `claim_cert`  | Fleet provisioning claim certificate            |
//! | `claim_key`   | Fleet provisioning claim private key            |
//!
//! ## Identity journal
//!
//! The certificate, key and id are three NVS entries, and NVS only commits
//! one entry at a time.  A replacement identity is first written to the
//! `next_*` keys; writing `next_ready` is the commit point.  Once the
//! marker is set the `next_*` triple is the stored identity, and it is
//! folded into the main keys and cleared.  A failure before the marker
//! leaves the previous identity intact.

use log::{info, warn};

use crate::app::ports::{StorageError, StoragePort};
use crate::cert::credentials::{CredentialSet, Identity};

pub const NAMESPACE: &str = "aws";

const KEY_CERT: &str = "certificate";
const KEY_PRIVATE_KEY: &str = "private_key";
const KEY_ROOT_CA: &str = "root_ca";
const KEY_ENDPOINT: &str = "endpoint";
const KEY_THING_NAME: &str = "thing_name";
const KEY_CERT_ID: &str = "cert_id";
const KEY_ONBOARDING: &str = "onboarding";
const KEY_CLAIM_CERT: &str = "claim_cert";
const KEY_CLAIM_KEY: &str = "claim_key";

const KEY_NEXT_CERT: &str = "next_cert";
const KEY_NEXT_KEY: &str = "next_key";
const KEY_NEXT_CERT_ID: &str = "next_cert_id";
const KEY_NEXT_READY: &str = "next_ready";

const MAIN_KEYS: [&str; 3] = [KEY_CERT, KEY_PRIVATE_KEY, KEY_CERT_ID];
const NEXT_KEYS: [&str; 3] = [KEY_NEXT_CERT, KEY_NEXT_KEY, KEY_NEXT_CERT_ID];

/// Maximum PEM size (certificate chain or key, headers included).
const MAX_PEM_SIZE: usize = 4096;

pub struct CredentialStore<'a> {
    storage: &'a mut dyn StoragePort,
}

impl<'a> CredentialStore<'a> {
    pub fn new(storage: &'a mut dyn StoragePort) -> Self {
        Self { storage }
    }

    /// Load the full credential set.  A missing certificate or key yields a
    /// set with no committed identity; missing connection fields are errors.
    pub fn load(&self) -> Result<CredentialSet, StorageError> {
        let root_ca = self.read_string(KEY_ROOT_CA)?;
        let endpoint = self.read_string(KEY_ENDPOINT)?;
        let thing_name = self.read_string(KEY_THING_NAME)?;
        let identity = self.load_identity()?;

        info!(
            "CredentialStore: loaded '{}' (identity {})",
            thing_name,
            if identity.is_some() { "present" } else { "absent" }
        );
        Ok(CredentialSet::new(&root_ca, &endpoint, &thing_name, identity))
    }

    /// Credential set for the provisioning connection: the claim identity
    /// under a temporary thing name.
    pub fn load_for_onboarding(&self, thing_name: &str) -> Result<CredentialSet, StorageError> {
        let root_ca = self.read_string(KEY_ROOT_CA)?;
        let endpoint = self.read_string(KEY_ENDPOINT)?;
        let claim = self.load_claim_identity()?;
        info!("CredentialStore: onboarding as '{}' with claim identity", thing_name);
        Ok(CredentialSet::new(&root_ca, &endpoint, thing_name, Some(claim)))
    }

    /// The stored device identity, if one has been provisioned.
    pub fn load_identity(&self) -> Result<Option<Identity>, StorageError> {
        if self.journal_committed() {
            // A committed journal entry must be complete.
            return self
                .read_identity(NEXT_KEYS)
                .and_then(|id| id.ok_or(StorageError::Corrupted))
                .map(Some);
        }
        self.read_identity(MAIN_KEYS)
    }

    /// The fleet provisioning claim identity, used only while onboarding.
    pub fn load_claim_identity(&self) -> Result<Identity, StorageError> {
        Ok(Identity {
            certificate: self.read_string(KEY_CLAIM_CERT)?,
            private_key: self.read_string(KEY_CLAIM_KEY)?,
            certificate_id: String::new(),
        })
    }

    /// Durably replace the stored identity.
    ///
    /// Either the new identity is stored or, on `Err`, the previous one
    /// still is.  A failure after the commit point is only logged; the
    /// next persist or load picks the journal up.
    pub fn persist_identity(&mut self, identity: &Identity) -> Result<(), StorageError> {
        if self.journal_committed() {
            // An earlier fold was interrupted; finish it before reusing the journal.
            self.fold_journal()?;
        }
        let values = [
            identity.certificate.as_str(),
            identity.private_key.as_str(),
            identity.certificate_id.as_str(),
        ];
        for (key, value) in NEXT_KEYS.iter().zip(values) {
            self.storage.write(NAMESPACE, key, value.as_bytes())?;
        }
        self.storage.write(NAMESPACE, KEY_NEXT_READY, &[1])?;

        if let Err(e) = self.fold_journal() {
            warn!("CredentialStore: identity committed, fold deferred: {}", e);
        }
        info!(
            "CredentialStore: persisted certificate {}",
            identity.certificate_id
        );
        Ok(())
    }

    /// Store the connection parameters written at provisioning time.
    pub fn store_connection(
        &mut self,
        root_ca: &str,
        endpoint: &str,
        thing_name: &str,
    ) -> Result<(), StorageError> {
        self.storage
            .write(NAMESPACE, KEY_ROOT_CA, root_ca.as_bytes())?;
        self.storage
            .write(NAMESPACE, KEY_ENDPOINT, endpoint.as_bytes())?;
        self.storage
            .write(NAMESPACE, KEY_THING_NAME, thing_name.as_bytes())
    }

    /// Onboarding is pending until explicitly disabled.  With no flag
    /// stored it is pending exactly when no certificate is stored.
    pub fn is_onboarding_enabled(&self) -> bool {
        let mut flag = [0u8; 1];
        match self.storage.read(NAMESPACE, KEY_ONBOARDING, &mut flag) {
            Ok(1) => flag[0] != 0,
            _ => !self.storage.exists(NAMESPACE, KEY_CERT) && !self.journal_committed(),
        }
    }

    pub fn disable_onboarding(&mut self) -> Result<(), StorageError> {
        self.storage.write(NAMESPACE, KEY_ONBOARDING, &[0])
    }

    /// Store the claim identity and mark onboarding pending.
    pub fn store_claim(&mut self, claim: &Identity) -> Result<(), StorageError> {
        self.storage
            .write(NAMESPACE, KEY_CLAIM_CERT, claim.certificate.as_bytes())?;
        self.storage
            .write(NAMESPACE, KEY_CLAIM_KEY, claim.private_key.as_bytes())?;
        self.storage.write(NAMESPACE, KEY_ONBOARDING, &[1])
    }

    /// Record the thing name assigned at provisioning time.
    pub fn store_thing_name(&mut self, thing_name: &str) -> Result<(), StorageError> {
        self.storage
            .write(NAMESPACE, KEY_THING_NAME, thing_name.as_bytes())
    }

    fn journal_committed(&self) -> bool {
        let mut flag = [0u8; 1];
        matches!(self.storage.read(NAMESPACE, KEY_NEXT_READY, &mut flag), Ok(1) if flag[0] != 0)
    }

    /// Copy the committed journal into the main keys and clear it.
    fn fold_journal(&mut self) -> Result<(), StorageError> {
        for (next, main) in NEXT_KEYS.iter().zip(MAIN_KEYS) {
            let value = self.read_string(next)?;
            self.storage.write(NAMESPACE, main, value.as_bytes())?;
        }
        self.storage.delete(NAMESPACE, KEY_NEXT_READY)?;
        for next in NEXT_KEYS {
            self.storage.delete(NAMESPACE, next)?;
        }
        Ok(())
    }

    fn read_identity(&self, [cert, key, cert_id]: [&str; 3]) -> Result<Option<Identity>, StorageError> {
        let certificate = match self.read_string(cert) {
            Ok(c) => c,
            Err(StorageError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        let private_key = match self.read_string(key) {
            Ok(k) => k,
            Err(StorageError::NotFound) => {
                warn!("CredentialStore: certificate without private key");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let certificate_id = match self.read_string(cert_id) {
            Ok(id) => id,
            Err(StorageError::NotFound) => String::new(),
            Err(e) => return Err(e),
        };
        Ok(Some(Identity {
            certificate,
            private_key,
            certificate_id,
        }))
    }

    fn read_string(&self, key: &str) -> Result<String, StorageError> {
        let mut buf = vec![0u8; MAX_PEM_SIZE];
        let len = self.storage.read(NAMESPACE, key, &mut buf)?;
        buf.truncate(len);
        // Values written for mbedTLS may carry a trailing NUL.
        if buf.last() == Some(&0) {
            buf.pop();
        }
        String::from_utf8(buf).map_err(|_| StorageError::Corrupted)
    }
}

// ── Tests ────────────────────────────────────────────────────
