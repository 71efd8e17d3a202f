//! In-memory credential registry

use super::{
    parse_duration, AuthError, ClientCredential, ClientId, ClientSummary, Clock, Secret,
    SystemClock,
};
use crate::crypto::ClientKey;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// On-disk form of a credential snapshot
#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    clients: Vec<ClientCredential>,
}

/// Registry of client credentials
///
/// Each record is guarded by its map shard, so a reader never sees a record
/// half-way through a block, unblock or counter update.
pub struct CredentialStore {
    clients: DashMap<ClientId, ClientCredential>,
    /// Traffic accumulated since the last `sync_file`
    unsynced: DashMap<ClientId, (u64, u64)>,
    clock: Arc<dyn Clock>,
}

impl CredentialStore {
    /// Create an empty store on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store with an explicit time source
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clients: DashMap::new(),
            unsynced: DashMap::new(),
            clock,
        }
    }

    /// Issue a new credential valid for `duration` from now
    ///
    /// The returned record is the only place the secret and key are handed
    /// out; callers pass them to the client out of band.
    pub fn create(&self, duration: Duration) -> Result<ClientCredential, AuthError> {
        let invalid = || AuthError::InvalidDuration(format!("{:?}", duration));
        let validity = chrono::Duration::from_std(duration).map_err(|_| invalid())?;

        let created_at = self.clock.now();
        let expires_at = created_at.checked_add_signed(validity).ok_or_else(invalid)?;

        let credential = ClientCredential {
            id: ClientId::generate()?,
            secret: Secret::generate()?,
            key: ClientKey::generate()?,
            created_at,
            expires_at,
            blocked: false,
            bytes_up: 0,
            bytes_down: 0,
        };

        self.clients.insert(credential.id, credential.clone());
        info!("Issued client {} (expires {})", credential.id, expires_at);

        Ok(credential)
    }

    /// Issue a credential from an admin duration string such as `"24h"` or `"7d"`
    pub fn create_from_str(&self, duration: &str) -> Result<ClientCredential, AuthError> {
        self.create(parse_duration(duration)?)
    }

    /// Find a credential that may currently open a session
    ///
    /// Unknown, blocked and expired identities all report `None`.
    pub fn lookup(&self, id: &ClientId) -> Option<ClientCredential> {
        let now = self.clock.now();
        self.clients
            .get(id)
            .filter(|entry| entry.is_usable_at(now))
            .map(|entry| entry.value().clone())
    }

    /// Look up `id` and check `secret` in constant time
    pub fn verify(&self, id: &ClientId, secret: &Secret) -> Option<ClientCredential> {
        self.lookup(id).filter(|credential| credential.secret.verify(secret))
    }

    /// Fetch a record regardless of block or expiry state
    pub fn get(&self, id: &ClientId) -> Option<ClientCredential> {
        self.clients.get(id).map(|entry| entry.value().clone())
    }

    /// Remove a credential. Returns whether it existed.
    pub fn delete(&self, id: &ClientId) -> bool {
        let existed = self.clients.remove(id).is_some();
        if existed {
            info!("Deleted client {}", id);
        }
        existed
    }

    /// Block a credential. Returns whether it exists.
    pub fn block(&self, id: &ClientId) -> bool {
        self.set_blocked(id, true)
    }

    /// Unblock a credential. Returns whether it exists.
    pub fn unblock(&self, id: &ClientId) -> bool {
        self.set_blocked(id, false)
    }

    fn set_blocked(&self, id: &ClientId, blocked: bool) -> bool {
        match self.clients.get_mut(id) {
            Some(mut entry) => {
                entry.blocked = blocked;
                info!("Client {} {}", id, if blocked { "blocked" } else { "unblocked" });
                true
            }
            None => false,
        }
    }

    /// Snapshot of every record, including secrets and keys
    pub fn list(&self) -> Vec<ClientCredential> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Snapshot of every record with secrets and keys removed
    pub fn list_summaries(&self) -> Vec<ClientSummary> {
        self.clients.iter().map(|entry| entry.value().summary()).collect()
    }

    /// Add session traffic to a client's counters
    ///
    /// A client deleted while its session was running is skipped.
    pub fn accumulate(&self, id: &ClientId, up: u64, down: u64) {
        match self.clients.get_mut(id) {
            Some(mut entry) => {
                entry.bytes_up = entry.bytes_up.saturating_add(up);
                entry.bytes_down = entry.bytes_down.saturating_add(down);
                let mut pending = self.unsynced.entry(*id).or_insert((0, 0));
                pending.0 = pending.0.saturating_add(up);
                pending.1 = pending.1.saturating_add(down);
            }
            None => debug!("Dropping traffic for deleted client {} ({} up, {} down)", id, up, down),
        }
    }

    /// Number of stored credentials
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Insert previously exported records, replacing any with the same identity
    pub fn import(&self, credentials: impl IntoIterator<Item = ClientCredential>) -> usize {
        let mut count = 0;
        for credential in credentials {
            self.clients.insert(credential.id, credential);
            count += 1;
        }
        count
    }

    /// Load credentials from a TOML file
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<usize, AuthError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AuthError::File(format!("Failed to read credentials: {}", e)))?;

        let file: CredentialFile = toml::from_str(&content)
            .map_err(|e| AuthError::File(format!("Failed to parse credentials: {}", e)))?;

        Ok(self.import(file.clients))
    }

    /// Write every credential to a TOML file
    ///
    /// The file holds bearer secrets, so on Unix it is restricted to the owner.
    pub fn save_file<P: AsRef<Path>>(&self, path: P) -> Result<(), AuthError> {
        let mut clients = self.list();
        clients.sort_by_key(|c| c.created_at);

        let content = toml::to_string_pretty(&CredentialFile { clients })
            .map_err(|e| AuthError::File(format!("Failed to serialize credentials: {}", e)))?;

        write_private(path.as_ref(), content.as_bytes())
            .map_err(|e| AuthError::File(format!("Failed to write credentials: {}", e)))
    }

    /// Merge this store's traffic into the credentials file and adopt its records
    ///
    /// The file is the authority for which credentials exist and whether they
    /// are blocked: it is re-read, the traffic accumulated here since the last
    /// sync is added to its counters, and the result is written back and
    /// loaded in place of the in-memory records. Credentials issued, blocked
    /// or deleted by another process in the meantime are kept.
    pub fn sync_file<P: AsRef<Path>>(&self, path: P) -> Result<usize, AuthError> {
        let path = path.as_ref();

        let disk = CredentialStore::with_clock(Arc::clone(&self.clock));
        if path.exists() {
            disk.load_file(path)?;
        }

        let ids: Vec<ClientId> = self.unsynced.iter().map(|entry| *entry.key()).collect();
        let pending: Vec<(ClientId, (u64, u64))> =
            ids.iter().filter_map(|id| self.unsynced.remove(id)).collect();
        for (id, (up, down)) in &pending {
            disk.accumulate(id, *up, *down);
        }

        if let Err(e) = disk.save_file(path) {
            for (id, (up, down)) in pending {
                let mut entry = self.unsynced.entry(id).or_insert((0, 0));
                entry.0 = entry.0.saturating_add(up);
                entry.1 = entry.1.saturating_add(down);
            }
            return Err(e);
        }

        self.clients.retain(|id, _| disk.clients.contains_key(id));
        let count = self.import(disk.list());
        debug!("Synced {} credential(s) with {}", count, path.display());
        Ok(count)
    }
}

fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(content)?;
    file.flush()
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}
