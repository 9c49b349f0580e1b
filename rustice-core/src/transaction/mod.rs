//! Transaction identities and the in-flight transaction table.
//!
//! A transaction id correlates a request with its response (or timeout)
//! no matter which worker decodes the response datagram. Ids are plain
//! byte sequences; the table maps them to the shared transaction state,
//! so resolving the bytes of an in-flight transaction always yields the
//! same instance and whatever application data was attached to it.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;

/// Id length negotiated by the current protocol revision.
pub const TRANSACTION_ID_LEN: usize = 12;
/// Id length used by the legacy revision, which had no magic cookie.
pub const LEGACY_TRANSACTION_ID_LEN: usize = 16;

/// Unique correlation key for one request/response exchange.
///
/// The leftmost half holds the low-order bytes of a monotonically
/// increasing time value, the rightmost half a random 64-bit value,
/// least-significant bytes first in both. Adjacent ids therefore differ
/// in their first bytes, so equality checks against a table of live
/// transactions bail out early in the common miss case.
#[derive(Clone, Copy, Eq)]
pub struct TransactionId {
    bytes: [u8; LEGACY_TRANSACTION_ID_LEN],
    len: u8,
    hash: u32,
}

impl TransactionId {
    pub fn new() -> Self {
        Self::generate(TRANSACTION_ID_LEN)
    }
    pub fn new_legacy() -> Self {
        Self::generate(LEGACY_TRANSACTION_ID_LEN)
    }
    fn generate(len: usize) -> Self {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let random: u64 = rand::random();
        let mut bytes = [0u8; LEGACY_TRANSACTION_ID_LEN];
        let half = len / 2;
        for i in 0..half {
            bytes[i] = (time >> (i * 8)) as u8;
        }
        for i in half..len {
            bytes[i] = (random >> ((i - half) * 8)) as u8;
        }
        Self::assemble(bytes, len)
    }
    /// Wraps raw id bytes, e.g. taken out of a received message header.
    /// A 16-byte input is a legacy id; anything else is coerced into the
    /// current 12-byte form, truncating or zero-padding as needed.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let len = if bytes.len() == LEGACY_TRANSACTION_ID_LEN {
            LEGACY_TRANSACTION_ID_LEN
        } else {
            TRANSACTION_ID_LEN
        };
        let mut buf = [0u8; LEGACY_TRANSACTION_ID_LEN];
        let n = bytes.len().min(len);
        buf[..n].copy_from_slice(&bytes[..n]);
        Self::assemble(buf, len)
    }
    fn assemble(bytes: [u8; LEGACY_TRANSACTION_ID_LEN], len: usize) -> Self {
        // Lookup hash from the first four bytes only; equality still
        // compares the whole sequence.
        let hash = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Self {
            bytes,
            len: len as u8,
            hash,
        }
    }
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.len as usize
    }
    #[inline]
    pub fn is_legacy(&self) -> bool {
        self.len as usize == LEGACY_TRANSACTION_ID_LEN
    }
    #[inline]
    pub fn lookup_hash(&self) -> u32 {
        self.hash
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for TransactionId {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Hash for TransactionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.hash);
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({self})")
    }
}

/// Shared state of one in-flight transaction.
///
/// The id never changes; the application-data slot is the one mutable
/// part, letting the issuer stash caller context that the response path
/// later picks up.
pub struct StunTransaction {
    id: TransactionId,
    application_data: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl StunTransaction {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            application_data: Mutex::new(None),
        }
    }
    #[inline]
    pub fn id(&self) -> &TransactionId {
        &self.id
    }
    pub fn set_application_data(&self, data: Box<dyn Any + Send + Sync>) {
        self.application_data.lock().replace(data);
    }
    pub fn take_application_data(&self) -> Option<Box<dyn Any + Send + Sync>> {
        self.application_data.lock().take()
    }
    pub fn has_application_data(&self) -> bool {
        self.application_data.lock().is_some()
    }
}

/// Live client and server transactions, keyed by id bytes.
#[derive(Clone, Default)]
pub struct TransactionTable {
    client: Arc<DashMap<TransactionId, Arc<StunTransaction>>>,
    server: Arc<DashMap<TransactionId, Arc<StunTransaction>>>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }
    /// Registers a client transaction. Registering an id that is already
    /// tracked hands back the tracked instance instead of replacing it.
    pub fn register_client(&self, id: TransactionId) -> Arc<StunTransaction> {
        self.client
            .entry(id)
            .or_insert_with(|| Arc::new(StunTransaction::new(id)))
            .clone()
    }
    pub fn remove_client(&self, id: &TransactionId) -> Option<Arc<StunTransaction>> {
        self.client.remove(id).map(|(_, t)| t)
    }
    pub fn register_server(&self, id: TransactionId) -> Arc<StunTransaction> {
        self.server
            .entry(id)
            .or_insert_with(|| Arc::new(StunTransaction::new(id)))
            .clone()
    }
    pub fn remove_server(&self, id: &TransactionId) -> Option<Arc<StunTransaction>> {
        self.server.remove(id).map(|(_, t)| t)
    }
    /// Maps raw id bytes to the transaction state that owns them.
    ///
    /// If a client or server transaction is tracking the id, its existing
    /// instance is returned, application data and all. Unknown ids get a
    /// fresh untracked wrapper with equal bytes. Never fails; odd input
    /// lengths only influence the legacy flag of the wrapped id.
    pub fn resolve(&self, bytes: &[u8]) -> Arc<StunTransaction> {
        let id = TransactionId::from_bytes(bytes);
        if let Some(t) = self.client.get(&id) {
            return t.clone();
        }
        if let Some(t) = self.server.get(&id) {
            return t.clone();
        }
        Arc::new(StunTransaction::new(id))
    }
    pub fn client_count(&self) -> usize {
        self.client.len()
    }
    pub fn server_count(&self) -> usize {
        self.server.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn generated_ids_are_unique() {
        let a = TransactionId::new();
        let b = TransactionId::new();
        assert_eq!(a.byte_len(), TRANSACTION_ID_LEN);
        assert!(!a.is_legacy());
        assert_ne!(a, b);
    }

    #[test]
    fn legacy_ids_are_sixteen_bytes() {
        let id = TransactionId::new_legacy();
        assert_eq!(id.byte_len(), LEGACY_TRANSACTION_ID_LEN);
        assert!(id.is_legacy());
    }

    #[test]
    fn time_half_holds_millis_least_significant_first() {
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let id = TransactionId::new();
        let after = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let mut le = [0u8; 8];
        le[..6].copy_from_slice(&id.as_bytes()[..6]);
        let embedded = u64::from_le_bytes(le);
        // Only the low 48 bits of the clock fit in the time half.
        assert!(embedded >= before & 0x0000_ffff_ffff_ffff);
        assert!(embedded <= after & 0x0000_ffff_ffff_ffff);
    }

    #[test]
    fn lookup_hash_comes_from_first_four_bytes() {
        let id = TransactionId::from_bytes(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(id.lookup_hash(), u32::from_le_bytes([1, 2, 3, 4]));
    }

    #[test]
    fn equality_is_byte_based_and_map_safe() {
        let raw = [9u8; 12];
        let a = TransactionId::from_bytes(&raw);
        let b = TransactionId::from_bytes(&raw);
        assert_eq!(a, b);
        let mut map = HashMap::new();
        map.insert(a, 1u8);
        assert_eq!(map.get(&b), Some(&1));
    }

    #[test]
    fn odd_lengths_coerce_into_current_mode() {
        let id = TransactionId::from_bytes(&[0xaa; 5]);
        assert_eq!(id.byte_len(), TRANSACTION_ID_LEN);
        assert!(!id.is_legacy());
        assert_eq!(&id.as_bytes()[..5], &[0xaa; 5]);
        assert_eq!(&id.as_bytes()[5..], &[0u8; 7]);
    }

    #[test]
    fn display_is_lowercase_hex() {
        let id = TransactionId::from_bytes(&[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(id.to_string(), "deadbeef0000000000000001");
    }

    #[test]
    fn resolve_returns_tracked_client_instance() {
        let table = TransactionTable::new();
        let id = TransactionId::new();
        let tracked = table.register_client(id);
        tracked.set_application_data(Box::new(7u32));

        let resolved = table.resolve(id.as_bytes());
        assert!(Arc::ptr_eq(&tracked, &resolved));
        let data = resolved.take_application_data().unwrap();
        assert_eq!(*data.downcast::<u32>().unwrap(), 7);
    }

    #[test]
    fn resolve_returns_tracked_server_instance() {
        let table = TransactionTable::new();
        let id = TransactionId::new_legacy();
        let tracked = table.register_server(id);
        let resolved = table.resolve(id.as_bytes());
        assert!(Arc::ptr_eq(&tracked, &resolved));
        assert!(resolved.id().is_legacy());
    }

    #[test]
    fn resolve_of_unknown_id_wraps_fresh() {
        let table = TransactionTable::new();
        let id = TransactionId::new();
        let a = table.resolve(id.as_bytes());
        let b = table.resolve(id.as_bytes());
        assert_eq!(a.id(), b.id());
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn reregistering_preserves_application_data() {
        let table = TransactionTable::new();
        let id = TransactionId::new();
        let first = table.register_client(id);
        first.set_application_data(Box::new("ctx"));
        let second = table.register_client(id);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.has_application_data());
        table.remove_client(&id);
        assert_eq!(table.client_count(), 0);
    }
}
