//! Consensus metadata: the Raft config and its persistence.
//!
//! `ConsensusMetadata` holds the durable trio (current term, voted-for,
//! committed config) plus the *transient* pending config, which is never
//! persisted until it commits. The file store writes a CRC-framed record
//! with temp-file + rename + fsync so a crash can never leave a torn vote
//! on disk.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tessera_core::{Error, LogIndex, PeerId, Result, TermId};

/// Magic bytes for the consensus metadata file ("TSCM").
const METADATA_MAGIC: u32 = 0x5453434D;

/// Current metadata format version.
const METADATA_VERSION: u32 = 1;

/// Membership role of a peer within a Raft config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberType {
    /// Full voting member.
    Voter,
    /// Non-voting replica serving reads.
    Observer,
    /// Being bootstrapped; promoted to voter on catch-up.
    PreVoter,
    /// Being bootstrapped; promoted to observer on catch-up.
    PreObserver,
    /// Not a participant (e.g. just removed).
    NonParticipant,
}

impl MemberType {
    /// True for the transient bootstrap member types.
    #[must_use]
    pub const fn is_transition(self) -> bool {
        matches!(self, Self::PreVoter | Self::PreObserver)
    }

    const fn as_u8(self) -> u8 {
        match self {
            Self::Voter => 0,
            Self::Observer => 1,
            Self::PreVoter => 2,
            Self::PreObserver => 3,
            Self::NonParticipant => 4,
        }
    }

    const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Voter),
            1 => Some(Self::Observer),
            2 => Some(Self::PreVoter),
            3 => Some(Self::PreObserver),
            4 => Some(Self::NonParticipant),
            _ => None,
        }
    }
}

/// A peer descriptor within a Raft config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftPeer {
    /// Permanent id.
    pub id: PeerId,
    /// Last-known address.
    pub addr: String,
    /// Membership role.
    pub member_type: MemberType,
}

impl RaftPeer {
    /// Creates a voting peer descriptor.
    #[must_use]
    pub fn voter(id: PeerId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
            member_type: MemberType::Voter,
        }
    }

    /// Creates a peer descriptor with the given member type.
    #[must_use]
    pub fn new(id: PeerId, addr: impl Into<String>, member_type: MemberType) -> Self {
        Self {
            id,
            addr: addr.into(),
            member_type,
        }
    }
}

/// An ordered set of peers plus the log index of the entry that installed
/// it (`None` while the config is still pending).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RaftConfig {
    /// Log index of the entry that installed this config.
    pub opid_index: Option<LogIndex>,
    /// Member peers.
    pub peers: Vec<RaftPeer>,
}

impl RaftConfig {
    /// Creates a pending config from peers.
    #[must_use]
    pub fn new(peers: Vec<RaftPeer>) -> Self {
        Self {
            opid_index: None,
            peers,
        }
    }

    /// Looks up a peer by id.
    #[must_use]
    pub fn peer(&self, id: PeerId) -> Option<&RaftPeer> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Returns true if the config contains the peer.
    #[must_use]
    pub fn contains(&self, id: PeerId) -> bool {
        self.peer(id).is_some()
    }

    /// Number of voting members.
    #[must_use]
    pub fn voter_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.member_type == MemberType::Voter)
            .count()
    }

    /// Majority size over the voting members: ⌊n/2⌋ + 1.
    #[must_use]
    pub fn majority_size(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    /// Iterates the voting members.
    pub fn voters(&self) -> impl Iterator<Item = &RaftPeer> {
        self.peers
            .iter()
            .filter(|p| p.member_type == MemberType::Voter)
    }

    /// Returns true if any peer is in a PRE_VOTER/PRE_OBSERVER transition,
    /// other than `except`.
    #[must_use]
    pub fn has_transitioning_peer_except(&self, except: Option<PeerId>) -> bool {
        self.peers
            .iter()
            .any(|p| p.member_type.is_transition() && Some(p.id) != except)
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self.opid_index {
            Some(index) => {
                buf.put_u8(1);
                buf.put_u64_le(index.get());
            }
            None => {
                buf.put_u8(0);
                buf.put_u64_le(0);
            }
        }
        // Peer count bounded by config validation; a tablet config is tiny.
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(self.peers.len() as u32);
        for peer in &self.peers {
            buf.put_u64_le(peer.id.get());
            buf.put_u8(peer.member_type.as_u8());
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u32_le(peer.addr.len() as u32);
            buf.put_slice(peer.addr.as_bytes());
        }
    }

    fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 13 {
            return Err(Error::corruption("raft config truncated"));
        }
        let has_index = buf.get_u8() == 1;
        let raw_index = buf.get_u64_le();
        let opid_index = has_index.then(|| LogIndex::new(raw_index));
        let count = buf.get_u32_le() as usize;
        let mut peers = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.remaining() < 13 {
                return Err(Error::corruption("raft peer truncated"));
            }
            let id = PeerId::new(buf.get_u64_le());
            let tag = buf.get_u8();
            let member_type = MemberType::from_u8(tag)
                .ok_or_else(|| Error::corruption(format!("unknown member type tag {tag}")))?;
            let addr_len = buf.get_u32_le() as usize;
            if buf.remaining() < addr_len {
                return Err(Error::corruption("raft peer address truncated"));
            }
            let addr_bytes = buf.copy_to_bytes(addr_len);
            let addr = String::from_utf8(addr_bytes.to_vec())
                .map_err(|_| Error::corruption("raft peer address is not utf-8"))?;
            peers.push(RaftPeer { id, addr, member_type });
        }
        Ok(Self { opid_index, peers })
    }
}

/// Encodes a config-change payload: old config followed by new config.
#[must_use]
pub fn encode_config_change(old_config: &RaftConfig, new_config: &RaftConfig) -> Bytes {
    let mut buf = BytesMut::new();
    old_config.encode(&mut buf);
    new_config.encode(&mut buf);
    buf.freeze()
}

/// Decodes a config-change payload into (old config, new config).
///
/// # Errors
/// Returns `Corruption` if the payload is malformed.
pub fn decode_config_change(payload: &Bytes) -> Result<(RaftConfig, RaftConfig)> {
    let mut buf = &payload[..];
    let old_config = RaftConfig::decode(&mut buf)?;
    let new_config = RaftConfig::decode(&mut buf)?;
    Ok((old_config, new_config))
}

/// The durable consensus metadata, plus the transient pending config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusMetadata {
    /// Latest term this replica has seen.
    pub current_term: TermId,
    /// Who we voted for in `current_term`, if anyone.
    pub voted_for: Option<PeerId>,
    /// The committed configuration.
    pub committed_config: RaftConfig,
    /// A proposed, not-yet-committed configuration. Never persisted.
    pub pending_config: Option<RaftConfig>,
}

impl ConsensusMetadata {
    /// Creates metadata for a fresh replica with the given initial config.
    #[must_use]
    pub fn new(committed_config: RaftConfig) -> Self {
        Self {
            current_term: TermId::new(0),
            voted_for: None,
            committed_config,
            pending_config: None,
        }
    }

    /// The active config: pending if set, committed otherwise.
    #[must_use]
    pub fn active_config(&self) -> &RaftConfig {
        self.pending_config.as_ref().unwrap_or(&self.committed_config)
    }

    /// Returns true if a config change is in flight.
    #[must_use]
    pub const fn has_pending_config(&self) -> bool {
        self.pending_config.is_some()
    }

    /// Serializes the durable fields (pending config is excluded).
    ///
    /// Format:
    /// ```text
    /// [magic: 4][version: 4][term: 8][voted flag: 1][voted_for: 8]
    /// [committed config][crc32: 4]
    /// ```
    #[must_use]
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(METADATA_MAGIC);
        buf.put_u32_le(METADATA_VERSION);
        buf.put_u64_le(self.current_term.get());
        match self.voted_for {
            Some(id) => {
                buf.put_u8(1);
                buf.put_u64_le(id.get());
            }
            None => {
                buf.put_u8(0);
                buf.put_u64_le(0);
            }
        }
        self.committed_config.encode(&mut buf);

        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    /// Deserializes metadata written by [`serialize`](Self::serialize).
    ///
    /// # Errors
    /// Returns `Corruption` on bad framing or checksum.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 4 + 4 + 8 + 9 + 4 {
            return Err(Error::corruption("consensus metadata truncated"));
        }
        let (body, crc_bytes) = data.split_at(data.len() - 4);
        let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let actual_crc = crc32fast::hash(body);
        if stored_crc != actual_crc {
            return Err(Error::corruption(format!(
                "consensus metadata checksum mismatch: stored {stored_crc:#010x}, computed {actual_crc:#010x}"
            )));
        }

        let mut buf = body;
        let magic = buf.get_u32_le();
        if magic != METADATA_MAGIC {
            return Err(Error::corruption("bad consensus metadata magic"));
        }
        let version = buf.get_u32_le();
        if version != METADATA_VERSION {
            return Err(Error::corruption("unsupported consensus metadata version"));
        }
        let current_term = TermId::new(buf.get_u64_le());
        let has_vote = buf.get_u8() == 1;
        let raw_vote = buf.get_u64_le();
        let voted_for = has_vote.then(|| PeerId::new(raw_vote));
        let committed_config = RaftConfig::decode(&mut buf)?;

        Ok(Self {
            current_term,
            voted_for,
            committed_config,
            pending_config: None,
        })
    }
}

/// Persistence seam for consensus metadata.
///
/// `flush` must be durable before it returns: a vote or term change is
/// never externally visible before it is on disk.
pub trait MetadataStore: Send + Sync {
    /// Persists the durable fields of the metadata.
    ///
    /// # Errors
    /// Returns an error if the write fails; the caller must not proceed.
    fn flush(&self, meta: &ConsensusMetadata) -> Result<()>;

    /// Loads previously-persisted metadata, or `None` on first start.
    ///
    /// # Errors
    /// Returns `Corruption` if the stored record is unreadable.
    fn load(&self) -> Result<Option<ConsensusMetadata>>;

    /// On-disk size of the last flushed record, in bytes.
    fn on_disk_size(&self) -> u64;
}

/// File-backed metadata store: temp file, fsync, rename.
pub struct FileMetadataStore {
    path: PathBuf,
    size: AtomicU64,
}

impl FileMetadataStore {
    /// Creates a store writing to the given path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            size: AtomicU64::new(0),
        }
    }
}

impl MetadataStore for FileMetadataStore {
    fn flush(&self, meta: &ConsensusMetadata) -> Result<()> {
        use std::io::Write;

        let data = meta.serialize();
        let temp_path = self.path.with_extension("tmp");

        let io_err = |e: std::io::Error| Error::remote(format!("metadata flush: {e}"));
        let mut file = std::fs::File::create(&temp_path).map_err(io_err)?;
        file.write_all(&data).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        std::fs::rename(&temp_path, &self.path).map_err(io_err)?;

        self.size.store(data.len() as u64, Ordering::Release);
        Ok(())
    }

    fn load(&self) -> Result<Option<ConsensusMetadata>> {
        match std::fs::read(&self.path) {
            Ok(data) => {
                self.size.store(data.len() as u64, Ordering::Release);
                ConsensusMetadata::deserialize(&data).map(Some)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::remote(format!("metadata load: {e}"))),
        }
    }

    fn on_disk_size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }
}

/// In-memory metadata store for tests.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    data: Mutex<Option<Bytes>>,
}

impl InMemoryMetadataStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn flush(&self, meta: &ConsensusMetadata) -> Result<()> {
        *self.data.lock().expect("metadata lock poisoned") = Some(meta.serialize());
        Ok(())
    }

    fn load(&self) -> Result<Option<ConsensusMetadata>> {
        let data = self.data.lock().expect("metadata lock poisoned");
        match data.as_ref() {
            Some(bytes) => ConsensusMetadata::deserialize(bytes).map(Some),
            None => Ok(None),
        }
    }

    fn on_disk_size(&self) -> u64 {
        self.data
            .lock()
            .expect("metadata lock poisoned")
            .as_ref()
            .map_or(0, |b| b.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> RaftConfig {
        RaftConfig {
            opid_index: Some(LogIndex::new(7)),
            peers: vec![
                RaftPeer::voter(PeerId::new(1), "10.0.0.1:9100"),
                RaftPeer::voter(PeerId::new(2), "10.0.0.2:9100"),
                RaftPeer::new(PeerId::new(3), "10.0.0.3:9100", MemberType::PreVoter),
            ],
        }
    }

    #[test]
    fn test_majority_over_voters_only() {
        let config = sample_config();
        assert_eq!(config.voter_count(), 2);
        assert_eq!(config.majority_size(), 2);
    }

    #[test]
    fn test_transitioning_peer_detection() {
        let config = sample_config();
        assert!(config.has_transitioning_peer_except(None));
        assert!(!config.has_transitioning_peer_except(Some(PeerId::new(3))));
    }

    #[test]
    fn test_metadata_serialize_roundtrip() {
        let mut meta = ConsensusMetadata::new(sample_config());
        meta.current_term = TermId::new(9);
        meta.voted_for = Some(PeerId::new(2));
        meta.pending_config = Some(RaftConfig::new(vec![RaftPeer::voter(
            PeerId::new(1),
            "10.0.0.1:9100",
        )]));

        let restored = ConsensusMetadata::deserialize(&meta.serialize()).unwrap();
        assert_eq!(restored.current_term, TermId::new(9));
        assert_eq!(restored.voted_for, Some(PeerId::new(2)));
        assert_eq!(restored.committed_config, meta.committed_config);
        // The pending config is transient and never persisted.
        assert!(restored.pending_config.is_none());
    }

    #[test]
    fn test_metadata_checksum_detects_corruption() {
        let meta = ConsensusMetadata::new(sample_config());
        let mut data = meta.serialize().to_vec();
        data[10] ^= 0xFF;
        assert!(ConsensusMetadata::deserialize(&data).unwrap_err().is_corruption());
    }

    #[test]
    fn test_config_change_payload_roundtrip() {
        let old_config = sample_config();
        let mut new_config = old_config.clone();
        new_config.opid_index = None;
        new_config.peers.retain(|p| p.id != PeerId::new(2));

        let payload = encode_config_change(&old_config, &new_config);
        let (decoded_old, decoded_new) = decode_config_change(&payload).unwrap();
        assert_eq!(decoded_old, old_config);
        assert_eq!(decoded_new, new_config);
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMetadataStore::new(dir.path().join("cmeta"));
        assert!(store.load().unwrap().is_none());

        let mut meta = ConsensusMetadata::new(sample_config());
        meta.current_term = TermId::new(4);
        store.flush(&meta).unwrap();
        assert!(store.on_disk_size() > 0);

        let restored = store.load().unwrap().unwrap();
        assert_eq!(restored.current_term, TermId::new(4));
    }
}
