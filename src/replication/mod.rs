// Replication: a write-ahead log shared between primary and secondary,
// a length-prefixed transport for the wire protocol, and the sync
// handshake that brings a secondary's on-disk state in line with the
// primary's, either by replaying the WAL tail or by a full directory copy.

pub mod protocol;
pub mod sync;
pub mod transport;
pub mod wal;
