use super::protocol::Frame;

/// An item decoded off a connection's stream.
///
/// A connection to a Gearman server carries binary frames on every role
/// (client, worker, admin), and additionally carries line-oriented text on
/// admin connections (both directions: we write `status\n`, the server
/// writes back `OK ...\n` or multi-line `...\n.\n` bodies). The decoder
/// yields whichever of these was present next on the wire.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GearmanEvent {
    /// A fully parsed binary frame.
    Binary(Frame),
    /// A single `\n`-terminated text line (admin protocol).
    Text(String),
}
