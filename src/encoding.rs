//! Pluggable payload codec, applied to job data independently of the wire
//! framing. The default requires no transformation at all.

use bytes::Bytes;

use crate::error::Result;

/// Encodes/decodes job payloads. The wire protocol only ever sees bytes;
/// this is where an application can plug in JSON, msgpack, or similar.
pub trait DataEncoder: Send + Sync {
    fn encode(&self, data: &[u8]) -> Result<Bytes>;
    fn decode(&self, data: &[u8]) -> Result<Bytes>;
}

/// Identity codec: payloads pass through unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopEncoder;

impl DataEncoder for NoopEncoder {
    fn encode(&self, data: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }

    fn decode(&self, data: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_encoder_is_identity() {
        let enc = NoopEncoder;
        let data = b"hello";
        assert_eq!(enc.encode(data).unwrap(), Bytes::from_static(data));
        assert_eq!(enc.decode(data).unwrap(), Bytes::from_static(data));
    }
}
