use bytes::{Buf, Bytes};
use tokio_util::codec;

use super::events::GearmanEvent;
use super::protocol::{Frame, PacketType, MAGIC_RES};
use crate::error::GearmanError as Error;

/// Header size: 4-byte magic, 4-byte type, 4-byte payload length.
const HEADER_LEN: usize = 12;

/// Decodes a stream mixing binary Gearman frames and admin text lines.
///
/// Disambiguation follows the protocol directly: a leading NUL byte begins a
/// binary frame (`\0RES` is the only magic we accept from a server), any
/// other byte begins a `\n`-terminated text line. Because binary frames are
/// length-prefixed, no multi-step state machine is needed across calls the
/// way a line-scanning parser would need one: we simply wait for the full
/// frame's bytes to arrive before consuming anything.
#[derive(Debug, Default)]
pub struct Decoder;

impl codec::Decoder for Decoder {
    type Item = GearmanEvent;
    type Error = Error;

    fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        if src[0] == 0 {
            decode_binary(src)
        } else {
            decode_text(src)
        }
    }
}

fn decode_binary(src: &mut bytes::BytesMut) -> Result<Option<GearmanEvent>, Error> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }

    if src[0..4] != MAGIC_RES {
        return Err(Error::protocol(format!(
            "bad magic in binary frame: {:?}",
            &src[0..4]
        )));
    }

    let type_code = u32::from_be_bytes(src[4..8].try_into().unwrap());
    let payload_len = u32::from_be_bytes(src[8..12].try_into().unwrap()) as usize;

    let ptype = PacketType::from_u32(type_code)
        .ok_or_else(|| Error::protocol(format!("unknown command type {type_code}")))?;

    let total_len = HEADER_LEN + payload_len;
    if src.len() < total_len {
        src.reserve(total_len - src.len());
        return Ok(None);
    }

    // Panic safety: split_to requires src.len() >= idx, which we've just
    // ensured holds for total_len.
    let mut frame = src.split_to(total_len);
    frame.advance(HEADER_LEN);
    let payload = frame.freeze();

    let args = split_fields(payload, ptype.field_names().len())?;

    Ok(Some(GearmanEvent::Binary(Frame::new(ptype, args))))
}

/// Splits a payload into `n` NUL-separated fields; the final field keeps any
/// NULs it contains rather than being split further.
fn split_fields(payload: Bytes, n: usize) -> Result<Vec<Bytes>, Error> {
    if n == 0 {
        return if payload.is_empty() {
            Ok(Vec::new())
        } else {
            Err(Error::protocol("expected empty payload, got trailing bytes"))
        };
    }

    let mut fields = Vec::with_capacity(n);
    let mut remaining = payload;

    for _ in 0..n - 1 {
        let idx = remaining
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::protocol("missing NUL field separator"))?;

        let field = remaining.split_to(idx);
        remaining.advance(1); // discard the separator itself
        fields.push(field);
    }

    fields.push(remaining);

    Ok(fields)
}

fn decode_text(src: &mut bytes::BytesMut) -> Result<Option<GearmanEvent>, Error> {
    let Some(idx) = src.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };

    let mut line = src.split_to(idx + 1);
    line.truncate(idx); // drop the trailing \n

    let line = String::from_utf8(line.to_vec())
        .map_err(|_| Error::protocol("admin text line was not valid UTF-8"))?;

    Ok(Some(GearmanEvent::Text(line)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;
    use tokio_util::codec::FramedRead;

    fn binary_frame(ptype: PacketType, fields: &[&[u8]]) -> Vec<u8> {
        let payload = fields.join(&0u8);
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC_RES);
        buf.extend_from_slice(&ptype.code().to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        buf
    }

    #[tokio::test]
    async fn decodes_a_single_binary_frame() {
        let stream = binary_frame(PacketType::JobCreated, &[b"H:1"]);
        let mut framed = FramedRead::new(stream.as_slice(), Decoder);

        let GearmanEvent::Binary(frame) = framed.next().await.unwrap().unwrap() else {
            panic!("expected a binary frame");
        };
        assert_eq!(frame.ptype, PacketType::JobCreated);
        assert_eq!(frame.args, vec![Bytes::from_static(b"H:1")]);

        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn decodes_a_frame_whose_final_field_contains_nuls() {
        let stream = binary_frame(PacketType::WorkComplete, &[b"H:2", b"a\0b\0c"]);
        let mut framed = FramedRead::new(stream.as_slice(), Decoder);

        let GearmanEvent::Binary(frame) = framed.next().await.unwrap().unwrap() else {
            panic!("expected a binary frame");
        };
        assert_eq!(frame.args[1], Bytes::from_static(b"a\0b\0c"));
    }

    #[tokio::test]
    async fn partial_frame_awaits_more_bytes() {
        let stream = binary_frame(PacketType::Noop, &[]);
        // Feed the header first, then the rest, one byte at a time.
        let mut framed = FramedRead::new(std::io::Cursor::new(stream.clone()), Decoder);
        let evt = framed.next().await.unwrap().unwrap();
        assert_eq!(evt, GearmanEvent::Binary(Frame::new(PacketType::Noop, vec![])));
    }

    #[tokio::test]
    async fn rejects_bad_magic() {
        let mut bad = binary_frame(PacketType::Noop, &[]);
        bad[1] = b'X';
        let mut framed = FramedRead::new(bad.as_slice(), Decoder);
        assert!(framed.next().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn decodes_text_line() {
        let stream = b"status\n".to_vec();
        let mut framed = FramedRead::new(stream.as_slice(), Decoder);
        assert_eq!(
            framed.next().await.unwrap().unwrap(),
            GearmanEvent::Text("status".to_string())
        );
    }

    #[tokio::test]
    async fn ten_megabyte_payload_survives_one_byte_chunks() {
        let big = vec![b'x'; 10 * 1024 * 1024];
        let stream = binary_frame(PacketType::WorkComplete, &[b"H:1", &big]);

        // Feed byte-by-byte through BytesMut manually to simulate partial
        // socket reads, rather than relying on FramedRead's own chunking.
        use bytes::BytesMut;
        use tokio_util::codec::Decoder as _;

        let mut decoder = Decoder;
        let mut buf = BytesMut::new();
        let mut result = None;
        for byte in &stream {
            buf.extend_from_slice(&[*byte]);
            if let Some(evt) = decoder.decode(&mut buf).unwrap() {
                result = Some(evt);
                break;
            }
        }

        let GearmanEvent::Binary(frame) = result.expect("frame should decode") else {
            panic!("expected binary frame");
        };
        assert_eq!(frame.args[1].len(), big.len());
    }
}
