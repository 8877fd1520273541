use bytes::BufMut;
use tokio_util::codec;

use super::events::GearmanEvent;
use super::protocol::MAGIC_REQ;
use crate::error::GearmanError as Error;

/// Encodes outbound [`GearmanEvent`]s: binary frames get the `\0REQ` header,
/// text lines get a trailing `\n`.
#[derive(Debug, Default)]
pub struct Encoder;

impl codec::Encoder<GearmanEvent> for Encoder {
    type Error = Error;

    fn encode(&mut self, item: GearmanEvent, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
        match item {
            GearmanEvent::Binary(frame) => {
                let payload_len: usize = frame.args.iter().map(|a| a.len()).sum::<usize>()
                    + frame.args.len().saturating_sub(1);

                dst.reserve(12 + payload_len);
                dst.put_slice(&MAGIC_REQ);
                dst.put_u32(frame.ptype.code());
                dst.put_u32(payload_len as u32);

                for (i, field) in frame.args.iter().enumerate() {
                    if i > 0 {
                        dst.put_u8(0);
                    }
                    dst.put_slice(field);
                }
            },
            GearmanEvent::Text(line) => {
                dst.reserve(line.len() + 1);
                dst.put_slice(line.as_bytes());
                dst.put_u8(b'\n');
            },
        }

        Ok(())
    }
}
