use events::GearmanEvent;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{self, Framed};

use crate::error::GearmanError;

pub mod decoder;
pub mod encoder;
pub mod events;
pub mod protocol;

pub fn framed<T: AsyncRead + AsyncWrite>(stream: T) -> Framed<T, Codec> {
    Framed::new(stream, Codec::default())
}

/// The combined binary-plus-text Gearman wire codec.
#[derive(Default)]
pub struct Codec {
    d: decoder::Decoder,
    e: encoder::Encoder,
}

impl codec::Decoder for Codec {
    type Item = GearmanEvent;
    type Error = GearmanError;

    fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.d.decode(src)
    }
}

impl codec::Encoder<GearmanEvent> for Codec {
    type Error = GearmanError;

    fn encode(&mut self, item: GearmanEvent, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
        self.e.encode(item, dst)
    }
}
