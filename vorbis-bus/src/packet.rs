use bytes::Bytes;
use ogg_next_sys::ogg_packet;

use crate::error::{Error, Result};

/// One coded packet handed between the codec and the container layer.
///
/// An empty payload stands for a null native payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketBuffer {
    payload: Bytes,
    stream_start: bool,
    stream_end: bool,
    granule_position: i64,
    sequence_number: i64,
}

impl PacketBuffer {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_granule_position(mut self, granule_position: i64) -> Self {
        self.granule_position = granule_position;
        self
    }

    pub fn with_sequence_number(mut self, sequence_number: i64) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn with_stream_start(mut self, stream_start: bool) -> Self {
        self.stream_start = stream_start;
        self
    }

    pub fn with_stream_end(mut self, stream_end: bool) -> Self {
        self.stream_end = stream_end;
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn is_stream_start(&self) -> bool {
        self.stream_start
    }

    pub fn is_stream_end(&self) -> bool {
        self.stream_end
    }

    pub fn granule_position(&self) -> i64 {
        self.granule_position
    }

    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    pub(crate) fn set_stream_start(&mut self, stream_start: bool) {
        self.stream_start = stream_start;
    }

    pub(crate) fn set_stream_end(&mut self, stream_end: bool) {
        self.stream_end = stream_end;
    }

    pub(crate) fn set_sequence_number(&mut self, sequence_number: i64) {
        self.sequence_number = sequence_number;
    }

    /// Marshal into a transient native packet owning a copy of the payload.
    pub fn to_native(&self) -> NativePacket {
        NativePacket::from_buffer(self)
    }

    /// Copy a packet whose storage belongs to the native library.
    ///
    /// # Safety
    /// `raw.packet` must be null or point to at least `raw.bytes` readable bytes.
    pub unsafe fn from_raw(raw: &ogg_packet) -> Result<Self> {
        let len = raw.bytes as i64;
        if len < 0 {
            return Err(Error::marshal(format!("negative packet length {}", len)));
        }
        let payload = if len == 0 {
            Bytes::new()
        } else if raw.packet.is_null() {
            return Err(Error::marshal(format!(
                "null payload with length {}",
                len
            )));
        } else {
            let data = unsafe { std::slice::from_raw_parts(raw.packet as *const u8, len as usize) };
            Bytes::copy_from_slice(data)
        };

        Ok(Self {
            payload,
            stream_start: raw.b_o_s != 0,
            stream_end: raw.e_o_s != 0,
            granule_position: raw.granulepos as i64,
            sequence_number: raw.packetno as i64,
        })
    }
}

/// Scoped native representation of a packet.
///
/// Owns its payload copy; both are released when it drops, on every exit path.
pub struct NativePacket {
    raw: ogg_packet,
    _payload: Option<Box<[u8]>>,
}

impl NativePacket {
    /// Zeroed packet for the native library to fill in.
    pub fn empty() -> Self {
        Self {
            raw: unsafe { std::mem::zeroed() },
            _payload: None,
        }
    }

    fn from_buffer(buffer: &PacketBuffer) -> Self {
        let mut native = Self::empty();
        if !buffer.payload.is_empty() {
            let mut payload: Box<[u8]> = buffer.payload.to_vec().into_boxed_slice();
            native.raw.packet = payload.as_mut_ptr();
            native.raw.bytes = payload.len() as _;
            native._payload = Some(payload);
        }
        native.raw.b_o_s = buffer.stream_start as _;
        native.raw.e_o_s = buffer.stream_end as _;
        native.raw.granulepos = buffer.granule_position as _;
        native.raw.packetno = buffer.sequence_number as _;
        native
    }

    pub fn as_ptr(&self) -> *const ogg_packet {
        &self.raw
    }

    pub fn as_mut_ptr(&mut self) -> *mut ogg_packet {
        &mut self.raw
    }

    /// Copy back into an owned buffer and release the native side.
    pub fn into_packet(self) -> Result<PacketBuffer> {
        // The raw payload pointer is either our own copy or storage the
        // library just handed back; both are valid until `self` drops.
        unsafe { PacketBuffer::from_raw(&self.raw) }
    }
}

/// The three Vorbis header packets, in stream order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderPackets {
    pub identification: PacketBuffer,
    pub comment: PacketBuffer,
    pub setup: PacketBuffer,
}

impl HeaderPackets {
    /// Only the identification header carries the stream-start flag.
    pub fn new(identification: PacketBuffer, comment: PacketBuffer, setup: PacketBuffer) -> Self {
        let mut headers = Self {
            identification,
            comment,
            setup,
        };
        headers.identification.set_stream_start(true);
        headers.comment.set_stream_start(false);
        headers.setup.set_stream_start(false);
        for (i, packet) in headers.iter_mut().enumerate() {
            packet.set_stream_end(false);
            packet.granule_position = 0;
            packet.set_sequence_number(i as i64);
        }
        headers
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut PacketBuffer> {
        [&mut self.identification, &mut self.comment, &mut self.setup].into_iter()
    }

    pub fn into_array(self) -> [PacketBuffer; 3] {
        [self.identification, self.comment, self.setup]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_round_trip() -> anyhow::Result<()> {
        let packet = PacketBuffer::new(vec![0x01, b'v', b'o', b'r', b'b', b'i', b's'])
            .with_stream_start(true)
            .with_granule_position(0)
            .with_sequence_number(0);
        let back = packet.to_native().into_packet()?;
        assert_eq!(back, packet);

        let packet = PacketBuffer::new(Bytes::from_static(&[7u8; 300]))
            .with_stream_end(true)
            .with_granule_position(441_000)
            .with_sequence_number(97);
        let back = packet.to_native().into_packet()?;
        assert_eq!(back, packet);
        Ok(())
    }

    #[test]
    fn test_empty_payload_is_null() -> anyhow::Result<()> {
        let packet = PacketBuffer::empty().with_stream_end(true).with_granule_position(12);
        let native = packet.to_native();
        assert!(unsafe { (*native.as_ptr()).packet.is_null() });
        assert_eq!(unsafe { (*native.as_ptr()).bytes }, 0);
        assert_eq!(native.into_packet()?, packet);
        Ok(())
    }

    #[test]
    fn test_negative_length_is_marshal_error() {
        let mut native = NativePacket::empty();
        unsafe {
            (*native.as_mut_ptr()).bytes = -4;
        }
        assert!(matches!(native.into_packet(), Err(Error::Marshal(_))));
    }

    #[test]
    fn test_null_payload_with_length_is_marshal_error() {
        let mut native = NativePacket::empty();
        unsafe {
            (*native.as_mut_ptr()).bytes = 16;
        }
        assert!(matches!(native.into_packet(), Err(Error::Marshal(_))));
    }

    #[test]
    fn test_header_flags_normalized() {
        let headers = HeaderPackets::new(
            PacketBuffer::new(vec![1u8]),
            PacketBuffer::new(vec![3u8]).with_stream_start(true),
            PacketBuffer::new(vec![5u8]).with_stream_end(true),
        );
        let [ident, comment, setup] = headers.into_array();
        assert!(ident.is_stream_start());
        assert!(!comment.is_stream_start());
        assert!(!setup.is_stream_start());
        assert!(!setup.is_stream_end());
        assert_eq!(
            [ident.sequence_number(), comment.sequence_number(), setup.sequence_number()],
            [0, 1, 2]
        );
    }
}
