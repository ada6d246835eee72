use aotuv_lancer_vorbis_sys::vorbis_synthesis_idheader;
use ogg_next_sys::{
    ogg_packet, ogg_page, ogg_page_bos, ogg_page_eos, ogg_page_serialno, ogg_stream_clear,
    ogg_stream_init, ogg_stream_packetout, ogg_stream_packetpeek, ogg_stream_pagein,
    ogg_stream_state, ogg_sync_buffer, ogg_sync_clear, ogg_sync_init, ogg_sync_pageout,
    ogg_sync_state, ogg_sync_wrote,
};

use crate::{
    error::{Error, Result},
    mux::ContainerPage,
    packet::PacketBuffer,
};

struct LogicalStream {
    state: Box<ogg_stream_state>,
    serial: i32,
}

impl Drop for LogicalStream {
    fn drop(&mut self) {
        unsafe { ogg_stream_clear(&mut *self.state) };
    }
}

impl LogicalStream {
    fn new(serial: i32) -> Result<Self> {
        let mut state: Box<ogg_stream_state> = Box::new(unsafe { std::mem::zeroed() });
        if unsafe { ogg_stream_init(&mut *state, serial as _) } != 0 {
            return Err(Error::fault("ogg_stream_init failed"));
        }
        Ok(Self { state, serial })
    }

    fn page_in(&mut self, page: &ogg_page) -> Result<()> {
        if unsafe { ogg_stream_pagein(&mut *self.state, page as *const _ as *mut _) } != 0 {
            return Err(Error::marshal(format!(
                "page rejected by stream {:#010x}",
                self.serial
            )));
        }
        Ok(())
    }

    /// The next packet, left in place, opens a Vorbis stream.
    fn starts_vorbis(&mut self) -> bool {
        let mut raw: ogg_packet = unsafe { std::mem::zeroed() };
        unsafe {
            ogg_stream_packetpeek(&mut *self.state, &mut raw) == 1
                && vorbis_synthesis_idheader(&mut raw) == 1
        }
    }
}

/// Recovers the packets of one logical Ogg stream from raw bytes.
///
/// The first stream-start page whose packet is a Vorbis identification header
/// picks the stream; pages of any other serial are skipped. Chained streams
/// are not followed.
pub struct OggDemux {
    stream: Option<LogicalStream>,
    sync: Box<ogg_sync_state>,
    end_page_seen: bool,
    finished: bool,
    foreign_pages: u64,
    resyncs: u64,
}

// The native state is owned exclusively and never shared between threads.
unsafe impl Send for OggDemux {}

impl OggDemux {
    pub fn new() -> Result<Self> {
        let mut sync: Box<ogg_sync_state> = Box::new(unsafe { std::mem::zeroed() });
        if unsafe { ogg_sync_init(&mut *sync) } != 0 {
            return Err(Error::fault("ogg_sync_init failed"));
        }
        Ok(Self {
            stream: None,
            sync,
            end_page_seen: false,
            finished: false,
            foreign_pages: 0,
            resyncs: 0,
        })
    }

    /// Append bytes read from the container. May split pages anywhere.
    pub fn push_bytes(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let len: std::os::raw::c_long = data
            .len()
            .try_into()
            .map_err(|_| Error::invalid_input(format!("{} bytes in one push", data.len())))?;
        let buffer = unsafe { ogg_sync_buffer(&mut *self.sync, len) };
        if buffer.is_null() {
            return Err(Error::fault("ogg_sync_buffer returned null"));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), buffer as *mut u8, data.len());
        }
        if unsafe { ogg_sync_wrote(&mut *self.sync, len) } != 0 {
            return Err(Error::fault("ogg_sync_wrote overflowed the sync buffer"));
        }
        Ok(())
    }

    pub fn push_page(&mut self, page: &ContainerPage) -> Result<()> {
        self.push_bytes(page.header())?;
        self.push_bytes(page.body())
    }

    /// Next packet of the followed stream.
    ///
    /// `Ok(None)` means more bytes are needed, or the stream has ended (see
    /// [`is_finished`](Self::is_finished)). `Err(StreamHole)` reports lost or
    /// corrupt data; the demux has already resynchronized and the next call
    /// continues after the gap.
    pub fn next_packet(&mut self) -> Result<Option<PacketBuffer>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            if let Some(stream) = self.stream.as_mut() {
                let mut raw: ogg_packet = unsafe { std::mem::zeroed() };
                match unsafe { ogg_stream_packetout(&mut *stream.state, &mut raw) } {
                    1 => return unsafe { PacketBuffer::from_raw(&raw) }.map(Some),
                    0 if self.end_page_seen => {
                        log::debug!("stream {:#010x} ended", stream.serial);
                        self.finished = true;
                        return Ok(None);
                    }
                    0 => {}
                    _ => {
                        log::warn!("hole in stream {:#010x}", stream.serial);
                        return Err(Error::StreamHole);
                    }
                }
            }

            let mut page: ogg_page = unsafe { std::mem::zeroed() };
            match unsafe { ogg_sync_pageout(&mut *self.sync, &mut page) } {
                0 => return Ok(None),
                1 => self.accept_page(&page)?,
                _ => {
                    self.resyncs += 1;
                    log::warn!("lost page sync, skipping to the next capture pattern");
                }
            }
        }
    }

    fn accept_page(&mut self, page: &ogg_page) -> Result<()> {
        let serial = unsafe { ogg_page_serialno(page) } as i32;
        match self.serial() {
            Some(followed) if followed == serial => {
                if let Some(stream) = self.stream.as_mut() {
                    stream.page_in(page)?;
                }
            }
            Some(_) => {
                self.foreign_pages += 1;
                log::debug!("skipping page of foreign stream {:#010x}", serial);
                return Ok(());
            }
            None if unsafe { ogg_page_bos(page) } != 0 => {
                let mut stream = LogicalStream::new(serial)?;
                stream.page_in(page)?;
                if !stream.starts_vorbis() {
                    self.foreign_pages += 1;
                    log::debug!("skipping non-vorbis stream {:#010x}", serial);
                    return Ok(());
                }
                log::info!("following logical stream {:#010x}", serial);
                self.stream = Some(stream);
            }
            None => {
                self.foreign_pages += 1;
                log::debug!("skipping page before any stream start");
                return Ok(());
            }
        }
        if unsafe { ogg_page_eos(page) } != 0 {
            self.end_page_seen = true;
        }
        Ok(())
    }

    /// Serial number of the followed stream, once one has started.
    pub fn serial(&self) -> Option<i32> {
        self.stream.as_ref().map(|s| s.serial)
    }

    /// The end-of-stream page was read and every packet on it handed out.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn foreign_pages(&self) -> u64 {
        self.foreign_pages
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }
}

impl Drop for OggDemux {
    fn drop(&mut self) {
        self.stream.take();
        unsafe { ogg_sync_clear(&mut *self.sync) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{OggMux, StreamMux};

    /// Enough of an identification header to pass the Vorbis signature check.
    fn vorbis_id() -> Vec<u8> {
        let mut id = b"\x01vorbis".to_vec();
        id.resize(30, 0);
        id
    }

    fn mux_stream(serial: i32, packets: usize) -> anyhow::Result<Vec<ContainerPage>> {
        mux_codec(serial, vorbis_id(), packets)
    }

    fn mux_codec(serial: i32, first: Vec<u8>, packets: usize) -> anyhow::Result<Vec<ContainerPage>> {
        let mut mux = OggMux::with_serial(serial)?;
        let mut pages = Vec::new();
        mux.admit(PacketBuffer::new(first).with_stream_start(true))?;
        for page in mux.force_flush() {
            pages.push(page?);
        }
        for i in 1..=packets as i64 {
            mux.admit(
                PacketBuffer::new(vec![i as u8; 1500])
                    .with_sequence_number(i)
                    .with_granule_position(i * 100)
                    .with_stream_end(i == packets as i64),
            )?;
            for page in mux.drain_ready() {
                pages.push(page?);
            }
        }
        for page in mux.force_flush() {
            pages.push(page?);
        }
        Ok(pages)
    }

    fn drain(demux: &mut OggDemux) -> (Vec<PacketBuffer>, usize) {
        let mut packets = Vec::new();
        let mut holes = 0;
        loop {
            match demux.next_packet() {
                Ok(Some(packet)) => packets.push(packet),
                Ok(None) => return (packets, holes),
                Err(Error::StreamHole) => holes += 1,
                Err(e) => panic!("unexpected error {e}"),
            }
        }
    }

    #[test]
    fn test_packets_survive_byte_splits() -> anyhow::Result<()> {
        let bytes: Vec<u8> = mux_stream(42, 12)?.iter().flat_map(|p| p.to_bytes()).collect();
        let mut demux = OggDemux::new()?;
        let mut packets = Vec::new();
        for chunk in bytes.chunks(777) {
            demux.push_bytes(chunk)?;
            packets.extend(drain(&mut demux).0);
        }
        assert!(demux.is_finished());
        assert_eq!(demux.serial(), Some(42));
        assert_eq!(packets.len(), 13);
        assert!(packets[0].is_stream_start());
        assert_eq!(packets[5].payload().as_ref(), &[5u8; 1500][..]);
        assert!(packets[12].is_stream_end());
        assert_eq!(packets[12].granule_position(), 1200);
        Ok(())
    }

    #[test]
    fn test_missing_page_is_hole() -> anyhow::Result<()> {
        // 60 KB of payload spans well over four pages.
        let mut pages = mux_stream(3, 40)?;
        assert!(pages.len() > 6, "only {} pages", pages.len());
        pages.remove(pages.len() / 2);

        let mut demux = OggDemux::new()?;
        for page in &pages {
            demux.push_page(page)?;
        }
        let (packets, holes) = drain(&mut demux);
        assert_eq!(holes, 1);
        assert!(demux.is_finished());
        assert!(packets.len() < 41);
        assert!(packets[0].is_stream_start());
        assert!(packets.last().unwrap().is_stream_end());
        Ok(())
    }

    #[test]
    fn test_foreign_stream_skipped() -> anyhow::Result<()> {
        let ours = mux_stream(1, 3)?;
        let theirs = mux_stream(2, 3)?;
        let mut demux = OggDemux::new()?;
        demux.push_page(&ours[0])?;
        for page in &theirs {
            demux.push_page(page)?;
        }
        for page in &ours[1..] {
            demux.push_page(page)?;
        }
        let (packets, holes) = drain(&mut demux);
        assert_eq!(holes, 0);
        assert_eq!(packets.len(), 4);
        assert_eq!(demux.foreign_pages(), theirs.len() as u64);
        Ok(())
    }

    #[test]
    fn test_non_vorbis_stream_skipped() -> anyhow::Result<()> {
        let theora = mux_codec(5, b"\x80theora".to_vec(), 2)?;
        let ours = mux_stream(6, 2)?;
        let mut demux = OggDemux::new()?;
        demux.push_page(&theora[0])?;
        demux.push_page(&ours[0])?;
        for page in theora[1..].iter().chain(&ours[1..]) {
            demux.push_page(page)?;
        }
        let (packets, holes) = drain(&mut demux);
        assert_eq!(holes, 0);
        assert_eq!(demux.serial(), Some(6));
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].payload().as_ref(), vorbis_id().as_slice());
        assert_eq!(demux.foreign_pages(), theora.len() as u64);
        assert!(demux.is_finished());
        Ok(())
    }

    #[test]
    fn test_garbage_prefix_resyncs() -> anyhow::Result<()> {
        let mut demux = OggDemux::new()?;
        demux.push_bytes(b"RIFF....not an ogg stream at all")?;
        for page in mux_stream(9, 2)? {
            demux.push_page(&page)?;
        }
        let (packets, _) = drain(&mut demux);
        assert_eq!(packets.len(), 3);
        assert!(demux.resyncs() >= 1);
        Ok(())
    }
}
