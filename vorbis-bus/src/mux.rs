use std::io::Write;

use bytes::Bytes;
use ogg_next_sys::{
    ogg_page, ogg_page_bos, ogg_page_eos, ogg_page_granulepos, ogg_page_pageno,
    ogg_page_serialno, ogg_stream_clear, ogg_stream_flush, ogg_stream_init,
    ogg_stream_packetin, ogg_stream_pageout, ogg_stream_state,
};

use crate::{
    codec::Drain,
    error::{Error, Result},
    packet::PacketBuffer,
};

/// One physical Ogg page: header bytes followed by body bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerPage {
    header: Bytes,
    body: Bytes,
    is_stream_start: bool,
    is_stream_end: bool,
    granule_position: i64,
    page_number: i64,
    serial: i32,
}

impl ContainerPage {
    /// Copy a page whose storage belongs to the native library.
    ///
    /// # Safety
    /// `raw` must describe a page just produced by libogg, with `header` and
    /// `body` pointing at `header_len` and `body_len` readable bytes.
    pub(crate) unsafe fn from_raw(raw: &ogg_page) -> Result<Self> {
        let copy = |ptr: *const u8, len: std::os::raw::c_long, what: &str| -> Result<Bytes> {
            if len < 0 {
                return Err(Error::marshal(format!("negative page {} length {}", what, len)));
            }
            if len == 0 {
                return Ok(Bytes::new());
            }
            if ptr.is_null() {
                return Err(Error::marshal(format!("null page {} with length {}", what, len)));
            }
            Ok(Bytes::copy_from_slice(unsafe {
                std::slice::from_raw_parts(ptr, len as usize)
            }))
        };
        let header = copy(raw.header as *const u8, raw.header_len as _, "header")?;
        let body = copy(raw.body as *const u8, raw.body_len as _, "body")?;
        Ok(Self {
            header,
            body,
            is_stream_start: unsafe { ogg_page_bos(raw) } != 0,
            is_stream_end: unsafe { ogg_page_eos(raw) } != 0,
            granule_position: unsafe { ogg_page_granulepos(raw) } as i64,
            page_number: unsafe { ogg_page_pageno(raw) } as i64,
            serial: unsafe { ogg_page_serialno(raw) } as i32,
        })
    }

    pub fn header(&self) -> &Bytes {
        &self.header
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_stream_start(&self) -> bool {
        self.is_stream_start
    }

    pub fn is_stream_end(&self) -> bool {
        self.is_stream_end
    }

    /// Granule position of the last packet finished on this page, or -1.
    pub fn granule_position(&self) -> i64 {
        self.granule_position
    }

    pub fn page_number(&self) -> i64 {
        self.page_number
    }

    pub fn serial(&self) -> i32 {
        self.serial
    }

    /// Write header then body, byte for byte.
    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_all(&self.header)?;
        out.write_all(&self.body)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.body);
        out
    }
}

/// Welds an ordered packet sequence of one logical stream into pages.
pub trait StreamMux: Sized {
    /// Take ownership of the next packet of the stream.
    fn admit(&mut self, packet: PacketBuffer) -> Result<()>;

    /// Next page regardless of fill level, or `None` once nothing is buffered.
    fn flush_page(&mut self) -> Result<Option<ContainerPage>>;

    /// Next page that reached its natural size, or `None`.
    fn ready_page(&mut self) -> Result<Option<ContainerPage>>;

    /// Every buffered packet, forced onto pages. Used for the header pages.
    fn force_flush(&mut self) -> Drain<'_, Self, ContainerPage> {
        Drain::new(self, Self::flush_page)
    }

    /// Only the pages that are full.
    fn drain_ready(&mut self) -> Drain<'_, Self, ContainerPage> {
        Drain::new(self, Self::ready_page)
    }
}

/// Ogg page muxer over libogg's stream state.
pub struct OggMux {
    state: Box<ogg_stream_state>,
    serial: i32,
    admitted_end: bool,
    emitted_end: bool,
}

// The native state is owned exclusively and never shared between threads.
unsafe impl Send for OggMux {}

impl OggMux {
    /// Mux for a logical stream with a random serial number.
    pub fn new() -> Result<Self> {
        Self::with_serial(rand::random())
    }

    pub fn with_serial(serial: i32) -> Result<Self> {
        let mut state: Box<ogg_stream_state> = Box::new(unsafe { std::mem::zeroed() });
        if unsafe { ogg_stream_init(&mut *state, serial as _) } != 0 {
            return Err(Error::fault("ogg_stream_init failed"));
        }
        log::debug!("ogg mux opened, serial {:#010x}", serial);
        Ok(Self {
            state,
            serial,
            admitted_end: false,
            emitted_end: false,
        })
    }

    pub fn serial(&self) -> i32 {
        self.serial
    }

    fn next_page(&mut self, force: bool) -> Result<Option<ContainerPage>> {
        if self.emitted_end {
            return Ok(None);
        }
        let mut raw: ogg_page = unsafe { std::mem::zeroed() };
        let produced = unsafe {
            if force {
                ogg_stream_flush(&mut *self.state, &mut raw)
            } else {
                ogg_stream_pageout(&mut *self.state, &mut raw)
            }
        };
        if produced == 0 {
            return Ok(None);
        }
        let page = unsafe { ContainerPage::from_raw(&raw) }?;
        log::debug!(
            "page {} ({} bytes, granule {}, eos {})",
            page.page_number(),
            page.len(),
            page.granule_position(),
            page.is_stream_end()
        );
        self.emitted_end = page.is_stream_end();
        Ok(Some(page))
    }
}

impl StreamMux for OggMux {
    fn admit(&mut self, packet: PacketBuffer) -> Result<()> {
        if self.admitted_end {
            return Err(Error::sequence(format!(
                "packet {} admitted after end of stream",
                packet.sequence_number()
            )));
        }
        self.admitted_end = packet.is_stream_end();
        // libogg copies the payload; the native packet drops right after.
        let mut native = packet.to_native();
        if unsafe { ogg_stream_packetin(&mut *self.state, native.as_mut_ptr()) } != 0 {
            return Err(Error::fault(format!(
                "ogg_stream_packetin rejected packet {}",
                packet.sequence_number()
            )));
        }
        Ok(())
    }

    fn flush_page(&mut self) -> Result<Option<ContainerPage>> {
        self.next_page(true)
    }

    fn ready_page(&mut self) -> Result<Option<ContainerPage>> {
        self.next_page(false)
    }
}

impl Drop for OggMux {
    fn drop(&mut self) {
        unsafe { ogg_stream_clear(&mut *self.state) };
    }
}
