use std::marker::PhantomData;
use std::ptr;

use serde::Serialize;

use aotuv_lancer_vorbis_sys::{
    vorbis_dsp_state, vorbis_granule_time, vorbis_packet_blocksize, vorbis_synthesis,
    vorbis_synthesis_blockin, vorbis_synthesis_halfrate, vorbis_synthesis_halfrate_p,
    vorbis_synthesis_headerin, vorbis_synthesis_idheader, vorbis_synthesis_init,
    vorbis_synthesis_pcmout, vorbis_synthesis_read, vorbis_synthesis_restart,
};

use crate::{
    block::SampleBlock,
    codec::{
        OV_EBADPACKET, OV_ENOTAUDIO, Synthesizer, check, code_name, fault,
        native::{Comment, DspState, Info, WorkBlock},
    },
    config::BitrateLimits,
    error::{Error, Result},
    packet::PacketBuffer,
};

const HEADER_COUNT: usize = 3;

/// Whether `packet` is a Vorbis identification header. Only looks at the
/// stream-start flag and the packet signature.
pub fn is_identification_header(packet: &PacketBuffer) -> bool {
    let mut native = packet.to_native();
    unsafe { vorbis_synthesis_idheader(native.as_mut_ptr().cast()) == 1 }
}

/// Stream parameters carried by the identification header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub channels: usize,
    pub sample_rate: u32,
    pub bitrate: BitrateLimits,
}

/// libvorbis synthesis (decode) side.
pub struct VorbisSynthesizer {
    // Drop order matters: block, dsp, comment, info.
    block: Option<WorkBlock>,
    dsp: Option<DspState>,
    comment: Comment,
    info: Info,
    headers_seen: usize,
}

// The native state is owned exclusively and never shared between threads.
unsafe impl Send for VorbisSynthesizer {}

impl Default for VorbisSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

impl VorbisSynthesizer {
    pub fn new() -> Self {
        Self {
            block: None,
            dsp: None,
            comment: Comment::new(),
            info: Info::new(),
            headers_seen: 0,
        }
    }

    /// Available once the identification header has been read.
    pub fn stream_info(&self) -> Option<StreamInfo> {
        if self.headers_seen == 0 {
            return None;
        }
        Some(StreamInfo {
            channels: self.info.channels(),
            sample_rate: self.info.rate(),
            bitrate: BitrateLimits::from_raw(
                self.info.bitrate_upper(),
                self.info.bitrate_nominal(),
                self.info.bitrate_lower(),
            ),
        })
    }

    pub fn vendor(&self) -> String {
        self.comment.vendor()
    }

    pub fn comments(&self) -> Vec<String> {
        self.comment.user_comments()
    }

    /// Value of the `index`th comment named `tag`, compared case-insensitively.
    pub fn query(&mut self, tag: &str, index: usize) -> Option<String> {
        self.comment.query(tag, index)
    }

    pub fn query_count(&mut self, tag: &str) -> usize {
        self.comment.query_count(tag)
    }

    /// Seconds corresponding to a granule position of this stream.
    pub fn granule_time(&mut self, granule_position: i64) -> Option<f64> {
        let dsp = self.dsp.as_mut()?;
        let seconds = unsafe { vorbis_granule_time(dsp.as_mut_ptr(), granule_position as _) };
        (seconds >= 0.0).then_some(seconds)
    }

    /// Decode at half the sample rate. Only allowed between the
    /// identification header and the last header.
    pub fn set_halfrate(&mut self, enabled: bool) -> Result<()> {
        if self.headers_seen == 0 || self.dsp.is_some() {
            return Err(Error::sequence(format!(
                "half-rate switch after {} of {} headers",
                self.headers_seen, HEADER_COUNT
            )));
        }
        match unsafe { vorbis_synthesis_halfrate(self.info.as_mut_ptr(), enabled as _) } {
            0 => Ok(()),
            code => Err(Error::config(format!(
                "stream blocks too short for half-rate decode ({})",
                code
            ))),
        }
    }

    pub fn is_halfrate(&mut self) -> bool {
        self.headers_seen > 0
            && unsafe { vorbis_synthesis_halfrate_p(self.info.as_mut_ptr()) } != 0
    }

    /// Forget the overlap and granule state after a discontinuity, as after a
    /// seek. Buffered but unread samples are dropped.
    pub fn restart(&mut self) -> Result<()> {
        let Some(dsp) = self.dsp.as_mut() else {
            return Err(Error::sequence("restart before headers"));
        };
        check(
            unsafe { vorbis_synthesis_restart(dsp.as_mut_ptr()) },
            "vorbis_synthesis_restart",
        )?;
        Ok(())
    }

    /// Size of the block an audio packet decodes to, without decoding it.
    pub fn packet_blocksize(&mut self, packet: &PacketBuffer) -> Result<usize> {
        if self.headers_seen < HEADER_COUNT {
            return Err(Error::sequence("block size before setup header"));
        }
        let mut native = packet.to_native();
        let size =
            unsafe { vorbis_packet_blocksize(self.info.as_mut_ptr(), native.as_mut_ptr().cast()) };
        if size < 0 {
            return Err(Error::marshal(format!(
                "packet {} has no block size: {}",
                packet.sequence_number(),
                code_name(size as _)
            )));
        }
        Ok(size as usize)
    }

    /// Borrow the decoded samples the transform has ready, if any.
    pub fn pcm_out(&mut self) -> Result<Option<PcmView<'_>>> {
        let channels = self.info.channels();
        let Some(dsp) = self.dsp.as_mut() else {
            return Ok(None);
        };
        let dsp = dsp.as_mut_ptr();
        let mut planes: *mut *mut f32 = ptr::null_mut();
        let frames = check(
            unsafe { vorbis_synthesis_pcmout(dsp, &mut planes) },
            "vorbis_synthesis_pcmout",
        )? as usize;
        if frames == 0 {
            return Ok(None);
        }
        if planes.is_null() {
            return Err(Error::fault("vorbis_synthesis_pcmout returned null planes"));
        }
        let mut views = Vec::with_capacity(channels);
        for ch in 0..channels {
            let plane = unsafe { *planes.add(ch) };
            if plane.is_null() {
                return Err(Error::fault(format!("null pcm plane for channel {}", ch)));
            }
            views.push(unsafe { std::slice::from_raw_parts(plane as *const f32, frames) });
        }
        Ok(Some(PcmView {
            dsp,
            channels: views,
            frames,
            _owner: PhantomData,
        }))
    }

    fn start_synthesis(&mut self) -> Result<()> {
        let info = self.info.as_mut_ptr();
        let mut dsp = DspState::init("vorbis_synthesis_init", |dsp| unsafe {
            vorbis_synthesis_init(dsp, info)
        })?;
        let block = WorkBlock::new(&mut dsp)?;
        self.dsp = Some(dsp);
        self.block = Some(block);
        log::info!(
            "vorbis synthesizer ready: {} ch, {} Hz, vendor {:?}",
            self.info.channels(),
            self.info.rate(),
            self.comment.vendor()
        );
        Ok(())
    }
}

impl Synthesizer for VorbisSynthesizer {
    fn send_header(&mut self, packet: &PacketBuffer) -> Result<()> {
        if self.is_ready() {
            return Err(Error::sequence("all header packets already received"));
        }
        let mut native = packet.to_native();
        let code = unsafe {
            vorbis_synthesis_headerin(
                self.info.as_mut_ptr(),
                self.comment.as_mut_ptr(),
                native.as_mut_ptr().cast(),
            )
        };
        if code != 0 {
            return Err(Error::fault(format!(
                "header {} rejected: {} ({})",
                self.headers_seen,
                code_name(code),
                code
            )));
        }
        self.headers_seen += 1;
        if self.headers_seen == HEADER_COUNT {
            self.start_synthesis()?;
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.headers_seen == HEADER_COUNT
    }

    fn send_packet(&mut self, packet: &PacketBuffer) -> Result<()> {
        let (Some(dsp), Some(block)) = (self.dsp.as_mut(), self.block.as_mut()) else {
            return Err(Error::sequence(format!(
                "audio packet before headers ({} of {} seen)",
                self.headers_seen, HEADER_COUNT
            )));
        };
        let mut native = packet.to_native();
        match unsafe { vorbis_synthesis(block.as_mut_ptr(), native.as_mut_ptr().cast()) } {
            0 => {}
            code @ (OV_ENOTAUDIO | OV_EBADPACKET) => {
                return Err(Error::marshal(format!(
                    "packet {} not decodable: {}",
                    packet.sequence_number(),
                    code_name(code)
                )));
            }
            code => return Err(fault(code, "vorbis_synthesis")),
        }
        check(
            unsafe { vorbis_synthesis_blockin(dsp.as_mut_ptr(), block.as_mut_ptr()) },
            "vorbis_synthesis_blockin",
        )?;
        Ok(())
    }

    fn receive_block(&mut self) -> Result<Option<SampleBlock>> {
        let Some(view) = self.pcm_out()? else {
            return Ok(None);
        };
        let frames = view.frames();
        let block = SampleBlock::new(view.channels().map(<[f32]>::to_vec).collect())?;
        view.consume(frames)?;
        Ok(Some(block))
    }
}

/// Decoded samples still owned by the synthesizer.
pub struct PcmView<'a> {
    dsp: *mut vorbis_dsp_state,
    channels: Vec<&'a [f32]>,
    frames: usize,
    _owner: PhantomData<&'a mut VorbisSynthesizer>,
}

impl PcmView<'_> {
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        self.channels[index]
    }

    pub fn channels(&self) -> impl Iterator<Item = &[f32]> {
        self.channels.iter().copied()
    }

    /// Mark the first `frames` samples as read.
    pub fn consume(self, frames: usize) -> Result<()> {
        if frames > self.frames {
            return Err(Error::invalid_input(format!(
                "consumed {} of {} available frames",
                frames, self.frames
            )));
        }
        check(
            unsafe { vorbis_synthesis_read(self.dsp, frames as _) },
            "vorbis_synthesis_read",
        )?;
        Ok(())
    }
}
