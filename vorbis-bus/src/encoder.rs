use std::marker::PhantomData;
use std::ptr;

use aotuv_lancer_vorbis_sys::{
    vorbis_analysis, vorbis_analysis_blockout, vorbis_analysis_buffer, vorbis_analysis_headerout,
    vorbis_analysis_init, vorbis_analysis_wrote, vorbis_bitrate_addblock,
    vorbis_bitrate_flushpacket, vorbis_dsp_state, vorbis_encode_ctl, vorbis_encode_init,
    vorbis_encode_init_vbr, vorbis_encode_setup_init, vorbis_encode_setup_managed,
    vorbis_info_blocksize,
};

use crate::{
    block::SampleBlock,
    codec::{
        Analyzer, OV_ECTL_RATEMANAGE2_SET, check, check_setup,
        native::{Comment, DspState, Info, WorkBlock},
    },
    config::{EncoderConfig, RatePolicy},
    error::{Error, Result},
    packet::{HeaderPackets, NativePacket, PacketBuffer},
};

/// libvorbis analysis (encode) side.
pub struct VorbisAnalyzer {
    // Drop order matters: block, dsp, comment, info.
    block: WorkBlock,
    dsp: DspState,
    comment: Comment,
    info: Info,
    channels: usize,
    headers_emitted: bool,
}

// The native state is owned exclusively and never shared between threads.
unsafe impl Send for VorbisAnalyzer {}

impl VorbisAnalyzer {
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        config.validate()?;

        let mut info = Info::new();
        Self::setup(&mut info, config)?;

        let mut comment = Comment::new();
        for (tag, value) in &config.comments {
            comment.add_tag(tag, value)?;
        }

        let info_ptr = info.as_mut_ptr();
        let mut dsp = DspState::init("vorbis_analysis_init", |dsp| unsafe {
            vorbis_analysis_init(dsp, info_ptr)
        })?;
        let block = WorkBlock::new(&mut dsp)?;

        log::info!(
            "vorbis analyzer configured: {} ch, {} Hz, {:?}",
            config.channels,
            config.sample_rate,
            config.policy
        );

        Ok(Self {
            block,
            dsp,
            comment,
            info,
            channels: config.channels,
            headers_emitted: false,
        })
    }

    fn setup(info: &mut Info, config: &EncoderConfig) -> Result<()> {
        let vi = info.as_mut_ptr();
        let channels = config.channels as _;
        let rate = config.sample_rate as _;
        match config.policy {
            RatePolicy::Quality { quality } => check_setup(
                unsafe { vorbis_encode_init_vbr(vi, channels, rate, quality) },
                "vorbis_encode_init_vbr",
            ),
            RatePolicy::Average(limits) => {
                let (max, nominal, min) = limits.to_raw();
                check_setup(
                    unsafe { vorbis_encode_init(vi, channels, rate, max as _, nominal as _, min as _) },
                    "vorbis_encode_init",
                )
            }
            RatePolicy::Managed(limits) => {
                let (max, nominal, min) = limits.to_raw();
                check_setup(
                    unsafe {
                        vorbis_encode_setup_managed(
                            vi,
                            channels,
                            rate,
                            max as _,
                            nominal as _,
                            min as _,
                        )
                    },
                    "vorbis_encode_setup_managed",
                )?;
                // A null argument turns bitrate management off.
                check_setup(
                    unsafe { vorbis_encode_ctl(vi, OV_ECTL_RATEMANAGE2_SET, ptr::null_mut()) },
                    "vorbis_encode_ctl(RATEMANAGE2_SET)",
                )?;
                check_setup(
                    unsafe { vorbis_encode_setup_init(vi) },
                    "vorbis_encode_setup_init",
                )
            }
        }
    }

    /// Short (`false`) or long (`true`) block size in samples.
    pub fn block_size(&mut self, long: bool) -> usize {
        unsafe { vorbis_info_blocksize(self.info.as_mut_ptr(), long as _) }.max(0) as usize
    }

    pub fn nominal_bitrate(&self) -> Option<u32> {
        let nominal = self.info.bitrate_nominal();
        (nominal > 0).then_some(nominal as u32)
    }

    /// Borrow the native analysis buffer for `frames` samples per channel.
    ///
    /// The views stay valid until `commit` or until the buffer is dropped;
    /// the borrow keeps every other analyzer call out in the meantime.
    pub fn buffer(&mut self, frames: usize) -> Result<AnalysisBuffer<'_>> {
        let frames_c: std::os::raw::c_int = frames
            .try_into()
            .map_err(|_| Error::invalid_input(format!("block of {} frames too large", frames)))?;
        let dsp = self.dsp.as_mut_ptr();
        let planes = unsafe { vorbis_analysis_buffer(dsp, frames_c) };
        if planes.is_null() {
            return Err(Error::fault("vorbis_analysis_buffer returned null"));
        }
        let mut channels = Vec::with_capacity(self.channels);
        for ch in 0..self.channels {
            let plane = unsafe { *planes.add(ch) };
            if plane.is_null() {
                return Err(Error::fault(format!("null analysis plane for channel {}", ch)));
            }
            channels.push(unsafe { std::slice::from_raw_parts_mut(plane, frames) });
        }
        Ok(AnalysisBuffer {
            dsp,
            channels,
            capacity: frames,
            _owner: PhantomData,
        })
    }

    fn wrote(&mut self, frames: usize) -> Result<()> {
        check(
            unsafe { vorbis_analysis_wrote(self.dsp.as_mut_ptr(), frames as _) },
            "vorbis_analysis_wrote",
        )?;
        Ok(())
    }
}

impl Analyzer for VorbisAnalyzer {
    fn open(config: &EncoderConfig) -> Result<Self> {
        Self::new(config)
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn header_packets(&mut self) -> Result<HeaderPackets> {
        if self.headers_emitted {
            return Err(Error::sequence("header packets already emitted"));
        }
        let mut ident = NativePacket::empty();
        let mut comm = NativePacket::empty();
        let mut code = NativePacket::empty();
        check(
            unsafe {
                vorbis_analysis_headerout(
                    self.dsp.as_mut_ptr(),
                    self.comment.as_mut_ptr(),
                    ident.as_mut_ptr().cast(),
                    comm.as_mut_ptr().cast(),
                    code.as_mut_ptr().cast(),
                )
            },
            "vorbis_analysis_headerout",
        )?;
        self.headers_emitted = true;
        Ok(HeaderPackets::new(
            ident.into_packet()?,
            comm.into_packet()?,
            code.into_packet()?,
        ))
    }

    fn send_block(&mut self, block: &SampleBlock) -> Result<()> {
        if block.is_end_of_input() {
            return self.send_eof();
        }
        if block.channel_count() != self.channels {
            return Err(Error::invalid_input(format!(
                "block has {} channels, analyzer expects {}",
                block.channel_count(),
                self.channels
            )));
        }
        let frames = block.frame_count();
        let mut buffer = self.buffer(frames)?;
        for (ch, plane) in buffer.channels_mut().enumerate() {
            plane.copy_from_slice(block.channel(ch));
        }
        buffer.commit(frames)
    }

    fn send_eof(&mut self) -> Result<()> {
        self.wrote(0)
    }

    fn receive_packet(&mut self) -> Result<Option<PacketBuffer>> {
        loop {
            let mut packet = NativePacket::empty();
            let flushed = check(
                unsafe {
                    vorbis_bitrate_flushpacket(self.dsp.as_mut_ptr(), packet.as_mut_ptr().cast())
                },
                "vorbis_bitrate_flushpacket",
            )?;
            if flushed > 0 {
                return packet.into_packet().map(Some);
            }

            let ready = check(
                unsafe { vorbis_analysis_blockout(self.dsp.as_mut_ptr(), self.block.as_mut_ptr()) },
                "vorbis_analysis_blockout",
            )?;
            if ready == 0 {
                return Ok(None);
            }
            // Packets come out of the bitrate manager, not out of analysis.
            check(
                unsafe { vorbis_analysis(self.block.as_mut_ptr(), ptr::null_mut()) },
                "vorbis_analysis",
            )?;
            check(
                unsafe { vorbis_bitrate_addblock(self.block.as_mut_ptr()) },
                "vorbis_bitrate_addblock",
            )?;
        }
    }
}

/// Per-channel views into the analyzer's native input buffer.
pub struct AnalysisBuffer<'a> {
    dsp: *mut vorbis_dsp_state,
    channels: Vec<&'a mut [f32]>,
    capacity: usize,
    _owner: PhantomData<&'a mut VorbisAnalyzer>,
}

impl AnalysisBuffer<'_> {
    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        &mut *self.channels[index]
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut [f32]> {
        self.channels.iter_mut().map(|c| &mut **c)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Hand the first `frames` samples of every channel to the transform.
    pub fn commit(self, frames: usize) -> Result<()> {
        if frames > self.capacity {
            return Err(Error::invalid_input(format!(
                "committed {} frames into a buffer of {}",
                frames, self.capacity
            )));
        }
        check(
            unsafe { vorbis_analysis_wrote(self.dsp, frames as _) },
            "vorbis_analysis_wrote",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::packets;
    use crate::config::BitrateLimits;
    use crate::decoder::is_identification_header;

    fn drain_all(analyzer: &mut VorbisAnalyzer) -> anyhow::Result<Vec<PacketBuffer>> {
        Ok(packets(analyzer).collect::<Result<Vec<_>>>()?)
    }

    #[test]
    fn test_header_packets() -> anyhow::Result<()> {
        let mut analyzer = VorbisAnalyzer::new(&EncoderConfig::quality(2, 44100, 0.1))?;
        assert_headers(&mut analyzer)?;
        assert!(matches!(analyzer.header_packets(), Err(Error::Sequence(_))));
        Ok(())
    }

    fn assert_headers(analyzer: &mut VorbisAnalyzer) -> anyhow::Result<()> {
        let [ident, comment, setup] = analyzer.header_packets()?.into_array();
        assert!(ident.is_stream_start());
        assert!(!comment.is_stream_start() && !setup.is_stream_start());
        assert!(is_identification_header(&ident));
        assert_eq!(&ident.payload()[..7], &[0x01, b'v', b'o', b'r', b'b', b'i', b's']);
        assert_eq!(&comment.payload()[..7], &[0x03, b'v', b'o', b'r', b'b', b'i', b's']);
        assert_eq!(&setup.payload()[..7], &[0x05, b'v', b'o', b'r', b'b', b'i', b's']);
        Ok(())
    }

    #[test]
    fn test_encode_silence_ends_stream() -> anyhow::Result<()> {
        let mut analyzer = VorbisAnalyzer::new(&EncoderConfig::quality(2, 44100, 0.1))?;
        analyzer.header_packets()?;

        let mut out = Vec::new();
        for _ in 0..10 {
            analyzer.send_block(&SampleBlock::silence(2, 1024))?;
            out.extend(drain_all(&mut analyzer)?);
        }
        analyzer.send_eof()?;
        out.extend(drain_all(&mut analyzer)?);

        assert!(!out.is_empty());
        let last = out.last().unwrap();
        assert!(last.is_stream_end());
        assert_eq!(out.iter().filter(|p| p.is_stream_end()).count(), 1);
        assert!(out
            .windows(2)
            .all(|w| w[0].granule_position() <= w[1].granule_position()));
        assert!((last.granule_position() - 10 * 1024).abs() <= 1024);
        Ok(())
    }

    #[test]
    fn test_borrowed_buffer() -> anyhow::Result<()> {
        let mut analyzer = VorbisAnalyzer::new(&EncoderConfig::quality(1, 22050, 0.5))?;
        analyzer.header_packets()?;
        let mut buffer = analyzer.buffer(512)?;
        assert_eq!(buffer.capacity(), 512);
        for (i, sample) in buffer.channel_mut(0).iter_mut().enumerate() {
            *sample = ((i as f32) * 0.05).sin() * 0.5;
        }
        assert!(matches!(buffer.commit(513), Err(Error::InvalidInput(_))));

        let mut buffer = analyzer.buffer(512)?;
        buffer.channel_mut(0).fill(0.25);
        buffer.commit(512)?;
        Ok(())
    }

    #[test]
    fn test_block_sizes() -> anyhow::Result<()> {
        let mut analyzer = VorbisAnalyzer::new(&EncoderConfig::quality(2, 44100, 0.4))?;
        let short = analyzer.block_size(false);
        let long = analyzer.block_size(true);
        assert!(short > 0 && long >= short);
        assert!(short.is_power_of_two() && long.is_power_of_two());
        Ok(())
    }

    #[test]
    fn test_bitrate_modes() -> anyhow::Result<()> {
        let abr = EncoderConfig::average(2, 44100, BitrateLimits::nominal(128_000));
        let mut analyzer = VorbisAnalyzer::new(&abr)?;
        assert_eq!(analyzer.nominal_bitrate(), Some(128_000));
        assert_headers(&mut analyzer)?;

        let managed = EncoderConfig::managed(2, 44100, BitrateLimits::nominal(128_000));
        assert_headers(&mut VorbisAnalyzer::new(&managed)?)?;
        Ok(())
    }

    #[test]
    fn test_infeasible_bitrate_is_config_error() {
        let config = EncoderConfig::average(2, 44100, BitrateLimits::nominal(1_000));
        assert!(matches!(VorbisAnalyzer::new(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_channel_mismatch() -> anyhow::Result<()> {
        let mut analyzer = VorbisAnalyzer::new(&EncoderConfig::quality(2, 44100, 0.1))?;
        analyzer.header_packets()?;
        let result = analyzer.send_block(&SampleBlock::silence(1, 64));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        Ok(())
    }
}
