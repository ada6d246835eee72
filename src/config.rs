use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use vorbis_bus::config::{BitrateLimits, EncoderConfig, RatePolicy};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// 16-bit PCM (or WAV) on stdin to Ogg Vorbis on stdout
    Encode,
    /// Ogg Vorbis on stdin to 16-bit PCM on stdout
    Decode,
}

#[derive(Parser, Debug)]
#[command(name = "ovenc")]
#[command(about = "Ogg Vorbis encoder over stdin/stdout")]
#[command(version)]
pub struct Args {
    #[arg(value_enum, default_value = "encode")]
    pub mode: Mode,

    /// Full encoder configuration as JSON; overrides the encoder flags
    #[arg(long, value_name = "FILE", env = "OVENC_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(short, long, default_value = "2")]
    pub channels: usize,

    #[arg(short, long, default_value = "44100")]
    pub rate: u32,

    /// VBR quality in [-0.1, 1.0]
    #[arg(short, long, allow_negative_numbers = true)]
    pub quality: Option<f32>,

    /// Nominal bitrate in bits per second
    #[arg(short, long)]
    pub bitrate: Option<i64>,

    #[arg(long)]
    pub max_bitrate: Option<i64>,

    #[arg(long)]
    pub min_bitrate: Option<i64>,

    /// Pick the quality from the bitrate, then encode as plain VBR
    #[arg(long)]
    pub managed: bool,

    /// Comment tag, repeatable
    #[arg(short, long = "tag", value_name = "KEY=VALUE", value_parser = parse_tag)]
    pub tags: Vec<(String, String)>,

    /// Frames per analysis block
    #[arg(long, default_value = "1024")]
    pub block_frames: usize,

    /// Input has no WAV header
    #[arg(long)]
    pub raw: bool,

    /// Print the run report as JSON on stderr
    #[arg(long)]
    pub report: bool,
}

fn parse_tag(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", s)),
    }
}

impl Args {
    pub fn encoder_config(&self) -> anyhow::Result<EncoderConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str::<EncoderConfig>(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => EncoderConfig {
                channels: self.channels,
                sample_rate: self.rate,
                policy: self.policy(),
                comments: Vec::new(),
            },
        };
        config.comments.extend(self.tags.iter().cloned());
        if !config
            .comments
            .iter()
            .any(|(tag, _)| tag.eq_ignore_ascii_case("ENCODER"))
        {
            config
                .comments
                .push(("ENCODER".to_string(), format!("ovenc {}", env!("CARGO_PKG_VERSION"))));
        }
        config.validate()?;
        Ok(config)
    }

    fn policy(&self) -> RatePolicy {
        let bitrate_given =
            self.bitrate.is_some() || self.max_bitrate.is_some() || self.min_bitrate.is_some();
        if !bitrate_given {
            return RatePolicy::Quality {
                quality: self.quality.unwrap_or(0.1),
            };
        }
        let limits = BitrateLimits::from_raw(
            self.max_bitrate.unwrap_or(-1),
            self.bitrate.unwrap_or(-1),
            self.min_bitrate.unwrap_or(-1),
        );
        if self.managed {
            RatePolicy::Managed(limits)
        } else {
            RatePolicy::Average(limits)
        }
    }
}
