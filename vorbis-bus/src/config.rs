use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MIN_QUALITY: f32 = -0.1;
pub const MAX_QUALITY: f32 = 1.0;

/// Bitrate limits in bits per second. `None` means unconstrained.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitrateLimits {
    #[serde(default)]
    pub max: Option<u32>,
    #[serde(default)]
    pub nominal: Option<u32>,
    #[serde(default)]
    pub min: Option<u32>,
}

impl BitrateLimits {
    /// From raw values where any negative number means unconstrained.
    pub fn from_raw(max: i64, nominal: i64, min: i64) -> Self {
        let limit = |v: i64| (v >= 0).then(|| v.min(u32::MAX as i64) as u32);
        Self {
            max: limit(max),
            nominal: limit(nominal),
            min: limit(min),
        }
    }

    pub fn nominal(nominal: u32) -> Self {
        Self {
            nominal: Some(nominal),
            ..Default::default()
        }
    }

    /// (max, nominal, min) with -1 for unconstrained.
    pub fn to_raw(&self) -> (i64, i64, i64) {
        let raw = |v: Option<u32>| v.map(i64::from).unwrap_or(-1);
        (raw(self.max), raw(self.nominal), raw(self.min))
    }

    fn validate(&self) -> Result<()> {
        if self.max.is_none() && self.nominal.is_none() && self.min.is_none() {
            return Err(Error::config("bitrate policy needs at least one limit"));
        }
        for (name, value) in [("max", self.max), ("nominal", self.nominal), ("min", self.min)] {
            if value == Some(0) {
                return Err(Error::config(format!("{} bitrate must be positive", name)));
            }
        }
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(Error::config(format!(
                    "min bitrate {} above max bitrate {}",
                    min, max
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RatePolicy {
    /// True VBR at a target quality in [-0.1, 1.0].
    Quality { quality: f32 },
    /// Bitrate-managed encoding (ABR, or CBR when max == min).
    Average(BitrateLimits),
    /// Quality chosen from a bitrate, with rate management switched off afterwards.
    Managed(BitrateLimits),
}

impl Default for RatePolicy {
    fn default() -> Self {
        RatePolicy::Quality { quality: 0.4 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub channels: usize,
    pub sample_rate: u32,
    #[serde(default)]
    pub policy: RatePolicy,
    /// Comment header tags, written in order.
    #[serde(default)]
    pub comments: Vec<(String, String)>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            channels: 2,
            sample_rate: 44100,
            policy: RatePolicy::default(),
            comments: Vec::new(),
        }
    }
}

impl EncoderConfig {
    pub fn quality(channels: usize, sample_rate: u32, quality: f32) -> Self {
        Self {
            channels,
            sample_rate,
            policy: RatePolicy::Quality { quality },
            comments: Vec::new(),
        }
    }

    pub fn average(channels: usize, sample_rate: u32, limits: BitrateLimits) -> Self {
        Self {
            channels,
            sample_rate,
            policy: RatePolicy::Average(limits),
            comments: Vec::new(),
        }
    }

    pub fn managed(channels: usize, sample_rate: u32, limits: BitrateLimits) -> Self {
        Self {
            channels,
            sample_rate,
            policy: RatePolicy::Managed(limits),
            comments: Vec::new(),
        }
    }

    pub fn with_comment(mut self, tag: &str, value: &str) -> Self {
        self.comments.push((tag.to_string(), value.to_string()));
        self
    }

    /// Checks that do not need the native library.
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.channels > 255 {
            return Err(Error::config(format!(
                "channel count {} outside 1..=255",
                self.channels
            )));
        }
        if self.sample_rate == 0 {
            return Err(Error::config("sample rate must be positive"));
        }
        match &self.policy {
            RatePolicy::Quality { quality } => {
                if !quality.is_finite() || *quality < MIN_QUALITY || *quality > MAX_QUALITY {
                    return Err(Error::config(format!(
                        "quality {} outside [{}, {}]",
                        quality, MIN_QUALITY, MAX_QUALITY
                    )));
                }
            }
            RatePolicy::Average(limits) | RatePolicy::Managed(limits) => limits.validate()?,
        }
        for (tag, _) in &self.comments {
            if tag.is_empty() || tag.contains('=') {
                return Err(Error::config(format!("invalid comment tag {:?}", tag)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(EncoderConfig::default().validate().is_ok());
    }

    #[test]
    fn test_quality_range() {
        assert!(EncoderConfig::quality(2, 44100, -0.1).validate().is_ok());
        assert!(EncoderConfig::quality(2, 44100, 1.0).validate().is_ok());
        assert!(matches!(
            EncoderConfig::quality(2, 44100, 1.2).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            EncoderConfig::quality(2, 44100, f32::NAN).validate(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_channels_and_rate() {
        assert!(EncoderConfig::quality(0, 44100, 0.1).validate().is_err());
        assert!(EncoderConfig::quality(256, 44100, 0.1).validate().is_err());
        assert!(EncoderConfig::quality(2, 0, 0.1).validate().is_err());
    }

    #[test]
    fn test_bitrate_limits() {
        let limits = BitrateLimits::from_raw(-1, 128_000, -1);
        assert_eq!(limits, BitrateLimits::nominal(128_000));
        assert_eq!(limits.to_raw(), (-1, 128_000, -1));
        assert!(EncoderConfig::average(2, 44100, limits).validate().is_ok());

        let none = BitrateLimits::from_raw(-1, -1, -1);
        assert!(EncoderConfig::average(2, 44100, none).validate().is_err());

        let inverted = BitrateLimits::from_raw(64_000, -1, 96_000);
        assert!(EncoderConfig::managed(2, 44100, inverted).validate().is_err());
    }

    #[test]
    fn test_comment_tag_rules() {
        let config = EncoderConfig::default().with_comment("A=B", "c");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_config() -> anyhow::Result<()> {
        let config: EncoderConfig = serde_json::from_str(
            r#"{
                "channels": 1,
                "sample_rate": 48000,
                "policy": { "mode": "average", "nominal": 96000 },
                "comments": [["TITLE", "test"]]
            }"#,
        )?;
        assert_eq!(config.channels, 1);
        assert_eq!(
            config.policy,
            RatePolicy::Average(BitrateLimits::nominal(96_000))
        );
        assert_eq!(config.comments, vec![("TITLE".to_string(), "test".to_string())]);

        let config: EncoderConfig =
            serde_json::from_str(r#"{ "channels": 2, "sample_rate": 44100 }"#)?;
        assert_eq!(config.policy, RatePolicy::default());
        Ok(())
    }
}
