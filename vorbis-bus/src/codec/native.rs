//! Owning guards for the native libvorbis state structs.
//!
//! Each struct lives in its own heap allocation because the library keeps
//! pointers between them (dsp state -> info, block -> dsp state). Owners must
//! declare fields so they drop block, dsp, comment, info.

use std::ffi::CString;

use aotuv_lancer_vorbis_sys::{
    vorbis_block, vorbis_block_clear, vorbis_block_init, vorbis_comment, vorbis_comment_add_tag,
    vorbis_comment_clear, vorbis_comment_init, vorbis_comment_query, vorbis_comment_query_count,
    vorbis_dsp_clear, vorbis_dsp_state, vorbis_info, vorbis_info_clear, vorbis_info_init,
};

use super::check;
use crate::error::{Error, Result};

pub(crate) struct Info(Box<vorbis_info>);

impl Info {
    pub fn new() -> Self {
        let mut info: Box<vorbis_info> = Box::new(unsafe { std::mem::zeroed() });
        unsafe { vorbis_info_init(&mut *info) };
        Self(info)
    }

    pub fn as_mut_ptr(&mut self) -> *mut vorbis_info {
        &mut *self.0
    }

    pub fn channels(&self) -> usize {
        self.0.channels.max(0) as usize
    }

    pub fn rate(&self) -> u32 {
        self.0.rate.max(0) as u32
    }

    pub fn bitrate_upper(&self) -> i64 {
        self.0.bitrate_upper as i64
    }

    pub fn bitrate_nominal(&self) -> i64 {
        self.0.bitrate_nominal as i64
    }

    pub fn bitrate_lower(&self) -> i64 {
        self.0.bitrate_lower as i64
    }
}

impl Drop for Info {
    fn drop(&mut self) {
        unsafe { vorbis_info_clear(&mut *self.0) };
    }
}

pub(crate) struct Comment(Box<vorbis_comment>);

impl Comment {
    pub fn new() -> Self {
        let mut comment: Box<vorbis_comment> = Box::new(unsafe { std::mem::zeroed() });
        unsafe { vorbis_comment_init(&mut *comment) };
        Self(comment)
    }

    pub fn as_mut_ptr(&mut self) -> *mut vorbis_comment {
        &mut *self.0
    }

    pub fn add_tag(&mut self, tag: &str, value: &str) -> Result<()> {
        let tag = CString::new(tag)
            .map_err(|_| Error::invalid_input(format!("comment tag {:?} contains NUL", tag)))?;
        let value = CString::new(value)
            .map_err(|_| Error::invalid_input(format!("comment value {:?} contains NUL", value)))?;
        unsafe { vorbis_comment_add_tag(&mut *self.0, tag.as_ptr(), value.as_ptr()) };
        Ok(())
    }

    pub fn vendor(&self) -> String {
        if self.0.vendor.is_null() {
            return String::new();
        }
        unsafe { std::ffi::CStr::from_ptr(self.0.vendor) }
            .to_string_lossy()
            .into_owned()
    }

    /// User comments as stored, usually `TAG=value`.
    pub fn user_comments(&self) -> Vec<String> {
        let count = self.0.comments.max(0) as usize;
        if count == 0 || self.0.user_comments.is_null() || self.0.comment_lengths.is_null() {
            return Vec::new();
        }
        (0..count)
            .filter_map(|i| unsafe {
                let ptr = *self.0.user_comments.add(i);
                let len = *self.0.comment_lengths.add(i);
                if ptr.is_null() || len < 0 {
                    return None;
                }
                let bytes = std::slice::from_raw_parts(ptr as *const u8, len as usize);
                Some(String::from_utf8_lossy(bytes).into_owned())
            })
            .collect()
    }

    pub fn query(&mut self, tag: &str, index: usize) -> Option<String> {
        let tag = CString::new(tag).ok()?;
        let ptr = unsafe { vorbis_comment_query(&mut *self.0, tag.as_ptr(), index as _) };
        if ptr.is_null() {
            return None;
        }
        Some(
            unsafe { std::ffi::CStr::from_ptr(ptr) }
                .to_string_lossy()
                .into_owned(),
        )
    }

    pub fn query_count(&mut self, tag: &str) -> usize {
        match CString::new(tag) {
            Ok(tag) => unsafe { vorbis_comment_query_count(&mut *self.0, tag.as_ptr()) }.max(0)
                as usize,
            Err(_) => 0,
        }
    }
}

impl Drop for Comment {
    fn drop(&mut self) {
        unsafe { vorbis_comment_clear(&mut *self.0) };
    }
}

/// Transform state. Only constructed after a successful analysis or
/// synthesis init, so dropping it always pairs with that init.
pub(crate) struct DspState(Box<vorbis_dsp_state>);

impl DspState {
    /// Run `init` on a zeroed state and take ownership if it succeeds.
    pub fn init(
        what: &str,
        init: impl FnOnce(*mut vorbis_dsp_state) -> std::os::raw::c_int,
    ) -> Result<Self> {
        let mut dsp: Box<vorbis_dsp_state> = Box::new(unsafe { std::mem::zeroed() });
        check(init(&mut *dsp), what)?;
        Ok(Self(dsp))
    }

    pub fn as_mut_ptr(&mut self) -> *mut vorbis_dsp_state {
        &mut *self.0
    }
}

impl Drop for DspState {
    fn drop(&mut self) {
        unsafe { vorbis_dsp_clear(&mut *self.0) };
    }
}

pub(crate) struct WorkBlock(Box<vorbis_block>);

impl WorkBlock {
    pub fn new(dsp: &mut DspState) -> Result<Self> {
        let mut block: Box<vorbis_block> = Box::new(unsafe { std::mem::zeroed() });
        check(
            unsafe { vorbis_block_init(dsp.as_mut_ptr(), &mut *block) },
            "vorbis_block_init",
        )?;
        Ok(Self(block))
    }

    pub fn as_mut_ptr(&mut self) -> *mut vorbis_block {
        &mut *self.0
    }
}

impl Drop for WorkBlock {
    fn drop(&mut self) {
        unsafe { vorbis_block_clear(&mut *self.0) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comment_tags() -> anyhow::Result<()> {
        let mut comment = Comment::new();
        comment.add_tag("ENCODER", "ovenc")?;
        comment.add_tag("ARTIST", "first")?;
        comment.add_tag("ARTIST", "second")?;

        assert_eq!(comment.query_count("ARTIST"), 2);
        assert_eq!(comment.query("ARTIST", 1).as_deref(), Some("second"));
        assert_eq!(comment.query("TITLE", 0), None);
        assert_eq!(
            comment.user_comments(),
            vec!["ENCODER=ovenc", "ARTIST=first", "ARTIST=second"]
        );
        Ok(())
    }

    #[test]
    fn test_comment_rejects_nul() {
        let mut comment = Comment::new();
        assert!(matches!(
            comment.add_tag("BAD\0TAG", "x"),
            Err(Error::InvalidInput(_))
        ));
    }
}
