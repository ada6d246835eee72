use std::ffi::CStr;

pub mod block;
pub mod codec;
pub mod config;
pub mod decoder;
pub mod demux;
pub mod encoder;
pub mod error;
pub mod mux;
pub mod packet;
pub mod pipeline;
pub mod session;
pub mod task;

pub use error::{Error, Result};

/// Vendor string of the linked libvorbis.
pub fn version_string() -> String {
    let ptr = unsafe { aotuv_lancer_vorbis_sys::vorbis_version_string() };
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}
