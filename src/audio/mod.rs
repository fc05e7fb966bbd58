pub mod backend;
pub mod mic;
pub mod pcm;
pub mod radio;

pub use backend::{CaptureBackend, CaptureBackendFactory, CaptureBlock, CaptureSource};
pub use pcm::{encode_block, encode_sample, resample};
pub use radio::RadioBackend;
