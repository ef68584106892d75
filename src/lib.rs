//! Compare sequential and double-buffered invocation of a detection model on
//! a video stream.

pub mod device;
pub mod executor;
pub mod meter;
pub mod nn;
pub mod postproc;
pub mod preproc;
pub mod sink;
pub mod source;
