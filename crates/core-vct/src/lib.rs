//! VCT output side: instruction and character maps, the timing formatter,
//! and the streaming vector-section emitter.

pub mod charmap;
pub mod emitter;
pub mod instrmap;
pub mod timing_format;

pub use charmap::VctCharMap;
pub use emitter::VctEmitter;
pub use instrmap::MicroInstructionMap;
pub use timing_format::TimingFormatter;

use core_timing::TimingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VctError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Timing(#[from] TimingError),
}
