pub mod channel;
pub mod convert;
pub mod frame;
pub mod process;
pub mod simd;
