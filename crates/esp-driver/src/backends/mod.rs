//! Register transport implementations
//!
//! Three backends available:
//! - **Mmio**: UIO register window mapped with `mmap` (real ESP tiles)
//! - **Software**: accelerator model running the streaming pipeline against
//!   simulated physical memory (CI, development)
//! - **Recording**: wrapper logging every access of another backend

pub mod mmio;
pub mod recording;
pub mod software;

pub use mmio::MmioDevice;
pub use recording::{Access, AccessLog, RecordingDevice};
pub use software::{Completion, DeviceCounters, SoftwareAccelerator};
