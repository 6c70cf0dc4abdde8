pub mod host;
pub mod wgpu;

use crate::mem::MemorySnapshot;
use crate::ten::Shape;
use ndarray::{ArcArray, IxDyn};
use std::fmt::{Display, Formatter};

#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("No usable accelerator: {reason}")]
    Unavailable { reason: String },
    #[error("Could not open device: {0}")]
    RequestDevice(#[from] ::wgpu::RequestDeviceError),
    #[error("Out of memory: requested {requested} bytes with {reserved} of {limit} bytes reserved")]
    OutOfMemory {
        requested: u64,
        reserved: u64,
        limit: u64,
    },
    #[error("Device out of memory while allocating {requested} bytes")]
    DeviceOutOfMemory { requested: u64 },
    #[error("Size of a {shape} f32 block does not fit in memory addressing")]
    SizeOverflow { shape: Shape },
    #[error("Buffer of {requested} bytes exceeds the device maximum of {max} bytes")]
    BufferTooLarge { requested: u64, max: u64 },
    #[error("Device error: {0}")]
    Device(String),
    #[error("Readback failed: {0}")]
    Map(#[from] ::wgpu::BufferAsyncError),
    #[error("Wrong shape: {got:?} expected: {expected:?}")]
    WrongShape { expected: Shape, got: Shape },
    #[error("Readback mismatch at element {index}: uploaded {expected}, read {got}")]
    Mismatch { index: usize, expected: f32, got: f32 },
    #[error("Invalid {key}={value:?}: {reason}")]
    Config {
        key: String,
        value: String,
        reason: String,
    },
    #[error("Output failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ErrorKind {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ErrorKind::Unavailable { .. })
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            ErrorKind::OutOfMemory { .. }
                | ErrorKind::DeviceOutOfMemory { .. }
                | ErrorKind::BufferTooLarge { .. }
                | ErrorKind::SizeOverflow { .. }
        )
    }
}

pub type Error = Box<ErrorKind>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Other,
    /// Host memory standing in for a device, used by dry runs.
    Host,
}

impl DeviceKind {
    /// Whether this is a real accelerator rather than a software rasterizer.
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, DeviceKind::Cpu | DeviceKind::Host)
    }
}

impl Display for DeviceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DeviceKind::Discrete => "discrete",
            DeviceKind::Integrated => "integrated",
            DeviceKind::Virtual => "virtual",
            DeviceKind::Cpu => "cpu",
            DeviceKind::Host => "host",
            DeviceKind::Other => "other",
        })
    }
}

/// Identifies a selected device for the lifetime of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub kind: DeviceKind,
    /// Graphics API the device is driven through.
    pub api: String,
}

impl Display for DeviceInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}, {})", self.name, self.api, self.kind)
    }
}

/// Pick the device at `index`. Software devices only qualify when `allow_software` is set.
pub fn select_device(
    devices: &[DeviceInfo],
    index: usize,
    allow_software: bool,
) -> Result<&DeviceInfo, Error> {
    let usable = |d: &&DeviceInfo| allow_software || d.kind.is_accelerator();
    if !devices.iter().any(|d| usable(&d)) {
        return Err(ErrorKind::Unavailable {
            reason: format!("{} adapter(s) found, none usable", devices.len()),
        }
        .into());
    }

    match devices.get(index) {
        Some(d) if usable(&d) => Ok(d),
        Some(d) => Err(ErrorKind::Unavailable {
            reason: format!("device {index} ({d}) is a software adapter"),
        }
        .into()),
        None => Err(ErrorKind::Unavailable {
            reason: format!("no device with index {index}, {} found", devices.len()),
        }
        .into()),
    }
}

pub trait Backend: Sized {
    type Buffer: BufferT<Self>;

    fn info(&self) -> &DeviceInfo;

    /// Allocate a buffer for a dense `f32` block of `shape` through the memory pool.
    fn buffer(&mut self, shape: &Shape) -> Result<Self::Buffer, Error>;

    /// Current allocated and reserved bytes.
    fn memory_usage(&self) -> MemorySnapshot;

    /// Highest allocated bytes seen so far.
    fn peak_allocated(&self) -> u64;

    /// Block until all submitted work has finished.
    fn synchronize(&mut self);

    /// Release cached blocks back to the device. Returns released bytes.
    fn empty_cache(&mut self) -> u64;

    /// Enter a region bound to this device. Scopes nest.
    fn enter_scope(&mut self);

    /// Leave the innermost region, reporting any device error raised inside it.
    fn exit_scope(&mut self) -> Result<(), Error>;
}

/// Every buffer implementation must be able to materialize host data
pub trait BufferT<E: Backend<Buffer = Self>>: Sized {
    fn upload(&self, e: &mut E, n: ArcArray<f32, IxDyn>) -> Result<(), Error>;
    fn download(&self, shape: &Shape, e: &mut E) -> Result<ArcArray<f32, IxDyn>, Error>;
}
