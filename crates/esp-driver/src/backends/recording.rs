//! Access-recording transport wrapper

use crate::backend::{BackendType, RegisterIo};
use crate::error::Result;
use esp_chip::coherence::FlushAction;
use esp_chip::regs::Register;
use std::sync::{Arc, Mutex};

/// One observed transport operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Register read and the value returned
    Read(Register, u32),
    /// Register write
    Write(Register, u32),
    /// Cache flush
    Flush(FlushAction),
}

/// Shared handle to the access log of a [`RecordingDevice`].
#[derive(Debug, Clone, Default)]
pub struct AccessLog(Arc<Mutex<Vec<Access>>>);

impl AccessLog {
    fn push(&self, access: Access) {
        if let Ok(mut log) = self.0.lock() {
            log.push(access);
        }
    }

    /// Copy of every access so far, in order.
    pub fn snapshot(&self) -> Vec<Access> {
        self.0.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Register writes so far, in order.
    pub fn writes(&self) -> Vec<(Register, u32)> {
        self.snapshot()
            .into_iter()
            .filter_map(|a| match a {
                Access::Write(reg, value) => Some((reg, value)),
                _ => None,
            })
            .collect()
    }

    /// Forget everything recorded.
    pub fn clear(&self) {
        if let Ok(mut log) = self.0.lock() {
            log.clear();
        }
    }
}

/// Transport that forwards to `D` and records each access.
#[derive(Debug)]
pub struct RecordingDevice<D> {
    inner: D,
    log: AccessLog,
}

impl<D: RegisterIo> RecordingDevice<D> {
    /// Wrap `inner`.
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            log: AccessLog::default(),
        }
    }

    /// Handle to the log; stays valid after the device is boxed.
    pub fn log(&self) -> AccessLog {
        self.log.clone()
    }
}

impl<D: RegisterIo> RegisterIo for RecordingDevice<D> {
    fn read_register(&mut self, reg: Register) -> Result<u32> {
        let value = self.inner.read_register(reg)?;
        self.log.push(Access::Read(reg, value));
        Ok(value)
    }

    fn write_register(&mut self, reg: Register, value: u32) -> Result<()> {
        self.log.push(Access::Write(reg, value));
        self.inner.write_register(reg, value)
    }

    fn flush(&mut self, action: FlushAction) -> Result<()> {
        self.log.push(Access::Flush(action));
        self.inner.flush(action)
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Recording
    }
}
