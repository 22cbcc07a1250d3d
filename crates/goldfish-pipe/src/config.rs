use thiserror::Error;

use crate::layout::{
    dev_buf, INITIAL_PIPES_CAPACITY, MAX_BUFFERS_PER_COMMAND, MAX_SIGNALLED_PIPES, PAGE_SIZE,
    PIPE_CURRENT_DEVICE_VERSION, PIPE_DRIVER_VERSION,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("initial pipe table capacity must be non-zero")]
    ZeroPipeCapacity,

    #[error("buffers per command must be between 1 and {max}, got {got}")]
    BuffersPerCommand { got: usize, max: usize },

    #[error("signal buffer of {got} entries does not fit in the shared page (max {max})")]
    SignalBufferTooLarge { got: usize, max: usize },

    #[error("driver version {0} is older than the command-buffer protocol")]
    DriverVersion(u32),
}

/// Tunables for a [`crate::PipeDevice`].
///
/// The defaults match what the host expects from a stock driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeDeviceConfig {
    /// Number of pipe table slots allocated at attach; the table doubles when
    /// full.
    pub initial_pipes_capacity: usize,
    /// Descriptor cap per READ/WRITE command, announced to the host on open.
    pub max_buffers_per_command: usize,
    /// Entries in the signalled-pipe array the host writes into.
    pub max_signalled_pipes: usize,
    /// Version written to the host during the version handshake.
    pub driver_version: u32,
    pub bottom_half_thread_name: String,
}

impl Default for PipeDeviceConfig {
    fn default() -> Self {
        Self {
            initial_pipes_capacity: INITIAL_PIPES_CAPACITY,
            max_buffers_per_command: MAX_BUFFERS_PER_COMMAND,
            max_signalled_pipes: MAX_SIGNALLED_PIPES,
            driver_version: PIPE_DRIVER_VERSION,
            bottom_half_thread_name: "goldfish-pipe-bh".to_string(),
        }
    }
}

impl PipeDeviceConfig {
    pub fn with_initial_pipes_capacity(mut self, capacity: usize) -> Self {
        self.initial_pipes_capacity = capacity;
        self
    }

    pub fn with_max_buffers_per_command(mut self, count: usize) -> Self {
        self.max_buffers_per_command = count;
        self
    }

    pub fn with_max_signalled_pipes(mut self, count: usize) -> Self {
        self.max_signalled_pipes = count;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_pipes_capacity == 0 {
            return Err(ConfigError::ZeroPipeCapacity);
        }
        if self.max_buffers_per_command == 0
            || self.max_buffers_per_command > MAX_BUFFERS_PER_COMMAND
        {
            return Err(ConfigError::BuffersPerCommand {
                got: self.max_buffers_per_command,
                max: MAX_BUFFERS_PER_COMMAND,
            });
        }
        let max_signalled =
            ((PAGE_SIZE - dev_buf::SIGNALLED) / dev_buf::SIGNALLED_ENTRY_BYTES) as usize;
        if self.max_signalled_pipes == 0 || self.max_signalled_pipes > max_signalled {
            return Err(ConfigError::SignalBufferTooLarge {
                got: self.max_signalled_pipes,
                max: max_signalled,
            });
        }
        if self.driver_version < PIPE_CURRENT_DEVICE_VERSION {
            return Err(ConfigError::DriverVersion(self.driver_version));
        }
        Ok(())
    }
}
