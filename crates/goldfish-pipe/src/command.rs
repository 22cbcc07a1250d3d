//! Synchronous request/response commands over a pipe's command buffer.

use std::sync::Arc;

use crate::hal::{GuestMemory, RegisterWindow};
use crate::layout::{cmd_buf, reg, status, PipeCommand};
use crate::sg::BufferDescriptor;
use crate::wait::CommandLockGuard;

/// Typed view of one pipe's command buffer page in guest memory.
#[derive(Clone, Copy)]
pub(crate) struct CommandBuffer<'a> {
    memory: &'a dyn GuestMemory,
    paddr: u64,
}

impl<'a> CommandBuffer<'a> {
    pub(crate) fn new(memory: &'a dyn GuestMemory, paddr: u64) -> Self {
        Self { memory, paddr }
    }

    pub(crate) fn set_command(&self, cmd: PipeCommand) {
        self.memory.write_i32(self.paddr + cmd_buf::CMD, cmd.as_raw());
    }

    pub(crate) fn set_id(&self, id: u32) {
        self.memory.write_u32(self.paddr + cmd_buf::ID, id);
    }

    pub(crate) fn status(&self) -> i32 {
        self.memory.read_i32(self.paddr + cmd_buf::STATUS)
    }

    pub(crate) fn set_status(&self, value: i32) {
        self.memory.write_i32(self.paddr + cmd_buf::STATUS, value);
    }

    pub(crate) fn set_rw_buffers(&self, descriptors: &[BufferDescriptor]) {
        self.memory.write_u32(self.paddr + cmd_buf::RW_BUFFERS_COUNT, descriptors.len() as u32);
        self.memory.write_i32(self.paddr + cmd_buf::RW_CONSUMED_SIZE, 0);
        for (i, desc) in descriptors.iter().enumerate() {
            self.memory.write_u64(self.paddr + cmd_buf::rw_ptr(i), desc.paddr);
            self.memory.write_u32(self.paddr + cmd_buf::rw_size(i), desc.len);
        }
    }

    pub(crate) fn consumed_size(&self) -> i32 {
        self.memory.read_i32(self.paddr + cmd_buf::RW_CONSUMED_SIZE)
    }

    pub(crate) fn set_dma_params(&self, paddr: u64, size: u64) {
        self.memory.write_u64(self.paddr + cmd_buf::DMA_PADDR, paddr);
        self.memory.write_u64(self.paddr + cmd_buf::DMA_SIZE, size);
    }
}

/// Executes commands against the host through the execute register.
pub(crate) struct CommandChannel {
    registers: Arc<dyn RegisterWindow>,
    memory: Arc<dyn GuestMemory>,
}

impl CommandChannel {
    pub(crate) fn new(registers: Arc<dyn RegisterWindow>, memory: Arc<dyn GuestMemory>) -> Self {
        Self { registers, memory }
    }

    pub(crate) fn buffer(&self, paddr: u64) -> CommandBuffer<'_> {
        CommandBuffer::new(&*self.memory, paddr)
    }

    /// Runs `cmd` for pipe `id` and returns the host's status.
    ///
    /// The guard proves the caller holds the pipe's command lock. The status
    /// is preset to [`status::ERROR_INVAL`] so a host that ignores the command
    /// reads as a failure.
    pub(crate) fn execute(
        &self,
        _locked: &CommandLockGuard<'_>,
        buffer_paddr: u64,
        id: u32,
        cmd: PipeCommand,
    ) -> i32 {
        let buffer = self.buffer(buffer_paddr);
        buffer.set_command(cmd);
        buffer.set_id(id);
        buffer.set_status(status::ERROR_INVAL);
        self.registers.write_u32(reg::CMD, id);
        buffer.status()
    }
}
