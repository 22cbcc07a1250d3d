//! Guest-side driver for the goldfish pipe device.
//!
//! A single register window multiplexes any number of byte-stream pipes
//! between guest callers and host services. Each pipe owns a command buffer
//! page; commands are executed synchronously by writing the pipe ID to the
//! execute register, while asynchronous host events arrive through an
//! interrupt and a shared page listing signalled pipes.
//!
//! The crate is hosted: register access, physical memory, page allocation and
//! user address spaces are supplied by the embedder through the traits in
//! [`hal`]. Interrupt delivery is driven by calling [`PipeDevice::interrupt`].

mod command;
mod device;
mod dma;
mod pipe;
mod signal;
mod table;

pub mod config;
pub mod error;
pub mod hal;
pub mod layout;
pub mod sg;
pub mod wait;

pub use config::{ConfigError, PipeDeviceConfig};
pub use device::{IrqReturn, PipeDevice};
pub use dma::{DmaControl, DmaControlReply};
pub use error::{InitError, PipeError, Result};
pub use hal::{
    AddressSpace, GuestMemory, PageAllocator, Platform, RegisterWindow, RemapError, UserMapping,
};
pub use pipe::{IoOptions, Pipe, PipeState, PollMask};
pub use sg::{BufferDescriptor, Direction, ScatterGatherMapper};
pub use wait::{CancelToken, Cancelled, WaitFlags, WaitQueue};
