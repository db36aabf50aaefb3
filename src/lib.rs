//! fabric9 - Userspace Driver Fabric
//!
//! fabric9 exports hardware devices as file hierarchies over the 9P2000
//! protocol. Drivers run as isolated userspace servers; each one implements
//! a file-server contract and the fabric turns 9P file operations into
//! device I/O.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        9P2000 clients                        │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ byte transport (pipe/socket)
//! ┌──────────────────────────────┴───────────────────────────────┐
//! │  server: request-reply loop, fid table, msize negotiation    │
//! │  proto:  wire codec (Tversion..Rwstat, qids, stats)          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  fabric: capabilities, lifecycle, health, factory, manager   │
//! ├───────────────────────────┬──────────────────────────────────┤
//! │  block driver             │  framebuffer driver              │
//! │  disk/N/{data,ctl,        │  draw/screenN/{info,data,text,   │
//! │          geometry,part/M} │    rect,line,cursor,ctl,...}     │
//! │  RMW, MBR/GPT             │  pixels, text, dirty tracking    │
//! ├───────────────────────────┴──────────────────────────────────┤
//! │  device: StorageBackend / DisplayBackend contracts           │
//! │  hw:     MMIO region, IRQ events, DMA arena                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use fabric9::block::BlockDriver;
//! use fabric9::device::MemoryDisk;
//! use fabric9::server::Server;
//!
//! let disk = MemoryDisk::new(1, 2048);           // one device, 2048 sectors
//! let driver = BlockDriver::new("blk0", disk.into());
//! driver.initialize(&config)?;
//! driver.start()?;
//!
//! let server = Server::new(driver.clone());
//! server.serve(&mut connection)?;                // one connection per call
//! ```

// Protocol engine
pub mod proto;
pub mod server;

// Driver framework
pub mod fabric;

// Device and hardware contracts
pub mod device;
pub mod hw;

// Drivers
pub mod block;
pub mod fb;

mod error;

pub use error::{DriverError, DriverResult};
pub use fabric::{
    Capability, DriverConfig, Health, HealthStatus, Driver, DeviceOps,
    DriverHandle, DriverFactory, DriverManager, CancelToken,
};
pub use server::{FileServer, Server};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
