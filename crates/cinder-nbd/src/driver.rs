//! NBD driver abstraction.
//!
//! A driver attaches a [`Device`] to a kernel NBD slot. The kernel driver
//! lives in [`crate::kernel`]; tests substitute their own.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use cinder_block::Device;
use cinder_common::CinderResult;

/// Attaches devices to NBD slots.
#[async_trait]
pub trait NbdDriver: Send + Sync + fmt::Debug {
    /// Export `device` as NBD slot `slot`.
    ///
    /// Resolves once the export is live and the device node can be opened.
    /// Dropping the future before then abandons the export.
    async fn connect(&self, slot: u32, device: Arc<dyn Device>) -> CinderResult<Box<dyn NbdConnection>>;
}

/// A live export.
#[async_trait]
pub trait NbdConnection: Send + Sync + fmt::Debug {
    /// The exported slot.
    fn slot(&self) -> u32;

    /// Tear down the export and wait for the serving side to finish.
    async fn disconnect(&mut self) -> CinderResult<()>;
}
