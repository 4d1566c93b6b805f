//! The Linux NBD driver.
//!
//! The export is served in-process: the kernel gets one end of a socket
//! pair through `NBD_SET_SOCK`, a dedicated thread parks in `NBD_DO_IT` for
//! the lifetime of the export, and [`crate::protocol::serve`] answers
//! requests on the other end.
#![allow(unsafe_code)]

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cinder_block::Device;
use cinder_common::{CinderError, CinderResult, NbdConfig};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::driver::{NbdConnection, NbdDriver};
use crate::path::device_path_in;
use crate::pool::{SlotProbe, SysfsProbe};

const NBD_SET_SOCK: u64 = 0xab00;
const NBD_SET_BLKSIZE: u64 = 0xab01;
const NBD_SET_SIZE: u64 = 0xab02;
const NBD_DO_IT: u64 = 0xab03;
const NBD_CLEAR_SOCK: u64 = 0xab04;
const NBD_CLEAR_QUE: u64 = 0xab05;
const NBD_DISCONNECT: u64 = 0xab08;
const NBD_SET_TIMEOUT: u64 = 0xab09;
const NBD_SET_FLAGS: u64 = 0xab0a;

const NBD_FLAG_HAS_FLAGS: u64 = 1 << 0;
const NBD_FLAG_SEND_FLUSH: u64 = 1 << 2;
const NBD_FLAG_SEND_TRIM: u64 = 1 << 5;

/// Exports devices through `/dev/nbdN`.
#[derive(Debug, Clone)]
pub struct KernelDriver {
    dev_dir: PathBuf,
    probe: SysfsProbe,
    block_size: u64,
    io_timeout: Duration,
    poll_interval: Duration,
}

impl KernelDriver {
    /// A driver using the configured device and sysfs directories.
    #[must_use]
    pub fn new(config: &NbdConfig) -> Self {
        Self {
            dev_dir: config.dev_dir.clone(),
            probe: SysfsProbe::new(&config.sys_block_dir),
            block_size: config.block_size,
            io_timeout: Duration::from_secs(config.io_timeout_secs),
            poll_interval: Duration::from_millis(5),
        }
    }

    /// How often readiness is checked while connecting.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl NbdDriver for KernelDriver {
    #[cfg(target_os = "linux")]
    async fn connect(&self, slot: u32, device: Arc<dyn Device>) -> CinderResult<Box<dyn NbdConnection>> {
        let path = device_path_in(&self.dev_dir, slot);
        let size = device.size();
        let block_size = self.block_size;
        let io_timeout = self.io_timeout.as_secs();

        let (control, kernel_end, server_end) = tokio::task::spawn_blocking(move || {
            configure(&path, size, block_size, io_timeout)
                .map_err(|e| CinderError::from(e).context(format!("configuring {}", path.display())))
        })
        .await
        .map_err(|e| CinderError::Internal {
            message: format!("nbd setup task failed: {e}"),
        })??;

        let (done_tx, done_rx) = oneshot::channel();
        let doer = control.try_clone()?;
        std::thread::Builder::new()
            .name(format!("nbd{slot}-do-it"))
            .spawn(move || {
                let result = do_it(&doer, kernel_end);
                let _ = done_tx.send(result);
            })?;

        server_end.set_nonblocking(true)?;
        let stream = tokio::net::UnixStream::from_std(server_end)?;
        let serve = tokio::spawn(crate::protocol::serve(stream, device));

        // From here on dropping the connection tears the export down.
        let mut connection = KernelConnection {
            slot,
            control,
            do_it: Some(done_rx),
            serve: Some(serve),
            disconnected: false,
        };

        loop {
            if self.probe.in_use(slot)? {
                tracing::debug!(slot, size, "NBD device is ready");
                return Ok(Box::new(connection));
            }

            if let Some(done) = connection.do_it.as_mut() {
                if let Ok(result) = done.try_recv() {
                    connection.do_it = None;
                    connection.disconnected = true;
                    let cause = result.err().map_or_else(|| "exited early".to_string(), |e| e.to_string());
                    return Err(CinderError::Nbd {
                        message: format!("nbd{slot} did not come up: {cause}"),
                    });
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    #[cfg(not(target_os = "linux"))]
    async fn connect(&self, _slot: u32, _device: Arc<dyn Device>) -> CinderResult<Box<dyn NbdConnection>> {
        Err(CinderError::Unsupported {
            feature: "kernel NBD exports".to_string(),
        })
    }
}

/// A live kernel export.
#[derive(Debug)]
pub struct KernelConnection {
    slot: u32,
    control: File,
    do_it: Option<oneshot::Receiver<std::io::Result<()>>>,
    serve: Option<JoinHandle<CinderResult<()>>>,
    disconnected: bool,
}

#[async_trait]
impl NbdConnection for KernelConnection {
    fn slot(&self) -> u32 {
        self.slot
    }

    async fn disconnect(&mut self) -> CinderResult<()> {
        if self.disconnected {
            return Ok(());
        }
        self.disconnected = true;

        let mut errors = Vec::new();

        if let Err(e) = ioctl(&self.control, NBD_DISCONNECT, 0) {
            errors.push(CinderError::from(e).context(format!("disconnecting nbd{}", self.slot)));
        }

        if let Some(done) = self.do_it.take() {
            match done.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(CinderError::from(e).context(format!("nbd{} transmission", self.slot))),
                Err(_) => errors.push(CinderError::Internal {
                    message: format!("nbd{} worker vanished", self.slot),
                }),
            }
        }

        if let Some(serve) = self.serve.take() {
            match serve.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e.context(format!("serving nbd{}", self.slot))),
                Err(e) => errors.push(CinderError::Internal {
                    message: format!("nbd{} server task failed: {e}", self.slot),
                }),
            }
        }

        tracing::debug!(slot = self.slot, "NBD device disconnected");
        CinderError::join(errors)
    }
}

impl Drop for KernelConnection {
    fn drop(&mut self) {
        if self.disconnected {
            return;
        }
        tracing::warn!(slot = self.slot, "NBD connection dropped while live, disconnecting");
        if let Err(e) = ioctl(&self.control, NBD_DISCONNECT, 0) {
            tracing::warn!(slot = self.slot, error = %e, "Failed to disconnect NBD device");
        }
    }
}

/// Open the device node and hand the kernel its socket.
#[cfg(target_os = "linux")]
fn configure(
    path: &std::path::Path,
    size: u64,
    block_size: u64,
    io_timeout_secs: u64,
) -> std::io::Result<(File, std::os::unix::net::UnixStream, std::os::unix::net::UnixStream)> {
    use std::os::unix::io::AsRawFd;

    let control = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    let (kernel_end, server_end) = std::os::unix::net::UnixStream::pair()?;

    // Leftovers from a previous export; failure just means there were none.
    let _ = ioctl(&control, NBD_CLEAR_SOCK, 0);

    ioctl(&control, NBD_SET_BLKSIZE, block_size)?;
    ioctl(&control, NBD_SET_SIZE, size)?;
    if io_timeout_secs > 0 {
        ioctl(&control, NBD_SET_TIMEOUT, io_timeout_secs)?;
    }
    ioctl(
        &control,
        NBD_SET_FLAGS,
        NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH | NBD_FLAG_SEND_TRIM,
    )?;
    ioctl(&control, NBD_SET_SOCK, kernel_end.as_raw_fd() as u64)?;

    Ok((control, kernel_end, server_end))
}

/// Park in `NBD_DO_IT` until the export is disconnected.
fn do_it(control: &File, kernel_end: std::os::unix::net::UnixStream) -> std::io::Result<()> {
    let result = ioctl(control, NBD_DO_IT, 0);

    let _ = ioctl(control, NBD_CLEAR_QUE, 0);
    let _ = ioctl(control, NBD_CLEAR_SOCK, 0);
    drop(kernel_end);

    match result {
        // A requested disconnect ends DO_IT with EPIPE on older kernels.
        Err(e) if e.raw_os_error() == Some(libc::EPIPE) => Ok(()),
        other => other,
    }
}

#[cfg(target_os = "linux")]
fn ioctl(file: &File, request: u64, arg: u64) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: every NBD ioctl used here takes an integer argument.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), request as _, arg as libc::c_ulong) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn ioctl(_file: &File, _request: u64, _arg: u64) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "NBD ioctls require Linux",
    ))
}
