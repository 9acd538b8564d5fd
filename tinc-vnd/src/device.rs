//! Device handles.

use std::path::Path;

use bytes::{Bytes, BytesMut};
use tinc_core::{Error, Result};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Router mode talks IP over a tun-style device; switch and hub modes
/// talk Ethernet over a tap-style device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VndMode {
    Tun,
    Tap,
}

impl VndMode {
    /// Extra room a frame needs on top of the MTU: an Ethernet header on
    /// tap devices, nothing on tun devices.
    fn frame_overhead(self) -> usize {
        match self {
            VndMode::Tun => 0,
            VndMode::Tap => 18,
        }
    }
}

/// Daemon-side handle: frame sink plus identity for hooks and logging.
#[derive(Debug, Clone)]
pub struct VndHandle {
    device: String,
    interface: String,
    mode: VndMode,
    mtu: u16,
    writer: mpsc::Sender<Bytes>,
}

impl VndHandle {
    /// Queue one frame for the host. Never blocks; a full queue drops the
    /// frame with a warning, as the host side is assumed to drain fast.
    pub fn send(&self, frame: Bytes) -> Result<()> {
        self.writer.try_send(frame).map_err(|_| {
            warn!(device = %self.device, "dropping frame: device writer congested");
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "device write queue full",
            ))
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn mode(&self) -> VndMode {
        self.mode
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }
}

/// Open a character-device node and pump frames both ways. One `read`
/// returns one frame; one queued frame becomes one `write`.
pub fn open_file(
    path: &Path,
    interface: &str,
    mode: VndMode,
    mtu: u16,
) -> Result<(VndHandle, mpsc::Receiver<Bytes>)> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::config(format!("cannot open device {}: {e}", path.display())))?;
    let reader = File::from_std(file.try_clone().map_err(Error::Io)?);
    let writer = File::from_std(file);

    let (frames_tx, frames_rx) = mpsc::channel::<Bytes>(256);
    let (writer_tx, writer_rx) = mpsc::channel::<Bytes>(256);

    let handle = VndHandle {
        device: path.display().to_string(),
        interface: interface.to_owned(),
        mode,
        mtu,
        writer: writer_tx,
    };

    let frame_cap = mtu as usize + mode.frame_overhead();
    tokio::spawn(read_loop(reader, frame_cap, frames_tx));
    tokio::spawn(write_loop(writer, writer_rx));

    info!(
        device = %handle.device,
        interface = %handle.interface,
        ?mode,
        "device opened"
    );
    Ok((handle, frames_rx))
}

async fn read_loop(mut file: File, frame_cap: usize, frames: mpsc::Sender<Bytes>) {
    loop {
        let mut buf = BytesMut::zeroed(frame_cap);
        match file.read(&mut buf).await {
            Ok(0) => {
                warn!("device closed");
                return;
            }
            Ok(n) => {
                buf.truncate(n);
                debug!(len = n, "frame from device");
                if frames.send(buf.freeze()).await.is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("device read failed: {e}");
                return;
            }
        }
    }
}

async fn write_loop(mut file: File, mut frames: mpsc::Receiver<Bytes>) {
    while let Some(frame) = frames.recv().await {
        match file.write_all(&frame).await {
            Ok(()) => debug!(len = frame.len(), "frame to device"),
            Err(e) => warn!("device write failed: {e}"),
        }
    }
}

/// Test double: frames written by the daemon land in `outbound`, and the
/// test injects host frames through `inject`.
#[derive(Debug)]
pub struct InMemoryVnd {
    pub handle: VndHandle,
    /// What the daemon reads as host frames.
    pub frames: mpsc::Receiver<Bytes>,
    /// Inject a frame as if the host had sent it.
    pub inject: mpsc::Sender<Bytes>,
    /// Frames the daemon delivered back to the host.
    pub outbound: mpsc::Receiver<Bytes>,
}

/// Build an in-memory device.
pub fn in_memory(mode: VndMode, mtu: u16) -> InMemoryVnd {
    let (inject, frames) = mpsc::channel(256);
    let (writer, outbound) = mpsc::channel(256);
    InMemoryVnd {
        handle: VndHandle {
            device: "memory".to_owned(),
            interface: "vpn0".to_owned(),
            mode,
            mtu,
            writer,
        },
        frames,
        inject,
        outbound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_device_round_trips() {
        let mut vnd = in_memory(VndMode::Tap, 1500);
        assert_eq!(vnd.handle.mtu(), 1500);
        assert_eq!(vnd.handle.mode(), VndMode::Tap);

        vnd.inject.send(Bytes::from_static(&[1, 2, 3])).await.unwrap();
        assert_eq!(vnd.frames.recv().await.unwrap(), Bytes::from_static(&[1, 2, 3]));

        vnd.handle.send(Bytes::from_static(&[4, 5])).unwrap();
        assert_eq!(vnd.outbound.recv().await.unwrap(), Bytes::from_static(&[4, 5]));
    }

    #[tokio::test]
    async fn file_device_reads_and_writes_frames() {
        // A regular file stands in for the device node: reads drain the
        // existing content, writes append.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vnd");
        std::fs::write(&path, [0xaau8; 4]).unwrap();

        let (handle, mut frames) = open_file(&path, "vpn0", VndMode::Tun, 1500).unwrap();
        assert_eq!(handle.mode(), VndMode::Tun);
        let frame = frames.recv().await.unwrap();
        assert_eq!(&frame[..], &[0xaa; 4]);

        handle.send(Bytes::from_static(&[1, 2, 3])).unwrap();
        // Writes land eventually; poll the file until they do.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if std::fs::read(&path).unwrap().len() >= 7 {
                return;
            }
        }
        panic!("frame never written to backing file");
    }
}
