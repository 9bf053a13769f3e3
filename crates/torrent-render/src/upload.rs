// SPDX-License-Identifier: CEPL-1.0
//! Staged host-to-device uploads.
//!
//! Every upload is a full round trip: fill scratch, record copy plus
//! visibility barrier, submit, wait for the device to go idle. Fine for load
//! time, wrong for per-frame streaming.

use thiserror::Error;

/// Host-visible memory the upload path writes through.
pub trait StagingBuffer {
    fn capacity(&self) -> u64;
    /// Persistently mapped bytes, `None` if the allocation is not host visible.
    fn mapped_mut(&mut self) -> Option<&mut [u8]>;
}

pub trait DeviceBuffer {
    fn capacity(&self) -> u64;
}

/// The command recording and submission half of an upload.
pub trait TransferContext {
    type Buffer: DeviceBuffer;
    type Staging: StagingBuffer;
    type Error;

    fn begin(&mut self) -> Result<(), Self::Error>;
    fn copy(&mut self, src: &Self::Staging, dst: &Self::Buffer, size: u64) -> Result<(), Self::Error>;
    /// Makes the transfer write visible to every later shader, index and
    /// indirect read of `dst`.
    fn visibility_barrier(&mut self, dst: &Self::Buffer) -> Result<(), Self::Error>;
    /// Returns once the device has drained every queue.
    fn submit_and_wait_idle(&mut self) -> Result<(), Self::Error>;
}

#[derive(Debug, Error)]
pub enum UploadError<E> {
    #[error("scratch buffer holds {capacity} bytes, upload needs {needed}")]
    ScratchTooSmall { needed: u64, capacity: u64 },
    #[error("destination buffer holds {capacity} bytes, upload needs {needed}")]
    DestinationTooSmall { needed: u64, capacity: u64 },
    #[error("scratch buffer is not host visible")]
    ScratchNotMapped,
    #[error("transfer failed")]
    Transfer(#[source] E),
}

pub fn upload_buffer<C: TransferContext>(
    ctx: &mut C,
    dst: &C::Buffer,
    scratch: &mut C::Staging,
    data: &[u8],
) -> Result<(), UploadError<C::Error>> {
    let needed = data.len() as u64;
    if needed == 0 {
        return Ok(());
    }
    if scratch.capacity() < needed {
        return Err(UploadError::ScratchTooSmall { needed, capacity: scratch.capacity() });
    }
    if dst.capacity() < needed {
        return Err(UploadError::DestinationTooSmall { needed, capacity: dst.capacity() });
    }

    let mapped = scratch.mapped_mut().ok_or(UploadError::ScratchNotMapped)?;
    mapped[..data.len()].copy_from_slice(data);

    ctx.begin().map_err(UploadError::Transfer)?;
    ctx.copy(scratch, dst, needed).map_err(UploadError::Transfer)?;
    ctx.visibility_barrier(dst).map_err(UploadError::Transfer)?;
    ctx.submit_and_wait_idle().map_err(UploadError::Transfer)?;

    tracing::debug!(bytes = needed, "staged upload complete");
    Ok(())
}
