//! Fences, semaphores, and per-frame synchronization.

use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;
use std::sync::Arc;

/// Status reported by [`Fence::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    Unsignaled,
}

/// Owned fence.
pub struct Fence {
    device: Arc<ash::Device>,
    handle: vk::Fence,
}

impl Fence {
    /// Create a fence, optionally already signaled.
    pub fn new(device: &Device, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        let handle = unsafe { device.handle().create_fence(&info, None) }?;
        Ok(Self {
            device: device.shared(),
            handle,
        })
    }

    /// Get the raw fence handle.
    #[must_use]
    pub const fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Block until the fence signals or `timeout_ns` elapses.
    pub fn wait(&self, timeout_ns: u64) -> Result<()> {
        unsafe {
            self.device
                .wait_for_fences(&[self.handle], true, timeout_ns)?;
        }
        Ok(())
    }

    /// Move the fence back to the unsignaled state.
    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.device.reset_fences(&[self.handle])?;
        }
        Ok(())
    }

    /// Query the current fence state without blocking.
    pub fn status(&self) -> Result<FenceStatus> {
        let signaled = unsafe { self.device.get_fence_status(self.handle) }?;
        Ok(if signaled {
            FenceStatus::Signaled
        } else {
            FenceStatus::Unsignaled
        })
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.handle, None);
        }
    }
}

/// Owned binary semaphore.
pub struct Semaphore {
    device: Arc<ash::Device>,
    handle: vk::Semaphore,
}

impl Semaphore {
    /// Create a binary semaphore.
    pub fn new(device: &Device) -> Result<Self> {
        let info = vk::SemaphoreCreateInfo::default();
        let handle = unsafe { device.handle().create_semaphore(&info, None) }?;
        Ok(Self {
            device: device.shared(),
            handle,
        })
    }

    /// Get the raw semaphore handle.
    #[must_use]
    pub const fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.handle, None);
        }
    }
}

/// Synchronization objects for one frame in flight.
pub struct FrameSync {
    /// Signaled when the swapchain image is available.
    pub image_available: Semaphore,
    /// Signaled when rendering to the image finishes.
    pub render_finished: Semaphore,
    /// Signaled when the frame's command buffer completes.
    pub in_flight: Fence,
}

impl FrameSync {
    /// Create sync objects for one frame. The fence starts signaled so
    /// the first wait does not block.
    pub fn new(device: &Device) -> Result<Self> {
        Ok(Self {
            image_available: Semaphore::new(device)?,
            render_finished: Semaphore::new(device)?,
            in_flight: Fence::new(device, true)?,
        })
    }
}

/// Ring of [`FrameSync`] objects for N frames in flight.
pub struct FrameSyncManager {
    frames: Vec<FrameSync>,
    current: usize,
}

impl FrameSyncManager {
    /// Create sync objects for `frames_in_flight` frames. At least one
    /// frame is required.
    pub fn new(device: &Device, frames_in_flight: usize) -> Result<Self> {
        if frames_in_flight == 0 {
            return Err(GpuError::InvalidState(
                "frames_in_flight must be at least one".to_string(),
            ));
        }
        let frames = (0..frames_in_flight)
            .map(|_| FrameSync::new(device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { frames, current: 0 })
    }

    /// Sync objects for the current frame.
    #[must_use]
    pub fn current(&self) -> &FrameSync {
        &self.frames[self.current]
    }

    /// Advance to the next frame slot.
    pub fn advance(&mut self) {
        if !self.frames.is_empty() {
            self.current = (self.current + 1) % self.frames.len();
        }
    }

    /// Number of frames in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_on_an_empty_ring_does_not_panic() {
        let mut manager = FrameSyncManager {
            frames: Vec::new(),
            current: 0,
        };
        manager.advance();
        assert_eq!(manager.current, 0);
        assert!(manager.is_empty());
    }
}
