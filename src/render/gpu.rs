//! Software GPU model
//!
//! Contexts, share groups, external textures and window surfaces with the
//! same ownership rules a GL driver enforces: a context is current on at most
//! one thread, sibling contexts share textures, and an external texture only
//! exposes a new camera frame after `update_tex_image`.

use crate::utils::error::{CaptureError, CaptureResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

static NEXT_OBJECT_ID: AtomicU32 = AtomicU32::new(1);

fn next_id() -> u32 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Column-major 4x4 identity
pub const IDENTITY_MATRIX: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Texture transform for a front camera: mirror horizontally
pub const MIRROR_MATRIX: [f32; 16] = [
    -1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    1.0, 0.0, 0.0, 1.0,
];

/// Objects shared between sibling contexts
#[derive(Debug)]
pub struct ShareGroup {
    id: u32,
}

/// A rendering context. Create siblings with [`GlContext::create_sibling`].
#[derive(Debug)]
pub struct GlContext {
    id: u32,
    share: Arc<ShareGroup>,
    current: Mutex<Option<ThreadId>>,
    lost: AtomicBool,
}

impl GlContext {
    /// New context with its own share group
    pub fn new_primary() -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            share: Arc::new(ShareGroup { id: next_id() }),
            current: Mutex::new(None),
            lost: AtomicBool::new(false),
        })
    }

    /// New context sharing this one's textures
    pub fn create_sibling(&self) -> CaptureResult<Arc<Self>> {
        if self.is_lost() {
            return Err(CaptureError::InvalidState(format!(
                "context {} is lost",
                self.id
            )));
        }
        Ok(Arc::new(Self {
            id: next_id(),
            share: self.share.clone(),
            current: Mutex::new(None),
            lost: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn shares_with(&self, other: &GlContext) -> bool {
        self.share.id == other.share.id
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }

    /// Thread the context is current on, if any
    pub fn current_thread(&self) -> Option<ThreadId> {
        *self.current.lock()
    }

    /// Bind the context to the calling thread until the guard drops
    pub fn make_current(self: &Arc<Self>) -> CaptureResult<CurrentContext> {
        if self.is_lost() {
            return Err(CaptureError::InvalidState(format!(
                "context {} is lost",
                self.id
            )));
        }
        let me = std::thread::current().id();
        let mut current = self.current.lock();
        match *current {
            Some(owner) if owner != me => Err(CaptureError::InvalidState(format!(
                "context {} is current on another thread",
                self.id
            ))),
            _ => {
                *current = Some(me);
                Ok(CurrentContext {
                    context: self.clone(),
                })
            }
        }
    }
}

/// Releases the context when dropped
#[derive(Debug)]
pub struct CurrentContext {
    context: Arc<GlContext>,
}

impl CurrentContext {
    pub fn context(&self) -> &Arc<GlContext> {
        &self.context
    }
}

impl Drop for CurrentContext {
    fn drop(&mut self) {
        *self.context.current.lock() = None;
    }
}

/// RGBA camera frame as written by the driver
#[derive(Debug, Clone)]
pub struct CameraFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Arc<Vec<u8>>,
    /// Monotonic capture time
    pub timestamp_ns: u64,
}

/// What `update_tex_image` latched
#[derive(Debug, Clone)]
pub struct TexImage {
    pub frame: CameraFrame,
    pub transform: [f32; 16],
}

type FrameListener = Box<dyn Fn() + Send + Sync>;

/// Texture the camera driver streams into
pub struct ExternalTexture {
    id: u32,
    pending: Mutex<Option<CameraFrame>>,
    transform: Mutex<[f32; 16]>,
    listener: Mutex<Option<FrameListener>>,
    posted: AtomicU64,
    latched: AtomicU64,
}

impl ExternalTexture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            pending: Mutex::new(None),
            transform: Mutex::new(IDENTITY_MATRIX),
            listener: Mutex::new(None),
            posted: AtomicU64::new(0),
            latched: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Called once per posted frame, on the producer's thread
    pub fn set_frame_available_listener<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.listener.lock() = Some(Box::new(f));
    }

    pub fn clear_frame_available_listener(&self) {
        *self.listener.lock() = None;
    }

    pub fn set_transform(&self, matrix: [f32; 16]) {
        *self.transform.lock() = matrix;
    }

    /// Producer side. An unlatched frame is replaced, not queued.
    pub fn post_frame(&self, frame: CameraFrame) {
        *self.pending.lock() = Some(frame);
        self.posted.fetch_add(1, Ordering::Relaxed);
        if let Some(listener) = self.listener.lock().as_ref() {
            listener();
        }
    }

    /// Consumer side: latch the newest frame, if one arrived since last time
    pub fn update_tex_image(&self) -> Option<TexImage> {
        let frame = self.pending.lock().take()?;
        self.latched.fetch_add(1, Ordering::Relaxed);
        Some(TexImage {
            frame,
            transform: *self.transform.lock(),
        })
    }

    pub fn frames_posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }

    pub fn frames_latched(&self) -> u64 {
        self.latched.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ExternalTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalTexture")
            .field("id", &self.id)
            .field("posted", &self.frames_posted())
            .finish()
    }
}

/// Rendered RGBA image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if self.width != width || self.height != height {
            *self = Self::new(width, height);
        }
    }
}

/// A window or encoder input the renderer can draw into
pub trait RenderSurface: Send + Sync {
    fn size(&self) -> (u32, u32);

    /// Timestamp attached to the next swap
    fn set_presentation_time(&self, timestamp_ns: u64);

    /// Publish `frame` as the surface contents
    fn swap_buffers(&self, frame: &FrameBuffer) -> CaptureResult<()>;

    /// Drop any buffers; further swaps fail
    fn release(&self);
}

/// On-screen preview surface that keeps the last presented frame
pub struct PreviewSink {
    width: u32,
    height: u32,
    last: Mutex<Option<FrameBuffer>>,
    presented: AtomicU64,
    released: AtomicBool,
}

impl PreviewSink {
    pub fn new(width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            width,
            height,
            last: Mutex::new(None),
            presented: AtomicU64::new(0),
            released: AtomicBool::new(false),
        })
    }

    pub fn frames_presented(&self) -> u64 {
        self.presented.load(Ordering::Relaxed)
    }

    pub fn last_frame(&self) -> Option<FrameBuffer> {
        self.last.lock().clone()
    }
}

impl RenderSurface for PreviewSink {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn set_presentation_time(&self, _timestamp_ns: u64) {}

    fn swap_buffers(&self, frame: &FrameBuffer) -> CaptureResult<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(CaptureError::InvalidState("preview surface released".to_string()));
        }
        *self.last.lock() = Some(frame.clone());
        self.presented.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn release(&self) {
        self.released.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ts: u64) -> CameraFrame {
        CameraFrame {
            width: 2,
            height: 2,
            pixels: Arc::new(vec![0; 16]),
            timestamp_ns: ts,
        }
    }

    #[test]
    fn test_sibling_shares_textures() {
        let primary = GlContext::new_primary();
        let sibling = primary.create_sibling().unwrap();
        let stranger = GlContext::new_primary();
        assert!(primary.shares_with(&sibling));
        assert!(!primary.shares_with(&stranger));
        assert_ne!(primary.id(), sibling.id());
    }

    #[test]
    fn test_context_is_current_on_one_thread() {
        let ctx = GlContext::new_primary();
        let guard = ctx.make_current().unwrap();
        assert_eq!(ctx.current_thread(), Some(std::thread::current().id()));

        let other = ctx.clone();
        let result = std::thread::spawn(move || other.make_current().map(|_| ()))
            .join()
            .unwrap();
        assert!(matches!(result, Err(CaptureError::InvalidState(_))));

        drop(guard);
        assert_eq!(ctx.current_thread(), None);
    }

    #[test]
    fn test_lost_context_refuses_work() {
        let ctx = GlContext::new_primary();
        ctx.mark_lost();
        assert!(ctx.make_current().is_err());
        assert!(ctx.create_sibling().is_err());
    }

    #[test]
    fn test_texture_latches_newest_frame_once() {
        let texture = ExternalTexture::new();
        let notified = Arc::new(AtomicU64::new(0));
        let n = notified.clone();
        texture.set_frame_available_listener(move || {
            n.fetch_add(1, Ordering::SeqCst);
        });

        texture.post_frame(frame(1));
        texture.post_frame(frame(2));
        texture.set_transform(MIRROR_MATRIX);

        let image = texture.update_tex_image().unwrap();
        assert_eq!(image.frame.timestamp_ns, 2);
        assert_eq!(image.transform, MIRROR_MATRIX);
        assert!(texture.update_tex_image().is_none());
        assert_eq!(notified.load(Ordering::SeqCst), 2);
        assert_eq!(texture.frames_latched(), 1);
    }

    #[test]
    fn test_released_preview_rejects_swaps() {
        let sink = PreviewSink::new(4, 4);
        sink.swap_buffers(&FrameBuffer::new(4, 4)).unwrap();
        sink.release();
        assert!(sink.swap_buffers(&FrameBuffer::new(4, 4)).is_err());
        assert_eq!(sink.frames_presented(), 1);
    }
}
