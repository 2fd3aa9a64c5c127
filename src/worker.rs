//! Background loops that run beside the interactive thread.
//!
//! A [`Ticker`] owns one std thread that wakes on a fixed cadence and runs a
//! job until the job asks to stop or the ticker is stopped/dropped.  Jobs
//! only ever touch the canvas through [`ChunkLock`], one short critical
//! section per tick.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::canvas::ChunkLock;
use crate::error::Result;
use crate::io;
use crate::{log_info, log_warn};

pub struct Ticker {
    name: String,
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Run `job` every `interval` on a named thread.  Returning `false`
    /// from the job ends the loop.
    pub fn spawn(
        name: &str,
        interval: Duration,
        mut job: impl FnMut() -> bool + Send + 'static,
    ) -> Result<Ticker> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let interval = interval.max(Duration::from_millis(1));
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if !job() {
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;
        log_info!("Started worker '{}' ({:?} cadence)", name, interval);
        Ok(Ticker { name: name.to_string(), stop_tx: Some(stop_tx), handle: Some(handle) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the loop and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log_warn!("Worker '{}' panicked", self.name);
            } else {
                log_info!("Stopped worker '{}'", self.name);
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// ANIMATION PLAYBACK
// ============================================================================

/// Steps the current frame forward at `fps`, wrapping at the end.
pub struct AnimationPlayer {
    lock: Arc<ChunkLock>,
}

impl AnimationPlayer {
    pub fn new(lock: Arc<ChunkLock>) -> Self {
        Self { lock }
    }

    /// Advance one frame; returns the new frame index.
    pub fn advance(&self) -> usize {
        self.lock.write(|c| {
            let count = c.frame_count().max(1);
            let next = (c.current_frame + 1) % count;
            if next != c.current_frame {
                c.current_frame = next;
                c.clear_preview();
                c.mark_dirty(None);
            }
            next
        })
    }

    pub fn start(self, fps: f32) -> Result<Ticker> {
        let fps = if fps.is_finite() { fps.clamp(1.0, 60.0) } else { 12.0 };
        let interval = Duration::from_secs_f32(1.0 / fps);
        Ticker::spawn("paintcore-playback", interval, move || {
            self.advance();
            true
        })
    }
}

// ============================================================================
// AUTOSAVE
// ============================================================================

/// Writes `<dir>/<name>.autosave.pcp` on a timer.
pub struct Autosave {
    lock: Arc<ChunkLock>,
    path: PathBuf,
}

impl Autosave {
    pub fn new(lock: Arc<ChunkLock>, dir: &Path, project_name: &str) -> Self {
        let safe_name: String = project_name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = dir.join(format!("{}.autosave.{}", safe_name, io::PROJECT_EXTENSION));
        Self { lock, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy the canvas under the lock, then serialize without holding it.
    pub fn save_now(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let data = self.lock.read(io::build_project);
        io::write_project(&data, &self.path)
    }

    /// `None` when `minutes` is 0 (autosave disabled).
    pub fn start(self, minutes: u32) -> Result<Option<Ticker>> {
        if minutes == 0 {
            return Ok(None);
        }
        self.start_every(Duration::from_secs(minutes as u64 * 60)).map(Some)
    }

    pub fn start_every(self, interval: Duration) -> Result<Ticker> {
        Ticker::spawn("paintcore-autosave", interval, move || {
            match self.save_now() {
                Ok(()) => {
                    log_info!("Auto-save OK  ->  {}", self.path.display());
                }
                Err(e) => {
                    log_warn!("Auto-save failed for {}: {}", self.path.display(), e);
                }
            }
            true
        })
    }
}
