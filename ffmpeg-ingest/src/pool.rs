use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use ffmpeg_next::format::Pixel;
use parking_lot::Mutex;

use crate::error::IngestError;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

struct Pixels(ffmpeg_next::frame::Video);

unsafe impl Send for Pixels {}
unsafe impl Sync for Pixels {}

/// Reusable BGR24 buffer of fixed geometry. Whether it is in use is tracked by
/// the owning pool, not by the backing itself.
pub struct VideoFrameBacking {
    id: usize,
    pool_id: u64,
    width: u32,
    height: u32,
    pixels: Mutex<Pixels>,
}

impl VideoFrameBacking {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn with_pixels<R>(&self, f: impl FnOnce(&ffmpeg_next::frame::Video) -> R) -> R {
        f(&self.pixels.lock().0)
    }

    pub fn with_pixels_mut<R>(&self, f: impl FnOnce(&mut ffmpeg_next::frame::Video) -> R) -> R {
        f(&mut self.pixels.lock().0)
    }
}

struct Slot {
    backing: Arc<VideoFrameBacking>,
    in_use: bool,
}

/// Growable pool of [`VideoFrameBacking`]s. Acquiring never blocks: when every
/// backing is taken a new one is allocated.
pub struct BackingPool {
    id: u64,
    width: u32,
    height: u32,
    slots: Mutex<Vec<Slot>>,
}

impl BackingPool {
    pub fn new(width: u32, height: u32, initial: usize) -> Self {
        let pool = Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            slots: Mutex::new(Vec::with_capacity(initial)),
        };
        {
            let mut slots = pool.slots.lock();
            for _ in 0..initial {
                let backing = pool.allocate(slots.len());
                slots.push(Slot {
                    backing,
                    in_use: false,
                });
            }
        }
        log::debug!(
            "allocated {} frame backings of {}x{}",
            initial,
            width,
            height
        );
        pool
    }

    fn allocate(&self, id: usize) -> Arc<VideoFrameBacking> {
        Arc::new(VideoFrameBacking {
            id,
            pool_id: self.id,
            width: self.width,
            height: self.height,
            pixels: Mutex::new(Pixels(ffmpeg_next::frame::Video::new(
                Pixel::BGR24,
                self.width,
                self.height,
            ))),
        })
    }

    pub fn acquire(&self) -> Arc<VideoFrameBacking> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|slot| !slot.in_use) {
            slot.in_use = true;
            return slot.backing.clone();
        }
        let backing = self.allocate(slots.len());
        log::warn!(
            "frame backing pool exhausted, allocated backing {} (consumers are falling behind)",
            backing.id
        );
        slots.push(Slot {
            backing: backing.clone(),
            in_use: true,
        });
        backing
    }

    pub fn release(&self, backing: &Arc<VideoFrameBacking>) -> anyhow::Result<()> {
        if backing.pool_id != self.id {
            return Err(IngestError::logic(format!(
                "backing {} belongs to another pool",
                backing.id
            )));
        }
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(backing.id)
            .ok_or_else(|| IngestError::logic(format!("unknown backing {}", backing.id)))?;
        if !slot.in_use {
            return Err(IngestError::logic(format!(
                "backing {} released while not in use",
                backing.id
            )));
        }
        slot.in_use = false;
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.slots.lock().iter().all(|slot| slot.in_use)
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.in_use).count()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_grows_when_exhausted() {
        let pool = BackingPool::new(4, 4, 2);
        let a = pool.acquire();
        let b = pool.acquire();
        assert!(pool.is_full());
        let c = pool.acquire();
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.in_use(), 3);
        let ids = [a.id(), b.id(), c.id()];
        assert_eq!(ids, [0, 1, 2]);
    }

    #[test]
    fn test_release_makes_backing_reusable() -> anyhow::Result<()> {
        let pool = BackingPool::new(4, 4, 2);
        let a = pool.acquire();
        let b = pool.acquire();
        pool.release(&a)?;
        assert!(!pool.is_full());
        let again = pool.acquire();
        assert_eq!(again.id(), a.id());
        assert_ne!(again.id(), b.id());
        assert_eq!(pool.capacity(), 2);
        Ok(())
    }

    #[test]
    fn test_double_release_is_logic_error() -> anyhow::Result<()> {
        let pool = BackingPool::new(4, 4, 1);
        let a = pool.acquire();
        pool.release(&a)?;
        let err = pool.release(&a).unwrap_err();
        assert!(matches!(IngestError::of(&err), Some(IngestError::Logic(_))));
        Ok(())
    }

    #[test]
    fn test_foreign_backing_rejected() {
        let pool = BackingPool::new(4, 4, 1);
        let other = BackingPool::new(4, 4, 1);
        let foreign = other.acquire();
        let err = pool.release(&foreign).unwrap_err();
        assert!(matches!(IngestError::of(&err), Some(IngestError::Logic(_))));
        assert_eq!(other.in_use(), 1);
    }

    #[test]
    fn test_pixels_have_backing_geometry() {
        let pool = BackingPool::new(6, 2, 1);
        let backing = pool.acquire();
        let (w, h, fmt) = backing.with_pixels(|p| (p.width(), p.height(), p.format()));
        assert_eq!((w, h, fmt), (6, 2, Pixel::BGR24));
    }
}
