/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Cross-process texture import and keyed-mutex ownership.
 *
 * Shared textures travel between processes as NT-shareable handles: opaque
 * pointer-sized integers that any device on the same adapter can open. Each
 * shared texture carries a keyed mutex with the single key 0; at any instant
 * exactly one process holds it, and holding it is the only license to touch
 * the texture contents. The protocol messages are pure control plane. */
use crate::tag;
use log::error;

/** Opaque cross-process texture handle */
pub type RawHandle = u64;

/** The only key value used on shared-texture mutexes */
pub const MUTEX_KEY: u64 = 0;

/** A texture's keyed-mutex interface */
pub trait KeyedMutex {
    /** Block until `key` is acquired; no timeout */
    fn acquire(&self, key: u64) -> Result<(), String>;
    fn release(&self, key: u64) -> Result<(), String>;
}

/** A texture opened on the server's device from a cross-process handle */
pub trait GpuTexture {
    /** Query the keyed-mutex interface. Fails if the producer did not create
     * the texture with the shareable-keyed-mutex flag, which is a hard
     * requirement on clients. */
    fn keyed_mutex(&self) -> Result<Box<dyn KeyedMutex>, String>;
}

/** The graphics device owned by the server process */
pub trait GpuDevice {
    fn open_shared_texture(&self, handle: RawHandle) -> Result<Box<dyn GpuTexture>, String>;
}

/** Client-side view of a texture whose shareable handle can be extracted */
pub trait ShareableTexture {
    fn shared_handle(&self) -> Result<RawHandle, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MutexState {
    Released,
    Held,
}

/** An imported shared texture owned by the server session.
 *
 * The held/released state of the keyed mutex is tracked here so that acquire
 * and release always pair: both are no-ops when the state already matches,
 * and a still-held mutex is released on drop before the mutex and texture
 * references are themselves dropped, each exactly once. */
pub struct ImportedTexture {
    handle: RawHandle,
    state: MutexState,
    /* Field order fixes drop order: mutex reference before texture */
    mutex: Box<dyn KeyedMutex>,
    texture: Box<dyn GpuTexture>,
}

/** Open `handle` on the server's device and query its keyed mutex */
pub fn import_texture(
    device: &dyn GpuDevice,
    handle: RawHandle,
) -> Result<ImportedTexture, String> {
    let texture = device
        .open_shared_texture(handle)
        .map_err(|x| tag!("Failed to open shared texture {:#x}: {}", handle, x))?;
    let mutex = texture
        .keyed_mutex()
        .map_err(|x| tag!("Failed to get keyed mutex for texture {:#x}: {}", handle, x))?;
    Ok(ImportedTexture {
        handle,
        state: MutexState::Released,
        mutex,
        texture,
    })
}

impl ImportedTexture {
    pub fn handle(&self) -> RawHandle {
        self.handle
    }

    pub fn texture(&self) -> &dyn GpuTexture {
        &*self.texture
    }

    pub fn is_held(&self) -> bool {
        self.state == MutexState::Held
    }

    /** Block until this process holds the mutex; no-op when already held */
    pub fn acquire(&mut self) -> Result<(), String> {
        if self.state == MutexState::Held {
            return Ok(());
        }
        self.mutex.acquire(MUTEX_KEY)?;
        self.state = MutexState::Held;
        Ok(())
    }

    /** Hand the mutex back to the peer; no-op when not held */
    pub fn release(&mut self) -> Result<(), String> {
        if self.state == MutexState::Released {
            return Ok(());
        }
        self.state = MutexState::Released;
        self.mutex.release(MUTEX_KEY)
    }
}

impl Drop for ImportedTexture {
    fn drop(&mut self) {
        if self.state == MutexState::Held {
            if let Err(x) = self.mutex.release(MUTEX_KEY) {
                error!("Failed to release mutex for texture {:#x}: {}", self.handle, x);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingMutex {
        acquires: Rc<Cell<u32>>,
        releases: Rc<Cell<u32>>,
    }
    impl KeyedMutex for CountingMutex {
        fn acquire(&self, key: u64) -> Result<(), String> {
            assert_eq!(key, MUTEX_KEY);
            self.acquires.set(self.acquires.get() + 1);
            Ok(())
        }
        fn release(&self, key: u64) -> Result<(), String> {
            assert_eq!(key, MUTEX_KEY);
            self.releases.set(self.releases.get() + 1);
            Ok(())
        }
    }

    struct CountingTexture {
        acquires: Rc<Cell<u32>>,
        releases: Rc<Cell<u32>>,
    }
    impl GpuTexture for CountingTexture {
        fn keyed_mutex(&self) -> Result<Box<dyn KeyedMutex>, String> {
            Ok(Box::new(CountingMutex {
                acquires: self.acquires.clone(),
                releases: self.releases.clone(),
            }))
        }
    }

    struct CountingDevice {
        acquires: Rc<Cell<u32>>,
        releases: Rc<Cell<u32>>,
    }
    impl GpuDevice for CountingDevice {
        fn open_shared_texture(&self, handle: RawHandle) -> Result<Box<dyn GpuTexture>, String> {
            if handle == 0 {
                return Err(tag!("Invalid handle"));
            }
            Ok(Box::new(CountingTexture {
                acquires: self.acquires.clone(),
                releases: self.releases.clone(),
            }))
        }
    }

    fn counting_device() -> (CountingDevice, Rc<Cell<u32>>, Rc<Cell<u32>>) {
        let acquires = Rc::new(Cell::new(0));
        let releases = Rc::new(Cell::new(0));
        (
            CountingDevice {
                acquires: acquires.clone(),
                releases: releases.clone(),
            },
            acquires,
            releases,
        )
    }

    #[test]
    fn acquire_release_pairing() {
        let (device, acquires, releases) = counting_device();
        let mut tex = import_texture(&device, 0x10).unwrap();
        tex.acquire().unwrap();
        tex.acquire().unwrap();
        assert_eq!(acquires.get(), 1);
        assert!(tex.is_held());
        tex.release().unwrap();
        tex.release().unwrap();
        assert_eq!(releases.get(), 1);
        drop(tex);
        assert_eq!(acquires.get(), releases.get());
    }

    #[test]
    fn drop_releases_held_mutex() {
        let (device, acquires, releases) = counting_device();
        let mut tex = import_texture(&device, 0x11).unwrap();
        tex.acquire().unwrap();
        drop(tex);
        assert_eq!(acquires.get(), 1);
        assert_eq!(releases.get(), 1);
    }

    #[test]
    fn invalid_handle_rejected() {
        let (device, _, _) = counting_device();
        assert!(import_texture(&device, 0).is_err());
    }
}
