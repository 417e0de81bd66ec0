/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Keyed-mutex hand-off around buffer registration and presents.
 *
 * The hand-off rule: after presenting a set, the server keeps holding that
 * set's mutexes until the *next* present replaces it, because the pipeline
 * may still be reading the just-presented textures asynchronously. Only the
 * previously-active set is handed back to the client, which is exactly the
 * set the client wants to render into next. */
use crate::messages::RenderInfo;
use crate::pipeline::{HmdPipeline, RenderParams};
use crate::tag;
use crate::texture::ImportedTexture;
use log::error;

/** One frame's worth of per-view textures */
pub struct BufferSet {
    pub textures: Vec<ImportedTexture>,
}

/* Mutex failures mid-frame are logged and do not abort the operation; the
 * per-texture held-state flag keeps acquire/release paired regardless. */
fn acquire_all(set: &mut BufferSet) {
    for tex in &mut set.textures {
        if let Err(x) = tex.acquire() {
            error!("Failed to acquire mutex for texture {:#x}: {}", tex.handle(), x);
        }
    }
}

fn release_all(set: &mut BufferSet) {
    for tex in &mut set.textures {
        if let Err(x) = tex.release() {
            error!("Failed to release mutex for texture {:#x}: {}", tex.handle(), x);
        }
    }
}

/** Tracks which buffer set the server is still holding from the last
 * present and orders every mutex operation around the pipeline calls */
pub struct PresentGate {
    active_set: Option<usize>,
}

impl PresentGate {
    pub fn new() -> PresentGate {
        PresentGate { active_set: None }
    }

    pub fn active_set(&self) -> Option<usize> {
        self.active_set
    }

    /** Forget the active set. Used when the session drops its buffer sets;
     * the sets themselves release any held mutex as they drop. */
    pub fn reset(&mut self) {
        self.active_set = None;
    }

    /** Register one set with the pipeline while holding every mutex in it,
     * so the pipeline's bookkeeping sees a stable texture state */
    pub fn register(
        &self,
        pipeline: &mut dyn HmdPipeline,
        set: &mut BufferSet,
    ) -> Result<(), String> {
        acquire_all(set);
        let result = pipeline.register_buffers(&set.textures, true);
        release_all(set);
        result.map_err(|x| tag!("Failed to register render buffers: {}", x))
    }

    /** Present `sets[idx]` and retire the previously-active set */
    pub fn present(
        &mut self,
        pipeline: &mut dyn HmdPipeline,
        sets: &mut [BufferSet],
        idx: usize,
        render_info: &[RenderInfo],
        params: &RenderParams,
    ) -> Result<(), String> {
        acquire_all(&mut sets[idx]);
        let result = pipeline.present_buffers(&sets[idx].textures, render_info, params);
        if let Some(prev) = self.active_set {
            /* Re-presenting the active set keeps it held */
            if prev != idx && prev < sets.len() {
                release_all(&mut sets[prev]);
            }
        }
        self.active_set = Some(idx);
        result
    }
}

impl Default for PresentGate {
    fn default() -> Self {
        PresentGate::new()
    }
}
