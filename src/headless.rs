/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Headless pipeline backend.
 *
 * Stands in for real display hardware so the server can run on machines
 * without a headset: render-info queries return canned side-by-side view
 * geometry, registration and presents are accepted and logged, and every
 * keyed-mutex operation succeeds immediately. */
use crate::messages::{PoseState, Projection, Quaternion, RenderInfo, Viewport};
use crate::pipeline::{HmdPipeline, PipelineFactory, RenderParams};
use crate::tag;
use crate::texture::{GpuDevice, GpuTexture, ImportedTexture, KeyedMutex, RawHandle};
use log::{debug, trace};

const DEFAULT_NEAR_CLIP: f64 = 0.1;
const DEFAULT_FAR_CLIP: f64 = 100.0;

pub struct HeadlessFactory {
    pub view_count: usize,
    pub view_width: f64,
    pub view_height: f64,
}

impl Default for HeadlessFactory {
    fn default() -> Self {
        HeadlessFactory {
            view_count: 2,
            view_width: 960.0,
            view_height: 1080.0,
        }
    }
}

impl PipelineFactory for HeadlessFactory {
    fn open_pipeline(&self) -> Result<Box<dyn HmdPipeline>, String> {
        debug!("Opening headless pipeline with {} views", self.view_count);
        Ok(Box::new(HeadlessPipeline {
            device: HeadlessDevice,
            view_count: self.view_count,
            view_width: self.view_width,
            view_height: self.view_height,
            frames: 0,
        }))
    }
}

struct HeadlessDevice;

impl GpuDevice for HeadlessDevice {
    fn open_shared_texture(&self, handle: RawHandle) -> Result<Box<dyn GpuTexture>, String> {
        if handle == 0 {
            return Err(tag!("Invalid shared texture handle"));
        }
        Ok(Box::new(HeadlessTexture))
    }
}

struct HeadlessTexture;

impl GpuTexture for HeadlessTexture {
    fn keyed_mutex(&self) -> Result<Box<dyn KeyedMutex>, String> {
        Ok(Box::new(HeadlessMutex))
    }
}

struct HeadlessMutex;

impl KeyedMutex for HeadlessMutex {
    fn acquire(&self, _key: u64) -> Result<(), String> {
        Ok(())
    }
    fn release(&self, _key: u64) -> Result<(), String> {
        Ok(())
    }
}

struct HeadlessPipeline {
    device: HeadlessDevice,
    view_count: usize,
    view_width: f64,
    view_height: f64,
    frames: u64,
}

impl HmdPipeline for HeadlessPipeline {
    fn device(&self) -> &dyn GpuDevice {
        &self.device
    }

    fn render_info(&mut self, params: &RenderParams) -> Result<Vec<RenderInfo>, String> {
        let near = params.near_clip.map(f64::from).unwrap_or(DEFAULT_NEAR_CLIP);
        let far = params.far_clip.map(f64::from).unwrap_or(DEFAULT_FAR_CLIP);
        let pose = params.room_from_head.unwrap_or(PoseState {
            translation: [0.0; 3],
            rotation: Quaternion::IDENTITY,
        });
        Ok((0..self.view_count)
            .map(|i| RenderInfo {
                viewport: Viewport {
                    left: i as f64 * self.view_width,
                    lower: 0.0,
                    width: self.view_width,
                    height: self.view_height,
                },
                pose,
                projection: Projection {
                    left: -near,
                    right: near,
                    top: near,
                    bottom: -near,
                    near_clip: near,
                    far_clip: far,
                },
            })
            .collect())
    }

    fn register_buffers(
        &mut self,
        buffers: &[ImportedTexture],
        app_will_present: bool,
    ) -> Result<(), String> {
        debug!(
            "Registered {} buffers (app_will_present = {})",
            buffers.len(),
            app_will_present
        );
        Ok(())
    }

    fn present_buffers(
        &mut self,
        buffers: &[ImportedTexture],
        render_info: &[RenderInfo],
        _params: &RenderParams,
    ) -> Result<(), String> {
        if render_info.len() != buffers.len() {
            return Err(tag!(
                "Present with {} buffers but {} render infos",
                buffers.len(),
                render_info.len()
            ));
        }
        self.frames += 1;
        trace!("Composited frame {}", self.frames);
        Ok(())
    }
}

#[test]
fn render_info_honors_params() {
    let factory = HeadlessFactory::default();
    let mut pipeline = factory.open_pipeline().unwrap();
    let infos = pipeline.render_info(&RenderParams::default()).unwrap();
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[0].viewport.left, 0.0);
    assert_eq!(infos[1].viewport.left, 960.0);
    assert_eq!(infos[0].projection.near_clip, DEFAULT_NEAR_CLIP);

    let params = RenderParams::from_wire(0.5, 200.0, 0.0);
    let infos = pipeline.render_info(&params).unwrap();
    assert_eq!(infos[0].projection.near_clip, 0.5);
    assert_eq!(infos[0].projection.far_clip, 200.0);

    let q = Quaternion {
        w: 0.0,
        x: 0.0,
        y: 1.0,
        z: 0.0,
    };
    let infos = pipeline
        .render_info(&params.with_head_rotation(q))
        .unwrap();
    assert_eq!(infos[0].pose.rotation, q);
}
