/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Interface to the HMD compositing pipeline.
 *
 * The pipeline is the external component that owns the headset: it reports
 * per-view geometry, takes ownership bookkeeping for registered buffer sets,
 * and composites presented sets to the display. The bridge consumes it
 * through this trait and never looks inside; shutting a pipeline down is
 * dropping it. */
use crate::messages::{PoseState, Quaternion, RenderInfo};
use crate::texture::{GpuDevice, ImportedTexture};

/** Frame parameters for render-info queries. `None` means "use the
 * pipeline's default"; unset fields are never forwarded. */
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RenderParams {
    pub near_clip: Option<f32>,
    pub far_clip: Option<f32>,
    pub ipd: Option<f32>,
    /** Replace the tracked head pose for this query */
    pub room_from_head: Option<PoseState>,
}

impl RenderParams {
    /** Build params from wire clip values, keeping only the fields the
     * client actually set (zero means unset) */
    pub fn from_wire(near_clip: f32, far_clip: f32, ipd: f32) -> RenderParams {
        RenderParams {
            near_clip: (near_clip > 0.0).then_some(near_clip),
            far_clip: (far_clip > 0.0).then_some(far_clip),
            ipd: (ipd > 0.0).then_some(ipd),
            room_from_head: None,
        }
    }

    /** These params with the head pose replaced by a bare rotation */
    pub fn with_head_rotation(&self, rotation: Quaternion) -> RenderParams {
        RenderParams {
            room_from_head: Some(PoseState {
                translation: [0.0; 3],
                rotation,
            }),
            ..*self
        }
    }
}

pub trait HmdPipeline {
    /** The device shared textures are opened on */
    fn device(&self) -> &dyn GpuDevice;

    /** Query the ordered per-view geometry and current head pose */
    fn render_info(&mut self, params: &RenderParams) -> Result<Vec<RenderInfo>, String>;

    /** Hand one frame's worth of buffers to the compositor's bookkeeping.
     * The caller holds every buffer's keyed mutex for the duration. */
    fn register_buffers(
        &mut self,
        buffers: &[ImportedTexture],
        app_will_present: bool,
    ) -> Result<(), String>;

    /** Composite `buffers` to the display using the given per-view info.
     * The caller holds every buffer's keyed mutex; the pipeline may keep
     * reading from the buffers asynchronously after this returns. */
    fn present_buffers(
        &mut self,
        buffers: &[ImportedTexture],
        render_info: &[RenderInfo],
        params: &RenderParams,
    ) -> Result<(), String>;
}

/** Opens pipelines on demand. The server opens one lazily per session and
 * reopens it when a client re-registers buffers. */
pub trait PipelineFactory {
    fn open_pipeline(&self) -> Result<Box<dyn HmdPipeline>, String>;
}

#[test]
fn wire_params_keep_only_set_fields() {
    let p = RenderParams::from_wire(0.0, 0.0, 0.0);
    assert_eq!(p, RenderParams::default());
    let p = RenderParams::from_wire(0.1, 0.0, 0.064);
    assert_eq!(p.near_clip, Some(0.1));
    assert_eq!(p.far_clip, None);
    assert_eq!(p.ipd, Some(0.064));
    let q = Quaternion {
        w: 0.5,
        x: 0.5,
        y: -0.5,
        z: 0.5,
    };
    let r = p.with_head_rotation(q);
    assert_eq!(r.near_clip, Some(0.1));
    assert_eq!(r.room_from_head.unwrap().rotation, q);
}
