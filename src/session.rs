/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Server side: the per-connection session state machine.
 *
 * One connection is served at a time. Within a session the display pipeline
 * is opened lazily on the first message that needs it, buffer sets are
 * imported and registered on request, and presents run through the keyed-
 * mutex gate. Every transport or protocol error tears the session down;
 * the outer loop then waits for the next client. */
use crate::gate::{BufferSet, PresentGate};
use crate::messages::{Message, Quaternion, RenderInfo, MAX_MESSAGE_SIZE, MAX_RENDER_INFO_COUNT};
use crate::pipe::{PipeConnection, PipeEndpoint};
use crate::pipeline::{HmdPipeline, PipelineFactory, RenderParams};
use crate::tag;
use crate::texture::import_texture;
use log::{debug, error};
use nix::sys::signal::SigSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

struct Session<'a> {
    factory: &'a dyn PipelineFactory,
    view_count: Option<usize>,
    render_params: RenderParams,
    last_render_info: Vec<RenderInfo>,
    present_counter: u64,
    /* Declaration order fixes teardown order: buffer sets drop first,
     * releasing any held keyed mutex, then the pipeline shuts down */
    buffer_sets: Vec<BufferSet>,
    gate: PresentGate,
    pipeline: Option<Box<dyn HmdPipeline>>,
}

impl<'a> Session<'a> {
    fn new(factory: &'a dyn PipelineFactory) -> Session<'a> {
        Session {
            factory,
            view_count: None,
            render_params: RenderParams::default(),
            last_render_info: Vec::new(),
            present_counter: 0,
            buffer_sets: Vec::new(),
            gate: PresentGate::new(),
            pipeline: None,
        }
    }

    fn ensure_pipeline(&mut self) -> Result<(), String> {
        if self.pipeline.is_none() {
            self.pipeline = Some(
                self.factory
                    .open_pipeline()
                    .map_err(|x| tag!("Failed to open display pipeline: {}", x))?,
            );
        }
        Ok(())
    }

    /** Query the pipeline and cache the result. The view count is pinned by
     * the first successful query; the display growing or shrinking mid-
     * session would invalidate every registered set. */
    fn update_render_info(&mut self, params: RenderParams) -> Result<(), String> {
        self.ensure_pipeline()?;
        let pipeline = self.pipeline.as_mut().unwrap();
        let infos = pipeline
            .render_info(&params)
            .map_err(|x| tag!("Failed to query render info: {}", x))?;
        if infos.is_empty() {
            return Err(tag!("Pipeline reported no views"));
        }
        if infos.len() > MAX_RENDER_INFO_COUNT {
            return Err(tag!("Pipeline reported {} views, protocol limit is {}",
                infos.len(), MAX_RENDER_INFO_COUNT));
        }
        match self.view_count {
            None => {
                for (i, info) in infos.iter().enumerate() {
                    debug!(
                        "View {}: {} x {}",
                        i, info.viewport.width, info.viewport.height
                    );
                }
                self.view_count = Some(infos.len());
            }
            Some(v) if v != infos.len() => {
                return Err(tag!("View count changed from {} to {}", v, infos.len()));
            }
            Some(_) => (),
        }
        self.render_params = params;
        self.last_render_info = infos;
        Ok(())
    }

    fn handle_request_render_info(
        &mut self,
        conn: &PipeConnection,
        near_clip: f32,
        far_clip: f32,
        ipd: f32,
    ) -> Result<(), String> {
        self.update_render_info(RenderParams::from_wire(near_clip, far_clip, ipd))?;
        let reply = Message::SendRenderInfo {
            infos: self.last_render_info.clone(),
        };
        conn.send(&reply.encode())
            .map_err(|x| tag!("Failed to send render info reply: {}", x))
    }

    fn handle_register_buffers(&mut self, handles: &[u64]) -> Result<(), String> {
        if !self.buffer_sets.is_empty() {
            /* A second registration forces a full reset: drop every set
             * (handing held mutexes back) and restart the pipeline */
            debug!(
                "Re-registration: dropping {} existing buffer sets",
                self.buffer_sets.len()
            );
            self.buffer_sets.clear();
            self.gate.reset();
            self.pipeline = None;
            self.last_render_info.clear();
        }
        if self.last_render_info.is_empty() {
            self.update_render_info(self.render_params)?;
        }
        let view_count = self.view_count.unwrap();
        if handles.len() % view_count != 0 {
            return Err(tag!(
                "Buffer count {} is not a multiple of the {} views",
                handles.len(),
                view_count
            ));
        }
        let set_count = handles.len() / view_count;
        debug!(
            "Importing {} shared handles as {} buffer sets",
            handles.len(),
            set_count
        );
        for chunk in handles.chunks_exact(view_count) {
            let mut textures = Vec::with_capacity(view_count);
            for &handle in chunk {
                debug!("Importing shared texture {:#x}", handle);
                let device = self.pipeline.as_ref().unwrap().device();
                textures.push(import_texture(device, handle)?);
            }
            let mut set = BufferSet { textures };
            let pipeline = self.pipeline.as_mut().unwrap();
            self.gate.register(pipeline.as_mut(), &mut set)?;
            self.buffer_sets.push(set);
        }
        Ok(())
    }

    fn handle_begin_present(
        &mut self,
        conn: &PipeConnection,
        set_index: u32,
        head_pose: Option<Quaternion>,
    ) -> Result<(), String> {
        /* Ack before presenting, so the client can time the two phases */
        conn.send(&Message::PresentAck.encode())
            .map_err(|x| tag!("Failed to send present ack: {}", x))?;

        let code = self.present(set_index, head_pose);

        conn.send(&Message::PresentResult { code }.encode())
            .map_err(|x| tag!("Failed to send present result: {}", x))?;

        self.present_counter += 1;
        if self.present_counter == 1 || self.present_counter % 60 == 0 {
            debug!("Presented {} frames", self.present_counter);
        }
        Ok(())
    }

    /** Run one present. Returns the wire result code: 0 on success, -1 on a
     * parameter error, -2 on a pipeline failure; only transport errors are
     * fatal to the session. */
    fn present(&mut self, set_index: u32, head_pose: Option<Quaternion>) -> i32 {
        if self.pipeline.is_none() {
            error!("Present request before any buffer registration");
            return -1;
        }
        let idx = set_index as usize;
        if idx >= self.buffer_sets.len() {
            error!("Invalid buffer set index: {}", idx);
            return -1;
        }

        /* A supplied head rotation overrides the tracked pose: re-query the
         * pipeline with the replacement instead of using the cached info */
        let render_info = if let Some(q) = head_pose {
            let params = self.render_params.with_head_rotation(q);
            match self.pipeline.as_mut().unwrap().render_info(&params) {
                Ok(infos) => infos,
                Err(x) => {
                    error!("Failed to re-query render info for head pose: {}", x);
                    return -2;
                }
            }
        } else {
            self.last_render_info.clone()
        };

        let pipeline = self.pipeline.as_mut().unwrap();
        match self.gate.present(
            pipeline.as_mut(),
            &mut self.buffer_sets,
            idx,
            &render_info,
            &self.render_params,
        ) {
            Ok(()) => 0,
            Err(x) => {
                error!("Failed to present buffer set {}: {}", idx, x);
                -2
            }
        }
    }
}

/** Serve one connected client until it disconnects, a protocol error ends
 * the session, or `stop` is raised. Session state (imported textures, the
 * pipeline) is torn down on return. */
pub fn serve_connection(
    conn: &PipeConnection,
    factory: &dyn PipelineFactory,
    pollmask: Option<&SigSet>,
    stop: &AtomicBool,
) -> Result<(), String> {
    let mut session = Session::new(factory);
    let mut buf = [0u8; MAX_MESSAGE_SIZE];
    loop {
        if !conn.wait_message(pollmask, stop)? {
            debug!("Shutdown requested, ending session");
            return Ok(());
        }
        let len = match conn.receive(&mut buf)? {
            None => {
                debug!("Peer disconnected");
                return Ok(());
            }
            Some(len) => len,
        };
        match Message::decode(&buf[..len])? {
            Message::RequestRenderInfo {
                near_clip,
                far_clip,
                ipd,
            } => session.handle_request_render_info(conn, near_clip, far_clip, ipd)?,
            Message::RegisterBuffers { handles } => {
                session.handle_register_buffers(&handles)?
            }
            Message::BeginPresent {
                set_index,
                head_pose,
            } => session.handle_begin_present(conn, set_index, head_pose)?,
            other => {
                return Err(tag!("Unexpected message from client: {:?}", other.id()));
            }
        }
    }
}

/** Bind the endpoint and serve clients one at a time until `stop` is
 * raised. A failed session disconnects that client and keeps serving. */
pub fn run_server(
    endpoint: &Path,
    factory: &dyn PipelineFactory,
    pollmask: Option<&SigSet>,
    stop: &AtomicBool,
) -> Result<(), String> {
    let endpoint = PipeEndpoint::bind(endpoint)?;
    loop {
        debug!("Waiting for a new connection...");
        let Some(conn) = endpoint.accept(pollmask, stop)? else {
            debug!("Shutdown requested, exiting");
            return Ok(());
        };
        debug!("Got new connection");
        match serve_connection(&conn, factory, pollmask, stop) {
            Ok(()) => debug!("Session ended"),
            Err(x) => error!("Session failed: {}", x),
        }
        if stop.load(Ordering::Acquire) {
            return Ok(());
        }
    }
}
