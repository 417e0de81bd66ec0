/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Client side: the library surface applications link against.
 *
 * A [NetClient] owns the connection to the render server, the cached render
 * parameters sent with every info request, and the last received per-view
 * render info. Transport and protocol failures disconnect the client; it
 * may reconnect and re-register at any time. */
use crate::messages::{Message, Quaternion, RenderInfo, MAX_BUFFER_COUNT, MAX_MESSAGE_SIZE};
use crate::pipe::{endpoint_path, PipeConnection, ENDPOINT_PRIMARY, ENDPOINT_SECONDARY};
use crate::tag;
use crate::texture::{RawHandle, ShareableTexture};
use log::debug;
use std::path::Path;
use std::time::{Duration, Instant};

/* Round-trip timing is aggregated and logged once per this many presents */
const STATS_INTERVAL: u32 = 60;

#[derive(Default)]
struct PresentStats {
    frames: u32,
    total_ack: Duration,
    total_present: Duration,
    max_present: Duration,
}

impl PresentStats {
    fn record(&mut self, ack: Duration, present: Duration) {
        self.frames += 1;
        self.total_ack += ack;
        self.total_present += present;
        self.max_present = self.max_present.max(present);
        if self.frames == STATS_INTERVAL {
            debug!(
                "Present delay over {} frames: ack avg {:.3} ms, present avg {:.3} ms, present max {:.3} ms",
                STATS_INTERVAL,
                1e3 * self.total_ack.as_secs_f64() / f64::from(STATS_INTERVAL),
                1e3 * self.total_present.as_secs_f64() / f64::from(STATS_INTERVAL),
                1e3 * self.max_present.as_secs_f64(),
            );
            *self = PresentStats::default();
        }
    }
}

pub struct NetClient {
    conn: Option<PipeConnection>,
    /* Cached request payload; zeros mean "use the server's default" */
    near_clip: f32,
    far_clip: f32,
    ipd: f32,
    render_info: Vec<RenderInfo>,
    stats: PresentStats,
}

impl NetClient {
    pub fn new() -> NetClient {
        NetClient {
            conn: None,
            near_clip: 0.0,
            far_clip: 0.0,
            ipd: 0.0,
            render_info: Vec::new(),
            stats: PresentStats::default(),
        }
    }

    /** Connect to the well-known primary (or secondary) endpoint and run the
     * initial render-info exchange */
    pub fn connect(&mut self, primary: bool) -> Result<(), String> {
        let name = if primary {
            ENDPOINT_PRIMARY
        } else {
            ENDPOINT_SECONDARY
        };
        self.connect_at(&endpoint_path(name))
    }

    /** Connect to a server at an explicit socket path */
    pub fn connect_at(&mut self, path: &Path) -> Result<(), String> {
        self.disconnect();
        self.conn = Some(
            PipeConnection::connect(path).map_err(|x| tag!("Failed to open pipe: {}", x))?,
        );
        if let Err(x) = self.update_render_info() {
            self.disconnect();
            return Err(x);
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.conn = None;
        self.render_info.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /** Update the cached request payload. Takes effect on the next
     * [NetClient::update_render_info]; zero fields keep server defaults. */
    pub fn set_render_params(&mut self, near_clip: f32, far_clip: f32, ipd: f32) {
        self.near_clip = near_clip;
        self.far_clip = far_clip;
        self.ipd = ipd;
    }

    /** Exchange the cached parameters for fresh per-view render info */
    pub fn update_render_info(&mut self) -> Result<(), String> {
        let result = self.update_render_info_inner();
        if result.is_err() {
            self.disconnect();
        }
        result
    }

    fn update_render_info_inner(&mut self) -> Result<(), String> {
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| tag!("Pipe not connected"))?;
        let request = Message::RequestRenderInfo {
            near_clip: self.near_clip,
            far_clip: self.far_clip,
            ipd: self.ipd,
        };
        conn.send(&request.encode())?;

        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let len = conn
            .receive(&mut buf)?
            .ok_or_else(|| tag!("Server closed the pipe"))?;
        /* The decoder enforces the 1..=8 info count and the exact length */
        match Message::decode(&buf[..len])? {
            Message::SendRenderInfo { infos } => {
                self.render_info = infos;
                Ok(())
            }
            other => Err(tag!("Expected render info reply, got {:?}", other.id())),
        }
    }

    pub fn render_info_count(&self) -> usize {
        self.render_info.len()
    }

    pub fn render_info(&self, idx: usize) -> Option<&RenderInfo> {
        self.render_info.get(idx)
    }

    /** Extract a shareable handle from every texture and register them with
     * the server, whole sets at a time. The server does not reply; a
     * registration failure surfaces as a disconnect on the next call. */
    pub fn register_render_buffers(
        &mut self,
        textures: &[&dyn ShareableTexture],
    ) -> Result<(), String> {
        if self.render_info.is_empty() {
            return Err(tag!("No render info; connect first"));
        }
        if textures.len() % self.render_info.len() != 0 {
            return Err(tag!(
                "Must register a multiple of the {} views",
                self.render_info.len()
            ));
        }
        if textures.len() > MAX_BUFFER_COUNT {
            return Err(tag!("Too many buffers: {}", textures.len()));
        }
        let mut handles: Vec<RawHandle> = Vec::with_capacity(textures.len());
        for tex in textures {
            handles.push(
                tex.shared_handle()
                    .map_err(|x| tag!("Failed to get shared handle for texture: {}", x))?,
            );
        }
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| tag!("Pipe not connected"))?;
        if let Err(x) = conn.send(&Message::RegisterBuffers { handles }.encode()) {
            self.disconnect();
            return Err(x);
        }
        Ok(())
    }

    /** Present one registered buffer set, optionally overriding the head
     * rotation the server resolves view poses with. Returns the server's
     * result code: 0 on success, -1 for a bad set index, -2 when the
     * display pipeline failed; transport errors disconnect. */
    pub fn present_render_buffers(
        &mut self,
        set_index: u32,
        head_pose: Option<Quaternion>,
    ) -> Result<i32, String> {
        let result = self.present_inner(set_index, head_pose);
        if result.is_err() {
            self.disconnect();
        }
        result
    }

    fn present_inner(
        &mut self,
        set_index: u32,
        head_pose: Option<Quaternion>,
    ) -> Result<i32, String> {
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| tag!("Pipe not connected"))?;
        let msg = Message::BeginPresent {
            set_index,
            head_pose,
        };
        let t_sent = Instant::now();
        conn.send(&msg.encode())
            .map_err(|x| tag!("Failed to send present request: {}", x))?;

        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let len = conn
            .receive(&mut buf)?
            .ok_or_else(|| tag!("Server closed the pipe before ack"))?;
        match Message::decode(&buf[..len])? {
            Message::PresentAck => (),
            other => return Err(tag!("Expected present ack, got {:?}", other.id())),
        }
        let t_ack = Instant::now();

        let len = conn
            .receive(&mut buf)?
            .ok_or_else(|| tag!("Server closed the pipe before present result"))?;
        let code = match Message::decode(&buf[..len])? {
            Message::PresentResult { code } => code,
            other => return Err(tag!("Expected present result, got {:?}", other.id())),
        };
        let t_result = Instant::now();

        self.stats.record(t_ack - t_sent, t_result - t_ack);
        Ok(code)
    }
}

impl Default for NetClient {
    fn default() -> Self {
        NetClient::new()
    }
}
