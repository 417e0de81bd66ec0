/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Wire format for the render-bridge control protocol.
 *
 * Every message starts with a 4-byte little-endian tag and packs its fields
 * with 4-byte alignment and no trailing padding. The protocol is same-host
 * only; values are nevertheless copied field by field rather than by
 * reinterpreting buffers, so the layout here is the single source of truth. */
use crate::tag;

pub const HEADER_SIZE: usize = 4;
/** Per-view descriptor: viewport (4 f64) + pose (7 f64) + projection (6 f64) */
pub const RENDER_INFO_SIZE: usize = 136;
/** Cap on views per display reply */
pub const MAX_RENDER_INFO_COUNT: usize = 8;
/** Cap on texture handles per registration */
pub const MAX_BUFFER_COUNT: usize = 16;
/** Size of the largest well-formed message (a full render-info reply) */
pub const MAX_MESSAGE_SIZE: usize =
    HEADER_SIZE + 4 + MAX_RENDER_INFO_COUNT * RENDER_INFO_SIZE;

/* Tag 0 is reserved-invalid */
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum MsgId {
    RequestRenderInfo = 1,
    RegisterBuffers = 2,
    SendRenderInfo = 3,
    BeginPresent = 4,
    PresentAck = 5,
    PresentResult = 6,
}

pub fn parse_msg_id(raw: u32) -> Option<MsgId> {
    match raw {
        1 => Some(MsgId::RequestRenderInfo),
        2 => Some(MsgId::RegisterBuffers),
        3 => Some(MsgId::SendRenderInfo),
        4 => Some(MsgId::BeginPresent),
        5 => Some(MsgId::PresentAck),
        6 => Some(MsgId::PresentResult),
        _ => None,
    }
}

/** Viewport with the lower-left corner of the screen as (0,0), in pixels */
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub left: f64,
    pub lower: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };
}

impl Default for Quaternion {
    fn default() -> Self {
        Quaternion::IDENTITY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PoseState {
    pub translation: [f64; 3],
    pub rotation: Quaternion,
}

/** Description needed to construct an off-axis projection matrix */
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Projection {
    pub left: f64,
    pub right: f64,
    pub top: f64,
    pub bottom: f64,
    pub near_clip: f64,
    pub far_clip: f64,
}

/** Per-view viewport, head pose, and projection */
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RenderInfo {
    pub viewport: Viewport,
    pub pose: PoseState,
    pub projection: Projection,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /** Client asks for per-view geometry; zero fields mean "server default" */
    RequestRenderInfo {
        near_clip: f32,
        far_clip: f32,
        ipd: f32,
    },
    /** Client hands over shareable texture handles, whole sets at a time.
     * The server does not reply; failure surfaces as a disconnect. */
    RegisterBuffers { handles: Vec<u64> },
    /** Server reply to RequestRenderInfo */
    SendRenderInfo { infos: Vec<RenderInfo> },
    /** Client requests a present of one registered buffer set, optionally
     * overriding the head rotation used to resolve view poses */
    BeginPresent {
        set_index: u32,
        head_pose: Option<Quaternion>,
    },
    /** Server acknowledges receipt of BeginPresent before presenting */
    PresentAck,
    /** Present outcome: 0 ok, -1 parameter error, -2 pipeline failure */
    PresentResult { code: i32 },
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn get_f32(buf: &[u8], off: usize) -> f32 {
    f32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn get_f64(buf: &[u8], off: usize) -> f64 {
    f64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn put_f64s(out: &mut Vec<u8>, vals: &[f64]) {
    for v in vals {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

pub fn encode_render_info(info: &RenderInfo, out: &mut Vec<u8>) {
    let v = &info.viewport;
    put_f64s(out, &[v.left, v.lower, v.width, v.height]);
    put_f64s(out, &info.pose.translation);
    let q = &info.pose.rotation;
    put_f64s(out, &[q.w, q.x, q.y, q.z]);
    let p = &info.projection;
    put_f64s(out, &[p.left, p.right, p.top, p.bottom, p.near_clip, p.far_clip]);
}

/* Caller checks buf.len() == RENDER_INFO_SIZE */
pub fn decode_render_info(buf: &[u8]) -> RenderInfo {
    RenderInfo {
        viewport: Viewport {
            left: get_f64(buf, 0),
            lower: get_f64(buf, 8),
            width: get_f64(buf, 16),
            height: get_f64(buf, 24),
        },
        pose: PoseState {
            translation: [get_f64(buf, 32), get_f64(buf, 40), get_f64(buf, 48)],
            rotation: Quaternion {
                w: get_f64(buf, 56),
                x: get_f64(buf, 64),
                y: get_f64(buf, 72),
                z: get_f64(buf, 80),
            },
        },
        projection: Projection {
            left: get_f64(buf, 88),
            right: get_f64(buf, 96),
            top: get_f64(buf, 104),
            bottom: get_f64(buf, 112),
            near_clip: get_f64(buf, 120),
            far_clip: get_f64(buf, 128),
        },
    }
}

impl Message {
    pub fn id(&self) -> MsgId {
        match self {
            Message::RequestRenderInfo { .. } => MsgId::RequestRenderInfo,
            Message::RegisterBuffers { .. } => MsgId::RegisterBuffers,
            Message::SendRenderInfo { .. } => MsgId::SendRenderInfo,
            Message::BeginPresent { .. } => MsgId::BeginPresent,
            Message::PresentAck => MsgId::PresentAck,
            Message::PresentResult { .. } => MsgId::PresentResult,
        }
    }

    /** Serialize to one framed message. The encoder does not enforce the
     * count bounds; the decoder does, so malformed traffic can be produced
     * for testing but never accepted. */
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_MESSAGE_SIZE);
        out.extend_from_slice(&(self.id() as u32).to_le_bytes());
        match self {
            Message::RequestRenderInfo {
                near_clip,
                far_clip,
                ipd,
            } => {
                out.extend_from_slice(&near_clip.to_le_bytes());
                out.extend_from_slice(&far_clip.to_le_bytes());
                out.extend_from_slice(&ipd.to_le_bytes());
            }
            Message::RegisterBuffers { handles } => {
                out.extend_from_slice(&(handles.len() as u32).to_le_bytes());
                for h in handles {
                    out.extend_from_slice(&h.to_le_bytes());
                }
            }
            Message::SendRenderInfo { infos } => {
                out.extend_from_slice(&(infos.len() as u32).to_le_bytes());
                for info in infos {
                    encode_render_info(info, &mut out);
                }
            }
            Message::BeginPresent {
                set_index,
                head_pose,
            } => {
                out.extend_from_slice(&set_index.to_le_bytes());
                out.extend_from_slice(&(head_pose.is_some() as u32).to_le_bytes());
                let q = head_pose.unwrap_or(Quaternion {
                    w: 0.0,
                    x: 0.0,
                    y: 0.0,
                    z: 0.0,
                });
                put_f64s(&mut out, &[q.w, q.x, q.y, q.z]);
            }
            Message::PresentAck => {}
            Message::PresentResult { code } => {
                out.extend_from_slice(&code.to_le_bytes());
            }
        }
        out
    }

    /** Parse one whole received message. Every length is validated exactly;
     * any mismatch or out-of-bounds count is a protocol error. */
    pub fn decode(buf: &[u8]) -> Result<Message, String> {
        if buf.len() < HEADER_SIZE {
            return Err(tag!("Runt message: {} bytes", buf.len()));
        }
        let raw = get_u32(buf, 0);
        let id = parse_msg_id(raw).ok_or_else(|| tag!("Unknown message id: {}", raw))?;
        match id {
            MsgId::RequestRenderInfo => {
                if buf.len() != 16 {
                    return Err(tag!("Bad RequestRenderInfo size: {}", buf.len()));
                }
                Ok(Message::RequestRenderInfo {
                    near_clip: get_f32(buf, 4),
                    far_clip: get_f32(buf, 8),
                    ipd: get_f32(buf, 12),
                })
            }
            MsgId::RegisterBuffers => {
                if buf.len() < 8 {
                    return Err(tag!("Bad RegisterBuffers size: {}", buf.len()));
                }
                let n = get_u32(buf, 4) as usize;
                if n > MAX_BUFFER_COUNT {
                    return Err(tag!("Too many buffers: {}", n));
                }
                if buf.len() != 8 + 8 * n {
                    return Err(tag!(
                        "RegisterBuffers size {} does not match {} handles",
                        buf.len(),
                        n
                    ));
                }
                let handles = (0..n).map(|i| get_u64(buf, 8 + 8 * i)).collect();
                Ok(Message::RegisterBuffers { handles })
            }
            MsgId::SendRenderInfo => {
                if buf.len() < 8 {
                    return Err(tag!("Bad SendRenderInfo size: {}", buf.len()));
                }
                let n = get_u32(buf, 4) as usize;
                if n == 0 {
                    return Err(tag!("Zero render infos"));
                }
                if n > MAX_RENDER_INFO_COUNT {
                    return Err(tag!("Too many render infos: {}", n));
                }
                if buf.len() != 8 + RENDER_INFO_SIZE * n {
                    return Err(tag!(
                        "SendRenderInfo size {} does not match {} infos",
                        buf.len(),
                        n
                    ));
                }
                let infos = (0..n)
                    .map(|i| {
                        let off = 8 + RENDER_INFO_SIZE * i;
                        decode_render_info(&buf[off..off + RENDER_INFO_SIZE])
                    })
                    .collect();
                Ok(Message::SendRenderInfo { infos })
            }
            MsgId::BeginPresent => {
                if buf.len() != 44 {
                    return Err(tag!("Bad BeginPresent size: {}", buf.len()));
                }
                let head_pose = if get_u32(buf, 8) != 0 {
                    Some(Quaternion {
                        w: get_f64(buf, 12),
                        x: get_f64(buf, 20),
                        y: get_f64(buf, 28),
                        z: get_f64(buf, 36),
                    })
                } else {
                    None
                };
                Ok(Message::BeginPresent {
                    set_index: get_u32(buf, 4),
                    head_pose,
                })
            }
            MsgId::PresentAck => {
                if buf.len() != 4 {
                    return Err(tag!("Bad PresentAck size: {}", buf.len()));
                }
                Ok(Message::PresentAck)
            }
            MsgId::PresentResult => {
                if buf.len() != 8 {
                    return Err(tag!("Bad PresentResult size: {}", buf.len()));
                }
                Ok(Message::PresentResult {
                    code: get_u32(buf, 4) as i32,
                })
            }
        }
    }
}

#[cfg(test)]
fn sample_info(seed: f64) -> RenderInfo {
    RenderInfo {
        viewport: Viewport {
            left: seed,
            lower: 0.0,
            width: 960.0,
            height: 1080.0,
        },
        pose: PoseState {
            translation: [seed * 0.25, -1.5, 3.0],
            rotation: Quaternion {
                w: 0.8,
                x: 0.1,
                y: -0.2,
                z: 0.55,
            },
        },
        projection: Projection {
            left: -1.0 - seed,
            right: 1.0,
            top: 1.1,
            bottom: -1.1,
            near_clip: 0.1,
            far_clip: 100.0,
        },
    }
}

#[test]
fn message_roundtrip() {
    let examples = [
        Message::RequestRenderInfo {
            near_clip: 0.0,
            far_clip: 0.0,
            ipd: 0.0,
        },
        Message::RequestRenderInfo {
            near_clip: 0.05,
            far_clip: 250.0,
            ipd: 0.064,
        },
        Message::RegisterBuffers {
            handles: vec![0xdead0001, 0xdead0002],
        },
        Message::RegisterBuffers { handles: vec![] },
        Message::SendRenderInfo {
            infos: vec![sample_info(0.0), sample_info(960.0)],
        },
        Message::BeginPresent {
            set_index: 3,
            head_pose: None,
        },
        Message::BeginPresent {
            set_index: 0,
            head_pose: Some(Quaternion::IDENTITY),
        },
        Message::PresentAck,
        Message::PresentResult { code: 0 },
        Message::PresentResult { code: -1 },
        Message::PresentResult { code: -2 },
    ];
    for msg in examples {
        assert_eq!(Message::decode(&msg.encode()), Ok(msg.clone()), "{:?}", msg);
    }
}

#[test]
fn message_sizes() {
    let req = Message::RequestRenderInfo {
        near_clip: 1.0,
        far_clip: 2.0,
        ipd: 3.0,
    };
    assert_eq!(req.encode().len(), 16);
    let reg = Message::RegisterBuffers {
        handles: vec![1, 2, 3],
    };
    assert_eq!(reg.encode().len(), 8 + 3 * 8);
    for n in 1..=MAX_RENDER_INFO_COUNT {
        let reply = Message::SendRenderInfo {
            infos: (0..n).map(|i| sample_info(i as f64)).collect(),
        };
        assert_eq!(reply.encode().len(), 8 + n * RENDER_INFO_SIZE);
    }
    let present = Message::BeginPresent {
        set_index: 0,
        head_pose: None,
    };
    assert_eq!(present.encode().len(), 44);
    assert_eq!(Message::PresentAck.encode().len(), 4);
    assert_eq!(Message::PresentResult { code: -2 }.encode().len(), 8);
}

#[test]
fn decode_rejects_malformed() {
    /* Unknown and reserved tags */
    assert!(Message::decode(&99u32.to_le_bytes()).is_err());
    assert!(Message::decode(&0u32.to_le_bytes()).is_err());
    /* Runt inputs */
    assert!(Message::decode(&[]).is_err());
    assert!(Message::decode(&[1, 0]).is_err());
    assert!(Message::decode(&1u32.to_le_bytes()).is_err());
    /* Truncated and oversized fixed layouts */
    let mut req = Message::RequestRenderInfo {
        near_clip: 1.0,
        far_clip: 2.0,
        ipd: 3.0,
    }
    .encode();
    req.pop();
    assert!(Message::decode(&req).is_err());
    let mut ack = Message::PresentAck.encode();
    ack.push(0);
    assert!(Message::decode(&ack).is_err());
}

#[test]
fn decode_rejects_bad_counts() {
    let over = Message::RegisterBuffers {
        handles: vec![7; MAX_BUFFER_COUNT + 1],
    };
    assert!(Message::decode(&over.encode()).is_err());
    let full = Message::RegisterBuffers {
        handles: vec![7; MAX_BUFFER_COUNT],
    };
    assert!(Message::decode(&full.encode()).is_ok());

    let empty = Message::SendRenderInfo { infos: vec![] };
    assert!(Message::decode(&empty.encode()).is_err());
    let over = Message::SendRenderInfo {
        infos: vec![sample_info(0.0); MAX_RENDER_INFO_COUNT + 1],
    };
    assert!(Message::decode(&over.encode()).is_err());

    /* Declared count inconsistent with the actual tail */
    let mut reg = Message::RegisterBuffers {
        handles: vec![1, 2],
    }
    .encode();
    reg[4] = 3;
    assert!(Message::decode(&reg).is_err());
    reg[4] = 1;
    assert!(Message::decode(&reg).is_err());
}
