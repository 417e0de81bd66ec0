/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! End-to-end protocol tests: a real server session over a real socket pair,
 * talking to the library client, with a scripted pipeline backend recording
 * every pipeline and keyed-mutex operation. */
#![cfg(test)]
use crate::client::NetClient;
use crate::messages::{Message, Quaternion, RenderInfo};
use crate::pipe::{PipeConnection, PipeEndpoint};
use crate::pipeline::{HmdPipeline, PipelineFactory, RenderParams};
use crate::session::serve_connection;
use crate::texture::{GpuDevice, GpuTexture, ImportedTexture, KeyedMutex, RawHandle, ShareableTexture};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

struct TestLogger;
impl log::Log for TestLogger {
    fn enabled(&self, _meta: &log::Metadata<'_>) -> bool {
        true
    }
    fn log(&self, record: &log::Record<'_>) {
        /* println! so the test framework captures output per test */
        println!("[{}] {}", record.level(), record.args());
    }
    fn flush(&self) {}
}
static TEST_LOGGER: TestLogger = TestLogger;

fn setup() {
    if log::set_logger(&TEST_LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Debug);
    }
}

fn temp_socket_path(label: &str) -> PathBuf {
    let mut rand = [0u8; 6];
    getrandom::getrandom(&mut rand).unwrap();
    let mut name = format!("hmdpipe-e2e-{}-", label);
    for b in rand {
        name.push_str(&format!("{:02x}", b));
    }
    std::env::temp_dir().join(name)
}

#[derive(Clone, Debug, PartialEq)]
enum Event {
    OpenPipeline,
    QueryInfo { replaced_head: bool },
    Import(u64),
    Acquire(u64),
    Release(u64),
    Register { count: usize },
    Present { handles: Vec<u64> },
    ClosePipeline,
}

type EventLog = Arc<Mutex<Vec<Event>>>;

fn push(log: &EventLog, e: Event) {
    log.lock().unwrap().push(e);
}

fn events(log: &EventLog) -> Vec<Event> {
    log.lock().unwrap().clone()
}

fn acquires(ev: &[Event], h: u64) -> usize {
    ev.iter().filter(|e| **e == Event::Acquire(h)).count()
}

fn releases(ev: &[Event], h: u64) -> usize {
    ev.iter().filter(|e| **e == Event::Release(h)).count()
}

fn imports(ev: &[Event]) -> usize {
    ev.iter()
        .filter(|e| matches!(e, Event::Import(_)))
        .count()
}

fn present_positions(ev: &[Event]) -> Vec<usize> {
    ev.iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, Event::Present { .. }))
        .map(|(i, _)| i)
        .collect()
}

struct ScriptedFactory {
    log: EventLog,
    view_count: usize,
    /* When set, render-info queries after the first report this many views */
    later_query_view_count: Option<usize>,
    fail_present: bool,
}

impl ScriptedFactory {
    fn new(log: &EventLog, view_count: usize) -> ScriptedFactory {
        ScriptedFactory {
            log: log.clone(),
            view_count,
            later_query_view_count: None,
            fail_present: false,
        }
    }
}

impl PipelineFactory for ScriptedFactory {
    fn open_pipeline(&self) -> Result<Box<dyn HmdPipeline>, String> {
        push(&self.log, Event::OpenPipeline);
        Ok(Box::new(ScriptedPipeline {
            device: ScriptedDevice {
                log: self.log.clone(),
            },
            log: self.log.clone(),
            view_count: self.view_count,
            later_query_view_count: self.later_query_view_count,
            queries: 0,
            fail_present: self.fail_present,
        }))
    }
}

struct ScriptedDevice {
    log: EventLog,
}

impl GpuDevice for ScriptedDevice {
    fn open_shared_texture(&self, handle: RawHandle) -> Result<Box<dyn GpuTexture>, String> {
        if handle == 0 {
            return Err("Invalid shared texture handle".into());
        }
        push(&self.log, Event::Import(handle));
        Ok(Box::new(ScriptedTexture {
            log: self.log.clone(),
            handle,
        }))
    }
}

struct ScriptedTexture {
    log: EventLog,
    handle: u64,
}

impl GpuTexture for ScriptedTexture {
    fn keyed_mutex(&self) -> Result<Box<dyn KeyedMutex>, String> {
        Ok(Box::new(ScriptedMutex {
            log: self.log.clone(),
            handle: self.handle,
        }))
    }
}

struct ScriptedMutex {
    log: EventLog,
    handle: u64,
}

impl KeyedMutex for ScriptedMutex {
    fn acquire(&self, _key: u64) -> Result<(), String> {
        push(&self.log, Event::Acquire(self.handle));
        Ok(())
    }
    fn release(&self, _key: u64) -> Result<(), String> {
        push(&self.log, Event::Release(self.handle));
        Ok(())
    }
}

struct ScriptedPipeline {
    device: ScriptedDevice,
    log: EventLog,
    view_count: usize,
    later_query_view_count: Option<usize>,
    queries: usize,
    fail_present: bool,
}

impl Drop for ScriptedPipeline {
    fn drop(&mut self) {
        push(&self.log, Event::ClosePipeline);
    }
}

impl HmdPipeline for ScriptedPipeline {
    fn device(&self) -> &dyn GpuDevice {
        &self.device
    }

    fn render_info(&mut self, params: &RenderParams) -> Result<Vec<RenderInfo>, String> {
        self.queries += 1;
        push(
            &self.log,
            Event::QueryInfo {
                replaced_head: params.room_from_head.is_some(),
            },
        );
        let count = if self.queries > 1 {
            self.later_query_view_count.unwrap_or(self.view_count)
        } else {
            self.view_count
        };
        Ok((0..count)
            .map(|i| {
                let mut info = RenderInfo::default();
                info.viewport.left = 960.0 * i as f64;
                info.viewport.width = 960.0;
                info.viewport.height = 1080.0;
                info
            })
            .collect())
    }

    fn register_buffers(
        &mut self,
        buffers: &[ImportedTexture],
        app_will_present: bool,
    ) -> Result<(), String> {
        assert!(app_will_present);
        if !buffers.iter().all(|t| t.is_held()) {
            return Err("Registered buffers must be locked".into());
        }
        push(
            &self.log,
            Event::Register {
                count: buffers.len(),
            },
        );
        Ok(())
    }

    fn present_buffers(
        &mut self,
        buffers: &[ImportedTexture],
        render_info: &[RenderInfo],
        _params: &RenderParams,
    ) -> Result<(), String> {
        if !buffers.iter().all(|t| t.is_held()) {
            return Err("Presented buffers must be locked".into());
        }
        if render_info.len() != buffers.len() {
            return Err("Render info count does not match buffer count".into());
        }
        push(
            &self.log,
            Event::Present {
                handles: buffers.iter().map(|t| t.handle()).collect(),
            },
        );
        if self.fail_present {
            return Err("Scripted present failure".into());
        }
        Ok(())
    }
}

struct FakeShareable(u64);
impl ShareableTexture for FakeShareable {
    fn shared_handle(&self) -> Result<RawHandle, String> {
        Ok(self.0)
    }
}

/** Accept one connection, run `client_fn` against it, and return the serve
 * result after the client has disconnected */
fn run_one_session<F>(factory: &ScriptedFactory, client_fn: F) -> Result<(), String>
where
    F: FnOnce(&mut NetClient),
{
    setup();
    let path = temp_socket_path("session");
    let endpoint = PipeEndpoint::bind(&path).unwrap();
    let stop = AtomicBool::new(false);
    let mut result = Ok(());
    std::thread::scope(|s| {
        let server = s.spawn(|| {
            let conn = endpoint.accept(None, &stop).unwrap().unwrap();
            serve_connection(&conn, factory, None, &stop)
        });
        let mut client = NetClient::new();
        client.connect_at(&path).unwrap();
        client_fn(&mut client);
        client.disconnect();
        result = server.join().unwrap();
    });
    result
}

#[test]
fn handshake_only() {
    let log = EventLog::default();
    let factory = ScriptedFactory::new(&log, 2);
    run_one_session(&factory, |client| {
        assert!(client.is_connected());
        assert_eq!(client.render_info_count(), 2);
        assert_eq!(client.render_info(1).unwrap().viewport.left, 960.0);
        assert!(client.render_info(2).is_none());
    })
    .unwrap();
    /* Pipeline was brought up and torn down; nothing was imported */
    assert_eq!(
        events(&log),
        vec![
            Event::OpenPipeline,
            Event::QueryInfo {
                replaced_head: false
            },
            Event::ClosePipeline,
        ]
    );
}

#[test]
fn register_and_present_once() {
    let log = EventLog::default();
    let factory = ScriptedFactory::new(&log, 2);
    run_one_session(&factory, |client| {
        let t0 = FakeShareable(0x70);
        let t1 = FakeShareable(0x71);
        client.register_render_buffers(&[&t0, &t1]).unwrap();
        assert_eq!(client.present_render_buffers(0, None).unwrap(), 0);
    })
    .unwrap();

    let ev = events(&log);
    assert!(ev.contains(&Event::Register { count: 2 }));
    assert!(ev.contains(&Event::Present {
        handles: vec![0x70, 0x71]
    }));
    /* One acquire/release pair from registration, one from the present
     * (balanced by the teardown release) */
    for h in [0x70, 0x71] {
        assert_eq!(acquires(&ev, h), 2, "handle {:#x}", h);
        assert_eq!(releases(&ev, h), 2, "handle {:#x}", h);
    }
    /* The presented set stays held until teardown: its final releases come
     * after the present, just before the pipeline closes */
    let p = present_positions(&ev)[0];
    assert_eq!(
        &ev[p + 1..],
        &[
            Event::Release(0x70),
            Event::Release(0x71),
            Event::ClosePipeline,
        ]
    );
}

#[test]
fn handoff_across_two_sets() {
    let log = EventLog::default();
    let factory = ScriptedFactory::new(&log, 2);
    run_one_session(&factory, |client| {
        let textures: Vec<FakeShareable> =
            [0x80u64, 0x81, 0x82, 0x83].iter().map(|&h| FakeShareable(h)).collect();
        let refs: Vec<&dyn ShareableTexture> =
            textures.iter().map(|t| t as &dyn ShareableTexture).collect();
        client.register_render_buffers(&refs).unwrap();
        assert_eq!(client.present_render_buffers(0, None).unwrap(), 0);
        assert_eq!(client.present_render_buffers(1, None).unwrap(), 0);
    })
    .unwrap();

    let ev = events(&log);
    assert_eq!(imports(&ev), 4);
    let presents = present_positions(&ev);
    assert_eq!(presents.len(), 2);
    assert_eq!(
        ev[presents[1]],
        Event::Present {
            handles: vec![0x82, 0x83]
        }
    );
    /* Presenting set 1 retires set 0: its mutexes are handed back right
     * after the present call, while set 1 stays held until teardown */
    assert_eq!(
        &ev[presents[1] + 1..],
        &[
            Event::Release(0x80),
            Event::Release(0x81),
            Event::Release(0x82),
            Event::Release(0x83),
            Event::ClosePipeline,
        ]
    );
    /* No release of either set in between the two presents */
    assert!(ev[presents[0]..presents[1]]
        .iter()
        .all(|e| !matches!(e, Event::Release(_))));
    for h in [0x80u64, 0x81, 0x82, 0x83] {
        assert_eq!(acquires(&ev, h), releases(&ev, h), "handle {:#x}", h);
    }
}

#[test]
fn pose_override_requeries_render_info() {
    let log = EventLog::default();
    let factory = ScriptedFactory::new(&log, 2);
    run_one_session(&factory, |client| {
        let t0 = FakeShareable(0x90);
        let t1 = FakeShareable(0x91);
        client.register_render_buffers(&[&t0, &t1]).unwrap();
        let pose = Quaternion::IDENTITY;
        assert_eq!(client.present_render_buffers(0, Some(pose)).unwrap(), 0);
    })
    .unwrap();

    let ev = events(&log);
    let requery = ev
        .iter()
        .position(|e| {
            *e == Event::QueryInfo {
                replaced_head: true,
            }
        })
        .expect("present with a pose must re-query render info");
    let p = present_positions(&ev)[0];
    assert!(requery < p);
}

#[test]
fn invalid_set_index_reports_error_and_continues() {
    let log = EventLog::default();
    let factory = ScriptedFactory::new(&log, 2);
    run_one_session(&factory, |client| {
        let t0 = FakeShareable(0xa0);
        let t1 = FakeShareable(0xa1);
        client.register_render_buffers(&[&t0, &t1]).unwrap();
        /* One set registered, so index 1 is just past the end */
        assert_eq!(client.present_render_buffers(1, None).unwrap(), -1);
        assert!(client.is_connected());
        assert_eq!(client.present_render_buffers(0, None).unwrap(), 0);
    })
    .unwrap();
    let ev = events(&log);
    assert_eq!(present_positions(&ev).len(), 1);
}

#[test]
fn present_before_registration_reports_error() {
    let log = EventLog::default();
    let factory = ScriptedFactory::new(&log, 2);
    run_one_session(&factory, |client| {
        assert_eq!(client.present_render_buffers(0, None).unwrap(), -1);
        assert!(client.is_connected());
    })
    .unwrap();
}

#[test]
fn pipeline_present_failure_is_not_fatal() {
    let log = EventLog::default();
    let mut factory = ScriptedFactory::new(&log, 2);
    factory.fail_present = true;
    run_one_session(&factory, |client| {
        let t0 = FakeShareable(0xb0);
        let t1 = FakeShareable(0xb1);
        client.register_render_buffers(&[&t0, &t1]).unwrap();
        assert_eq!(client.present_render_buffers(0, None).unwrap(), -2);
        assert_eq!(client.present_render_buffers(0, None).unwrap(), -2);
        assert!(client.is_connected());
    })
    .unwrap();
    let ev = events(&log);
    for h in [0xb0u64, 0xb1] {
        assert_eq!(acquires(&ev, h), releases(&ev, h), "handle {:#x}", h);
    }
}

#[test]
fn re_registration_resets_pipeline_and_sets() {
    let log = EventLog::default();
    let factory = ScriptedFactory::new(&log, 2);
    run_one_session(&factory, |client| {
        let t0 = FakeShareable(0xc0);
        let t1 = FakeShareable(0xc1);
        client.register_render_buffers(&[&t0, &t1]).unwrap();
        assert_eq!(client.present_render_buffers(0, None).unwrap(), 0);
        let t2 = FakeShareable(0xc2);
        let t3 = FakeShareable(0xc3);
        client.register_render_buffers(&[&t2, &t3]).unwrap();
        assert_eq!(client.present_render_buffers(0, None).unwrap(), 0);
    })
    .unwrap();

    let ev = events(&log);
    /* The second registration drops the old sets (handing their mutexes
     * back) and restarts the pipeline before importing anew */
    let close = ev
        .iter()
        .position(|e| *e == Event::ClosePipeline)
        .unwrap();
    let reopen = ev[close..]
        .iter()
        .position(|e| *e == Event::OpenPipeline)
        .unwrap()
        + close;
    assert!(releases(&ev[..close], 0xc0) == 2 && releases(&ev[..close], 0xc1) == 2);
    assert!(ev[reopen..].contains(&Event::Import(0xc2)));
    for h in [0xc0u64, 0xc1, 0xc2, 0xc3] {
        assert_eq!(acquires(&ev, h), releases(&ev, h), "handle {:#x}", h);
    }
}

#[test]
fn view_count_change_is_fatal() {
    let log = EventLog::default();
    let mut factory = ScriptedFactory::new(&log, 2);
    factory.later_query_view_count = Some(3);
    let result = run_one_session(&factory, |client| {
        assert_eq!(client.render_info_count(), 2);
        assert!(client.update_render_info().is_err());
        assert!(!client.is_connected());
    });
    assert!(result.is_err());
}

#[test]
fn malformed_message_disconnects_and_server_reaccepts() {
    setup();
    let log = EventLog::default();
    let factory = ScriptedFactory::new(&log, 2);
    let path = temp_socket_path("malformed");
    let endpoint = PipeEndpoint::bind(&path).unwrap();
    let stop = AtomicBool::new(false);
    std::thread::scope(|s| {
        let server = s.spawn(|| {
            let conn = endpoint.accept(None, &stop).unwrap().unwrap();
            let first = serve_connection(&conn, &factory, None, &stop);
            drop(conn);
            let conn = endpoint.accept(None, &stop).unwrap().unwrap();
            let second = serve_connection(&conn, &factory, None, &stop);
            (first, second)
        });

        let raw = PipeConnection::connect(&path).unwrap();
        raw.send(&99u32.to_le_bytes()).unwrap();
        /* No reply; the server just disconnects */
        let mut buf = [0u8; 64];
        assert_eq!(raw.receive(&mut buf).unwrap(), None);
        drop(raw);

        let mut client = NetClient::new();
        client.connect_at(&path).unwrap();
        assert_eq!(client.render_info_count(), 2);
        client.disconnect();

        let (first, second) = server.join().unwrap();
        assert!(first.is_err());
        assert!(second.is_ok());
    });
}

#[test]
fn oversize_registration_is_fatal_and_leaves_sets_alone() {
    setup();
    let log = EventLog::default();
    let factory = ScriptedFactory::new(&log, 2);
    let path = temp_socket_path("oversize-reg");
    let endpoint = PipeEndpoint::bind(&path).unwrap();
    let stop = AtomicBool::new(false);
    std::thread::scope(|s| {
        let server = s.spawn(|| {
            let conn = endpoint.accept(None, &stop).unwrap().unwrap();
            serve_connection(&conn, &factory, None, &stop)
        });

        let raw = PipeConnection::connect(&path).unwrap();
        let mut buf = [0u8; 2048];

        /* Normal handshake and a valid registration first */
        raw.send(
            &Message::RequestRenderInfo {
                near_clip: 0.0,
                far_clip: 0.0,
                ipd: 0.0,
            }
            .encode(),
        )
        .unwrap();
        let len = raw.receive(&mut buf).unwrap().unwrap();
        assert!(matches!(
            Message::decode(&buf[..len]).unwrap(),
            Message::SendRenderInfo { .. }
        ));
        raw.send(
            &Message::RegisterBuffers {
                handles: vec![0xd0, 0xd1],
            }
            .encode(),
        )
        .unwrap();

        /* 17 handles is over the protocol limit: fatal, nothing imported */
        raw.send(
            &Message::RegisterBuffers {
                handles: vec![0xee; 17],
            }
            .encode(),
        )
        .unwrap();
        assert_eq!(raw.receive(&mut buf).unwrap(), None);
        drop(raw);

        assert!(server.join().unwrap().is_err());
    });
    let ev = events(&log);
    assert_eq!(imports(&ev), 2);
}

#[test]
fn every_present_gets_one_ack_then_one_result() {
    setup();
    let log = EventLog::default();
    let factory = ScriptedFactory::new(&log, 2);
    let path = temp_socket_path("ack-order");
    let endpoint = PipeEndpoint::bind(&path).unwrap();
    let stop = AtomicBool::new(false);
    std::thread::scope(|s| {
        let server = s.spawn(|| {
            let conn = endpoint.accept(None, &stop).unwrap().unwrap();
            serve_connection(&conn, &factory, None, &stop)
        });

        let raw = PipeConnection::connect(&path).unwrap();
        let mut buf = [0u8; 2048];
        raw.send(
            &Message::RequestRenderInfo {
                near_clip: 0.0,
                far_clip: 0.0,
                ipd: 0.0,
            }
            .encode(),
        )
        .unwrap();
        raw.receive(&mut buf).unwrap().unwrap();
        raw.send(
            &Message::RegisterBuffers {
                handles: vec![0xe0, 0xe1],
            }
            .encode(),
        )
        .unwrap();

        for _ in 0..3 {
            raw.send(
                &Message::BeginPresent {
                    set_index: 0,
                    head_pose: None,
                }
                .encode(),
            )
            .unwrap();
            let len = raw.receive(&mut buf).unwrap().unwrap();
            assert_eq!(Message::decode(&buf[..len]), Ok(Message::PresentAck));
            let len = raw.receive(&mut buf).unwrap().unwrap();
            assert_eq!(
                Message::decode(&buf[..len]),
                Ok(Message::PresentResult { code: 0 })
            );
        }
        drop(raw);
        assert!(server.join().unwrap().is_ok());
    });
    assert_eq!(present_positions(&events(&log)).len(), 3);
}
