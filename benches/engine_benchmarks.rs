// ABOUTME: Benchmark suite for the link engine: frame parsing, composition, and dispatch hot paths
// ABOUTME: Measures the per-frame cost the transport thread pays in its tight dispatch loop

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::io;
use std::sync::Arc;
use wiremux::frame::Frame;
use wiremux::{
    BufferPool, ChunkReader, ClientHandler, Executor, ServiceRegistry, Transport, WireMarshaller,
    MSG_FLAG_FIRST,
};

struct NullTransport;

impl Transport for NullTransport {
    fn send_blocking(&self, _buf: &mut BytesMut, _flush: bool) -> io::Result<()> {
        Ok(())
    }

    fn close(&self) {}
}

struct NullPool;

impl BufferPool for NullPool {
    fn allocate(&self) -> BytesMut {
        BytesMut::with_capacity(256)
    }

    fn free(&self, _buf: BytesMut) {}
}

struct DropExecutor;

impl Executor for DropExecutor {
    fn execute(&self, _task: Box<dyn FnOnce() + Send>) {}
}

struct SinkHandler;

impl ClientHandler for SinkHandler {
    fn handle_request(&self, _rid: u32, _payload: ChunkReader) {}

    fn close(&self) {}
}

struct AlwaysOpen;

impl ServiceRegistry for AlwaysOpen {
    fn open_service(&self, _service_type: &str, _group_name: &str) -> Option<Arc<dyn ClientHandler>> {
        Some(Arc::new(SinkHandler))
    }
}

fn bench_engine() -> Arc<wiremux::Engine> {
    wiremux::Engine::new(
        Arc::new(NullTransport),
        Arc::new(NullPool),
        Arc::new(DropExecutor),
        Arc::new(AlwaysOpen),
        Arc::new(WireMarshaller),
    )
}

fn frame_parse_benchmark(c: &mut Criterion) {
    let request = Frame::Request {
        rid: 0x10,
        flags: MSG_FLAG_FIRST,
        client_id: Some(7),
        payload: Bytes::from_static(&[0x55; 512]),
    }
    .to_bytes();

    c.bench_function("parse_request_frame", |b| {
        b.iter(|| Frame::parse(black_box(&request)).unwrap())
    });

    let ack = Frame::StreamAck { sid: 0xDEADBEEF }.to_bytes();
    c.bench_function("parse_control_frame", |b| {
        b.iter(|| Frame::parse(black_box(&ack)).unwrap())
    });
}

fn frame_encode_benchmark(c: &mut Criterion) {
    let frame = Frame::Reply {
        rid: 0x20,
        flags: 0,
        payload: Bytes::from_static(&[0x55; 512]),
    };

    c.bench_function("encode_reply_frame", |b| {
        b.iter(|| {
            let mut buf = BytesMut::with_capacity(1024);
            black_box(&frame).encode(&mut buf);
            black_box(buf)
        })
    });
}

fn dispatch_benchmark(c: &mut Criterion) {
    let engine = bench_engine();
    let unknown_ack = Frame::StreamAck { sid: 0xDEADBEEF }.to_bytes();

    // The dispatcher's cheapest path: lookup miss, trace, drop
    c.bench_function("dispatch_unknown_id", |b| {
        b.iter(|| engine.dispatch(black_box(unknown_ack.clone())))
    });

    let alive = Frame::Alive.to_bytes();
    c.bench_function("dispatch_alive", |b| {
        b.iter(|| engine.dispatch(black_box(alive.clone())))
    });

    // Full request lifecycle: create entity, push payload, abort
    let first = Frame::Request {
        rid: 0x10,
        flags: MSG_FLAG_FIRST,
        client_id: Some(7),
        payload: Bytes::from_static(&[0x55; 512]),
    }
    .to_bytes();
    let abort = Frame::RequestAbort { rid: 0x10 }.to_bytes();

    c.bench_function("dispatch_request_lifecycle", |b| {
        b.iter(|| {
            engine.dispatch(black_box(first.clone()));
            engine.dispatch(black_box(abort.clone()));
        })
    });
}

criterion_group!(
    benches,
    frame_parse_benchmark,
    frame_encode_benchmark,
    dispatch_benchmark
);
criterion_main!(benches);
