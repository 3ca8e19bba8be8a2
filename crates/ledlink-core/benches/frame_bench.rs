//! Criterion benchmarks for the line-JSON frame codec.
//!
//! A status reply from a fully populated controller is the largest frame on
//! the link; it is decoded every poll interval for every controller.
//!
//! Run with:
//! ```bash
//! cargo bench --package ledlink-core --bench frame_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ledlink_core::protocol::frame::{decode_frame, encode_frame, Frame};
use ledlink_core::protocol::messages::{DeviceCommand, DriverChannels, InboundMessage};
use serde_json::{json, Value};

// ── Frame fixtures ────────────────────────────────────────────────────────────

fn status_value(drivers: usize) -> Value {
    let drvs: Vec<Value> = (0..drivers)
        .map(|i| {
            json!({
                "idx": i, "av": true, "idc": false, "w": 1,
                "cs": (0..4).map(|c| json!({"idx": c, "on": c % 2 == 0, "pwm": 120, "flt": false})).collect::<Vec<_>>()
            })
        })
        .collect();
    json!({
        "t": "status", "um": 123_456, "dv": "bench",
        "f": {"rd": true, "cn": 2, "rpm": 1800, "flt": false},
        "ac": {"sns": [
            {"bu": "A", "idx": 0, "rd": true, "s": {"vd": true, "um": 1, "vlt": {"k": 24.0}, "cu": {"k": 1.2}, "pw": {"k": 28.8}}},
            {"bu": "B", "idx": 1, "rd": true, "s": {"vd": true, "um": 1, "vlt": {"k": 23.9}, "cu": {"k": 0.8}, "pw": {"k": 19.1}}}
        ]},
        "l": {"drvs": drvs}
    })
}

fn pwm_command() -> DeviceCommand {
    DeviceCommand::LedPwm {
        pwm: 128,
        drivers: (0..8)
            .map(|d| DriverChannels { driver: d, channels: vec![0, 1, 2, 3] })
            .collect(),
    }
}

// ── Benchmarks ────────────────────────────────────────────────────────────────

fn bench_encode(c: &mut Criterion) {
    let frame = pwm_command().to_frame();
    c.bench_function("encode_led_pwm", |b| {
        b.iter(|| encode_frame(black_box(&frame)).expect("encode"))
    });
}

fn bench_decode_status(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_status");
    for drivers in [1usize, 8, 32] {
        let frame = Frame::from_value(status_value(drivers)).expect("object");
        let bytes = encode_frame(&frame).expect("encode");
        group.bench_with_input(BenchmarkId::from_parameter(drivers), &bytes, |b, bytes| {
            b.iter(|| {
                let (frame, _) = decode_frame(black_box(bytes)).expect("decode");
                InboundMessage::from_frame(&frame).expect("classify")
            })
        });
    }
    group.finish();
}

fn bench_resync(c: &mut Criterion) {
    let good = encode_frame(&DeviceCommand::Status.to_frame()).expect("encode");
    let mut stream = b"{garbage\r\n".to_vec();
    stream.extend_from_slice(&good);
    c.bench_function("decode_after_corrupt_line", |b| {
        b.iter(|| {
            let buf = black_box(stream.as_slice());
            let skip = decode_frame(buf)
                .err()
                .and_then(|e| e.resync_len())
                .unwrap_or(0);
            decode_frame(&buf[skip..]).expect("decode")
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode_status, bench_resync);
criterion_main!(benches);
