#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
#[cfg(not(target_arch = "wasm32"))]
use xfer_engine::device::{DeviceId, Platform, PlatformConfig};
#[cfg(not(target_arch = "wasm32"))]
use xfer_engine::{DataTransferer, GranularTransferChannel, PrefetchChannel, TypedTransfer};

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("XFER_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(10)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50)
            .noise_threshold(0.03),
    }
}

#[cfg(not(target_arch = "wasm32"))]
const SIZES: [usize; 3] = [4 * 1024, 256 * 1024, 4 * 1024 * 1024];

#[cfg(not(target_arch = "wasm32"))]
fn bench_granular_round_trip(c: &mut Criterion) {
    let platform = Platform::new(PlatformConfig::default()).expect("default config");
    let ctx = platform.device(DeviceId(0)).expect("device 0");
    let mut group = c.benchmark_group("granular_round_trip");

    for &len in &SIZES {
        group.throughput(Throughput::Bytes(2 * len as u64));
        let buf = ctx.allocate(len as u64).expect("allocate");
        let src = vec![0x5Au8; len];
        let mut dst = vec![0u8; len];
        let mut ch = GranularTransferChannel::new(&platform, DeviceId(0), false).expect("channel");

        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            b.iter(|| {
                // SAFETY: both host buffers outlive the waits below.
                unsafe {
                    ch.copy_host_to_device_async(src.as_ptr(), len, 1, buf.ptr())
                        .expect("assign");
                }
                ch.record_host_to_device_copy().expect("record");
                ch.wait_for_host_to_device_copy().expect("wait");
                unsafe {
                    ch.copy_device_to_host_async(buf.ptr(), len, 1, dst.as_mut_ptr())
                        .expect("fetch");
                }
                ch.record_device_to_host_copy().expect("record");
                ch.wait_for_device_to_host_copy().expect("wait");
                black_box(dst[len - 1]);
            })
        });
    }
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_typed_f32(c: &mut Criterion) {
    let platform = Platform::new(PlatformConfig::default()).expect("default config");
    let ctx = platform.device(DeviceId(0)).expect("device 0");
    let mut group = c.benchmark_group("typed_f32_fetch");

    for concurrent in [false, true] {
        let n = 256 * 1024;
        group.throughput(Throughput::Bytes((n * 4) as u64));
        let buf = ctx.allocate((n * 4) as u64).expect("allocate");
        let mut out = vec![0f32; n];
        let mut t = TypedTransfer::<f32>::new(&platform, DeviceId(0), concurrent).expect("typed");

        let name = if concurrent { "concurrent" } else { "compute_queue" };
        group.bench_function(name, |b| {
            b.iter(|| {
                t.copy_to_slice(buf.ptr(), &mut out).expect("fetch");
                black_box(out[n - 1]);
            })
        });
    }
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_prefetch_batch(c: &mut Criterion) {
    let platform = Platform::new(PlatformConfig::default()).expect("default config");
    let ctx = platform.device(DeviceId(0)).expect("device 0");
    let chunk = 64 * 1024;
    let chunks = 16;
    let buf = ctx.allocate((chunk * chunks) as u64).expect("allocate");
    let src = vec![7u8; chunk * chunks];
    let mut ch = PrefetchChannel::new(&platform, DeviceId(0)).expect("prefetch");

    let mut group = c.benchmark_group("prefetch_batched_assign");
    group.throughput(Throughput::Bytes((chunk * chunks) as u64));
    group.bench_function("16x64KiB", |b| {
        b.iter(|| {
            for i in 0..chunks {
                // SAFETY: `src` outlives the wait below.
                unsafe {
                    ch.copy_host_to_device_async(
                        src[i * chunk..].as_ptr(),
                        chunk,
                        1,
                        buf.ptr().byte_add((i * chunk) as u64),
                    )
                    .expect("assign");
                }
            }
            ch.record_host_to_device_copy().expect("record");
            ch.wait_for_host_to_device_copy().expect("wait");
        })
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_granular_round_trip, bench_typed_f32, bench_prefetch_batch
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
