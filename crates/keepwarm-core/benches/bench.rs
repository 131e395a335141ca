use bytes::Bytes;
use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::stream;
use keepwarm_core::drain;
use tokio::runtime::Builder;

fn drain_bench(c: &mut Criterion) {
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();
    let chunk_size = 64 * 1024;
    let chunk = Bytes::from(vec![0xAB_u8; chunk_size]);

    let mut group = c.benchmark_group("ingress/drain");
    for total_chunks in [1_usize, 16, 256] {
        group.throughput(Throughput::Bytes((total_chunks * chunk_size) as u64));
        group.bench_function(format!("chunks/{total_chunks}"), |b| {
            b.to_async(&rt).iter(|| {
                let chunk = chunk.clone();
                let chunks =
                    (0..total_chunks).map(move |_| Ok::<_, std::io::Error>(chunk.clone()));
                async move { black_box(drain(stream::iter(chunks), 0).await.unwrap()) }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, drain_bench);
criterion_main!(benches);
