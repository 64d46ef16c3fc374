use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use sigstream::modules::signer::{self, SessionKeyPair};

fn bench_sign_segment(c: &mut Criterion) {
    let keys = SessionKeyPair::generate().unwrap();
    // Well above the size of a single segment at the configured bitrates
    let segment = vec![0x5au8; 1024 * 1024];

    let mut group = c.benchmark_group("segment_integrity");
    group.throughput(Throughput::Bytes(segment.len() as u64));
    group.bench_function("digest_1mib", |b| {
        b.iter(|| signer::digest(black_box(&segment)))
    });
    group.bench_function("digest_and_sign_1mib", |b| {
        b.iter(|| {
            let digest = signer::digest(black_box(&segment));
            signer::sign(&digest, keys.signing_key()).unwrap()
        })
    });
    group.finish();
}

fn bench_generate_session_keys(c: &mut Criterion) {
    c.bench_function("generate_session_keys", |b| {
        b.iter(|| SessionKeyPair::generate().unwrap())
    });
}

criterion_group!(benches, bench_sign_segment, bench_generate_session_keys);
criterion_main!(benches);
