//! Primitive operation benchmarks (digests, AEAD, erasure coding)

use criterion::{black_box, criterion_group, BenchmarkId, Criterion, Throughput};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use shardvault::{
    config,
    crypto::{self, FileKey},
    erasure::{self, CodecParams},
    integrity,
};

fn generate_test_data(size: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(config::TEST_RANDOM_SEED);
    let mut data = vec![0u8; size];
    rng.fill_bytes(&mut data);
    data
}

fn bench_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest");

    for size_kb in [1, 64, 1024] {
        let data = generate_test_data(size_kb * 1024);
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("sha256", format!("{}KB", size_kb)),
            &data,
            |bencher, data| {
                bencher.iter(|| black_box(integrity::digest(black_box(data))));
            },
        );
    }

    group.finish();
}

fn bench_aead(c: &mut Criterion) {
    let mut group = c.benchmark_group("aead");
    let key = FileKey::from_bytes([7u8; config::KEY_LEN]);

    for size_kb in [1, 64, 1024] {
        let data = generate_test_data(size_kb * 1024);
        group.throughput(Throughput::Bytes(data.len() as u64));

        group.bench_with_input(
            BenchmarkId::new("encrypt", format!("{}KB", size_kb)),
            &data,
            |bencher, data| {
                bencher.iter(|| crypto::encrypt(black_box(data), &key).unwrap());
            },
        );

        let sealed = crypto::encrypt(&data, &key).unwrap();
        group.bench_function(BenchmarkId::new("decrypt", format!("{}KB", size_kb)), |bencher| {
            bencher.iter(|| {
                crypto::decrypt(
                    black_box(&sealed.ciphertext),
                    &sealed.auth_tag,
                    &sealed.nonce,
                    &key,
                )
                .unwrap()
            });
        });
    }

    group.finish();
}

fn bench_erasure_coding(c: &mut Criterion) {
    let mut group = c.benchmark_group("erasure");

    for size_kb in [10, 100, 1024] {
        let data = generate_test_data(size_kb * 1024);
        let (k, n) = (config::DEFAULT_REQUIRED_SHARDS, config::DEFAULT_TOTAL_SHARDS);
        group.throughput(Throughput::Bytes(data.len() as u64));

        group.bench_with_input(
            BenchmarkId::new("encode", format!("{}KB", size_kb)),
            &data,
            |bencher, data| {
                bencher.iter(|| erasure::encode(black_box(data), k, n).unwrap());
            },
        );

        // Worst case: only parity shards survive
        let shards = erasure::encode(&data, k, n).unwrap();
        let parity_only: Vec<_> = shards.into_iter().skip(n - k).collect();
        let params = CodecParams::new(k, n, data.len());
        group.bench_with_input(
            BenchmarkId::new("decode_parity_only", format!("{}KB", size_kb)),
            &parity_only,
            |bencher, shards| {
                bencher.iter(|| erasure::decode(black_box(shards), &params).unwrap());
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_digest, bench_aead, bench_erasure_coding);
