use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use murmur_core::core_model::{LocalId, Message, MessageContent, ServerId, Timestamp, UserId};
use murmur_core::core_store::MessageLog;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SEED: u64 = 0x6d75_726d;

fn peer_message(id: u64, at: u64) -> Message {
    Message::persisted(
        ServerId(id),
        UserId::new("2"),
        false,
        MessageContent::Plaintext(format!("message {}", id)),
        Timestamp(at),
    )
}

/// Messages with shuffled timestamps, as a poll after reconnect delivers them
fn shuffled_batch(n: u64) -> Vec<Message> {
    let mut rng = StdRng::seed_from_u64(SEED);
    (0..n)
        .map(|id| peer_message(id, rng.gen_range(1_000_000..10_000_000)))
        .collect()
}

fn bench_merge_fresh(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_log_merge_fresh");
    for size in [10u64, 100, 1_000] {
        let batch = shuffled_batch(size);
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &batch, |b, batch| {
            b.iter(|| {
                let mut log = MessageLog::new();
                for message in batch.iter().cloned() {
                    black_box(log.merge(message));
                }
                log
            });
        });
    }
    group.finish();
}

fn bench_merge_repoll(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_log_merge_repoll");
    for size in [100u64, 1_000] {
        let batch = shuffled_batch(size);
        let mut seeded = MessageLog::new();
        for message in batch.iter().cloned() {
            seeded.merge(message);
        }
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &batch, |b, batch| {
            b.iter(|| {
                let mut log = seeded.clone();
                for message in batch.iter().cloned() {
                    black_box(log.merge(message));
                }
                log
            });
        });
    }
    group.finish();
}

fn bench_promote_pending(c: &mut Criterion) {
    c.bench_function("message_log_promote_pending_100", |b| {
        let me = UserId::new("1");
        b.iter(|| {
            let mut log = MessageLog::new();
            for i in 0..100u64 {
                log.merge(Message::outgoing(LocalId::new(format!("l{}", i)), me.clone(), format!("m{}", i), Timestamp(i)));
            }
            for i in 0..100u64 {
                let echo = Message::persisted(
                    ServerId(i),
                    me.clone(),
                    true,
                    MessageContent::Plaintext(format!("m{}", i)),
                    Timestamp(i + 5),
                );
                black_box(log.merge(echo));
            }
            log
        });
    });
}

criterion_group!(benches, bench_merge_fresh, bench_merge_repoll, bench_promote_pending);
criterion_main!(benches);
