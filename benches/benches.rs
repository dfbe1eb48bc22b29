use criterion::{criterion_group, criterion_main};


criterion_group!(benches, crypto::sigs, crypto::threshold, beacon::rounds);
criterion_main!(benches);
