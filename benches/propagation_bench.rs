use criterion::{black_box, criterion_group, criterion_main, Criterion};
use streamgraph::{CellSink, StreamSink};

fn map_chain_benchmark(c: &mut Criterion) {
    c.bench_function("map chain send", |b| {
        let sink = StreamSink::<i32>::new();
        let out = sink
            .stream()
            .map(|x| x + 1)
            .map(|x| x * 2)
            .map(|x| x - 3)
            .filter(|x| *x != 0);
        let _l = out.listen(|v| {
            black_box(*v);
        });
        let mut n = 0;
        b.iter(|| {
            n += 1;
            sink.send(black_box(n)).unwrap();
        });
    });
}

fn merge_coalesce_benchmark(c: &mut Criterion) {
    c.bench_function("merge coalesce send", |b| {
        let a = StreamSink::<i32>::new();
        let sb = StreamSink::<i32>::new();
        let merged = a.stream().merge_with(&sb.stream(), |l, r| l + r);
        let _l = merged.listen(|v| {
            black_box(*v);
        });
        let mut n = 0;
        b.iter(|| {
            n += 1;
            a.send(black_box(n)).unwrap();
            sb.send(black_box(n * 2)).unwrap();
        });
    });
}

fn accum_benchmark(c: &mut Criterion) {
    c.bench_function("accum running total", |b| {
        let sink = StreamSink::<i32>::new();
        let total = sink.stream().accum(0, |v, s| v + s);
        let mut n = 0;
        b.iter(|| {
            n += 1;
            sink.send(black_box(n)).unwrap();
            black_box(total.sample());
        });
    });
}

fn cell_sink_send_benchmark(c: &mut Criterion) {
    c.bench_function("cell sink send", |b| {
        let cell_sink = CellSink::new(0);
        let mut n = 0;
        b.iter(|| {
            n += 1;
            cell_sink.send(black_box(n)).unwrap();
        });
    });
}

criterion_group!(
    benches,
    map_chain_benchmark,
    merge_coalesce_benchmark,
    accum_benchmark,
    cell_sink_send_benchmark
);
criterion_main!(benches);
