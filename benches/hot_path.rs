use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stitch_rs::continuation::payload::classify_context;
use stitch_rs::continuation::{is_truncated, verdict, PayloadBuilder};
use stitch_rs::protocol::chat::{ChatMessage, Role};
use stitch_rs::stream::{ChunkEncoder, UpstreamDecoder};

fn sample_round(chars: usize) -> String {
    let line = "    const value = items.map((item) => item.id).filter(Boolean);\n";
    line.chars().cycle().take(chars).collect()
}

fn sample_upstream_body(fragments: usize) -> Vec<u8> {
    let mut body = String::from("f:{\"messageId\":\"msg-bench\"}\n");
    for i in 0..fragments {
        body.push_str("0:\"fragment ");
        body.push_str(&i.to_string());
        body.push_str(" with \\\"quotes\\\" and \\n newline \"\n");
    }
    body.push_str("e:{\"finishReason\":\"stop\"}\nd:{\"finishReason\":\"stop\"}\n");
    body.into_bytes()
}

fn bench_detector(c: &mut Criterion) {
    let round = sample_round(20_000);
    c.bench_function("detector_is_truncated_20k", |b| {
        b.iter(|| black_box(is_truncated(black_box(&round))));
    });
    c.bench_function("detector_verdict_20k", |b| {
        b.iter(|| black_box(verdict(black_box(&round), "<built>")));
    });
}

fn bench_classify(c: &mut Criterion) {
    let window = sample_round(200);
    c.bench_function("classify_context_200", |b| {
        b.iter(|| black_box(classify_context(black_box(&window))));
    });
}

fn bench_decoder(c: &mut Criterion) {
    let body = sample_upstream_body(500);
    c.bench_function("upstream_decoder_500_fragments_64b_chunks", |b| {
        b.iter(|| {
            let mut decoder = UpstreamDecoder::new();
            let mut out = Vec::with_capacity(512);
            for chunk in body.chunks(64) {
                let _ = decoder.feed(black_box(chunk), &mut out);
            }
            let _ = decoder.finish(&mut out);
            black_box(out.len())
        });
    });
}

fn bench_frames(c: &mut Criterion) {
    let encoder = ChunkEncoder::new(
        "chatcmpl-bench".to_string(),
        1_700_000_000,
        "mintlify".to_string(),
    );
    c.bench_function("sse_delta_frame", |b| {
        b.iter(|| black_box(encoder.delta_frame(black_box("let x = \"quoted\";\n"))));
    });

    let builder = PayloadBuilder::new(None, "mintlify");
    let messages = vec![
        ChatMessage::new(Role::System, "You are a builder."),
        ChatMessage::new(Role::User, "Build a todo app"),
    ];
    let prior = sample_round(2_000);
    c.bench_function("payload_build_continuation", |b| {
        b.iter(|| {
            black_box(builder.build(
                black_box(&messages),
                Some("conv_1700000000000_abc123"),
                false,
                Some(&prior),
            ))
        });
    });
}

criterion_group!(benches, bench_detector, bench_classify, bench_decoder, bench_frames);
criterion_main!(benches);
