//! End-to-end identification runs over synthetic corpora

use fgpt_ident::{
    config::IdentConfig,
    output::ReportWriter,
    packet::{resolve, split_len, Packet, Split},
    FingerprintIdentifier, StopReason,
};
use tempfile::TempDir;

fn background_packet(i: u32) -> Packet {
    Packet {
        ip_id: (i.wrapping_mul(40503) >> 3) as u16,
        src_ip: 0x0a00_0000 | i.wrapping_mul(2_654_435_761) >> 8,
        dst_ip: 0xc0a8_0001,
        src_port: 1024 + (i.wrapping_mul(7919) % 60000) as u16,
        dst_port: 1 + (i.wrapping_mul(104_729) % 5000) as u16,
        seq: i.wrapping_mul(2_246_822_519),
        window: (i.wrapping_mul(3_266_489_917) >> 16) as u16,
    }
}

fn scanner_packet(i: u32) -> Packet {
    Packet {
        ip_id: 777,
        src_ip: 0x2d21_0000 | (i % 16),
        dst_ip: 0xc0a8_0001,
        src_port: 61000,
        dst_port: [22, 23, 80][(i % 3) as usize],
        seq: 0xdead_0000 | (i & 0xff),
        window: 1024,
    }
}

/// Two splits of background traffic with one scanner mixed in
fn planted_corpus() -> Vec<Split> {
    (0..2u32)
        .map(|s| {
            let mut packets: Vec<Packet> = (0..600).map(|i| background_packet(s * 1000 + i)).collect();
            for i in 0..150 {
                packets.insert((i * 4) as usize, scanner_packet(s * 1000 + i));
            }
            Split::new(format!("2024-01-0{}", s + 1), packets)
        })
        .collect()
}

fn small_config() -> IdentConfig {
    let mut config = IdentConfig::default()
        .with_functions(12)
        .with_samples(500)
        .with_iterations(4)
        .with_seeds(11, 23)
        .with_workers(4, 2, 8, 4);
    // keeps the subset search small in debug builds
    config.max_true_signs = 8;
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_small_corpus_stops_before_sampling() {
    let corpus = planted_corpus();
    let identifier = FingerprintIdentifier::new(small_config().with_samples(10_000)).unwrap();

    let outcome = identifier.run(corpus.clone()).await;
    assert_eq!(outcome.stop_reason, StopReason::CorpusDepleted);
    assert_eq!(outcome.iterations, 0);
    assert!(outcome.intersections.is_empty());
    assert_eq!(outcome.remaining, corpus);
    assert_eq!(outcome.seeds, (11, 23));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_zero_budget_runs_nothing() {
    let identifier = FingerprintIdentifier::new(small_config().with_iterations(0)).unwrap();
    let outcome = identifier.run(planted_corpus()).await;
    assert_eq!(outcome.stop_reason, StopReason::BudgetExhausted);
    assert_eq!(outcome.iterations, 0);
    assert_eq!(outcome.fingerprinted_packets, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_accounts_for_every_packet() {
    let corpus = planted_corpus();
    let total = split_len(&corpus);
    let identifier = FingerprintIdentifier::new(small_config()).unwrap();

    let outcome = identifier.run(corpus).await;
    assert_ne!(outcome.stop_reason, StopReason::Aborted);
    assert!(outcome.iterations <= 4 + identifier.config().max_budget_extension);
    assert_eq!(split_len(&outcome.remaining) + outcome.fingerprinted_packets, total);
    assert_eq!(outcome.functions.len(), 12 + 7);

    // every accepted packet exists in the corpus and satisfies all of its signs
    for intersection in &outcome.intersections {
        assert_eq!(intersection.size, intersection.packets.len());
        assert_eq!(intersection.idxs.len(), intersection.f_idxs.len());
        for index in &intersection.packets {
            let packet = resolve(&outcome.corpus, index).expect("packet index out of range");
            for idx in &intersection.idxs {
                assert!(outcome.function_results[*idx].sign.matches(packet));
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_seeded_runs_are_reproducible() {
    let identifier = FingerprintIdentifier::new(small_config()).unwrap();
    let first = identifier.run(planted_corpus()).await;
    let second = identifier.run(planted_corpus()).await;

    assert_eq!(first.stop_reason, second.stop_reason);
    assert_eq!(first.iterations, second.iterations);
    assert_eq!(first.intersections, second.intersections);
    assert_eq!(first.bad_functions, second.bad_functions);
    assert_eq!(first.threshold, second.threshold);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reports_are_written_after_a_run() {
    let dir = TempDir::new().unwrap();
    let corpus = planted_corpus();
    let total = split_len(&corpus);
    let identifier = FingerprintIdentifier::new(small_config()).unwrap();
    let outcome = identifier.run(corpus).await;

    let written = ReportWriter::new(dir.path()).write(&outcome, total).unwrap();
    assert_eq!(written.len(), outcome.intersections.len() + 2);

    let seeds = std::fs::read_to_string(dir.path().join("seeds")).unwrap();
    assert_eq!(seeds, "SEEDS: 11, 23\n");

    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("summary.json")).unwrap()).unwrap();
    assert_eq!(summary["n_packets"], total);
    assert_eq!(
        summary["fingerprints"].as_array().map(|a| a.len()),
        Some(outcome.intersections.len())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_seq_mod_four_subset_is_identified() {
    use fgpt_ident::consolidate::{consolidate_signs, ConsolidationParams};
    use fgpt_ident::engine::{find_effective_signs, EvaluationParams};
    use fgpt_ident::packet::{Field, PacketIndex};
    use fgpt_ident::synthesis::{PacketFunction, UnaryOp};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    let seq_mod_four = PacketFunction::unary(
        UnaryOp::ShiftRight(30),
        &PacketFunction::unary(UnaryOp::ShiftLeft(30), &PacketFunction::seed(Field::Seq)),
    );

    // 950 packets cycle through the four residues, 50 more all have residue 3
    let mut packets: Vec<Packet> = (0..950u32)
        .map(|i| Packet {
            seq: (i.wrapping_mul(2_654_435_761) & !3) | (i % 4),
            dst_port: 80,
            ..Default::default()
        })
        .collect();
    packets.extend((0..50u32).map(|k| Packet {
        seq: (k << 16) | 3,
        dst_port: 80,
        ..Default::default()
    }));
    assert!(packets.iter().all(|p| seq_mod_four.apply(p) == p.seq % 4));
    let splits = Arc::new(vec![Split::new("t0", packets)]);

    let eval_params = EvaluationParams {
        threshold: 0.5,
        max_candidates: 4,
        function_workers: 2,
        split_workers: 2,
    };
    let results = find_effective_signs(
        Arc::new(vec![seq_mod_four]),
        splits.clone(),
        eval_params,
        &BTreeSet::new(),
    )
    .await;
    // residue 3 leads with 287 packets; residue 2 marks the cut
    assert_eq!(
        results.iter().map(|r| r.sign.value).collect::<Vec<_>>(),
        vec![3, 0, 1]
    );

    let params = ConsolidationParams {
        filter_workers: 4,
        subset_workers: 2,
        ..Default::default()
    };
    let result = consolidate_signs(splits, Arc::new(vec![results[0].clone()]), params, 0)
        .await
        .unwrap();
    assert_eq!(result.intersections.len(), 1);
    let only = &result.intersections[0];
    assert_eq!(only.size, 237 + 50);
    assert!((950..1000).all(|i| only.packets.contains(&PacketIndex::new(0, i))));
}
