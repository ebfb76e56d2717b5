mod common;

use common::*;
use rustml_net::*;

fn lm_training(epochs: usize) -> TrainingConfig {
    TrainingConfig::default()
        .with_learning_rate(0.01)
        .with_optimizer(OptimizerKind::adamw())
        .with_epochs(epochs)
}

#[test]
fn test_token_lm_learns_cycle() {
    let dataset = cyclic_tokens(8, 80);
    let network = Network::new(ArchitectureConfig::Transformer(tiny_lm(8)), lm_training(30)).unwrap();
    let summary = network.run(&dataset, RunMode::Train, &mut NoCallbacks).unwrap();
    let first = &summary.history[0];
    let last = summary.last().unwrap();
    assert!(last.loss < first.loss, "{} -> {}", first.loss, last.loss);
    assert_eq!(last.samples, 79);
    assert!(last.perplexity.is_some());
    assert!(last.regression.is_none());

    let eval = network.run(&dataset, RunMode::Test, &mut NoCallbacks).unwrap();
    let m = eval.last().unwrap();
    assert!(m.perplexity.unwrap().is_finite());
    assert!(m.accuracy.is_some());
    assert!((m.perplexity.unwrap() - m.loss.exp()).abs() < 1e-6 * m.perplexity.unwrap());
}

#[test]
fn test_sampled_softmax_training() {
    let dataset = cyclic_tokens(8, 64);
    let mut cfg = tiny_lm(8);
    cfg.token_lm = Some(TokenLmConfig::new(8).with_loss(LmLoss::Sampled { negatives: 3 }));
    let network = Network::new(ArchitectureConfig::Transformer(cfg), lm_training(20)).unwrap();
    let summary = network.run(&dataset, RunMode::Train, &mut NoCallbacks).unwrap();
    assert!(summary.history.iter().all(|m| m.perplexity.is_none()));
    assert!(summary.last().unwrap().loss.is_finite());

    let eval = network.run(&dataset, RunMode::Test, &mut NoCallbacks).unwrap();
    assert!(eval.last().unwrap().perplexity.is_some());
}

#[test]
fn test_sequence_spans_bound_windows() {
    // two sentences of 5 tokens: 4 targets each
    let stream: Vec<u32> = vec![1, 2, 3, 4, 5, 5, 4, 3, 2, 1];
    let dataset = TokenDataset::new(8, stream.clone(), stream)
        .unwrap()
        .with_train_sequence_starts(&[0, 5])
        .unwrap();
    let network = Network::new(ArchitectureConfig::Transformer(tiny_lm(8)), lm_training(1)).unwrap();
    let summary = network.run(&dataset, RunMode::Train, &mut NoCallbacks).unwrap();
    assert_eq!(summary.last().unwrap().samples, 8);
}

#[test]
fn test_token_out_of_vocab_rejected_at_construction() {
    let err = TokenDataset::new(4, vec![0, 1, 9], vec![]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
}

fn check_decode_parity(cfg: TransformerConfig) {
    let vocab = cfg.token_lm.as_ref().map(|t| t.vocab_size).unwrap();
    let dataset = cyclic_tokens(vocab, 40);
    let network = Network::new(ArchitectureConfig::Transformer(cfg), lm_training(2)).unwrap();
    network.run(&dataset, RunMode::Train, &mut NoCallbacks).unwrap();

    let tokens = [5u32, 2, 7, 1];
    let full = network.forward_tokens(&tokens).unwrap();
    assert_eq!(full.len(), tokens.len() * vocab);

    let guard = network.read().unwrap();
    let tf = guard.transformer().unwrap();
    assert_eq!(tf.vocab_size(), vocab);
    let mut kv = tf.new_kv(8);
    let positions = tf.positional_cache(8).unwrap();
    let mut scratch = DecodeScratch::new();
    let mut logits = vec![0.0; vocab];
    for (t, &tok) in tokens.iter().enumerate() {
        tf.decode_step(&mut kv, &positions, tok, &mut scratch, &mut logits).unwrap();
        assert_f32_near(&logits, &full[t * vocab..(t + 1) * vocab], 1e-4, &format!("position {}", t));
    }
    assert_eq!(kv.len(), tokens.len());
}

#[test]
fn test_cached_decode_matches_full_forward() {
    check_decode_parity(tiny_lm(8));
}

#[test]
fn test_cached_decode_matches_full_forward_rope_gqa() {
    let cfg = TransformerConfig {
        num_heads: 4,
        num_kv_heads: 2,
        positional: PositionalKind::Rope,
        norm: NormKind::RmsNorm,
        ffn: FeedForwardKind::SwiGlu,
        attention: AttentionStrategy::Flash,
        ..tiny_lm(12)
    };
    check_decode_parity(cfg);
}

#[test]
fn test_decode_rejects_full_cache_and_bad_token() {
    let network = Network::new(ArchitectureConfig::Transformer(tiny_lm(8)), lm_training(1)).unwrap();
    network.build(IoShape::new(1, 0)).unwrap();
    let guard = network.read().unwrap();
    let tf = guard.transformer().unwrap();
    let mut kv = tf.new_kv(2);
    let positions = tf.positional_cache(2).unwrap();
    let mut scratch = DecodeScratch::new();
    let mut logits = vec![0.0; 8];
    let err = tf.decode_step(&mut kv, &positions, 8, &mut scratch, &mut logits).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    tf.decode_step(&mut kv, &positions, 1, &mut scratch, &mut logits).unwrap();
    tf.decode_step(&mut kv, &positions, 2, &mut scratch, &mut logits).unwrap();
    let err = tf.decode_step(&mut kv, &positions, 3, &mut scratch, &mut logits).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);
}

#[test]
fn test_dense_network_has_no_decoder() {
    let network = xor_network(1);
    network.build(IoShape::new(2, 1)).unwrap();
    let guard = network.read().unwrap();
    assert!(guard.transformer().is_err());
    drop(guard);
    assert_eq!(network.forward_tokens(&[0]).unwrap_err().code(), ErrorCode::InvalidArgument);
}
