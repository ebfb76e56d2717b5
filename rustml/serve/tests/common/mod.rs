#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use rustml_net::*;
use rustml_serve::*;

pub const VOCAB: usize = 16;

pub fn assert_f32_near(actual: &[f32], expected: &[f32], tolerance: f32, msg: &str) {
    assert_eq!(actual.len(), expected.len(), "{}: length mismatch", msg);
    for (i, (&a, &e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "{}: element [{}] mismatch: actual={}, expected={}, tolerance={}",
            msg,
            i,
            a,
            e,
            tolerance
        );
    }
}

pub fn lm_config(vocab: usize) -> TransformerConfig {
    TransformerConfig { max_seq_len: 16, ffn_hidden: 32, ..TransformerConfig::token_lm(vocab, 16, 2, 2) }
}

/// Freshly initialized token LM; weights depend only on `seed`.
pub fn lm_network(seed: u64) -> Network {
    let training = TrainingConfig::default().with_epochs(1).with_seed(seed);
    let network = Network::new(ArchitectureConfig::Transformer(lm_config(VOCAB)), training).unwrap();
    network.build(IoShape::new(1, 0)).unwrap();
    network
}

/// Greedy continuation computed through `generate`.
pub fn greedy_tokens(network: &Network, prompt: &[u32], n: usize) -> Vec<u32> {
    generate(network, prompt, &GenerationConfig::greedy(n), |_| TokenControl::Continue).unwrap().tokens
}

/// Token callback that appends to a shared log.
pub fn token_log() -> (Arc<Mutex<Vec<(RequestId, u32, usize)>>>, impl TokenCallback + 'static) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let cb = move |id: RequestId, tok: u32, index: usize| {
        sink.lock().unwrap().push((id, tok, index));
        TokenControl::Continue
    };
    (log, cb)
}
