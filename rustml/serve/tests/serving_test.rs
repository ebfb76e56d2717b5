mod common;

use std::sync::{Arc, Mutex};

use common::*;
use rustml_net::*;
use rustml_serve::*;

#[test]
fn test_generate_matches_manual_session() {
    let network = lm_network(31);
    let prompt = [5u32, 12, 7];
    let result = generate(&network, &prompt, &GenerationConfig::greedy(4), |_| TokenControl::Continue).unwrap();
    assert_eq!(result.stop, StopReason::MaxNewTokens);
    assert_eq!(result.prompt_len, 3);

    let mut session = KvSession::new();
    session.reset(&network, 8).unwrap();
    let mut last = 0;
    for &tok in &prompt {
        last = greedy_token(session.append(&network, tok).unwrap());
    }
    let mut expected = vec![last];
    for _ in 1..4 {
        last = greedy_token(session.append(&network, last).unwrap());
        expected.push(last);
    }
    assert_eq!(result.tokens, expected);
}

#[test]
fn test_generate_stop_conditions() {
    let network = lm_network(32);
    let prompt = [1u32, 2];
    let greedy = greedy_tokens(&network, &prompt, 3);

    let mut seen = Vec::new();
    let res = generate(&network, &prompt, &GenerationConfig::greedy(10), |t| {
        seen.push(t);
        if seen.len() == 2 {
            TokenControl::Stop
        } else {
            TokenControl::Continue
        }
    })
    .unwrap();
    assert_eq!(res.stop, StopReason::Cancelled);
    assert_eq!(res.tokens, greedy[..2].to_vec());
    assert_eq!(seen, res.tokens);

    let res = generate(&network, &prompt, &GenerationConfig::greedy(10).with_eos(greedy[0]), |_| TokenControl::Continue)
        .unwrap();
    assert_eq!(res.stop, StopReason::Eos);
    assert!(res.tokens.is_empty());

    let res = generate(&network, &prompt, &GenerationConfig::greedy(10).with_max_len(3), |_| TokenControl::Continue)
        .unwrap();
    assert_eq!(res.stop, StopReason::LengthCap);
    assert_eq!(res.tokens, greedy[..2].to_vec());
}

#[test]
fn test_generate_rejects_bad_input() {
    let network = lm_network(33);
    let go = |prompt: &[u32], cfg: GenerationConfig| generate(&network, prompt, &cfg, |_| TokenControl::Continue);
    assert_eq!(go(&[], GenerationConfig::greedy(2)).unwrap_err().code(), ErrorCode::InvalidArgument);
    assert_eq!(go(&[99], GenerationConfig::greedy(2)).unwrap_err().code(), ErrorCode::InvalidArgument);
    assert_eq!(go(&[1], GenerationConfig::greedy(0)).unwrap_err().code(), ErrorCode::InvalidArgument);
    assert_eq!(
        go(&[1, 2, 3], GenerationConfig::greedy(2).with_max_len(2)).unwrap_err().code(),
        ErrorCode::InvalidArgument
    );
}

#[test]
fn test_generate_bounds_kv_allocation() {
    let network = lm_network(36);
    let config = GenerationConfig::greedy(1usize << 40).with_eos(0);
    let result = generate(&network, &[1], &config, |_| TokenControl::Stop).unwrap();
    assert!(result.tokens.len() <= 1);
    assert!(matches!(result.stop, StopReason::Cancelled | StopReason::Eos));

    let huge = GenerationConfig::greedy(4).with_max_len(1usize << 40);
    let err = generate(&network, &[1], &huge, |_| TokenControl::Continue).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    let at_limit = GenerationConfig::greedy(2).with_max_len(GENERATE_MAX_LEN);
    assert_eq!(generate(&network, &[1], &at_limit, |_| TokenControl::Continue).unwrap().tokens.len(), 2);
}

struct GenerateDuringTraining {
    error: Option<ErrorCode>,
}

impl RunCallbacks for GenerateDuringTraining {
    fn on_epoch_end(&mut self, network: &Network, _metrics: &EpochMetrics) -> bool {
        self.error = generate(network, &[1], &GenerationConfig::greedy(1), |_| TokenControl::Continue)
            .err()
            .map(|e| e.code());
        true
    }
}

#[test]
fn test_generate_rejected_while_training() {
    let network = lm_network(34);
    let stream: Vec<u32> = (0..40).map(|i| (i % VOCAB) as u32).collect();
    let dataset = TokenDataset::new(VOCAB, stream.clone(), stream).unwrap();
    let mut callbacks = GenerateDuringTraining { error: None };
    network.run(&dataset, RunMode::Train, &mut callbacks).unwrap();
    assert_eq!(callbacks.error, Some(ErrorCode::InvalidState));
}

#[test]
fn test_generate_from_many_threads() {
    let network = lm_network(35);
    let config = GenerationConfig::with_top_p(6, 0.9, 0.8).with_seed(5);
    let reference = generate(&network, &[3, 4], &config, |_| TokenControl::Continue).unwrap();
    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let res = generate(&network, &[3, 4], &config, |_| TokenControl::Continue).unwrap();
                assert_eq!(res.tokens, reference.tokens);
            });
        }
    });
}

#[test]
fn test_serving_layer_runs_requests() {
    let network = Arc::new(lm_network(40));
    let layer = Arc::new(TransformerServingLayer::new(Arc::clone(&network), 3, 32).unwrap());

    std::thread::scope(|scope| {
        for prompt in [vec![1u32, 2], vec![3], vec![4, 5, 6]] {
            let layer = Arc::clone(&layer);
            scope.spawn(move || {
                layer.submit(GenerationRequest::new(prompt, GenerationConfig::greedy(3))).unwrap();
            });
        }
    });
    assert_eq!(layer.active().unwrap(), 3);

    let results = layer.run_until_idle().unwrap();
    assert_eq!(results.len(), 3);
    for r in &results {
        assert_eq!(r.stop, StopReason::MaxNewTokens);
        assert_eq!(r.tokens.len(), 3);
    }
    assert_eq!(layer.active().unwrap(), 0);
}

#[test]
fn test_serving_layer_rejects_reentry_from_callback() {
    let network = Arc::new(lm_network(41));
    let layer = Arc::new(TransformerServingLayer::new(Arc::clone(&network), 2, 16).unwrap());
    let codes: Arc<Mutex<Vec<ErrorCode>>> = Arc::new(Mutex::new(Vec::new()));

    let weak = Arc::downgrade(&layer);
    let sink = Arc::clone(&codes);
    let callback = move |_id: RequestId, _tok: u32, _index: usize| {
        if let Some(layer) = weak.upgrade() {
            let mut sink = sink.lock().unwrap();
            let err = layer.submit(GenerationRequest::new(vec![1], GenerationConfig::greedy(1))).unwrap_err();
            sink.push(err.code());
            sink.push(layer.step().unwrap_err().code());
            sink.push(layer.remove(0, false).unwrap_err().code());
        }
        TokenControl::Continue
    };
    layer
        .submit(GenerationRequest::new(vec![2, 3], GenerationConfig::greedy(2)).with_callback(callback))
        .unwrap();

    let results = layer.run_until_idle().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].stop, StopReason::MaxNewTokens);
    let codes = codes.lock().unwrap();
    assert_eq!(codes.len(), 6);
    assert!(codes.iter().all(|&c| c == ErrorCode::InvalidState));

    // outside a callback the layer is usable again
    layer.submit(GenerationRequest::new(vec![1], GenerationConfig::greedy(1))).unwrap();
    assert_eq!(layer.run_until_idle().unwrap().len(), 1);
}

#[test]
fn test_serving_layer_remove_and_cancel() {
    let network = Arc::new(lm_network(42));
    let layer = TransformerServingLayer::new(network, 2, 16).unwrap();
    let flag = CancelFlag::new();
    let a = layer
        .submit(GenerationRequest::new(vec![1], GenerationConfig::greedy(8)).with_stop_poll(flag.clone()))
        .unwrap();
    let b = layer.submit(GenerationRequest::new(vec![2], GenerationConfig::greedy(8))).unwrap();
    layer.step().unwrap();

    let removed = layer.remove(b.slot, true).unwrap();
    assert_eq!(removed.stop, StopReason::Removed);
    assert_eq!(removed.tokens.len(), 1);

    flag.cancel();
    let results = layer.step().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, a.id);
    assert_eq!(results[0].stop, StopReason::Cancelled);
    assert_eq!(layer.active().unwrap(), 0);
}
