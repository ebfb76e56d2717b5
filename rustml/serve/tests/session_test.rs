mod common;

use common::*;
use rustml_net::*;
use rustml_serve::*;

#[test]
fn test_session_matches_full_forward() {
    let network = lm_network(7);
    let tokens = [5u32, 12, 7];
    let full = network.forward_tokens(&tokens).unwrap();

    let mut session = KvSession::new();
    session.reset(&network, 8).unwrap();
    for (t, &tok) in tokens.iter().enumerate() {
        let logits = session.append(&network, tok).unwrap();
        assert_f32_near(logits, &full[t * VOCAB..(t + 1) * VOCAB], 1e-4, &format!("position {}", t));
    }
    assert_eq!(session.state(), SessionState::Ready { len: 3 });
    assert_eq!(session.valid_mask(), &[true, true, true]);
}

#[test]
fn test_session_lifecycle() {
    let network = lm_network(1);
    let mut session = KvSession::new();
    assert_eq!(session.state(), SessionState::Uninitialized);
    let err = session.append(&network, 1).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);

    assert_eq!(session.reset(&network, 0).unwrap_err().code(), ErrorCode::InvalidArgument);
    session.reset(&network, 2).unwrap();
    assert_eq!(session.state(), SessionState::Ready { len: 0 });
    assert!(session.last_logits().is_none());
    session.append(&network, 1).unwrap();
    session.append(&network, 2).unwrap();
    assert_eq!(session.state(), SessionState::Full { len: 2 });
    assert_eq!(session.append(&network, 3).unwrap_err().code(), ErrorCode::InvalidState);

    // reset reuses the buffers and starts over
    session.reset(&network, 2).unwrap();
    assert_eq!(session.len(), 0);
    session.append(&network, 3).unwrap();
    assert_eq!(session.len(), 1);

    session.release();
    assert_eq!(session.state(), SessionState::Uninitialized);
}

#[test]
fn test_session_rejects_out_of_vocab_token() {
    let network = lm_network(1);
    let mut session = KvSession::new();
    session.reset(&network, 4).unwrap();
    let err = session.append(&network, VOCAB as u32).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    assert_eq!(session.len(), 0);
}

#[test]
fn test_session_needs_token_lm() {
    let arch = ArchitectureConfig::Dff(DffConfig::new(vec![4]));
    let network = Network::new(arch, TrainingConfig::default()).unwrap();
    let mut session = KvSession::new();
    // not built yet
    assert_eq!(session.reset(&network, 4).unwrap_err().code(), ErrorCode::InvalidState);
    network.build(IoShape::new(2, 1)).unwrap();
    assert_eq!(session.reset(&network, 4).unwrap_err().code(), ErrorCode::InvalidArgument);
}

#[test]
fn test_session_beyond_training_context() {
    // max_seq_len is 16; positional tables are built for the session length
    let network = lm_network(3);
    let mut session = KvSession::new();
    session.reset(&network, 24).unwrap();
    for i in 0..24u32 {
        let logits = session.append(&network, i % VOCAB as u32).unwrap();
        assert!(logits.iter().all(|v| v.is_finite()));
    }
    assert!(session.is_full());
}

#[test]
fn test_batched_ragged_rows_match_single_sessions() {
    let network = lm_network(11);
    let prompts: [&[u32]; 3] = [&[1, 2, 3, 4], &[9], &[5, 12, 7]];

    let mut batch = BatchedKvSession::new(3);
    batch.reset(&network, 8).unwrap();
    let longest = prompts.iter().map(|p| p.len()).max().unwrap();
    for t in 0..longest {
        let step: Vec<Option<u32>> = prompts.iter().map(|p| p.get(t).copied()).collect();
        batch.append_batch(&network, &step).unwrap();
    }
    assert_eq!(batch.lens(), vec![4, 1, 3]);
    assert_eq!(batch.valid_mask(1), &[true]);

    for (row, prompt) in prompts.iter().enumerate() {
        let mut single = KvSession::new();
        single.reset(&network, 8).unwrap();
        for &tok in prompt.iter() {
            single.append(&network, tok).unwrap();
        }
        assert_f32_near(
            batch.logits(row).unwrap(),
            single.last_logits().unwrap(),
            1e-5,
            &format!("row {}", row),
        );
    }
}

#[test]
fn test_batched_errors() {
    let network = lm_network(2);
    let mut batch = BatchedKvSession::new(2);
    batch.reset(&network, 1).unwrap();
    assert_eq!(
        batch.append_batch(&network, &[Some(1)]).unwrap_err().code(),
        ErrorCode::InvalidArgument
    );
    batch.append_batch(&network, &[Some(1), None]).unwrap();
    // row 0 is full, row 1 still advances
    let err = batch.append_batch(&network, &[Some(2), Some(3)]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);
    assert_eq!(batch.lens(), vec![1, 1]);

    batch.clear_row(0, true).unwrap();
    assert_eq!(batch.lens(), vec![0, 1]);
    assert!(batch.logits(0).is_none());
    assert_eq!(batch.clear_row(5, false).unwrap_err().code(), ErrorCode::InvalidArgument);
}

#[test]
fn test_sessions_share_network_across_threads() {
    let network = lm_network(5);
    let reference = {
        let mut s = KvSession::new();
        s.reset(&network, 4).unwrap();
        s.append(&network, 5).unwrap();
        s.append(&network, 6).unwrap().to_vec()
    };
    std::thread::scope(|scope| {
        for _ in 0..3 {
            scope.spawn(|| {
                let mut s = KvSession::new();
                s.reset(&network, 4).unwrap();
                s.append(&network, 5).unwrap();
                let logits = s.append(&network, 6).unwrap();
                assert_f32_near(logits, &reference, 0.0, "thread");
            });
        }
    });
}
