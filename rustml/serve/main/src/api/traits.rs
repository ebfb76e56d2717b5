//! Generation hooks implemented by callers.
//!
//! Both hooks run on the thread that drives generation (the caller of
//! `generate` or of the batcher's `step`), never on a worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::api::types::{RequestId, TokenControl};

/// Receives every generated token as soon as it is sampled.
pub trait TokenCallback: Send {
    /// `index` counts generated tokens of this request from 0.
    fn on_token(&mut self, id: RequestId, token: u32, index: usize) -> TokenControl;
}

impl<F> TokenCallback for F
where
    F: FnMut(RequestId, u32, usize) -> TokenControl + Send,
{
    fn on_token(&mut self, id: RequestId, token: u32, index: usize) -> TokenControl {
        self(id, token, index)
    }
}

/// Polled once per decode step; `true` cancels the request.
pub trait StopPoll: Send {
    fn should_stop(&self, id: RequestId) -> bool;
}

impl<F> StopPoll for F
where
    F: Fn(RequestId) -> bool + Send,
{
    fn should_stop(&self, id: RequestId) -> bool {
        self(id)
    }
}

/// Shared cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl From<Arc<AtomicBool>> for CancelFlag {
    fn from(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }
}

impl StopPoll for CancelFlag {
    fn should_stop(&self, _id: RequestId) -> bool {
        self.is_cancelled()
    }
}
