use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::workflow::{ProbeError, ServiceProbe};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Scripted [`ServiceProbe`]
///
/// Answers are consumed in order; the last one repeats.
#[derive(Debug)]
pub struct MockProbe {
    answers: Mutex<VecDeque<Result<(), ProbeError>>>,
    urls: Mutex<Vec<String>>,
}

impl MockProbe {
    pub fn new(answers: impl IntoIterator<Item = Result<(), ProbeError>>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            urls: Mutex::new(Vec::new()),
        }
    }

    /// Probe that is ready right away
    pub fn ready() -> Self {
        Self::new([Ok(())])
    }

    /// Probe refusing `n` times, then ready
    pub fn refused_then_ready(n: usize) -> Self {
        let mut answers: Vec<_> = (0..n)
            .map(|_| Err(ProbeError::NotReady("connection refused".to_string())))
            .collect();
        answers.push(Ok(()));
        Self::new(answers)
    }

    /// Probe that never comes up
    pub fn always_refused() -> Self {
        Self::new([Err(ProbeError::NotReady("connection refused".to_string()))])
    }

    /// URLs probed so far
    pub fn urls(&self) -> Vec<String> {
        lock(&self.urls).clone()
    }

    pub fn calls(&self) -> usize {
        lock(&self.urls).len()
    }
}

impl ServiceProbe for MockProbe {
    fn probe(&self, url: &str) -> Result<(), ProbeError> {
        lock(&self.urls).push(url.to_string());
        let mut answers = lock(&self.answers);
        if answers.len() > 1 {
            answers.pop_front().unwrap_or(Ok(()))
        } else {
            answers.front().cloned().unwrap_or(Ok(()))
        }
    }
}
