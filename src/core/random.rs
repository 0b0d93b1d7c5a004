//! Injectable source of uniform draws.
//!
//! Sampling decisions and fire delays both go through [`RandomSource`] so tests
//! can script exact sequences.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use rand::Rng;

pub trait RandomSource: Send + Sync {
    /// Uniform draw in `[0, 1)`.
    fn next_f64(&self) -> f64;
}

/// Thread-local RNG from `rand`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::thread_rng().gen_range(0.0..1.0)
    }
}

/// Replays a fixed sequence, cycling when exhausted.
#[derive(Debug)]
pub struct SequenceRandom {
    values: Vec<f64>,
    cursor: Mutex<VecDeque<usize>>,
}

impl SequenceRandom {
    pub fn new(values: impl Into<Vec<f64>>) -> Self {
        let values: Vec<f64> = values.into();
        let cursor = (0..values.len()).collect();
        Self {
            values,
            cursor: Mutex::new(cursor),
        }
    }

    /// Always returns `value`.
    pub fn constant(value: f64) -> Self {
        Self::new(vec![value])
    }
}

impl RandomSource for SequenceRandom {
    fn next_f64(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let index = match cursor.pop_front() {
            Some(index) => index,
            None => {
                cursor.extend(0..self.values.len());
                cursor.pop_front().unwrap_or(0)
            }
        };
        self.values[index]
    }
}
