// ===============================
// src/indicators.rs
// ===============================
//
// Chunked EMA + rolling stddev over the whole price tape.
// Consumer asks for the next chunk only when its tick index runs past the
// current one; the recurrence state (last ema, running sums) is carried
// across chunk boundaries so chunk length never changes the numbers.
//
use thiserror::Error;

use crate::numeric::{calc_ema, nan_to_0};

pub const DEFAULT_CHUNK_LEN: usize = 65_536;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndicatorError {
    #[error("insufficient data: {ticks} ticks, need more than ema span {span}")]
    InsufficientData { ticks: usize, span: usize },
    #[error("ema span must be at least 1")]
    ZeroSpan,
}

/// A contiguous batch of indicator values starting at tick `start`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorChunk {
    pub start: usize,
    pub ema: Vec<f64>,
    pub std: Vec<f64>,
    /// std / ema, non-finite -> 0.0
    pub volatility: Vec<f64>,
}

impl IndicatorChunk {
    /// One past the last tick index covered.
    pub fn end(&self) -> usize { self.start + self.ema.len() }
    pub fn contains(&self, tick_index: usize) -> bool {
        tick_index >= self.start && tick_index < self.end()
    }
    /// (ema, volatility) at a global tick index.
    pub fn at(&self, tick_index: usize) -> Option<(f64, f64)> {
        if !self.contains(tick_index) { return None; }
        let i = tick_index - self.start;
        Some((self.ema[i], self.volatility[i]))
    }
}

/// Forward-only cursor. Restart = build a new one.
pub struct IndicatorStream<'a> {
    prices: &'a [f64],
    span: usize,
    chunk_len: usize,
    alpha: f64,
    alpha_: f64,
    cursor: usize,
    prev_ema: f64,
    sum: f64,
    sum_sq: f64,
}

impl<'a> IndicatorStream<'a> {
    pub fn new(prices: &'a [f64], span: usize, chunk_len: usize) -> Result<Self, IndicatorError> {
        if span == 0 {
            return Err(IndicatorError::ZeroSpan);
        }
        if prices.len() <= span {
            return Err(IndicatorError::InsufficientData { ticks: prices.len(), span });
        }
        let alpha = 2.0 / (span as f64 + 1.0);
        Ok(Self {
            prices,
            span,
            chunk_len: chunk_len.max(span),
            alpha,
            alpha_: 1.0 - alpha,
            cursor: 0,
            prev_ema: prices[0],
            sum: 0.0,
            sum_sq: 0.0,
        })
    }

    pub fn chunk_len(&self) -> usize { self.chunk_len }

    pub fn next_chunk(&mut self) -> Option<IndicatorChunk> {
        if self.cursor >= self.prices.len() {
            return None;
        }
        let start = self.cursor;
        let end = (start + self.chunk_len).min(self.prices.len());
        let n = end - start;
        let span_f = self.span as f64;

        let mut ema = Vec::with_capacity(n);
        let mut std = Vec::with_capacity(n);
        for i in start..end {
            let p = self.prices[i];
            let e = if i == 0 { p } else { calc_ema(self.alpha, self.alpha_, self.prev_ema, p) };
            self.prev_ema = e;
            ema.push(e);

            self.sum += p;
            self.sum_sq += p * p;
            if i >= self.span {
                let old = self.prices[i - self.span];
                self.sum -= old;
                self.sum_sq -= old * old;
                let mean = self.sum / span_f;
                std.push((self.sum_sq / span_f - mean * mean).max(0.0).sqrt());
            } else {
                std.push(0.0);
            }
        }
        let volatility = std.iter().zip(&ema).map(|(s, e)| nan_to_0(s / e)).collect();

        let chunk = IndicatorChunk { start, ema, std, volatility };
        self.cursor = end;
        Some(chunk)
    }
}

impl Iterator for IndicatorStream<'_> {
    type Item = IndicatorChunk;
    fn next(&mut self) -> Option<Self::Item> { self.next_chunk() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_tape() {
        let prices = [1.0, 2.0, 3.0];
        assert_eq!(
            IndicatorStream::new(&prices, 3, 16).err(),
            Some(IndicatorError::InsufficientData { ticks: 3, span: 3 })
        );
        assert!(IndicatorStream::new(&prices, 2, 16).is_ok());
        assert_eq!(IndicatorStream::new(&prices, 0, 16).err(), Some(IndicatorError::ZeroSpan));
    }

    #[test]
    fn ema_follows_recurrence() {
        let prices = [10.0, 11.0, 12.0, 11.0, 13.0];
        let mut s = IndicatorStream::new(&prices, 3, 64).unwrap();
        let c = s.next_chunk().unwrap();
        assert!(s.next_chunk().is_none());
        let alpha = 0.5;
        let mut e = 10.0;
        assert_eq!(c.ema[0], e);
        for i in 1..prices.len() {
            e = e * (1.0 - alpha) + prices[i] * alpha;
            assert_eq!(c.ema[i], e);
        }
    }

    #[test]
    fn rolling_std_population() {
        let prices = [1.0, 2.0, 3.0, 4.0, 5.0];
        let c = IndicatorStream::new(&prices, 2, 64).unwrap().next_chunk().unwrap();
        assert_eq!(c.std[0], 0.0);
        assert_eq!(c.std[1], 0.0);
        assert_eq!(c.std[2], 0.5);
        assert_eq!(c.std[4], 0.5);
    }

    #[test]
    fn chunking_does_not_change_values() {
        let prices: Vec<f64> = (0..1000).map(|i| 100.0 + ((i * 37) % 17) as f64 * 0.25).collect();
        let whole = IndicatorStream::new(&prices, 20, 4096).unwrap().next_chunk().unwrap();
        let chunks: Vec<IndicatorChunk> = IndicatorStream::new(&prices, 20, 64).unwrap().collect();
        assert_eq!(chunks.len(), 16);
        assert_eq!(chunks[1].start, 64);
        assert_eq!(chunks.last().unwrap().end(), 1000);
        for c in &chunks {
            for i in c.start..c.end() {
                assert_eq!(c.at(i), whole.at(i), "tick {i}");
            }
        }
    }

    #[test]
    fn chunk_len_at_least_span() {
        let prices = vec![1.0; 100];
        let s = IndicatorStream::new(&prices, 30, 8).unwrap();
        assert_eq!(s.chunk_len(), 30);
    }

    #[test]
    fn flat_tape_has_zero_volatility() {
        let prices = vec![42.0; 50];
        let c = IndicatorStream::new(&prices, 10, 64).unwrap().next_chunk().unwrap();
        assert!(c.volatility.iter().all(|v| *v == 0.0));
        assert!(c.ema.iter().all(|e| (e - 42.0).abs() < 1e-9));
    }
}
