//! Technical indicators over the spot close history.
//!
//! All functions take closes oldest-first and return `None` when the history
//! is too short.

/// Log return over `lag` bars.
pub fn log_return(closes: &[f64], lag: usize) -> Option<f64> {
    if closes.len() <= lag {
        return None;
    }
    let last = closes[closes.len() - 1];
    let prev = closes[closes.len() - 1 - lag];
    if last <= 0.0 || prev <= 0.0 {
        return None;
    }
    Some((last / prev).ln())
}

/// Simple moving average of the last `period` closes.
pub fn sma(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Population standard deviation of the last `period` closes.
pub fn stddev(closes: &[f64], period: usize) -> Option<f64> {
    let mean = sma(closes, period)?;
    let window = &closes[closes.len() - period..];
    let var = window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / period as f64;
    Some(var.sqrt())
}

/// Per-bar standard deviation of log returns over `period` returns.
pub fn realized_vol(closes: &[f64], period: usize) -> Option<f64> {
    if period < 2 || closes.len() < period + 1 {
        return None;
    }
    let window = &closes[closes.len() - period - 1..];
    let returns: Vec<f64> = window
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .collect();
    if returns.len() < 2 {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    Some(var.sqrt())
}

/// Z-score of the last close against the trailing `period` closes.
pub fn zscore(closes: &[f64], period: usize) -> Option<f64> {
    let mean = sma(closes, period)?;
    let sd = stddev(closes, period)?;
    let last = *closes.last()?;
    if sd <= f64::EPSILON {
        return Some(0.0);
    }
    Some((last - mean) / sd)
}

/// Wilder's RSI.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for w in closes[..=period].windows(2) {
        let change = w[1] - w[0];
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss -= change;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    for w in closes[period..].windows(2) {
        let change = w[1] - w[0];
        let (gain, loss) = if change > 0.0 { (change, 0.0) } else { (0.0, -change) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
    }

    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    let k = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev = values[0];
    for &v in values {
        prev = v * k + prev * (1.0 - k);
        out.push(prev);
    }
    out
}

/// MACD histogram (fast EMA - slow EMA, minus its signal EMA).
pub fn macd_histogram(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<f64> {
    if closes.len() < slow + signal {
        return None;
    }
    let fast_ema = ema_series(closes, fast);
    let slow_ema = ema_series(closes, slow);
    let macd: Vec<f64> = fast_ema.iter().zip(&slow_ema).map(|(f, s)| f - s).collect();
    let signal_line = ema_series(&macd, signal);
    Some(macd.last()? - signal_line.last()?)
}

/// Bollinger %B: position of the last close inside the bands.
pub fn bollinger_pct_b(closes: &[f64], period: usize, width: f64) -> Option<f64> {
    let mean = sma(closes, period)?;
    let sd = stddev(closes, period)?;
    let last = *closes.last()?;
    let band = width * sd;
    if band <= f64::EPSILON {
        return Some(0.5);
    }
    Some((last - (mean - band)) / (2.0 * band))
}
