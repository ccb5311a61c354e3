use crate::error::{EngineError, EngineResult};
use crate::models::{Bar, EnrichedBar, IndicatorSet};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

pub const RSI_PERIOD: usize = 14;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const BOLLINGER_WINDOW: usize = 20;
pub const BOLLINGER_STD: f64 = 2.0;
pub const ATR_WINDOW: usize = 14;
pub const SHORT_MA_WINDOW: usize = 50;
pub const LONG_MA_WINDOW: usize = 200;
pub const SMOOTHING_SPAN: usize = 10;
pub const FIBONACCI_LOOKBACK: usize = 50;
pub const FIBONACCI_RATIOS: [f64; 5] = [0.236, 0.382, 0.5, 0.618, 0.786];
/// Below this many closes the cycle strength is reported as zero.
pub const MIN_CYCLE_POINTS: usize = 11;
/// Shortest bar series `compute_indicator_set` accepts (MACD signal seed).
pub const MIN_INDICATOR_HISTORY: usize = MACD_SLOW + MACD_SIGNAL - 1;

fn ensure_history(actual: usize, required: usize) -> EngineResult<()> {
    if actual < required {
        return Err(EngineError::InsufficientHistory { required, actual });
    }
    Ok(())
}

fn ensure_period(name: &str, period: usize, min: usize) -> EngineResult<()> {
    if period < min {
        return Err(EngineError::Permanent(format!(
            "{} period must be >= {} (value: {})",
            name, min, period
        )));
    }
    Ok(())
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Trailing simple moving average; NaN until `period` values are available.
pub fn calculate_sma(prices: &[f64], period: usize) -> Vec<f64> {
    let mut sma_values = vec![f64::NAN; prices.len()];
    if period == 0 || prices.len() < period {
        return sma_values;
    }

    let mut window_sum: f64 = prices[..period].iter().sum();
    sma_values[period - 1] = window_sum / period as f64;
    for i in period..prices.len() {
        window_sum += prices[i] - prices[i - period];
        sma_values[i] = window_sum / period as f64;
    }

    sma_values
}

/// Bias-corrected exponential average with smoothing factor `2/(span+1)`.
/// Every position is defined, the first equals the first price.
pub fn calculate_ewm(prices: &[f64], span: usize) -> Vec<f64> {
    let alpha = 2.0 / (span as f64 + 1.0);
    let decay = 1.0 - alpha;
    let mut numerator = 0.0;
    let mut denominator = 0.0;

    prices
        .iter()
        .map(|&price| {
            numerator = price + decay * numerator;
            denominator = 1.0 + decay * denominator;
            numerator / denominator
        })
        .collect()
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

/// Wilder RSI. Positions before `period` are 0.0.
pub fn calculate_rsi(prices: &[f64], period: usize) -> EngineResult<Vec<f64>> {
    ensure_period("RSI", period, 1)?;
    ensure_history(prices.len(), period + 1)?;

    let mut rsi_values = vec![0.0; prices.len()];
    let mut sum_gain = 0.0f64;
    let mut sum_loss = 0.0f64;
    for i in 1..=period {
        let delta = prices[i] - prices[i - 1];
        if delta >= 0.0 {
            sum_gain += delta;
        } else {
            sum_loss += -delta;
        }
    }

    let mut avg_gain = sum_gain / period as f64;
    let mut avg_loss = sum_loss / period as f64;
    rsi_values[period] = rsi_from_avgs(avg_gain, avg_loss);

    for i in (period + 1)..prices.len() {
        let delta = prices[i] - prices[i - 1];
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { -delta } else { 0.0 };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        rsi_values[i] = rsi_from_avgs(avg_gain, avg_loss);
    }

    Ok(rsi_values)
}

/// EMA seeded with the simple mean of the first `span` values at index
/// `offset + span - 1`; earlier positions are 0.0.
fn seeded_ema(values: &[f64], span: usize, offset: usize) -> Vec<f64> {
    let mut ema = vec![0.0; values.len()];
    let seed_index = offset + span - 1;
    if seed_index >= values.len() {
        return ema;
    }

    let multiplier = 2.0 / (span as f64 + 1.0);
    ema[seed_index] = mean(&values[offset..=seed_index]);
    for i in (seed_index + 1)..values.len() {
        ema[i] = ema[i - 1] * (1.0 - multiplier) + values[i] * multiplier;
    }
    ema
}

/// MACD line and signal line. The MACD line is 0.0 until the slow EMA is
/// seeded; the signal line until `slow + signal - 2`.
pub fn calculate_macd(
    prices: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> EngineResult<(Vec<f64>, Vec<f64>)> {
    ensure_period("MACD fast", fast_period, 1)?;
    ensure_period("MACD signal", signal_period, 1)?;
    if slow_period <= fast_period {
        return Err(EngineError::Permanent(format!(
            "MACD slow period ({}) must exceed fast period ({})",
            slow_period, fast_period
        )));
    }
    ensure_history(prices.len(), slow_period + signal_period - 1)?;

    let fast_ema = seeded_ema(prices, fast_period, 0);
    let slow_ema = seeded_ema(prices, slow_period, 0);

    let slow_start = slow_period - 1;
    let mut macd_line = vec![0.0; prices.len()];
    for i in slow_start..prices.len() {
        macd_line[i] = fast_ema[i] - slow_ema[i];
    }

    let signal_line = seeded_ema(&macd_line, signal_period, slow_start);
    Ok((macd_line, signal_line))
}

#[derive(Debug, Clone, PartialEq)]
pub struct BollingerBands {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

/// Rolling mean +/- `std_dev` population standard deviations.
pub fn calculate_bollinger_bands(
    prices: &[f64],
    period: usize,
    std_dev: f64,
) -> EngineResult<BollingerBands> {
    ensure_period("Bollinger", period, 1)?;
    ensure_history(prices.len(), period)?;

    let mut upper = vec![0.0; prices.len()];
    let mut middle = vec![0.0; prices.len()];
    let mut lower = vec![0.0; prices.len()];

    for i in (period - 1)..prices.len() {
        let slice = &prices[i + 1 - period..=i];
        let window_mean = mean(slice);
        let variance = slice
            .iter()
            .map(|&val| (val - window_mean).powi(2))
            .sum::<f64>()
            / period as f64;
        let standard_deviation = variance.sqrt();

        middle[i] = window_mean;
        upper[i] = window_mean + std_dev * standard_deviation;
        lower[i] = window_mean - std_dev * standard_deviation;
    }

    Ok(BollingerBands {
        upper,
        middle,
        lower,
    })
}

/// Wilder ATR aligned to bar indices. Seeded at `period - 1` with the mean of
/// the true ranges at indices `1..period`; earlier positions are 0.0.
pub fn calculate_atr(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    period: usize,
) -> EngineResult<Vec<f64>> {
    ensure_period("ATR", period, 2)?;
    if highs.len() != closes.len() || lows.len() != closes.len() {
        return Err(EngineError::Permanent(format!(
            "ATR inputs differ in length (high {}, low {}, close {})",
            highs.len(),
            lows.len(),
            closes.len()
        )));
    }
    ensure_history(closes.len(), period)?;

    let mut true_ranges = vec![0.0; closes.len()];
    for i in 1..closes.len() {
        true_ranges[i] = (highs[i] - lows[i])
            .max((highs[i] - closes[i - 1]).abs())
            .max((lows[i] - closes[i - 1]).abs());
    }

    let mut atr = vec![0.0; closes.len()];
    atr[period - 1] = mean(&true_ranges[1..period]);
    for i in period..closes.len() {
        atr[i] = (atr[i - 1] * (period as f64 - 1.0) + true_ranges[i]) / period as f64;
    }

    Ok(atr)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FibonacciLevels {
    pub level_236: f64,
    pub level_382: f64,
    pub level_500: f64,
    pub level_618: f64,
    pub level_786: f64,
}

impl FibonacciLevels {
    pub fn as_array(&self) -> [f64; 5] {
        [
            self.level_236,
            self.level_382,
            self.level_500,
            self.level_618,
            self.level_786,
        ]
    }
}

pub fn fibonacci_retracement(high: f64, low: f64) -> FibonacciLevels {
    let diff = high - low;
    let level = |ratio: f64| high - diff * ratio;
    FibonacciLevels {
        level_236: level(FIBONACCI_RATIOS[0]),
        level_382: level(FIBONACCI_RATIOS[1]),
        level_500: level(FIBONACCI_RATIOS[2]),
        level_618: level(FIBONACCI_RATIOS[3]),
        level_786: level(FIBONACCI_RATIOS[4]),
    }
}

/// Largest DFT magnitude among the non-zero, non-mirrored frequencies.
pub fn cycle_strength(closes: &[f64]) -> f64 {
    if closes.len() < MIN_CYCLE_POINTS {
        return 0.0;
    }

    let mut spectrum: Vec<Complex<f64>> =
        closes.iter().map(|&close| Complex::new(close, 0.0)).collect();
    let mut planner = FftPlanner::<f64>::new();
    planner.plan_fft_forward(spectrum.len()).process(&mut spectrum);

    spectrum[1..closes.len() / 2]
        .iter()
        .map(|value| value.norm())
        .fold(0.0, f64::max)
}

/// Replaces non-finite values with the nearest earlier finite value, and any
/// leading gap with 0.0.
pub fn forward_fill_then_zero(values: &mut [f64]) {
    let mut last_valid: Option<f64> = None;
    for value in values.iter_mut() {
        if value.is_finite() {
            last_valid = Some(*value);
        } else {
            *value = last_valid.unwrap_or(0.0);
        }
    }
}

/// Enriches every bar with the indicator panel.
///
/// Per-bar indicators only look backwards. The Fibonacci level and the cycle
/// strength are computed once from the whole slice, so callers must pass
/// only bars available at decision time.
pub fn compute_indicator_set(bars: &[Bar]) -> EngineResult<Vec<EnrichedBar>> {
    ensure_history(bars.len(), MIN_INDICATOR_HISTORY)?;

    let closes: Vec<f64> = bars.iter().map(|bar| bar.close).collect();
    let highs: Vec<f64> = bars.iter().map(|bar| bar.high).collect();
    let lows: Vec<f64> = bars.iter().map(|bar| bar.low).collect();

    let mut ma_50 = calculate_sma(&closes, SHORT_MA_WINDOW);
    let mut ma_200 = calculate_sma(&closes, LONG_MA_WINDOW);
    let mut rsi = calculate_rsi(&closes, RSI_PERIOD)?;
    let (mut macd, mut macd_signal) =
        calculate_macd(&closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL)?;
    let BollingerBands {
        mut upper,
        mut middle,
        mut lower,
    } = calculate_bollinger_bands(&closes, BOLLINGER_WINDOW, BOLLINGER_STD)?;
    let mut atr = calculate_atr(&highs, &lows, &closes, ATR_WINDOW)?;
    let mut kalman_filter = calculate_ewm(&closes, SMOOTHING_SPAN);

    let fib_0618 = if bars.len() >= FIBONACCI_LOOKBACK {
        let recent = &bars[bars.len() - FIBONACCI_LOOKBACK..];
        let recent_high = recent.iter().map(|bar| bar.high).fold(f64::MIN, f64::max);
        let recent_low = recent.iter().map(|bar| bar.low).fold(f64::MAX, f64::min);
        fibonacci_retracement(recent_high, recent_low).level_618
    } else {
        f64::NAN
    };
    let mut fib_column = vec![fib_0618; bars.len()];
    let cycle = cycle_strength(&closes);

    for column in [
        &mut ma_50,
        &mut ma_200,
        &mut rsi,
        &mut macd,
        &mut macd_signal,
        &mut upper,
        &mut middle,
        &mut lower,
        &mut atr,
        &mut kalman_filter,
        &mut fib_column,
    ] {
        forward_fill_then_zero(column);
    }
    let cycle = if cycle.is_finite() { cycle } else { 0.0 };

    Ok(bars
        .iter()
        .enumerate()
        .map(|(i, bar)| EnrichedBar {
            bar: bar.clone(),
            indicators: IndicatorSet {
                ma_50: ma_50[i],
                ma_200: ma_200[i],
                rsi: rsi[i],
                macd: macd[i],
                macd_signal: macd_signal[i],
                upper_band: upper[i],
                middle_band: middle[i],
                lower_band: lower[i],
                atr: atr[i],
                kalman_filter: kalman_filter[i],
                fib_0618: fib_column[i],
                cycle_strength: cycle,
            },
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn wave(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 + 5.0 * (i as f64 * 0.37).sin() + 2.0 * (i as f64 * 1.3).cos())
            .collect()
    }

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                timestamp: start + Duration::days(i as i64),
                open: close - 0.5,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 1_000.0 + i as f64,
            })
            .collect()
    }

    #[test]
    fn rsi_stays_within_bounds() {
        let prices = wave(300);
        let rsi = calculate_rsi(&prices, RSI_PERIOD).unwrap();
        assert_eq!(rsi.len(), prices.len());
        assert!(rsi[..RSI_PERIOD].iter().all(|&v| v == 0.0));
        assert!(rsi.iter().all(|&v| (0.0..=100.0).contains(&v)));
        assert!(rsi[RSI_PERIOD..].iter().any(|&v| v > 0.0 && v < 100.0));
    }

    #[test]
    fn rsi_saturates_without_losses() {
        let prices: Vec<f64> = (0..40).map(|i| 50.0 + i as f64).collect();
        let rsi = calculate_rsi(&prices, RSI_PERIOD).unwrap();
        assert!(rsi[RSI_PERIOD..].iter().all(|&v| v == 100.0));

        let flat = vec![42.0; 30];
        let rsi = calculate_rsi(&flat, RSI_PERIOD).unwrap();
        assert!(rsi[RSI_PERIOD..].iter().all(|&v| v == 100.0));
    }

    #[test]
    fn rsi_matches_hand_computed_seed() {
        let mut prices = vec![100.0];
        for i in 0..20 {
            let last = *prices.last().unwrap();
            prices.push(if i % 2 == 0 { last + 2.0 } else { last - 1.0 });
        }
        let period = 4;
        let rsi = calculate_rsi(&prices, period).unwrap();
        // First four deltas: +2, -1, +2, -1.
        let avg_gain = 4.0 / 4.0;
        let avg_loss = 2.0 / 4.0;
        let expected_seed = 100.0 - 100.0 / (1.0 + avg_gain / avg_loss);
        assert!((rsi[period] - expected_seed).abs() < 1e-12);
        // Next delta is +2.
        let avg_gain = (avg_gain * 3.0 + 2.0) / 4.0;
        let avg_loss = (avg_loss * 3.0) / 4.0;
        let expected_next = 100.0 - 100.0 / (1.0 + avg_gain / avg_loss);
        assert!((rsi[period + 1] - expected_next).abs() < 1e-12);
    }

    #[test]
    fn rsi_rejects_short_history() {
        let err = calculate_rsi(&[1.0; 14], RSI_PERIOD).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientHistory {
                required: 15,
                actual: 14
            }
        ));
    }

    #[test]
    fn macd_and_signal_converge_on_constant_series() {
        let prices = vec![73.5; 120];
        let (macd, signal) = calculate_macd(&prices, MACD_FAST, MACD_SLOW, MACD_SIGNAL).unwrap();
        let start = MACD_SLOW + MACD_SIGNAL - 2;
        for i in start..prices.len() {
            assert!(macd[i].abs() < 1e-9);
            assert!((macd[i] - signal[i]).abs() < 1e-9);
        }
    }

    #[test]
    fn macd_signal_is_seeded_with_mean_of_first_signal_window() {
        let prices = wave(80);
        let (macd, signal) = calculate_macd(&prices, MACD_FAST, MACD_SLOW, MACD_SIGNAL).unwrap();
        assert!(macd[..MACD_SLOW - 1].iter().all(|&v| v == 0.0));
        let seed_index = MACD_SLOW + MACD_SIGNAL - 2;
        let expected = macd[MACD_SLOW - 1..=seed_index].iter().sum::<f64>() / MACD_SIGNAL as f64;
        assert!((signal[seed_index] - expected).abs() < 1e-12);
        assert!(signal[..seed_index].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn macd_requires_signal_seed_history() {
        let err = calculate_macd(&wave(33), MACD_FAST, MACD_SLOW, MACD_SIGNAL).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientHistory {
                required: 34,
                actual: 33
            }
        ));
    }

    #[test]
    fn bollinger_width_is_non_negative() {
        let prices = wave(100);
        let bands = calculate_bollinger_bands(&prices, BOLLINGER_WINDOW, BOLLINGER_STD).unwrap();
        for i in 0..prices.len() {
            assert!(bands.upper[i] - bands.lower[i] >= 0.0);
        }

        let flat = vec![10.0; 25];
        let bands = calculate_bollinger_bands(&flat, BOLLINGER_WINDOW, BOLLINGER_STD).unwrap();
        assert_eq!(bands.upper[24], 10.0);
        assert_eq!(bands.lower[24], 10.0);
        assert_eq!(bands.middle[24], 10.0);
    }

    #[test]
    fn bollinger_uses_population_deviation() {
        let prices = [1.0, 2.0, 3.0, 4.0];
        let bands = calculate_bollinger_bands(&prices, 4, 2.0).unwrap();
        let std = (1.25f64).sqrt();
        assert!((bands.middle[3] - 2.5).abs() < 1e-12);
        assert!((bands.upper[3] - (2.5 + 2.0 * std)).abs() < 1e-12);
        assert!((bands.lower[3] - (2.5 - 2.0 * std)).abs() < 1e-12);
    }

    #[test]
    fn atr_is_non_negative_and_tracks_constant_range() {
        let closes = vec![20.0; 40];
        let highs = vec![21.0; 40];
        let lows = vec![19.0; 40];
        let atr = calculate_atr(&highs, &lows, &closes, ATR_WINDOW).unwrap();
        assert!(atr[..ATR_WINDOW - 1].iter().all(|&v| v == 0.0));
        for value in &atr[ATR_WINDOW - 1..] {
            assert!((value - 2.0).abs() < 1e-12);
        }

        let closes = wave(120);
        let highs: Vec<f64> = closes.iter().map(|c| c + 1.5).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.7).collect();
        let atr = calculate_atr(&highs, &lows, &closes, ATR_WINDOW).unwrap();
        assert!(atr.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn fibonacci_levels_use_standard_ratios() {
        let levels = fibonacci_retracement(200.0, 100.0);
        let expected = [176.4, 161.8, 150.0, 138.2, 121.4];
        for (actual, expected) in levels.as_array().iter().zip(expected) {
            assert!((actual - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn cycle_strength_is_zero_below_minimum_points() {
        let closes: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        assert_eq!(cycle_strength(&closes), 0.0);
    }

    #[test]
    fn cycle_strength_finds_dominant_frequency() {
        let n = 64;
        let closes: Vec<f64> = (0..n)
            .map(|i| 100.0 + (2.0 * std::f64::consts::PI * 8.0 * i as f64 / n as f64).sin())
            .collect();
        // A unit sinusoid on bin 8 has magnitude n/2; the DC term is excluded.
        assert!((cycle_strength(&closes) - 32.0).abs() < 1e-6);
    }

    #[test]
    fn forward_fill_then_zero_fills_gaps() {
        let mut values = vec![f64::NAN, f64::NAN, 3.0, f64::NAN, 5.0, f64::INFINITY];
        forward_fill_then_zero(&mut values);
        assert_eq!(values, vec![0.0, 0.0, 3.0, 3.0, 5.0, 5.0]);
    }

    #[test]
    fn ewm_starts_at_first_price_and_is_bias_corrected() {
        let ewm = calculate_ewm(&[10.0, 20.0], SMOOTHING_SPAN);
        let alpha = 2.0 / 11.0;
        assert_eq!(ewm[0], 10.0);
        let expected = (20.0 + (1.0 - alpha) * 10.0) / (1.0 + (1.0 - alpha));
        assert!((ewm[1] - expected).abs() < 1e-12);
    }

    #[test]
    fn indicator_set_is_deterministic_and_fully_defined() {
        let bars = bars_from_closes(&wave(250));
        let first = compute_indicator_set(&bars).unwrap();
        let second = compute_indicator_set(&bars).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), bars.len());

        for enriched in &first {
            let set = enriched.indicators;
            for value in [
                set.ma_50,
                set.ma_200,
                set.rsi,
                set.macd,
                set.macd_signal,
                set.upper_band,
                set.middle_band,
                set.lower_band,
                set.atr,
                set.kalman_filter,
                set.fib_0618,
                set.cycle_strength,
            ] {
                assert!(value.is_finite());
            }
        }
        assert_eq!(first[48].indicators.ma_50, 0.0);
        assert!(first[49].indicators.ma_50 > 0.0);
        assert_eq!(first[198].indicators.ma_200, 0.0);
        assert!(first[199].indicators.ma_200 > 0.0);
    }

    #[test]
    fn indicator_set_fib_level_needs_full_lookback() {
        let bars = bars_from_closes(&wave(40));
        let enriched = compute_indicator_set(&bars).unwrap();
        assert!(enriched.iter().all(|e| e.indicators.fib_0618 == 0.0));

        let bars = bars_from_closes(&wave(60));
        let enriched = compute_indicator_set(&bars).unwrap();
        let recent = &bars[10..];
        let high = recent.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let low = recent.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        let expected = high - (high - low) * 0.618;
        assert!(enriched
            .iter()
            .all(|e| (e.indicators.fib_0618 - expected).abs() < 1e-12));
    }

    #[test]
    fn indicator_set_rejects_short_history() {
        let bars = bars_from_closes(&wave(MIN_INDICATOR_HISTORY - 1));
        assert!(matches!(
            compute_indicator_set(&bars),
            Err(EngineError::InsufficientHistory { .. })
        ));
    }
}
