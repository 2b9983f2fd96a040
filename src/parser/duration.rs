//! Duration literals as printed by Go services (`1.2ms`, `350µs`, `1m2.5s`)

use std::time::Duration;

const NANOS_PER_UNIT: &[(&str, u128)] = &[
    ("ns", 1),
    ("us", 1_000),
    ("\u{b5}s", 1_000),
    ("\u{3bc}s", 1_000),
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60_000_000_000),
    ("h", 3_600_000_000_000),
];

/// Parse a duration literal: one or more `<decimal><unit>` components, or a bare `0`.
/// Negative durations are rejected.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let mut s = input.strip_prefix('+').unwrap_or(input);
    if s.is_empty() || s.starts_with('-') {
        return None;
    }
    if s == "0" {
        return Some(Duration::ZERO);
    }

    let mut total: u128 = 0;
    while !s.is_empty() {
        let int_len = s.bytes().take_while(u8::is_ascii_digit).count();
        let (int_part, rest) = s.split_at(int_len);
        let (frac_part, rest) = match rest.strip_prefix('.') {
            Some(after_dot) => {
                let frac_len = after_dot.bytes().take_while(u8::is_ascii_digit).count();
                after_dot.split_at(frac_len)
            }
            None => ("", rest),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return None;
        }

        let unit_len = rest
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit() || *c == '.')
            .map_or(rest.len(), |(i, _)| i);
        let (unit, rest) = rest.split_at(unit_len);
        let scale = NANOS_PER_UNIT.iter().find(|(name, _)| *name == unit)?.1;

        let whole: u128 = if int_part.is_empty() { 0 } else { int_part.parse().ok()? };
        total = total.checked_add(whole.checked_mul(scale)?)?;
        total = total.checked_add(fraction_nanos(frac_part, scale))?;
        s = rest;
    }

    let secs = u64::try_from(total / 1_000_000_000).ok()?;
    Some(Duration::new(secs, (total % 1_000_000_000) as u32))
}

/// `0.<digits>` of `scale` nanoseconds, truncated
fn fraction_nanos(digits: &str, scale: u128) -> u128 {
    let mut value: u128 = 0;
    let mut divisor: u128 = 1;
    // Digits beyond nanosecond resolution of an hour contribute nothing
    for b in digits.bytes().take(18) {
        value = value * 10 + u128::from(b - b'0');
        divisor *= 10;
    }
    value * scale / divisor
}

/// Latency field: a duration literal, or a bare integer meaning microseconds
pub fn parse_latency(input: &str) -> Option<Duration> {
    if !input.is_empty() && input.bytes().all(|b| b.is_ascii_digit()) {
        return input.parse::<u64>().ok().map(Duration::from_micros);
    }
    parse_duration(input)
}
