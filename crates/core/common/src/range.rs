//! Selections over the ordering dimension.
//!
//! A [`RangeSelector`] is what the caller asks for: block spans that may reference the chain
//! head, or an explicit list of transaction hashes. It is resolved into a [`ResolvedRange`]
//! exactly once, and everything downstream works on the resolved form only.
//!
//! ## Block selector grammar
//!
//! A selector is a whitespace separated list of tokens; the selection is their union.
//!
//! | Token | Units |
//! |-------|-------|
//! | `N` | `[N, N+1)` |
//! | `start:end` | `[start, end)` |
//! | `start:` / `start:latest` | `[start, latest]` |
//! | `:end` | `[0, end)` |
//! | `:` | `[0, latest]` |
//! | `start:+N` | `[start, start+N)` |
//! | `-N:end` | `[end-N, end)` |
//! | `start:end:step` | every `step`-th unit of `[start, end)` |
//! | `start:end/count` | `count` evenly spaced units of `[start, end)`, both extremes included |
//!
//! Numbers accept `_` separators and the `K`, `M` and `B` suffixes (`1.5M` is `1_500_000`).

use std::{collections::HashSet, ops::Range};

use alloy::primitives::B256;

use crate::BlockNum;

/// The caller's selection over either ordering domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeSelector {
    Blocks(BlockSelector),
    Transactions(TxSelector),
}

impl RangeSelector {
    /// Whether resolving this selector requires reading the chain head.
    pub fn needs_latest(&self) -> bool {
        match self {
            RangeSelector::Blocks(selector) => selector.needs_latest(),
            RangeSelector::Transactions(_) => false,
        }
    }

    pub fn is_transactions(&self) -> bool {
        matches!(self, RangeSelector::Transactions(_))
    }
}

impl std::fmt::Display for RangeSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RangeSelector::Blocks(selector) => selector.fmt(f),
            RangeSelector::Transactions(selector) => selector.fmt(f),
        }
    }
}

/// A union of block spans, as parsed from a selector string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSelector(Vec<BlockSpan>);

impl BlockSelector {
    pub fn spans(&self) -> &[BlockSpan] {
        &self.0
    }

    pub fn needs_latest(&self) -> bool {
        self.0.iter().any(BlockSpan::needs_latest)
    }

    /// Resolves every span into concrete units.
    ///
    /// `latest` is the chain head and is only read by spans that reference it.
    pub fn resolve(&self, latest: BlockNum) -> BlockSet {
        BlockSet::from_intervals(self.0.iter().flat_map(|span| span.units(latest)))
    }
}

impl std::str::FromStr for BlockSelector {
    type Err = RangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let spans = s
            .split_whitespace()
            .map(BlockSpan::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if spans.is_empty() {
            return Err(RangeParseError::Empty);
        }
        Ok(BlockSelector(spans))
    }
}

impl std::fmt::Display for BlockSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, span) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            span.fmt(f)?;
        }
        Ok(())
    }
}

impl serde::Serialize for BlockSelector {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for BlockSelector {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Start of a block span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStart {
    Number(BlockNum),
    /// The chain head at resolution time
    Latest,
    /// `N` units before the span's end (`-N:end`)
    Before(u64),
}

/// Exclusive end of a block span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanEnd {
    Number(BlockNum),
    /// One past the chain head, so the head block is included
    Latest,
    /// `N` units after the span's start (`start:+N`)
    After(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sampling {
    #[default]
    All,
    Step(u64),
    Count(u64),
}

/// One token of a block selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub start: SpanStart,
    pub end: SpanEnd,
    pub sampling: Sampling,
}

impl BlockSpan {
    pub fn needs_latest(&self) -> bool {
        matches!(self.start, SpanStart::Latest) || matches!(self.end, SpanEnd::Latest)
    }

    fn parse(token: &str) -> Result<Self, RangeParseError> {
        let Some((start, rest)) = token.split_once(':') else {
            let start = match token {
                "latest" => SpanStart::Latest,
                number => SpanStart::Number(parse_number(number)?),
            };
            let end = match start {
                SpanStart::Number(n) => SpanEnd::Number(n.saturating_add(1)),
                _ => SpanEnd::Latest,
            };
            return Ok(BlockSpan {
                start,
                end,
                sampling: Sampling::All,
            });
        };

        let (end, sampling) = if let Some((end, step)) = rest.split_once(':') {
            match parse_number(step)? {
                0 => return Err(RangeParseError::ZeroStep(token.to_string())),
                step => (end, Sampling::Step(step)),
            }
        } else if let Some((end, count)) = rest.split_once('/') {
            match parse_number(count)? {
                0 => return Err(RangeParseError::ZeroCount(token.to_string())),
                count => (end, Sampling::Count(count)),
            }
        } else {
            (rest, Sampling::All)
        };

        let start = match start {
            "" => SpanStart::Number(0),
            "latest" => SpanStart::Latest,
            s => match s.strip_prefix('-') {
                Some(len) => SpanStart::Before(parse_number(len)?),
                None => SpanStart::Number(parse_number(s)?),
            },
        };
        let end = match end {
            "" | "latest" => SpanEnd::Latest,
            s => match s.strip_prefix('+') {
                Some(len) => SpanEnd::After(parse_number(len)?),
                None => SpanEnd::Number(parse_number(s)?),
            },
        };

        match (start, end) {
            (SpanStart::Before(_), SpanEnd::After(_)) => {
                return Err(RangeParseError::BothRelative(token.to_string()));
            }
            (SpanStart::Before(len), SpanEnd::Number(end)) if len > end => {
                return Err(RangeParseError::TrailingExceedsEnd { len, end });
            }
            (SpanStart::Number(start), SpanEnd::Number(end)) if start > end => {
                return Err(RangeParseError::InvertedRange { start, end });
            }
            _ => {}
        }

        Ok(BlockSpan {
            start,
            end,
            sampling,
        })
    }

    /// Concrete `[start, end)` bounds of this span. Inverted bounds collapse to an empty range.
    fn bounds(&self, latest: BlockNum) -> Range<BlockNum> {
        let start = match self.start {
            SpanStart::Number(n) => Some(n),
            SpanStart::Latest => Some(latest),
            SpanStart::Before(_) => None,
        };
        let end = match self.end {
            SpanEnd::Number(n) => n,
            SpanEnd::Latest => latest.saturating_add(1),
            SpanEnd::After(len) => start.unwrap_or_default().saturating_add(len),
        };
        let start = match self.start {
            SpanStart::Before(len) => end.saturating_sub(len),
            _ => start.unwrap_or_default(),
        };
        start..end.max(start)
    }

    fn units(&self, latest: BlockNum) -> Vec<Range<BlockNum>> {
        let Range { start, end } = self.bounds(latest);
        let len = end - start;
        if len == 0 {
            return vec![];
        }
        match self.sampling {
            Sampling::All | Sampling::Step(1) => vec![start..end],
            Sampling::Step(step) => {
                let step = usize::try_from(step).unwrap_or(usize::MAX);
                (start..end).step_by(step).map(|n| n..n + 1).collect()
            }
            Sampling::Count(count) if count >= len => vec![start..end],
            Sampling::Count(1) => vec![start..start + 1],
            Sampling::Count(count) => {
                let span = u128::from(len - 1);
                let gaps = u128::from(count - 1);
                let mut units: Vec<Range<BlockNum>> = Vec::with_capacity(count as usize);
                for i in 0..u128::from(count) {
                    // Offsets never exceed `len - 1`, so the narrowing is lossless.
                    let n = start + (i * span / gaps) as u64;
                    if units.last().is_none_or(|last| last.start != n) {
                        units.push(n..n + 1);
                    }
                }
                units
            }
        }
    }
}

impl std::fmt::Display for BlockSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let (SpanStart::Number(start), SpanEnd::Number(end), Sampling::All) =
            (self.start, self.end, self.sampling)
            && end == start.saturating_add(1)
        {
            return write!(f, "{start}");
        }
        match self.start {
            SpanStart::Number(n) => write!(f, "{n}")?,
            SpanStart::Latest => f.write_str("latest")?,
            SpanStart::Before(n) => write!(f, "-{n}")?,
        }
        f.write_str(":")?;
        match self.end {
            SpanEnd::Number(n) => write!(f, "{n}")?,
            SpanEnd::Latest => f.write_str("latest")?,
            SpanEnd::After(n) => write!(f, "+{n}")?,
        }
        match self.sampling {
            Sampling::All => Ok(()),
            Sampling::Step(step) => write!(f, ":{step}"),
            Sampling::Count(count) => write!(f, "/{count}"),
        }
    }
}

/// An ordered, deduplicated list of transaction hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSelector(Vec<B256>);

impl TxSelector {
    pub fn new(hashes: impl IntoIterator<Item = B256>) -> Result<Self, RangeParseError> {
        let mut seen = HashSet::new();
        let hashes: Vec<B256> = hashes.into_iter().filter(|h| seen.insert(*h)).collect();
        if hashes.is_empty() {
            return Err(RangeParseError::Empty);
        }
        Ok(TxSelector(hashes))
    }

    pub fn hashes(&self) -> &[B256] {
        &self.0
    }
}

impl std::str::FromStr for TxSelector {
    type Err = RangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hashes = s
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|token| !token.is_empty())
            .map(|token| {
                if !token.starts_with("0x") {
                    return Err(RangeParseError::InvalidTransactionHash(token.to_string()));
                }
                token
                    .parse::<B256>()
                    .map_err(|_| RangeParseError::InvalidTransactionHash(token.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        TxSelector::new(hashes)
    }
}

impl std::fmt::Display for TxSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, hash) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{hash}")?;
        }
        Ok(())
    }
}

impl serde::Serialize for TxSelector {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_seq(self.0.iter())
    }
}

impl<'de> serde::Deserialize<'de> for TxSelector {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hashes = Vec::<B256>::deserialize(deserializer)?;
        TxSelector::new(hashes).map_err(serde::de::Error::custom)
    }
}

/// A selection whose open bounds have been fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedRange {
    Blocks(BlockSet),
    Transactions(Vec<B256>),
}

impl ResolvedRange {
    pub fn n_units(&self) -> u64 {
        match self {
            ResolvedRange::Blocks(set) => set.n_units(),
            ResolvedRange::Transactions(hashes) => hashes.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.n_units() == 0
    }
}

/// Sorted, disjoint, non-adjacent block intervals.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockSet(Vec<Range<BlockNum>>);

impl BlockSet {
    /// Normalizes arbitrary intervals: empty ones are dropped, overlapping and adjacent ones
    /// are merged.
    pub fn from_intervals(intervals: impl IntoIterator<Item = Range<BlockNum>>) -> Self {
        let mut intervals: Vec<_> = intervals.into_iter().filter(|r| r.start < r.end).collect();
        intervals.sort_by_key(|r| r.start);

        let mut merged: Vec<Range<BlockNum>> = Vec::with_capacity(intervals.len());
        for interval in intervals {
            match merged.last_mut() {
                Some(last) if interval.start <= last.end => last.end = last.end.max(interval.end),
                _ => merged.push(interval),
            }
        }
        BlockSet(merged)
    }

    pub fn intervals(&self) -> &[Range<BlockNum>] {
        &self.0
    }

    pub fn n_units(&self) -> u64 {
        self.0.iter().map(|r| r.end - r.start).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keeps only the units strictly below `cap`.
    pub fn truncate(&self, cap: BlockNum) -> BlockSet {
        BlockSet(
            self.0
                .iter()
                .filter(|r| r.start < cap)
                .map(|r| r.start..r.end.min(cap))
                .collect(),
        )
    }
}

fn parse_number(s: &str) -> Result<u64, RangeParseError> {
    let cleaned = s.replace('_', "");
    let invalid = || RangeParseError::InvalidNumber(s.to_string());

    let multiplier = match cleaned.chars().last() {
        Some('K' | 'k') => 1e3,
        Some('M' | 'm') => 1e6,
        Some('B' | 'b') => 1e9,
        Some(_) => return cleaned.parse::<u64>().map_err(|_| invalid()),
        None => return Err(invalid()),
    };

    let mantissa = &cleaned[..cleaned.len() - 1];
    let value = mantissa.parse::<f64>().map_err(|_| invalid())? * multiplier;
    if !value.is_finite() || value < 0.0 || value > u64::MAX as f64 {
        return Err(invalid());
    }
    if value.fract() != 0.0 {
        return Err(RangeParseError::FractionalNumber(s.to_string()));
    }
    Ok(value as u64)
}

/// Errors raised while parsing a range selector.
///
/// These are configuration errors: they are detected before anything is fetched.
#[derive(Debug, thiserror::Error)]
pub enum RangeParseError {
    /// The selector contains no tokens
    #[error("range selector is empty")]
    Empty,

    /// A bound, step or count is not a valid number
    ///
    /// Numbers are unsigned integers with optional `_` separators and an optional
    /// `K`/`M`/`B` suffix.
    #[error("invalid number in range selector: '{0}'")]
    InvalidNumber(String),

    /// A suffixed number does not scale to an integer, e.g. `1.2345K`
    #[error("number does not resolve to an integer: '{0}'")]
    FractionalNumber(String),

    /// Both bounds are relative to each other (`-N:+M`)
    #[error("range cannot have both a relative start and a relative end: '{0}'")]
    BothRelative(String),

    /// The start of the range is after its end
    #[error("range start {start} is after range end {end}")]
    InvertedRange { start: BlockNum, end: BlockNum },

    /// `-N:end` with `N` larger than `end`
    #[error("trailing length {len} exceeds range end {end}")]
    TrailingExceedsEnd { len: u64, end: BlockNum },

    /// `start:end:0`
    #[error("range step must be positive: '{0}'")]
    ZeroStep(String),

    /// `start:end/0`
    #[error("range count must be positive: '{0}'")]
    ZeroCount(String),

    /// A transaction selector token is not a `0x`-prefixed 32-byte hash
    #[error("invalid transaction hash: '{0}'")]
    InvalidTransactionHash(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(selector: &str, latest: BlockNum) -> Vec<Range<BlockNum>> {
        selector
            .parse::<BlockSelector>()
            .expect("selector should parse")
            .resolve(latest)
            .intervals()
            .to_vec()
    }

    #[test]
    fn parse_number_accepts_separators_and_suffixes() {
        assert_eq!(parse_number("1_000").unwrap(), 1000);
        assert_eq!(parse_number("15K").unwrap(), 15_000);
        assert_eq!(parse_number("1.5M").unwrap(), 1_500_000);
        assert_eq!(parse_number("2B").unwrap(), 2_000_000_000);
        assert!(matches!(
            parse_number("1.0001K"),
            Err(RangeParseError::FractionalNumber(_))
        ));
        assert!(parse_number("abc").is_err());
        assert!(parse_number("").is_err());
    }

    #[test]
    fn resolve_block_selector_forms() {
        //* Params
        let latest = 1_999;
        let test_cases = [
            ("1000:1500", vec![1000..1500]),
            ("1000:", vec![1000..2000]),
            ("1000:latest", vec![1000..2000]),
            (":100", vec![0..100]),
            (":", vec![0..2000]),
            ("42", vec![42..43]),
            ("latest", vec![1999..2000]),
            ("100:+10", vec![100..110]),
            ("-10:100", vec![90..100]),
            ("-10:latest", vec![1990..2000]),
            ("1K:1_010", vec![1000..1010]),
            ("100:100", vec![]),
        ];

        //* Test
        for (selector, expected) in test_cases {
            assert_eq!(resolve(selector, latest), expected, "selector {selector}");
        }
    }

    #[test]
    fn resolve_with_step_and_count_samples_units() {
        assert_eq!(resolve("0:10:3", 0), vec![0..1, 3..4, 6..7, 9..10]);
        assert_eq!(resolve("0:10:1", 0), vec![0..10]);
        assert_eq!(resolve("0:101/3", 0), vec![0..1, 50..51, 100..101]);
        assert_eq!(resolve("0:100/1", 0), vec![0..1]);
        assert_eq!(resolve("0:3/10", 0), vec![0..3]);
    }

    #[test]
    fn resolve_with_multiple_tokens_merges_overlaps() {
        //* Given
        let selector = "500:600 0:100 50:150 150:200";

        //* When
        let intervals = resolve(selector, 0);

        //* Then
        assert_eq!(intervals, vec![0..200, 500..600]);
    }

    #[test]
    fn resolve_with_open_start_beyond_head_is_empty() {
        assert_eq!(resolve("3000:", 1999), vec![]);
    }

    #[test]
    fn parse_with_invalid_selectors_fails() {
        for selector in ["", "200:100", "-200:100", "-5:+5", "0:10:0", "0:10/0", "x:10"] {
            assert!(
                selector.parse::<BlockSelector>().is_err(),
                "{selector:?} should fail"
            );
        }
    }

    #[test]
    fn display_round_trips_through_from_str() {
        for selector in ["1000:1500", "42", "-10:latest", "0:10:3 20:+5", "0:100/7"] {
            let parsed: BlockSelector = selector.parse().expect("selector should parse");
            assert_eq!(parsed.to_string(), selector);
        }
    }

    #[test]
    fn needs_latest_only_for_open_spans() {
        assert!(!"1000:1500".parse::<BlockSelector>().unwrap().needs_latest());
        assert!("1000:".parse::<BlockSelector>().unwrap().needs_latest());
        assert!("latest".parse::<BlockSelector>().unwrap().needs_latest());
    }

    #[test]
    fn block_set_truncate_keeps_units_below_cap() {
        //* Given
        let set = BlockSet::from_intervals([0..10, 20..30]);

        //* When
        let truncated = set.truncate(25);

        //* Then
        assert_eq!(truncated.intervals(), &[0..10, 20..25]);
        assert_eq!(truncated.n_units(), 15);
        assert!(set.truncate(0).is_empty());
    }

    #[test]
    fn tx_selector_deduplicates_preserving_order() {
        //* Given
        let a = B256::repeat_byte(0xaa);
        let b = B256::repeat_byte(0xbb);
        let input = format!("{b} {a},{b}");

        //* When
        let selector: TxSelector = input.parse().expect("hashes should parse");

        //* Then
        assert_eq!(selector.hashes(), &[b, a]);
    }

    #[test]
    fn tx_selector_rejects_malformed_hashes() {
        assert!("0x1234".parse::<TxSelector>().is_err());
        assert!("".parse::<TxSelector>().is_err());
        assert!(
            "aa".repeat(32).parse::<TxSelector>().is_err(),
            "unprefixed hash should fail"
        );
    }
}
