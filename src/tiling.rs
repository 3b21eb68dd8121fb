// Tiling: which slice of a global axis each locality owns
//
// A TileSpan is a half-open index range [start, stop). A Tiling lists one
// span per locality (indexed by locality id) for a single axis of a global
// array. The coverage invariant: the distinct non-empty spans, sorted by
// start, begin at 0, end at the global extent and neither gap nor overlap.
// Identical spans on several localities are replicas and count once.
//
// Redistribution between two tilings of the same axis is planned by
// `transfers`: every (source, destination) pair whose spans intersect gives
// one point-to-point transfer. A destination spanning several sources
// (gather) and a source spanning several destinations (scatter) fall out of
// the same intersection loop.

use std::fmt;

use tracing::warn;

use crate::error::EvalError;

/// Half-open index range `[start, stop)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileSpan {
    pub start: usize,
    pub stop: usize,
}

impl TileSpan {
    pub fn new(start: usize, stop: usize) -> Result<Self, EvalError> {
        if stop < start {
            return Err(EvalError::invalid_argument(format!(
                "tile span [{start}, {stop}) ends before it starts"
            )));
        }
        Ok(Self { start, stop })
    }

    pub fn len(&self) -> usize {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.stop == self.start
    }

    pub fn contains(&self, index: usize) -> bool {
        self.start <= index && index < self.stop
    }

    pub fn intersect(&self, other: &TileSpan) -> Option<TileSpan> {
        let start = self.start.max(other.start);
        let stop = self.stop.min(other.stop);
        (start < stop).then_some(TileSpan { start, stop })
    }

    /// This span in coordinates relative to `origin`. `self` must start at
    /// or after `origin`.
    pub fn relative_to(&self, origin: usize) -> TileSpan {
        TileSpan {
            start: self.start - origin,
            stop: self.stop - origin,
        }
    }
}

impl fmt::Display for TileSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.stop)
    }
}

/// Check the coverage invariant for `spans` over `[0, extent)`.
pub fn check_coverage(spans: &[TileSpan], extent: usize) -> Result<(), EvalError> {
    let mut distinct: Vec<TileSpan> = spans.iter().copied().filter(|s| !s.is_empty()).collect();
    distinct.sort();
    distinct.dedup();
    let mut next = 0;
    for span in &distinct {
        if span.start != next {
            let problem = if span.start > next { "gap" } else { "overlap" };
            warn!(%span, expected_start = next, extent, "tiling coverage broken");
            return Err(EvalError::distribution(format!(
                "{problem} at index {} (tile {span}) in tiling of extent {extent}",
                span.start.min(next)
            )));
        }
        next = span.stop;
    }
    if next != extent {
        warn!(covered = next, extent, "tiling coverage broken");
        return Err(EvalError::distribution(format!(
            "tiles cover [0, {next}) but the extent is {extent}"
        )));
    }
    Ok(())
}

/// One point-to-point move of `span` (global coordinates).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub source: usize,
    pub destination: usize,
    pub span: TileSpan,
}

/// Per-locality spans of one axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tiling {
    spans: Vec<TileSpan>,
}

impl Tiling {
    /// Tiling from per-locality spans; fails unless coverage holds.
    pub fn new(spans: Vec<TileSpan>) -> Result<Self, EvalError> {
        let extent = spans.iter().map(|s| s.stop).max().unwrap_or(0);
        check_coverage(&spans, extent)?;
        Ok(Self { spans })
    }

    /// Split `[0, extent)` into `localities` contiguous tiles. The first
    /// `extent % localities` tiles get one extra element.
    pub fn even(extent: usize, localities: usize) -> Result<Self, EvalError> {
        if localities == 0 {
            return Err(EvalError::invalid_argument("cannot tile over zero localities"));
        }
        let base = extent / localities;
        let extra = extent % localities;
        let mut spans = Vec::with_capacity(localities);
        let mut start = 0;
        for i in 0..localities {
            let len = base + usize::from(i < extra);
            spans.push(TileSpan {
                start,
                stop: start + len,
            });
            start += len;
        }
        Ok(Self { spans })
    }

    pub fn spans(&self) -> &[TileSpan] {
        &self.spans
    }

    pub fn num_localities(&self) -> usize {
        self.spans.len()
    }

    pub fn extent(&self) -> usize {
        self.spans.iter().map(|s| s.stop).max().unwrap_or(0)
    }

    pub fn span(&self, locality: usize) -> Option<TileSpan> {
        self.spans.get(locality).copied()
    }

    /// The locality owning global `index` (the lowest id among replicas).
    pub fn owner(&self, index: usize) -> Option<usize> {
        self.spans.iter().position(|s| s.contains(index))
    }

    /// The part of `global` owned by `locality`, in that locality's local
    /// coordinates.
    pub fn project(&self, global: TileSpan, locality: usize) -> Option<TileSpan> {
        let own = self.span(locality)?;
        own.intersect(&global).map(|s| s.relative_to(own.start))
    }

    /// The moves that turn `self` into `target`. Replicated source spans
    /// are read from their lowest-numbered owner.
    pub fn transfers(&self, target: &Tiling) -> Result<Vec<Transfer>, EvalError> {
        if self.extent() != target.extent() {
            warn!(from = self.extent(), to = target.extent(), "retile changes extent");
            return Err(EvalError::distribution(format!(
                "cannot retile extent {} onto extent {}",
                self.extent(),
                target.extent()
            )));
        }
        let mut moves = Vec::new();
        for (destination, want) in target.spans.iter().enumerate() {
            for (source, have) in self.spans.iter().enumerate() {
                let Some(span) = have.intersect(want) else {
                    continue;
                };
                let replica_of_earlier = self.spans[..source]
                    .iter()
                    .any(|earlier| earlier.intersect(&span) == Some(span));
                if !replica_of_earlier {
                    moves.push(Transfer {
                        source,
                        destination,
                        span,
                    });
                }
            }
        }
        Ok(moves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvalErrorKind;

    fn span(start: usize, stop: usize) -> TileSpan {
        TileSpan::new(start, stop).unwrap()
    }

    #[test]
    fn even_gives_remainder_to_first_localities() {
        let t = Tiling::even(13, 3).unwrap();
        assert_eq!(t.spans(), &[span(0, 5), span(5, 9), span(9, 13)]);
        assert_eq!(t.extent(), 13);
        assert_eq!(Tiling::even(2, 3).unwrap().spans()[2], span(2, 2));
    }

    #[test]
    fn coverage_rejects_gap_and_overlap() {
        let gap = check_coverage(&[span(0, 4), span(5, 9)], 9).unwrap_err();
        assert!(matches!(gap.kind, EvalErrorKind::DistributionInvariantViolation(_)));
        assert!(check_coverage(&[span(0, 5), span(4, 9)], 9).is_err());
        assert!(check_coverage(&[span(0, 5), span(5, 9)], 10).is_err());
        assert!(check_coverage(&[span(5, 9), span(0, 5)], 9).is_ok());
        assert!(check_coverage(&[span(0, 2), span(0, 2), span(2, 4)], 4).is_ok());
    }

    #[test]
    fn project_into_local_coordinates() {
        let t = Tiling::new(vec![span(0, 5), span(5, 9), span(9, 13)]).unwrap();
        assert_eq!(t.project(span(4, 10), 1), Some(span(0, 4)));
        assert_eq!(t.project(span(4, 10), 2), Some(span(0, 1)));
        assert_eq!(t.project(span(0, 3), 2), None);
        assert_eq!(t.owner(9), Some(2));
    }

    #[test]
    fn transfers_cover_gather_and_scatter() {
        let from = Tiling::new(vec![span(0, 5), span(5, 9), span(9, 13)]).unwrap();
        let to = Tiling::new(vec![span(0, 4), span(4, 9), span(9, 13)]).unwrap();
        let moves = from.transfers(&to).unwrap();
        let expected = vec![
            Transfer { source: 0, destination: 0, span: span(0, 4) },
            Transfer { source: 0, destination: 1, span: span(4, 5) },
            Transfer { source: 1, destination: 1, span: span(5, 9) },
            Transfer { source: 2, destination: 2, span: span(9, 13) },
        ];
        assert_eq!(moves, expected);
        let moved: usize = moves.iter().map(|m| m.span.len()).sum();
        assert_eq!(moved, 13);
    }

    #[test]
    fn transfers_reject_extent_change() {
        let from = Tiling::even(10, 2).unwrap();
        let to = Tiling::even(12, 2).unwrap();
        assert!(from.transfers(&to).is_err());
    }
}
