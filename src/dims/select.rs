//! Axis selectors for narrowing a dimension descriptor
//!
//! A selector picks a coordinate, a contiguous run, or everything along one
//! axis. Arbitrary gather (non-contiguous or non-monotonic index sets) is
//! rejected: accelerated backends cannot express it along a dimension.

use crate::error::{Error, Result};

/// One-axis selection
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    /// Keep the whole axis
    All,
    /// Pick one coordinate and drop the axis
    Index(usize),
    /// Keep the half-open run `[lo, hi)`
    Range(usize, usize),
    /// Explicit index list; must form a contiguous increasing run
    Indices(Vec<usize>),
}

impl Selector {
    /// Resolve against an axis of size `dim`
    ///
    /// Returns `None` for a full-axis pass-through, otherwise
    /// `(lo, hi, keep_axis)` with `keep_axis == false` when the axis is
    /// dropped (single-coordinate selection).
    pub(crate) fn normalize(&self, dim: usize) -> Result<Option<(usize, usize, bool)>> {
        match self {
            Selector::All => Ok(None),
            Selector::Index(i) => {
                if *i >= dim {
                    return Err(Error::Select {
                        reason: format!("index {i} out of bounds for axis of size {dim}"),
                    });
                }
                Ok(Some((*i, i + 1, false)))
            }
            Selector::Range(lo, hi) => {
                if lo >= hi || *hi > dim {
                    return Err(Error::Select {
                        reason: format!("range {lo}..{hi} invalid for axis of size {dim}"),
                    });
                }
                Ok(Some((*lo, *hi, true)))
            }
            Selector::Indices(indices) => {
                let (lo, hi) = contiguous_run(indices)?;
                if hi > dim {
                    return Err(Error::Select {
                        reason: format!("indices reach {hi} on an axis of size {dim}"),
                    });
                }
                Ok(Some((lo, hi, true)))
            }
        }
    }
}

fn contiguous_run(indices: &[usize]) -> Result<(usize, usize)> {
    let Some(&first) = indices.first() else {
        return Err(Error::Select {
            reason: "empty index list".to_string(),
        });
    };
    for (k, &i) in indices.iter().enumerate() {
        if i != first + k {
            return Err(Error::Select {
                reason: format!("indices {indices:?} are not a contiguous increasing run"),
            });
        }
    }
    Ok((first, first + indices.len()))
}

/// Compose two selector lists so that
/// `dims.select(s1)?.select(s2) == dims.select(&compose_selectors(s1, s2)?)`
///
/// `s2` addresses the axes that survive `s1`; axes dropped by an `Index`
/// selector in `s1` pass through unchanged.
pub fn compose_selectors(s1: &[Selector], s2: &[Selector]) -> Result<Vec<Selector>> {
    let mut out = Vec::with_capacity(s1.len());
    let mut inner = s2.iter();
    for sel in s1 {
        // Dropped axes consume nothing from s2
        if let Selector::Index(_) = sel {
            out.push(sel.clone());
            continue;
        }
        let next = inner.next().ok_or_else(|| Error::Select {
            reason: "second selector list is shorter than the surviving axes".to_string(),
        })?;
        let base = match sel {
            Selector::All => 0,
            Selector::Range(lo, _) => *lo,
            Selector::Indices(indices) => contiguous_run(indices)?.0,
            Selector::Index(_) => unreachable!(),
        };
        out.push(match next {
            Selector::All => sel.clone(),
            Selector::Index(i) => Selector::Index(base + i),
            Selector::Range(lo, hi) => Selector::Range(base + lo, base + hi),
            Selector::Indices(indices) => {
                let (lo, hi) = contiguous_run(indices)?;
                Selector::Range(base + lo, base + hi)
            }
        });
    }
    if inner.next().is_some() {
        return Err(Error::Select {
            reason: "second selector list is longer than the surviving axes".to_string(),
        });
    }
    Ok(out)
}
