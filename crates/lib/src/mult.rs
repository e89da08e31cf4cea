//! Multiplicity of a dependency: the set of accepted element counts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultiplicityError {
  #[error("slice step must be positive, not {0}")]
  NonPositiveStep(usize),

  #[error("invalid multiplicity notation: {0:?}")]
  Syntax(String),

  #[error("element count too large: {0}")]
  CountTooLarge(usize),
}

/// A normalized range `[start:stop:step]` of counts.
///
/// Normalization makes `stop` one more than the largest member (or `None` for no upper bound),
/// turns a range with a single member into `[n]` with step 1, and collapses an empty range
/// into `[0:0]`. Two multiplicities are equal iff they accept the same counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Multiplicity {
  start: usize,
  stop: Option<usize>,
  step: usize,
}

impl Multiplicity {
  pub fn range(start: usize, stop: Option<usize>, step: usize) -> Result<Self, MultiplicityError> {
    if step == 0 {
      return Err(MultiplicityError::NonPositiveStep(step));
    }
    let mut m = Multiplicity { start, stop, step };
    if let Some(stop) = stop {
      if stop > start {
        let c = (stop - start - 1) / step;
        m.stop = Some(c * step + start + 1);
        if c == 0 {
          m.step = 1;
        }
      } else {
        m = Multiplicity {
          start: 0,
          stop: Some(0),
          step: 1,
        };
      }
    }
    Ok(m)
  }

  /// Exactly `n` elements; `usize::MAX` has no representable stop.
  pub fn exact(n: usize) -> Result<Self, MultiplicityError> {
    let stop = n.checked_add(1).ok_or(MultiplicityError::CountTooLarge(n))?;
    Ok(Multiplicity {
      start: n,
      stop: Some(stop),
      step: 1,
    })
  }

  /// At least `n` elements.
  pub fn at_least(n: usize) -> Self {
    Multiplicity {
      start: n,
      stop: None,
      step: 1,
    }
  }

  /// Same as `s.parse()`.
  pub fn parse(s: &str) -> Result<Self, MultiplicityError> {
    s.parse()
  }

  pub fn start(&self) -> usize {
    self.start
  }

  pub fn stop(&self) -> Option<usize> {
    self.stop
  }

  pub fn step(&self) -> usize {
    self.step
  }

  pub fn contains(&self, count: usize) -> bool {
    if count < self.start {
      return false;
    }
    if let Some(stop) = self.stop
      && count >= stop
    {
      return false;
    }
    (count - self.start) % self.step == 0
  }

  /// True if every count accepted by `self` is accepted by `other`, at the same step.
  pub fn is_within(&self, other: &Multiplicity) -> bool {
    if self.step != other.step || self.start < other.start {
      return false;
    }
    match (self.stop, other.stop) {
      (_, None) => true,
      (None, Some(_)) => false,
      (Some(a), Some(b)) => a <= b,
    }
  }
}

impl fmt::Display for Multiplicity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.stop.is_some() && self.stop == self.start.checked_add(1) {
      return write!(f, "[{}]", self.start);
    }
    f.write_str("[")?;
    if self.start > 0 {
      write!(f, "{}", self.start)?;
    }
    f.write_str(":")?;
    if let Some(stop) = self.stop {
      write!(f, "{stop}")?;
    }
    if self.step > 1 {
      write!(f, ":{}", self.step)?;
    }
    f.write_str("]")
  }
}

/// Parses the notation produced by `Display`, e.g. `[2]`, `[1:]`, `[2:10:3]`.
impl FromStr for Multiplicity {
  type Err = MultiplicityError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let syntax = || MultiplicityError::Syntax(s.to_string());
    let inner = s
      .trim()
      .strip_prefix('[')
      .and_then(|s| s.strip_suffix(']'))
      .ok_or_else(syntax)?;

    let number = |part: &str| -> Result<Option<usize>, MultiplicityError> {
      let part = part.trim();
      if part.is_empty() {
        Ok(None)
      } else {
        part.parse().map(Some).map_err(|_| syntax())
      }
    };

    let parts: Vec<&str> = inner.split(':').collect();
    match parts.as_slice() {
      [n] => {
        let n = number(n)?.ok_or_else(syntax)?;
        Multiplicity::exact(n).map_err(|_| syntax())
      }
      [start, stop] => Multiplicity::range(number(start)?.unwrap_or(0), number(stop)?, 1),
      [start, stop, step] => Multiplicity::range(number(start)?.unwrap_or(0), number(stop)?, number(step)?.unwrap_or(1)),
      _ => Err(syntax()),
    }
  }
}
