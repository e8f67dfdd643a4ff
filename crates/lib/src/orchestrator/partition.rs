//! Splitting the platform list across CI jobs.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid partition '{input}': {reason}")]
pub struct PartitionArgumentError {
  pub input: String,
  pub reason: String,
}

/// Part `part` (1-indexed) of `of` contiguous, roughly equal slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
  part: usize,
  of: usize,
}

impl Partition {
  pub fn new(part: usize, of: usize) -> Result<Self, PartitionArgumentError> {
    let input = format!("{part}/{of}");
    if of == 0 {
      return Err(PartitionArgumentError {
        input,
        reason: "the number of parts must be at least 1".to_string(),
      });
    }
    if part == 0 || part > of {
      return Err(PartitionArgumentError {
        input,
        reason: format!("part must be between 1 and {of}"),
      });
    }
    Ok(Self { part, of })
  }

  pub fn part(&self) -> usize {
    self.part
  }

  pub fn of(&self) -> usize {
    self.of
  }

  /// Index range this part covers in a list of `len` items.
  pub fn bounds(&self, len: usize) -> std::ops::Range<usize> {
    let start = (self.part - 1) * len / self.of;
    let end = self.part * len / self.of;
    start..end
  }

  pub fn select<'a, T>(&self, items: &'a [T]) -> &'a [T] {
    &items[self.bounds(items.len())]
  }
}

impl fmt::Display for Partition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.part, self.of)
  }
}

impl FromStr for Partition {
  type Err = PartitionArgumentError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = |reason: &str| PartitionArgumentError {
      input: s.to_string(),
      reason: reason.to_string(),
    };

    let (part, of) = s.split_once('/').ok_or_else(|| invalid("expected n/m"))?;
    let part = part.trim().parse().map_err(|_| invalid("n is not a number"))?;
    let of = of.trim().parse().map_err(|_| invalid("m is not a number"))?;
    Self::new(part, of).map_err(|e| PartitionArgumentError {
      input: s.to_string(),
      reason: e.reason,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn middle_third_of_nine() {
    let items: Vec<usize> = (1..=9).collect();
    let partition: Partition = "2/3".parse().unwrap();
    assert_eq!(partition.select(&items), &[4, 5, 6]);
  }

  #[test]
  fn parts_cover_everything_once() {
    let items: Vec<usize> = (0..13).collect();
    let mut seen = Vec::new();
    for part in 1..=4 {
      seen.extend_from_slice(Partition::new(part, 4).unwrap().select(&items));
    }
    assert_eq!(seen, items);
  }

  #[test]
  fn more_parts_than_items_yields_empty_slices() {
    let items = ["a", "b"];
    assert!(Partition::new(1, 3).unwrap().select(&items).is_empty());
    assert_eq!(Partition::new(3, 3).unwrap().select(&items), &["b"]);
  }

  #[test]
  fn rejects_bad_arguments() {
    for input in ["0/3", "4/3", "1/0", "x", "a/b", "2"] {
      let err = input.parse::<Partition>().unwrap_err();
      assert_eq!(err.input, input);
    }
  }
}
