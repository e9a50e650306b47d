use super::error::{AllocError, Result};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Environment variable naming a division plan file, see
/// [`DivisionPlan::from_env`].
pub const DIVISION_PLAN_PATH_ENV: &str = "BINBUF_DIVISION_PLAN_PATH";

/// Smallest default boundary: 4 KiB.
const DEFAULT_MIN_LOG2: u32 = 12;
/// Largest default boundary (the overflow threshold): 1 GiB.
const DEFAULT_MAX_LOG2: u32 = 30;

/// Size class of a request under a [`DivisionPlan`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinClass {
    /// Index of the smallest boundary that covers the request.
    Bin(usize),
    /// At or above the last boundary. Never cached.
    Overflow,
}

/// Ascending bin boundaries. The last boundary is the overflow threshold.
///
/// A request of `size` bytes belongs to bin `i`, the first boundary with
/// `size <= b[i]`, unless `size >= b[n-1]`, which is [`BinClass::Overflow`].
/// The high end of the last bin is exclusive, so the finite bins are
/// `(0, b0], (b0, b1], ..., (b[n-3], b[n-2]], (b[n-2], b[n-1])`.
#[derive(Clone, PartialEq, Eq)]
pub struct DivisionPlan {
    bounds: Vec<usize>,
}

impl DivisionPlan {
    /// Validate and adopt `bounds`.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidConfig`] when `bounds` is empty, contains zero,
    /// or is not strictly increasing.
    pub fn new(bounds: Vec<usize>) -> Result<Self> {
        if bounds.is_empty() {
            return Err(AllocError::InvalidConfig("division plan is empty".into()));
        }
        if bounds[0] == 0 {
            return Err(AllocError::InvalidConfig(
                "division plan boundaries must be positive".into(),
            ));
        }
        if let Some(w) = bounds.windows(2).find(|w| w[0] >= w[1]) {
            return Err(AllocError::InvalidConfig(format!(
                "division plan must be strictly increasing, found {} followed by {}",
                w[0], w[1]
            )));
        }
        Ok(Self { bounds })
    }

    /// Powers of two from `2^min_log2` through `2^max_log2` inclusive.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidConfig`] when the range is empty or does not fit
    /// in `usize`.
    pub fn geometric(min_log2: u32, max_log2: u32) -> Result<Self> {
        if min_log2 > max_log2 || max_log2 >= usize::BITS {
            return Err(AllocError::InvalidConfig(format!(
                "geometric plan 2^{min_log2}..=2^{max_log2} is empty or overflows"
            )));
        }
        Self::new((min_log2..=max_log2).map(|e| 1usize << e).collect())
    }

    /// Read a plan from a text file in the [`FromStr`] format.
    ///
    /// # Errors
    ///
    /// [`AllocError::Io`] when the file cannot be read,
    /// [`AllocError::InvalidConfig`] when its content is not a valid plan.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let plan: Self = text.parse()?;
        tracing::debug!(path = %path.display(), bins = plan.len(), "loaded division plan");
        Ok(plan)
    }

    /// Load the plan named by `BINBUF_DIVISION_PLAN_PATH`, or the default
    /// plan when the variable is unset or empty.
    ///
    /// # Errors
    ///
    /// Same as [`from_file`](Self::from_file) when the variable is set.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(DIVISION_PLAN_PATH_ENV) {
            Some(path) if !path.is_empty() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    /// Classify a non-zero request size.
    #[inline]
    pub fn bin_of(&self, size: usize) -> BinClass {
        if size >= self.overflow_threshold() {
            return BinClass::Overflow;
        }
        // size < last boundary, so some boundary covers it.
        BinClass::Bin(self.bounds.partition_point(|&b| b < size))
    }

    /// The last boundary: requests this large or larger are never cached.
    #[inline]
    pub fn overflow_threshold(&self) -> usize {
        self.bounds[self.bounds.len() - 1]
    }

    #[inline]
    pub fn bounds(&self) -> &[usize] {
        &self.bounds
    }

    /// Largest boundary, the same value as
    /// [`overflow_threshold`](Self::overflow_threshold).
    #[inline]
    pub fn back(&self) -> usize {
        self.overflow_threshold()
    }

    /// Number of boundaries, which is also the number of finite bins.
    #[inline]
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    /// Always false; kept for API symmetry with `len`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }
}

impl Default for DivisionPlan {
    /// 4 KiB, 8 KiB, ..., 512 MiB, 1 GiB.
    fn default() -> Self {
        Self {
            bounds: (DEFAULT_MIN_LOG2..=DEFAULT_MAX_LOG2)
                .map(|e| 1usize << e)
                .collect(),
        }
    }
}

impl fmt::Debug for DivisionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.bounds).finish()
    }
}

impl FromStr for DivisionPlan {
    type Err = AllocError;

    /// Boundaries separated by commas or whitespace (newlines included),
    /// each a decimal integer with an optional binary suffix: `K`, `KB`,
    /// `M`, `MB`, `G`, `GB`, any case. Lines starting with `#` are comments.
    fn from_str(s: &str) -> Result<Self> {
        let mut bounds = Vec::new();
        for line in s.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            for token in line
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|t| !t.is_empty())
            {
                bounds.push(parse_size(token)?);
            }
        }
        Self::new(bounds)
    }
}

/// Parse `"512"`, `"4K"`, `"16kb"`, `"1G"` into bytes.
fn parse_size(token: &str) -> Result<usize> {
    let digits_end = token
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(token.len());
    let (digits, suffix) = token.split_at(digits_end);
    let invalid = || AllocError::InvalidConfig(format!("invalid size {token:?} in division plan"));

    let value: usize = digits.parse().map_err(|_| invalid())?;
    let shift = match suffix.to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" => 10,
        "m" | "mb" => 20,
        "g" | "gb" => 30,
        _ => return Err(invalid()),
    };
    value.checked_mul(1usize << shift).ok_or_else(invalid)
}
