//! Runtime configuration of the allocator.
//!
//! The allocator reads its configuration once per allocation. By default it
//! comes from two environment variables:
//!
//! | Variable              | Values                                        |
//! |-----------------------|-----------------------------------------------|
//! | `ALLOCATOR_ALGORITHM` | `first_fit` (default), `best_fit`, `worst_fit` |
//! | `ALLOCATOR_SCRIBBLE`  | `0` (default), `1`                            |
//!
//! Reading the environment does not allocate, so it is safe to do while the
//! allocator is serving the whole process.

use std::{ffi::CStr, fmt, str::FromStr};

use crate::error::UnknownAlgorithm;

/// Environment variable selecting the [`Algorithm`].
pub const ALGORITHM_VAR: &CStr = c"ALLOCATOR_ALGORITHM";

/// Environment variable toggling scribbling.
pub const SCRIBBLE_VAR: &CStr = c"ALLOCATOR_SCRIBBLE";

/// Policy used to pick which existing block serves a request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// The first block with enough room.
    #[default]
    FirstFit,
    /// The block whose remainder is the smallest that still fits.
    BestFit,
    /// The block whose remainder is the largest.
    WorstFit,
}

impl Algorithm {
    pub const fn name(self) -> &'static str {
        match self {
            Algorithm::FirstFit => "first_fit",
            Algorithm::BestFit => "best_fit",
            Algorithm::WorstFit => "worst_fit",
        }
    }

    pub fn from_bytes(name: &[u8]) -> Option<Self> {
        match name {
            b"first_fit" => Some(Algorithm::FirstFit),
            b"best_fit" => Some(Algorithm::BestFit),
            b"worst_fit" => Some(Algorithm::WorstFit),
            _ => None,
        }
    }
}

impl FromStr for Algorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(s.as_bytes()).ok_or_else(|| UnknownAlgorithm(s.to_owned()))
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Settings applied to a single allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// `None` when the selector names no known algorithm. Free blocks are
    /// then never reused and every request maps a new region.
    pub algorithm: Option<Algorithm>,
    /// Poison fresh payloads with `0xAA`.
    pub scribble: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Algorithm::FirstFit)
    }
}

impl Config {
    pub const fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm: Some(algorithm),
            scribble: false,
        }
    }

    pub const fn scribble(mut self, scribble: bool) -> Self {
        self.scribble = scribble;
        self
    }

    /// Reads `ALLOCATOR_ALGORITHM` and `ALLOCATOR_SCRIBBLE`.
    pub fn from_env() -> Self {
        let algorithm = with_env_var(ALGORITHM_VAR, |value| match value {
            None => Some(Algorithm::FirstFit),
            Some(name) => Algorithm::from_bytes(name),
        });
        let scribble = with_env_var(SCRIBBLE_VAR, |value| value.is_some_and(|v| atoi(v) == 1));

        Self { algorithm, scribble }
    }
}

/// Where the allocator takes its [`Config`] from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// Re-read the environment on every allocation.
    Environment,
    /// Always use the same settings.
    Fixed(Config),
}

impl ConfigSource {
    pub fn resolve(&self) -> Config {
        match self {
            ConfigSource::Environment => Config::from_env(),
            ConfigSource::Fixed(config) => *config,
        }
    }
}

#[cfg(unix)]
fn with_env_var<R>(key: &CStr, f: impl FnOnce(Option<&[u8]>) -> R) -> R {
    // SAFETY: `key` is NUL terminated and getenv returns either null or a
    // NUL terminated string we only read before returning.
    unsafe {
        let value = libc::getenv(key.as_ptr());
        if value.is_null() {
            f(None)
        } else {
            f(Some(CStr::from_ptr(value).to_bytes()))
        }
    }
}

/// Longest value read from the environment on Windows, NUL included.
#[cfg(windows)]
const ENV_VALUE_MAX: usize = 256;

/// Values longer than [`ENV_VALUE_MAX`] read as empty.
#[cfg(windows)]
fn with_env_var<R>(key: &CStr, f: impl FnOnce(Option<&[u8]>) -> R) -> R {
    use windows::{
        Win32::{
            Foundation::{ERROR_ENVVAR_NOT_FOUND, GetLastError},
            System::Environment::GetEnvironmentVariableA,
        },
        core::PCSTR,
    };

    let mut buffer = [0u8; ENV_VALUE_MAX];

    // SAFETY: `key` is NUL terminated and `buffer` outlives the call.
    let len = unsafe {
        GetEnvironmentVariableA(PCSTR::from_raw(key.as_ptr().cast()), Some(&mut buffer))
    } as usize;

    match len {
        0 if unsafe { GetLastError() } == ERROR_ENVVAR_NOT_FOUND => f(None),
        len if len < buffer.len() => f(Some(&buffer[..len])),
        _ => f(Some(&buffer[..0])),
    }
}

/// Integer prefix of `bytes` the way C's `atoi` reads it. Anything that is
/// not a number reads as 0.
fn atoi(bytes: &[u8]) -> i64 {
    let bytes = bytes.trim_ascii_start();

    let (negative, digits) = match bytes.split_first() {
        Some((b'-', rest)) => (true, rest),
        Some((b'+', rest)) => (false, rest),
        _ => (false, bytes),
    };

    let value = digits
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .fold(0i64, |acc, b| acc.saturating_mul(10).saturating_add(i64::from(b - b'0')));

    if negative { -value } else { value }
}
