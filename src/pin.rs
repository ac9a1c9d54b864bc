//! Logical to physical pin numbering.
//!
//! Kernels from 6.0 on register the SoC GPIO chip at a non-zero base, so the
//! legacy sysfs numbers users configure have to be shifted by the base of the
//! first exported chip.

use crate::error::AppError;

/// First kernel major version that numbers sysfs GPIO lines from the chip base.
pub const PREFIXED_KERNEL_MAJOR: u32 = 6;

/// Parses a configured pin. Missing, empty or non-numeric input yields `default`.
pub fn try_parse(raw: Option<&str>, default: u32) -> u32 {
    match raw.map(str::trim) {
        Some(s) if !s.is_empty() => s.parse::<u32>().unwrap_or(default),
        _ => default,
    }
}

/// Leading integer of a kernel release string such as `6.1.0-rpi7-rpi-v8`.
pub fn kernel_major(release: &str) -> Option<u32> {
    let digits: String = release
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Extracts the chip base from the probe output: the first line that still
/// has digits once everything else is stripped.
pub fn parse_prefix(output: &str) -> Result<u32, AppError> {
    let digits = output
        .lines()
        .map(|line| line.chars().filter(char::is_ascii_digit).collect::<String>())
        .find(|digits| !digits.is_empty())
        .ok_or_else(|| AppError::Probe("no GPIO chip found in probe output".into()))?;

    digits
        .parse()
        .map_err(|e| AppError::Probe(format!("invalid GPIO prefix {digits}: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinTranslator {
    kernel_major: u32,
    prefix: u32,
}

impl PinTranslator {
    pub fn new(kernel_major: u32, prefix: u32) -> Self {
        Self {
            kernel_major,
            prefix,
        }
    }

    pub fn kernel_major(&self) -> u32 {
        self.kernel_major
    }

    pub fn prefix(&self) -> u32 {
        self.prefix
    }

    /// `None` when the offset pin does not fit a line number.
    pub fn physical_pin(&self, logical: u32) -> Option<u32> {
        if self.kernel_major >= PREFIXED_KERNEL_MAJOR {
            logical.checked_add(self.prefix)
        } else {
            Some(logical)
        }
    }

    pub fn translate(&self, raw: Option<&str>, default: u32) -> Option<String> {
        self.physical_pin(try_parse(raw, default))
            .map(|line| line.to_string())
    }
}
