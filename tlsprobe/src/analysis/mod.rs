//! # Binary Analysis
//!
//! Locates the functions to hook and the struct layouts the hooks need inside
//! a Go executable.
//!
//! The manager only depends on the [`BinaryAnalyzer`] trait. [`ElfAnalyzer`]
//! is the real implementation; tests substitute in-memory fakes.
//!
//! ## What an analysis produces
//!
//! - **Function locations**: the file offset of each declared function's
//!   entry and, when requested, of each of its `ret` instructions. Go may move
//!   goroutine stacks while a call is in progress, which breaks uretprobes, so
//!   returns are hooked with plain uprobes on every `ret`.
//! - **Struct field offsets**: DWARF `data_member_location` of the fields the
//!   hooks walk through to get from a `*tls.Conn` to the socket fd.
//! - **Go version / ABI**: whether arguments arrive in registers or on the
//!   stack.

pub mod elf;
pub mod lookup;

use std::collections::HashMap;
use std::fmt;
use std::fs::File;

use crate::domain::AnalysisError;

pub use elf::ElfAnalyzer;

/// A function to locate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionSpec {
    /// Fully qualified Go symbol, e.g. `crypto/tls.(*Conn).Read`
    pub name: &'static str,
    /// Also report the offset of every return instruction
    pub include_returns: bool,
}

/// A struct member whose offset is needed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldSpec {
    /// DWARF name of the struct, e.g. `crypto/tls.Conn`
    pub struct_name: &'static str,
    pub field_name: &'static str,
}

impl fmt::Display for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.struct_name, self.field_name)
    }
}

/// Where a function lives in the executable file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionLocation {
    /// File offset of the first instruction
    pub entry: u64,
    /// File offsets of every `ret` (empty unless requested)
    pub returns: Vec<u64>,
}

/// Go toolchain version recorded in the binary's build info
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GoVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl GoVersion {
    /// Parse `go1.21.5`, `go1.22`, `go1.22rc1` and friends
    #[must_use]
    pub fn parse(version: &str) -> Option<Self> {
        let rest = version.strip_prefix("go")?;
        let mut parts = rest.splitn(3, '.');
        let major = leading_number(parts.next()?)?;
        let minor = leading_number(parts.next()?)?;
        let patch = parts.next().and_then(leading_number).unwrap_or(0);
        Some(Self { major, minor, patch })
    }
}

fn leading_number(s: &str) -> Option<u16> {
    let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

impl fmt::Display for GoVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "go{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Calling convention of Go functions in the binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoAbi {
    Stack,
    Register,
}

/// Immutable output of one analysis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisResult {
    pub functions: HashMap<String, FunctionLocation>,
    pub struct_offsets: HashMap<FieldSpec, u64>,
    pub go_version: GoVersion,
    pub abi: GoAbi,
}

impl AnalysisResult {
    #[must_use]
    pub fn function(&self, name: &str) -> Option<&FunctionLocation> {
        self.functions.get(name)
    }

    #[must_use]
    pub fn field_offset(&self, field: &FieldSpec) -> Option<u64> {
        self.struct_offsets.get(field).copied()
    }
}

/// Inspects executables for the functions and layouts to hook
///
/// Implementations must be stateless with respect to a single call so that
/// different images can be analyzed concurrently.
pub trait BinaryAnalyzer: Send + Sync {
    /// Analyze an opened executable
    ///
    /// # Errors
    /// [`AnalysisError::NotInstrumentable`] when the image can never be hooked
    /// (safe to cache), [`AnalysisError::MalformedImage`] or
    /// [`AnalysisError::Io`] otherwise.
    fn inspect(
        &self,
        image: &File,
        functions: &[FunctionSpec],
        fields: &[FieldSpec],
    ) -> Result<AnalysisResult, AnalysisError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_go_version_parse() {
        assert_eq!(GoVersion::parse("go1.21.5"), Some(GoVersion { major: 1, minor: 21, patch: 5 }));
        assert_eq!(GoVersion::parse("go1.22"), Some(GoVersion { major: 1, minor: 22, patch: 0 }));
        assert_eq!(
            GoVersion::parse("go1.23rc2"),
            Some(GoVersion { major: 1, minor: 23, patch: 0 })
        );
        assert_eq!(GoVersion::parse("devel +abc"), None);
        assert_eq!(GoVersion::parse("go"), None);
    }

    #[test]
    fn test_go_version_ordering() {
        let v117 = GoVersion::parse("go1.17").unwrap();
        let v121 = GoVersion::parse("go1.21.0").unwrap();
        assert!(v117 < v121);
        assert_eq!(v121.to_string(), "go1.21.0");
    }
}
