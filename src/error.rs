//! Error types for the allocator.
//!
//! Mirrors the shape used throughout this crate's Go ancestor's Rust successor:
//! a single [`AllocError`] carrying a [`AllocErrorKind`], an optional
//! [`Layout`], and caller-captured context, rather than a bare error code.

use core::alloc::Layout;
use core::fmt;
#[cfg(feature = "std")]
use std::panic::Location;
use core::sync::atomic::{AtomicU64, Ordering};

/// Coarse classification of why an allocator operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocErrorKind {
    /// The backing allocator's OS call failed. Treated as fatal by callers.
    OutOfMemoryOs,
    /// All promotion-eligible buckets were exhausted and the backing
    /// allocator also failed (or was not consulted because the caller
    /// asked for a segregated-only allocation).
    BucketExhausted,
    /// An unknown size-class strategy constant was requested.
    InvalidStrategy,
    /// `free` observed a double-free at the bucket's free-list head.
    DoubleFreeAtHead,
    /// `free` or `realloc` received a pointer outside every known range.
    UnknownPointer,
    /// The caller-supplied `Layout` failed validation (non-power-of-two
    /// alignment, or a size that overflows when padded to that alignment).
    InvalidLayout,
}

impl AllocErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AllocErrorKind::OutOfMemoryOs => "out of memory (OS allocation failed)",
            AllocErrorKind::BucketExhausted => "bucket exhausted",
            AllocErrorKind::InvalidStrategy => "invalid size-class strategy",
            AllocErrorKind::DoubleFreeAtHead => "double free detected at list head",
            AllocErrorKind::UnknownPointer => "pointer not owned by this allocator",
            AllocErrorKind::InvalidLayout => "invalid layout",
        }
    }

    pub fn severity(self) -> ErrorSeverity {
        match self {
            AllocErrorKind::OutOfMemoryOs => ErrorSeverity::Critical,
            AllocErrorKind::InvalidStrategy => ErrorSeverity::Critical,
            AllocErrorKind::DoubleFreeAtHead => ErrorSeverity::Critical,
            AllocErrorKind::UnknownPointer => ErrorSeverity::Critical,
            AllocErrorKind::BucketExhausted => ErrorSeverity::Warning,
            AllocErrorKind::InvalidLayout => ErrorSeverity::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Warning,
    Error,
    Critical,
}

/// Process-wide atomic counters, one per [`AllocErrorKind`], plus a total.
///
/// Packed as a fixed array rather than a map: the kind set is closed and
/// small, so indexing beats hashing.
#[derive(Debug)]
pub struct ErrorStats {
    out_of_memory_os: AtomicU64,
    bucket_exhausted: AtomicU64,
    invalid_strategy: AtomicU64,
    double_free_at_head: AtomicU64,
    unknown_pointer: AtomicU64,
    invalid_layout: AtomicU64,
    total: AtomicU64,
}

impl ErrorStats {
    const fn new() -> Self {
        Self {
            out_of_memory_os: AtomicU64::new(0),
            bucket_exhausted: AtomicU64::new(0),
            invalid_strategy: AtomicU64::new(0),
            double_free_at_head: AtomicU64::new(0),
            unknown_pointer: AtomicU64::new(0),
            invalid_layout: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    fn record(&self, kind: AllocErrorKind) {
        let counter = match kind {
            AllocErrorKind::OutOfMemoryOs => &self.out_of_memory_os,
            AllocErrorKind::BucketExhausted => &self.bucket_exhausted,
            AllocErrorKind::InvalidStrategy => &self.invalid_strategy,
            AllocErrorKind::DoubleFreeAtHead => &self.double_free_at_head,
            AllocErrorKind::UnknownPointer => &self.unknown_pointer,
            AllocErrorKind::InvalidLayout => &self.invalid_layout,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ErrorStatsSnapshot {
        ErrorStatsSnapshot {
            out_of_memory_os: self.out_of_memory_os.load(Ordering::Relaxed),
            bucket_exhausted: self.bucket_exhausted.load(Ordering::Relaxed),
            invalid_strategy: self.invalid_strategy.load(Ordering::Relaxed),
            double_free_at_head: self.double_free_at_head.load(Ordering::Relaxed),
            unknown_pointer: self.unknown_pointer.load(Ordering::Relaxed),
            invalid_layout: self.invalid_layout.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.out_of_memory_os.store(0, Ordering::Relaxed);
        self.bucket_exhausted.store(0, Ordering::Relaxed);
        self.invalid_strategy.store(0, Ordering::Relaxed);
        self.double_free_at_head.store(0, Ordering::Relaxed);
        self.unknown_pointer.store(0, Ordering::Relaxed);
        self.invalid_layout.store(0, Ordering::Relaxed);
        self.total.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorStatsSnapshot {
    pub out_of_memory_os: u64,
    pub bucket_exhausted: u64,
    pub invalid_strategy: u64,
    pub double_free_at_head: u64,
    pub unknown_pointer: u64,
    pub invalid_layout: u64,
    pub total: u64,
}

pub static ERROR_STATS: ErrorStats = ErrorStats::new();

/// Caller-location context captured at the point an error was built.
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext {
    #[cfg(feature = "std")]
    location: Option<&'static Location<'static>>,
    message: Option<&'static str>,
}

impl ErrorContext {
    #[cfg_attr(feature = "std", track_caller)]
    pub fn captured() -> Self {
        Self {
            #[cfg(feature = "std")]
            location: Some(Location::caller()),
            message: None,
        }
    }

    pub fn with_message(mut self, message: &'static str) -> Self {
        self.message = Some(message);
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[cfg(feature = "std")]
        if let Some(loc) = self.location {
            write!(f, "at {}:{}", loc.file(), loc.line())?;
        }
        if let Some(msg) = self.message {
            write!(f, " ({msg})")?;
        }
        Ok(())
    }
}

/// The error type returned by every fallible operation in this crate.
#[derive(Debug, Clone)]
pub struct AllocError {
    kind: AllocErrorKind,
    layout: Option<Layout>,
    context: Option<ErrorContext>,
    /// Captured at construction time, only under `backtrace-feature` —
    /// capturing a backtrace on every error is too expensive to do
    /// unconditionally on a hot error path. `Arc`-wrapped so `AllocError`
    /// stays cheaply `Clone` regardless of whether the underlying
    /// `backtrace::Backtrace` itself is.
    #[cfg(feature = "backtrace-feature")]
    backtrace: Option<std::sync::Arc<backtrace::Backtrace>>,
}

impl AllocError {
    #[cfg_attr(feature = "std", track_caller)]
    pub fn new(kind: AllocErrorKind) -> Self {
        ERROR_STATS.record(kind);
        Self {
            kind,
            layout: None,
            context: Some(ErrorContext::captured()),
            #[cfg(feature = "backtrace-feature")]
            backtrace: Some(std::sync::Arc::new(backtrace::Backtrace::new())),
        }
    }

    /// The backtrace captured when this error was constructed, if the
    /// `backtrace-feature` is enabled.
    #[cfg(feature = "backtrace-feature")]
    pub fn backtrace(&self) -> Option<&backtrace::Backtrace> {
        self.backtrace.as_deref()
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn with_message(mut self, message: &'static str) -> Self {
        self.context = Some(
            self.context
                .unwrap_or_else(ErrorContext::captured)
                .with_message(message),
        );
        self
    }

    pub fn kind(&self) -> AllocErrorKind {
        self.kind
    }

    pub fn layout(&self) -> Option<Layout> {
        self.layout
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.kind.severity()
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == ErrorSeverity::Critical
    }

    #[cfg_attr(feature = "std", track_caller)]
    pub fn out_of_memory(layout: Layout) -> Self {
        Self::new(AllocErrorKind::OutOfMemoryOs).with_layout(layout)
    }

    #[cfg_attr(feature = "std", track_caller)]
    pub fn invalid_layout(layout: Layout) -> Self {
        Self::new(AllocErrorKind::InvalidLayout).with_layout(layout)
    }

    #[cfg_attr(feature = "std", track_caller)]
    pub fn bucket_exhausted() -> Self {
        Self::new(AllocErrorKind::BucketExhausted)
    }

    #[cfg_attr(feature = "std", track_caller)]
    pub fn unknown_pointer() -> Self {
        Self::new(AllocErrorKind::UnknownPointer)
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        if let Some(layout) = self.layout {
            write!(f, " (size={}, align={})", layout.size(), layout.align())?;
        }
        if let Some(ctx) = &self.context {
            write!(f, " {ctx}")?;
        }
        Ok(())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AllocError {}

pub type AllocResult<T> = Result<T, AllocError>;

/// Adapter for attaching context to a `Result` without a `match`.
pub trait AllocResultExt<T> {
    fn context(self, message: &'static str) -> AllocResult<T>;
}

impl<T> AllocResultExt<T> for AllocResult<T> {
    fn context(self, message: &'static str) -> AllocResult<T> {
        self.map_err(|e| e.with_message(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_into_global_stats() {
        ERROR_STATS.reset();
        let _ = AllocError::new(AllocErrorKind::BucketExhausted);
        let snap = ERROR_STATS.snapshot();
        assert_eq!(snap.bucket_exhausted, 1);
        assert_eq!(snap.total, 1);
    }

    #[test]
    fn severities_are_ordered_sanely() {
        assert!(AllocErrorKind::BucketExhausted.severity() < AllocErrorKind::OutOfMemoryOs.severity());
    }

    #[test]
    fn display_includes_layout() {
        let layout = Layout::from_size_align(64, 8).unwrap();
        let err = AllocError::invalid_layout(layout);
        let msg = format!("{err}");
        assert!(msg.contains("64"));
        assert!(msg.contains('8'));
    }
}
