//! Configuration Module - Entry Barrier Parameters
//!
//! Tunables for the barrier service. Everything has a sensible default;
//! the environment can override the diagnostic switches at startup.

use crate::codec::PatchingType;

/// Main configuration for the entry barrier service
///
/// # Examples
///
/// ```rust
/// use entry_barrier::config::BarrierConfig;
///
/// // Defaults
/// let config = BarrierConfig::default();
/// assert!(config.validate().is_ok());
///
/// // Diagnostic configuration
/// let config = BarrierConfig {
///     verify_barriers: true,
///     deoptimize_a_lot: true,
///     wrong_method_stub: 0x4000,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct BarrierConfig {
    /// Patching strategy
    ///
    /// If None, the codec's default for the instruction set is used.
    ///
    /// Default: None
    pub patching_type: Option<PatchingType>,

    /// Verify the barrier template every time a guard is located
    ///
    /// A mismatch aborts the process. Production builds skip the check on
    /// the hot path.
    ///
    /// Default: true in debug builds, false in release builds
    pub verify_barriers: bool,

    /// Deoptimize every tenth non-OSR slow-path entry
    ///
    /// Stress mode for the resolution path.
    /// Default: false
    pub deoptimize_a_lot: bool,

    /// Record structured barrier events in the global logger
    ///
    /// Default: false
    pub trace_events: bool,

    /// Maintain barrier statistics
    ///
    /// Default: true
    pub stats_enabled: bool,

    /// Size of the executable region backing the code cache, in bytes
    ///
    /// Rounded up to whole pages.
    /// Default: 1MB
    pub code_cache_size: usize,

    /// Address of the wrong-method resolution stub
    ///
    /// Written into the return path of deoptimized activations.
    /// Default: a placeholder that must be replaced before generated code
    /// runs
    pub wrong_method_stub: usize,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        BarrierConfig {
            patching_type: None,
            verify_barriers: cfg!(debug_assertions),
            deoptimize_a_lot: false,
            trace_events: false,
            stats_enabled: true,
            code_cache_size: MB,
            wrong_method_stub: UNRESOLVED_STUB,
        }
    }
}

impl BarrierConfig {
    /// Validate configuration
    ///
    /// # Examples
    ///
    /// ```rust
    /// use entry_barrier::config::BarrierConfig;
    ///
    /// let config = BarrierConfig {
    ///     wrong_method_stub: 0,  // Invalid!
    ///     ..Default::default()
    /// };
    ///
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wrong_method_stub == 0 {
            return Err(ConfigError::InvalidStubAddress(
                "wrong_method_stub must be non-zero".to_string(),
            ));
        }

        if self.code_cache_size < page_size::get() {
            return Err(ConfigError::InvalidCodeCacheSize(format!(
                "code_cache_size must be at least one page ({} bytes)",
                page_size::get()
            )));
        }

        Ok(())
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with environment variables:
    /// - EBAR_PATCHING (`stw`, `conc_instruction_and_data`, `conc_data`)
    /// - EBAR_VERIFY
    /// - EBAR_DEOPT_A_LOT
    /// - EBAR_TRACE
    /// - EBAR_CODE_CACHE_SIZE
    ///
    /// # Examples
    ///
    /// ```bash
    /// export EBAR_PATCHING=conc_data
    /// export EBAR_VERIFY=1
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("EBAR_PATCHING") {
            config.patching_type = Some(
                PatchingType::parse(&val).ok_or(ConfigError::UnknownPatchingType(val))?,
            );
        }

        if let Ok(val) = std::env::var("EBAR_VERIFY") {
            config.verify_barriers = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("EBAR_DEOPT_A_LOT") {
            config.deoptimize_a_lot = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("EBAR_TRACE") {
            config.trace_events = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("EBAR_CODE_CACHE_SIZE") {
            config.code_cache_size = val.parse::<usize>().map_err(|_| {
                ConfigError::InvalidCodeCacheSize(format!("EBAR_CODE_CACHE_SIZE={}", val))
            })?;
        }

        Ok(config)
    }
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown patching type: {0}")]
    UnknownPatchingType(String),

    #[error("Invalid stub address: {0}")]
    InvalidStubAddress(String),

    #[error("Invalid code cache size: {0}")]
    InvalidCodeCacheSize(String),
}

const MB: usize = 1024 * 1024;

/// Recognizable non-null address for a stub that was never bound
const UNRESOLVED_STUB: usize = 0xdead_0000;

fn parse_flag(val: &str) -> bool {
    val == "1" || val.eq_ignore_ascii_case("true")
}
