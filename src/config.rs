//! A global store of flags that can impact the analysis.
//!
//! WARNING: Currently only supports a single consistent configuration amongst threads (i.e., cannot
//! have different configurations for different analysis executions in the same process).

/// The global configuration store. Its fields are expected to be accessed across the program via
/// the global [`CONFIG`](static@CONFIG).
pub struct AnalysisConfig {
    /// Warn when a candidate-pass run claims basic blocks that an earlier run already claimed.
    /// The earlier claim always wins; the warning exists to surface overlapping-but-not-nested
    /// reachable sets for inspection.
    pub warn_on_overlapping_claims: bool,
    /// Run the CFG consistency check on the committed model (every DirectBranch destination must
    /// be the source of some edge of the same function). Violations are logged, never fatal.
    pub enable_cfg_verification: bool,
    /// Whether a BrokenReturn terminator counts as returning to the caller for the purposes of
    /// the noreturn proof. Disabling this treats functions whose only exits are broken returns as
    /// noreturn, which is occasionally right for binaries with heavily non-standard epilogues.
    pub broken_return_counts_as_return: bool,
    /// Keep candidate function entry points whose only jump-target evidence is ReturnAddress.
    /// Such addresses are almost always just the fallthrough of a call, hence off by default.
    pub keep_return_address_candidates: bool,
    /// Log every entry scheduled and every summary replacement during the interprocedural fixed
    /// point (very noisy).
    pub trace_fixed_point: bool,
}

impl AnalysisConfig {
    /// Internal method: sets up initialization
    #[allow(static_mut_refs)]
    fn from_initialized() -> Self {
        let init = unsafe {
            INTERNAL_CONFIG_INITIALIZER
                .take()
                .expect("Should be initialized only once")
        };
        init.unwrap_or_default()
    }

    /// Initialize with the given command line configuration. Should only be called once, and should
    /// only be called from `main`.
    #[allow(static_mut_refs)]
    pub fn initialize(command_line_config: Vec<CommandLineAnalysisConfig>) {
        let prev = unsafe { INTERNAL_CONFIG_INITIALIZER.replace(Some(command_line_config.into())) };
        assert!(prev.is_some(), "Performed double initialization");
        lazy_static::initialize(&CONFIG);
    }
}

/// Internal initialization detail.
static mut INTERNAL_CONFIG_INITIALIZER: Option<Option<AnalysisConfig>> = Some(None);

lazy_static::lazy_static! {
    /// The global configuration store
    pub static ref CONFIG: AnalysisConfig = AnalysisConfig::from_initialized();
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Analysis configuration parameters
pub enum CommandLineAnalysisConfig {
    DisableOverlapWarnings,
    DisableCfgVerification,
    BrokenReturnIsNotAReturn,
    KeepReturnAddressCandidates,
    EnableFixedPointTracing,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            warn_on_overlapping_claims: true,
            enable_cfg_verification: true,
            broken_return_counts_as_return: true,
            keep_return_address_candidates: false,
            trace_fixed_point: false,
        }
    }
}

impl From<Vec<CommandLineAnalysisConfig>> for AnalysisConfig {
    fn from(v: Vec<CommandLineAnalysisConfig>) -> Self {
        use CommandLineAnalysisConfig::*;
        let mut r = AnalysisConfig::default();
        for v in v {
            match v {
                DisableOverlapWarnings => {
                    r.warn_on_overlapping_claims = false;
                }
                DisableCfgVerification => {
                    r.enable_cfg_verification = false;
                }
                BrokenReturnIsNotAReturn => {
                    r.broken_return_counts_as_return = false;
                }
                KeepReturnAddressCandidates => {
                    r.keep_return_address_candidates = true;
                }
                EnableFixedPointTracing => {
                    r.trace_fixed_point = true;
                }
            }
        }
        r
    }
}
