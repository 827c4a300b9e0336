//! A global store of knobs that can impact the analysis.
//!
//! WARNING: Currently only supports a single consistent configuration amongst threads (i.e.,
//! cannot have different configurations for different analyses in the same process).

/// The global configuration store. Its fields are expected to be accessed across the crate via
/// the global [`CONFIG`](static@CONFIG).
pub struct AnalysisConfig {
    /// Hard cap on the number of sweeps over the control flow graph. When the cap is reached
    /// the analyzer warns and terminates with whatever facts have accumulated.
    pub max_sweeps: usize,
    /// How many consecutive sweeps must leave every block's out-set unchanged before the
    /// analysis is considered to have reached its fixed point. A single unchanged sweep can be
    /// a coincidence in cyclic control flow.
    pub stable_sweeps: usize,
    /// Clear the reaching definitions at inline-assembly statements. Strictly required for
    /// soundness, since the effects of inline assembly are opaque; keeping the definitions
    /// usually leads to better downstream code, so this defaults to `false`.
    pub clear_definitions_at_inline_assembly: bool,
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

    /// Initialize the global configuration. Should be called at most once, before the first
    /// analysis runs; if never called, the defaults apply.
    #[allow(static_mut_refs)]
    pub fn initialize(config: AnalysisConfig) {
        let prev = unsafe { INTERNAL_CONFIG_INITIALIZER.replace(Some(config)) };
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

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            max_sweeps: 30,
            stable_sweeps: 3,
            clear_definitions_at_inline_assembly: false,
        }
    }
}
