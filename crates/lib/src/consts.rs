//! Crate-wide constants.

/// Application name, used for directory names and environment variable prefixes.
pub const APP_NAME: &str = "kiln";

/// Version byte string mixed into every rule key.
///
/// Bump this whenever the canonical encoding in [`crate::rulekey`] changes so
/// keys produced by older engines never collide with new ones.
pub const RULE_KEY_VERSION: &str = "kiln-rulekey-v1";

/// Directory under the output root that holds per-rule output scopes.
pub const GEN_DIR: &str = "gen";

/// Default output root directory name, relative to the cell root.
pub const DEFAULT_OUT_DIR: &str = "kiln-out";

/// Manifest file written into every on-disk cache entry.
pub const CACHE_ENTRY_MANIFEST: &str = "entry.json";

/// Subdirectory of a cache entry that holds the artifact files.
pub const CACHE_ENTRY_FILES: &str = "files";

/// Environment variable overriding the number of concurrently executing rules.
pub const ENV_JOBS: &str = "KILN_JOBS";

/// Environment variable overriding the output root.
pub const ENV_OUT_DIR: &str = "KILN_OUT_DIR";

/// Environment variable enabling the on-disk local cache at the given path.
pub const ENV_CACHE_DIR: &str = "KILN_CACHE_DIR";

/// Environment variable overriding the shell used by shell steps.
pub const ENV_SHELL: &str = "KILN_SHELL";

/// Reproducible timestamp handed to shell steps (1980-01-01, the ZIP epoch).
pub const SOURCE_DATE_EPOCH: &str = "315532800";
