//! Version and build information

use std::fmt;

/// Build metadata embedded by `build.rs`
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    /// Short git revision, or "unknown" outside a checkout
    pub git_hash: &'static str,
    git_dirty: &'static str,
    pub build_timestamp: &'static str,
    pub target: &'static str,
    pub profile: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub const fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            git_hash: env!("DATAFLOW_GIT_HASH"),
            git_dirty: env!("DATAFLOW_GIT_DIRTY"),
            build_timestamp: env!("DATAFLOW_BUILD_TIMESTAMP"),
            target: env!("DATAFLOW_TARGET"),
            profile: env!("DATAFLOW_PROFILE"),
            rustc_version: env!("DATAFLOW_RUSTC_VERSION"),
        }
    }

    pub fn git_dirty(&self) -> bool {
        self.git_dirty == "true"
    }

    /// Version plus revision, e.g. "0.1.0-abc12345"
    pub fn full_version(&self) -> String {
        let dirty = if self.git_dirty() { "-dirty" } else { "" };
        format!("{}-{}{}", self.version, self.git_hash, dirty)
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.name, self.full_version())?;
        writeln!(f)?;
        writeln!(f, "Build Information:")?;
        writeln!(f, "  Git Hash:  {}", self.git_hash)?;
        writeln!(f, "  Built:     {}", self.build_timestamp)?;
        writeln!(f, "  Profile:   {}", self.profile)?;
        writeln!(f, "  Target:    {}", self.target)?;
        writeln!(f, "  Compiler:  {}", self.rustc_version)
    }
}

pub fn build_info() -> BuildInfo {
    BuildInfo::current()
}

pub fn print_version() {
    print!("{}", build_info());
}
