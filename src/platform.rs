//! Sandbox architectures.
//!
//! The general-purpose runtime is shipped as one WebAssembly binary per
//! emulated guest architecture. Image conversion prefers manifests for these
//! architectures, in [`Arch::PREFERRED`] order.

use std::fmt;
use std::str::FromStr;

/// Guest CPU architecture emulated by a runtime-mode sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Arch {
    #[default]
    Amd64,
    Riscv64,
}

impl Arch {
    /// Supported architectures, in manifest selection order.
    pub const PREFERRED: [Arch; 2] = [Arch::Amd64, Arch::Riscv64];

    /// Returns the OCI architecture string (e.g., "amd64").
    pub fn as_oci(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Riscv64 => "riscv64",
        }
    }

    /// Returns true if `arch` names a supported sandbox architecture.
    pub fn is_supported(arch: &str) -> bool {
        arch.parse::<Arch>().is_ok()
    }

    /// Returns the sandbox architecture closest to the host.
    ///
    /// Hosts without a matching guest architecture fall back to amd64, the
    /// default runtime.
    pub fn host() -> Self {
        #[cfg(target_arch = "riscv64")]
        return Arch::Riscv64;

        #[cfg(not(target_arch = "riscv64"))]
        return Arch::Amd64;
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd64" | "x86_64" => Ok(Arch::Amd64),
            "riscv64" => Ok(Arch::Riscv64),
            other => Err(format!("unsupported sandbox architecture '{}'", other)),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_oci())
    }
}
