//! Built-in probes.
//!
//! | Probe                        | Default  | Needs       |
//! |------------------------------|----------|-------------|
//! | `extension`                  | enabled  | any version |
//! | `unexpected_superusers`      | enabled  | any version |
//! | `long_running_transactions`  | disabled | any version |
//! | `synchronized_standby_slots` | enabled  | 17+         |
//! | `postgres_binaries`          | disabled | any version |

pub mod binaries;
pub mod extension;
pub mod long_running;
pub mod standby_slots;
pub mod superusers;

pub use binaries::PostgresBinariesProbe;
pub use extension::{ExtensionProbe, select_databases};
pub use long_running::LongRunningTransactionsProbe;
pub use standby_slots::SynchronizedStandbySlotsProbe;
pub use superusers::UnexpectedSuperusersProbe;

use crate::error::ProbeResult;
use crate::registry::RegistryBuilder;

const DEFAULT_ENABLED: bool = true;
const DEFAULT_DISABLED: bool = false;

/// Adds every built-in probe to `builder`.
pub fn register_builtin(builder: &mut RegistryBuilder) -> ProbeResult<()> {
    builder
        .register(extension::SUBSYSTEM, DEFAULT_ENABLED, extension::construct)?
        .register(superusers::SUBSYSTEM, DEFAULT_ENABLED, superusers::construct)?
        .register(long_running::SUBSYSTEM, DEFAULT_DISABLED, long_running::construct)?
        .register(standby_slots::SUBSYSTEM, DEFAULT_ENABLED, standby_slots::construct)?
        .register(binaries::SUBSYSTEM, DEFAULT_DISABLED, binaries::construct)?;
    Ok(())
}
