//! Update pipeline: probe a server, fetch the manifests, diff them against the
//! live set, download changed bundles, then install.
//!
//! ```text
//! UpdateStateMachine::poll()
//!     │
//!     ├── VerifyUrl           worker::probe_urls        (Task)
//!     ├── DownloadMainConfig  worker::download_configs  (Task)
//!     ├── UpdateAssetBundle   DifferenceCalculator + Downloader
//!     ├── CopyCacheFile       install::promote_configs
//!     └── Dispose             ledger persistence, cache cleanup, relaunch
//! ```

mod install;
mod machine;
mod progress;
mod state;
mod worker;

pub use machine::{Observer, UpdateHandle, UpdateStateMachine, UpdateStatus};
pub use progress::StageWeights;
pub use state::UpdateState;
