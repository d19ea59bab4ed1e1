mod erase;
mod error;
mod fs_utils;
mod hardlinks;
mod install;
mod layout;
mod options;
mod payload;
mod progress;
mod receipts;
mod registry;
mod resolver;

pub use erase::remove_files;
pub use error::{EngineError, FileError, FileFailure, PathConflict, RunFailure, RunReport};
pub use install::install_files;
pub use layout::{RootLayout, NEW_SUFFIX, SAVE_SUFFIX};
pub use options::{ErrorPolicy, RunOptions};
pub use payload::{scan_tree, write_payload};
pub use progress::{ProgressEvent, ProgressPhase};
pub use receipts::{
    add_shared_from_receipts, read_install_receipt, read_install_receipts, read_installed_manifest,
    receipt_from_registry, registry_for_erase, remove_install_receipt, write_install_receipt,
    write_installed_manifest, InstallReceipt, ReceiptFile,
};
pub use registry::{FileAction, FileRegistry, FileState, SharedFile, SharedIter};
pub use resolver::{probe_disk, resolve_erase, resolve_install, Decision, DiskCondition};

#[cfg(test)]
mod tests;
