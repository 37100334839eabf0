//! Bulk transfers: chunked flash access and firmware update

pub mod firmware;
pub mod flash;

pub use firmware::{pad_image, FirmwareUpdater, UpdateReport, BLOCK_SIZE};
pub use flash::{FlashAccess, FlashTransfer, TransferReport, MAX_STORED_LENGTH};
