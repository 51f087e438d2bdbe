//! Encrypted persistence: key provisioning, envelope codec and record store

mod codec;
mod key;
mod manager;
mod records;
mod store;

pub use codec::EncryptionCodec;
pub use key::{EncryptionKey, KEY_LEN};
pub use manager::{KeyManager, KeySource};
pub use records::{Attachment, ChatMessage, ConversationLog, UsageStats};
pub use store::{RecordStore, VaultScan, validate_record_name};
