pub mod codec;
pub mod store;

pub use codec::MetadataHeader;
pub use store::{MetadataStore, StoredCopy};
