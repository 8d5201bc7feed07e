//! Object-storage client contract shared by the storage backends.

mod driver;
mod error;

pub use driver::Driver;
pub use driver::Metadata;
pub use driver::MultipartUpload;
pub use driver::Page;
pub use driver::Part;
pub use driver::ReadStream;
pub use driver::Reader;
pub use driver::UploadId;
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
