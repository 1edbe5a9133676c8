//! Partitioned Parquet writer and object-storage uploader.
//!
//! Groups a transformed dataset by day, encodes each group to Parquet in a
//! scratch directory and publishes the files through OpenDAL.

mod encoding;
mod partition;
mod scratch;
mod storage;
mod upload;

pub use encoding::{dataset_to_record_batch, encode_parquet, writer_properties};
pub use partition::{Artifact, PartitionKey, PartitionWriter, RunId, WrittenPartitions};
pub use scratch::ScratchDir;
pub use storage::build_operator;
pub use upload::{object_key, ObjectStoreUploader, UploadDescriptor, UploadError, Uploader};
