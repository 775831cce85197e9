//! imgpool Storage Service
//!
//! Image storage core for imgpool. Uploads are stored as originals on a blob
//! backend (local filesystem or S3), described by a metadata record, and
//! converted to WebP and AVIF in the background. Images can be picked at
//! random by orientation and tags, listed page by page, and expire on a
//! schedule.
//!
//! ## Features
//!
//! - **Interchangeable blob backends**: local directory tree or S3-compatible
//!   bucket with multipart upload, batch delete and paginated listing
//! - **Dual metadata backend**: JSON documents next to the blobs, optionally
//!   fronted by a Redis index for tags, recency and expiry
//! - **Background conversion**: bounded worker pool shelling out to `cwebp`
//!   and `avifenc`
//! - **Expiry sweeps**: periodic and on-demand removal of expired images
//! - **Random selection**: uniform pick with tag filters and format fallback
//!
//! ## Architecture
//!
//! ```text
//!  upload ──▶ ┌──────────────┐  put   ┌──────────────┐
//!             │ ImageService │───────▶│ BlobStore    │◀──────────────┐
//!             └──────────────┘        │ local | s3   │               │
//!                │    │    │          └──────────────┘               │
//!                │    │    │ record   ┌──────────────┐               │
//!                │    │    └─────────▶│ Metadata     │◀──────┐       │
//!                │    │               │ redis + scan │       │       │
//!                │    │ job           └──────────────┘       │       │
//!                │    ▼                      ▲               │       │
//!                │  ┌──────────────┐ attach  │               │       │
//!                │  │ Conversion   │─────────┘               │       │
//!                │  │ Pipeline     │─────────────────────────┼───────┘
//!                │  └──────────────┘                         │
//!                ▼                                           │
//!  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐      │
//!  │ Random       │  │ Listing      │  │ Expiry       │──────┘
//!  │ Selector     │  │ + Cache      │  │ Cleaner      │
//!  └──────────────┘  └──────────────┘  └──────────────┘
//! ```

pub mod blob_store;
pub mod cache;
pub mod cleanup;
pub mod clock;
pub mod config;
pub mod conversion;
pub mod error;
pub mod layout;
pub mod listing;
pub mod metadata;
pub mod model;
pub mod purge;
pub mod selector;
pub mod service;

pub use blob_store::{BlobStore, LocalBlobStore, S3BlobStore, StorageError};
pub use cleanup::{CleanupReport, ExpiryCleaner};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use conversion::{CommandEncoder, ConversionError, ConversionPipeline, Encoder};
pub use error::ImageError;
pub use listing::{FormatFilter, ImageSummary, ListingPage, ListingQuery};
pub use metadata::{IndexedMetadataStore, MetadataStore, RedisMetadataStore, ScanMetadataStore};
pub use model::{ImageRecord, Orientation, Rendition, SourceFormat};
pub use selector::{DeviceClass, FormatPreference, SelectedImage, SelectionRequest};
pub use service::{DeleteReceipt, ImageService, ShutdownReport, UploadReceipt};
