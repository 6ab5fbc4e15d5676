//! The streaming transfer engine between clients and the backend.
//!
//! Downloads bridge the backend's push-streamed response body to the
//! pull-oriented client read model; uploads bridge pushed client writes to a
//! single chunked backend PUT. Both directions are buffer-bounded with
//! explicit backpressure in each direction.

pub mod download;
pub mod upload;

pub use download::{
    into_async_read, DownloadReceiver, IdleTimeoutStream, DOWNLOAD_BUFFER_LIMIT,
    IDLE_CHUNK_TIMEOUT,
};
pub use upload::{UploadSender, BUFFER_WRITES_RESUME, MAX_BUFFER_WRITES};
