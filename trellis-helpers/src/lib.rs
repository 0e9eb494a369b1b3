//! # Trellis Helpers
//!
//! Long-running operations on top of a [`Transport`]: a sliced scroll over a
//! whole index and parallel bulk indexing of a document source. Both run in a
//! background task and deliver results as a [`Stream`](futures::Stream).
//!
//! ## Features
//!
//! - **Scroll All**: sliced scrolls, fetched in parallel, each slice strictly in page order
//! - **Bulk All**: lazy batching, bounded parallelism, back-off for rejected documents
//! - **Back-pressure**: producers pause until the consumer catches up
//! - **Cancellation**: one token per session; dropping the stream stops it
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use serde::Deserialize;
//! use std::sync::Arc;
//! use trellis_helpers::prelude::*;
//! use trellis_transport::{Node, PoolOptions, StaticPool, Transport, TransportSettings};
//!
//! #[derive(Debug, Deserialize)]
//! struct Log {
//!     message: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = Arc::new(StaticPool::new(vec![Node::parse("http://localhost:9200")?])?);
//!     let transport = Transport::new(pool, TransportSettings::default())?;
//!
//!     let back_pressure = Arc::new(BackPressure::new(2, None));
//!     let request = ScrollAllRequest::new("logs", 4)
//!         .max_degree_of_parallelism(2)
//!         .back_pressure(Arc::clone(&back_pressure));
//!
//!     let mut pages = transport.scroll_all::<Log>(request)?;
//!     while let Some(page) = pages.next().await {
//!         let page = page?;
//!         println!("slice {} page {}: {} hits", page.slice, page.page, page.hits.len());
//!         back_pressure.release();
//!     }
//!     Ok(())
//! }
//! ```

mod backpressure;
mod bulk_all;
mod error;
mod scroll_all;
mod stream;

pub use backpressure::{BackPressure, DEFAULT_BACK_PRESSURE_FACTOR};
pub use bulk_all::{
    BulkAll, BulkAllRequest, BulkAllResponse, BulkItemError, BulkItemStatus, BulkResponseItem,
    DEFAULT_BACK_OFF_TIME, DEFAULT_BULK_PARALLELISM, DEFAULT_BULK_SIZE, DocumentIdFn,
    RetryDocumentPredicate, bulk_all,
};
pub use error::{HelperError, Result};
pub use scroll_all::{
    DEFAULT_SCROLL, DEFAULT_SCROLL_SIZE, Hit, ScrollAll, ScrollAllPage, ScrollAllRequest,
    scroll_all,
};
pub use stream::HelperStream;

use serde::Serialize;
use serde::de::DeserializeOwned;
use trellis_transport::Transport;

/// Helper sessions started straight from a [`Transport`].
pub trait TransportHelpersExt {
    /// See [`scroll_all`].
    fn scroll_all<T>(&self, request: ScrollAllRequest) -> Result<ScrollAll<T>>
    where
        T: DeserializeOwned + Send + 'static;

    /// See [`bulk_all`].
    fn bulk_all<D>(&self, request: BulkAllRequest<D>) -> Result<BulkAll>
    where
        D: Serialize + Send + 'static;
}

impl TransportHelpersExt for Transport {
    fn scroll_all<T>(&self, request: ScrollAllRequest) -> Result<ScrollAll<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        scroll_all::scroll_all(self, request)
    }

    fn bulk_all<D>(&self, request: BulkAllRequest<D>) -> Result<BulkAll>
    where
        D: Serialize + Send + 'static,
    {
        bulk_all::bulk_all(self, request)
    }
}

/// Prelude for common imports.
pub mod prelude {
    pub use crate::{
        BackPressure, BulkAllRequest, BulkAllResponse, HelperError, ScrollAllPage,
        ScrollAllRequest, TransportHelpersExt,
    };
}
