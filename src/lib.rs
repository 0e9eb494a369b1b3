//! Trellis - a resilient transport for OpenSearch clients
//!
//! Connection pools that track node health, pinging and sniffing, a failover
//! request pipeline, and scroll/bulk helpers paced by back-pressure.

// Re-export the transport
pub use trellis_transport::*;

// Re-export optional crates
#[cfg(feature = "helpers")]
pub use trellis_helpers as helpers;

#[cfg(feature = "testing")]
pub use trellis_testing as testing;

// Prelude for common imports
pub mod prelude {
    pub use trellis_transport::prelude::*;

    #[cfg(feature = "helpers")]
    pub use trellis_helpers::prelude::*;
}
