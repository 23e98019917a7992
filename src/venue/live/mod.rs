pub mod cex;
pub mod chain;

pub use cex::{CexHttpClient, LiveCexInterface, LiveCexReader};
pub use chain::{ChainGatewayClient, LiveChainInterface, LiveChainReader};

use crate::error::VenueError;

/// Map a transport-level failure onto the venue error taxonomy.
pub(crate) fn map_reqwest_error(e: reqwest::Error) -> VenueError {
    if e.is_timeout() {
        VenueError::Timeout(0)
    } else {
        VenueError::Network(e.to_string())
    }
}

/// Map an HTTP status + body onto the venue error taxonomy.
pub(crate) fn map_status_error(status: reqwest::StatusCode, body: &str) -> VenueError {
    if status.as_u16() == 429 || status.as_u16() == 418 {
        VenueError::RateLimited(format!("{status}: {body}"))
    } else if status.is_client_error() {
        VenueError::InvalidOrder(format!("{status}: {body}"))
    } else {
        VenueError::Network(format!("{status}: {body}"))
    }
}
