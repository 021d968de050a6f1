//! Network access shared by repository sources, update checks and installs

mod error;
mod http;

pub use error::HttpError;
pub use http::{
    backoff_delay, hide_token, HttpClient, HttpResponse, HttpTransport, ReqwestTransport,
    CONNECT_TIMEOUT, MAX_RATE_LIMIT_RETRIES, READ_TIMEOUT, REQUEST_TIMEOUT,
};

use std::sync::atomic::{AtomicBool, Ordering};

/// Reports whether the device can reach the network
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Assumes the network is always reachable
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

impl Connectivity for AtomicBool {
    fn is_online(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}
