//
// src/proxy/mod.rs
//
mod access_log;
mod backend;
mod pool;
mod proxy;

pub use backend::BackendServer;
pub use pool::BackendPool;
pub use proxy::{ClientAddr, ForwardRequest, LoadBalancer, ProxyError, MAX_ATTEMPTS};

use std::any::Any;

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
