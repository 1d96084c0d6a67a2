//! Link listener port allocation.

use crate::constants::PORT_BIND_ATTEMPTS;
use crate::error::{Error, Result};
use rand::Rng;
use std::net::{Ipv4Addr, TcpListener};
use tracing::debug;

/// Binds a loopback listener on a random free port in `range` (inclusive).
///
/// Ports are tried at random until one binds, up to
/// [`PORT_BIND_ATTEMPTS`] times.
pub fn bind_listener(range: (u16, u16)) -> Result<(TcpListener, u16)> {
    let (low, high) = range;
    if low == 0 || low > high {
        return Err(Error::InvalidNetworkConfig(format!(
            "bad port range {}-{}",
            low, high
        )));
    }

    let mut rng = rand::thread_rng();
    let mut last_error = None;
    for _ in 0..PORT_BIND_ATTEMPTS {
        let port = rng.gen_range(low..=high);
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
            Ok(listener) => {
                debug!("Bound link listener on 127.0.0.1:{}", port);
                return Ok((listener, port));
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(Error::InvalidNetworkConfig(format!(
        "no free port in {}-{} after {} attempts: {}",
        low,
        high,
        PORT_BIND_ATTEMPTS,
        last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string())
    )))
}
