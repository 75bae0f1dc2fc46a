//! Decides whether push delivery is attempted at all.
//!
//! Production hosting does not keep long-lived sockets alive reliably, so
//! only recognized development hosts get push; everything else polls.

use chat_config_and_utils::TransportMode;
use std::net::IpAddr;
use url::Url;

/// True only for local-development hostnames.
pub fn is_push_transport_enabled(hostname: &str) -> bool {
    let host = hostname
        .trim()
        .trim_end_matches('.')
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();

    if host.is_empty() {
        return false;
    }

    if host == "localhost" || host.ends_with(".localhost") || host.ends_with(".local") {
        return true;
    }

    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback() || ip.is_unspecified(),
        Err(_) => false,
    }
}

/// Apply the configured transport mode to a deployment URL.
///
/// `Auto` defers to [`is_push_transport_enabled`]; an unparseable URL in
/// `Auto` mode fails closed.
pub fn resolve_push_enabled(mode: TransportMode, app_url: &str) -> bool {
    match mode {
        TransportMode::Push => true,
        TransportMode::Polling => false,
        TransportMode::Auto => Url::parse(app_url)
            .ok()
            .and_then(|url| url.host_str().map(is_push_transport_enabled))
            .unwrap_or(false),
    }
}
