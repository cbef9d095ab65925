//! Hop-by-hop header handling and protocol upgrades (`kubectl exec`,
//! `attach`, `port-forward`).

use hyper::header::{HeaderName, HeaderValue, CONNECTION, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::HeaderMap;
use hyper_util::rt::TokioIo;
use tracing::{debug, error};

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Removes hop-by-hop headers and every header named in `Connection`.
///
/// Returns the protocol of a requested upgrade, which is kept as
/// `Connection: Upgrade` plus its `Upgrade` value.
pub fn remove_hop_by_hop(headers: &mut HeaderMap) -> Option<HeaderValue> {
    let upgrade = requested_upgrade(headers);

    let listed: Vec<HeaderName> = connection_tokens(headers)
        .filter_map(|name| HeaderName::try_from(name).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }

    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
    headers.remove(UPGRADE);

    if let Some(protocol) = &upgrade {
        restore_upgrade(headers, protocol.clone());
    }
    upgrade
}

fn restore_upgrade(headers: &mut HeaderMap, protocol: HeaderValue) {
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, protocol);
}

fn requested_upgrade(headers: &HeaderMap) -> Option<HeaderValue> {
    if connection_tokens(headers).any(|token| token.eq_ignore_ascii_case("upgrade")) {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

fn connection_tokens(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Splices the client and upstream connections once both sides have
/// switched protocols, until either side closes.
pub fn spawn_bridge(client: OnUpgrade, upstream: OnUpgrade) {
    tokio::spawn(async move {
        let (client, upstream) = match tokio::try_join!(client, upstream) {
            Ok(upgraded) => upgraded,
            Err(error) => {
                error!("Failed to complete protocol upgrade: {error}");
                return;
            }
        };

        let mut client = TokioIo::new(client);
        let mut upstream = TokioIo::new(upstream);
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((from_client, from_upstream)) => debug!(
                "Upgraded connection closed, {from_client} bytes sent and {from_upstream} received"
            ),
            Err(error) => debug!("Upgraded connection failed: {error}"),
        }
    });
}
