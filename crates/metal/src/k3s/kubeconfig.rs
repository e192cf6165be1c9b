//! Kubeconfig rewriting.
//!
//! k3s writes its admin kubeconfig for local use (`https://127.0.0.1:6443`).
//! Every cluster server pointing at a loopback address is rewritten to the
//! control plane's real address.

use serde_yaml::Value;
use url::{Host, Url};

use crate::config::url_host;
use crate::error::{Error, Result};

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(d)) => d.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

/// Point every loopback `server:` entry at `host`.
///
/// # Errors
///
/// Returns an error if the kubeconfig is not valid YAML, has no clusters,
/// or `host` cannot be used in a URL.
pub fn rewrite_server_address(kubeconfig: &str, host: &str) -> Result<String> {
    let mut doc: Value = serde_yaml::from_str(kubeconfig)?;
    let target = url_host(host);

    let clusters = doc
        .get_mut("clusters")
        .and_then(Value::as_sequence_mut)
        .ok_or_else(|| Error::command("read kubeconfig", "kubeconfig has no clusters"))?;

    for entry in clusters.iter_mut() {
        let Some(server) = entry
            .get_mut("cluster")
            .and_then(|c| c.get_mut("server"))
        else {
            continue;
        };
        let Some(current) = server.as_str() else {
            continue;
        };
        let mut url = Url::parse(current).map_err(|e| {
            Error::command("read kubeconfig", format!("bad server URL {current}: {e}"))
        })?;
        if is_loopback(&url) {
            url.set_host(Some(&target))
                .map_err(|e| Error::validation(format!("cannot use host {host} in a URL: {e}")))?;
            // Url keeps a trailing slash on bare origins; kubectl doesn't want it.
            *server = Value::String(url.as_str().trim_end_matches('/').to_string());
        }
    }

    Ok(serde_yaml::to_string(&doc)?)
}
