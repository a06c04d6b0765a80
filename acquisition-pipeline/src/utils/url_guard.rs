use std::net::IpAddr;

use tracing::warn;

/// Rejects image URLs that are not plain http(s) or that point into loopback,
/// private or link-local networks. Returns the host on success.
pub fn ensure_download_url_allowed(url: &url::Url) -> Result<String, String> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            warn!(%url, %scheme, "Rejected image URL due to unsupported scheme");
            return Err(format!("unsupported URL scheme '{scheme}'"));
        }
    }

    let Some(host) = url.host_str() else {
        warn!(%url, "Rejected image URL missing host");
        return Err("URL is missing a host component".to_string());
    };

    if host.eq_ignore_ascii_case("localhost") {
        warn!(%url, host, "Rejected image URL to localhost");
        return Err("host is not allowed".to_string());
    }

    let bare_host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare_host.parse::<IpAddr>() {
        let is_disallowed = match ip {
            IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
            IpAddr::V6(v6) => v6.is_unique_local() || v6.is_unicast_link_local(),
        };
        if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() || is_disallowed {
            warn!(%url, host, %ip, "Rejected image URL pointing to restricted network range");
            return Err("host is not allowed".to_string());
        }
    }

    Ok(host.to_string())
}
