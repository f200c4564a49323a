//! SSRF-guarded outbound HTTP.
//!
//! Webhook deliveries, AI context fetches, and custom actions all leave the
//! platform through this client. URLs are validated twice: structurally at
//! submit time (scheme, hostname, literal-IP denylist) and again at dial
//! time after DNS resolution, so a public name rebinding to a private
//! address is still refused. A fresh transport is built per request, so no
//! connection state carries over between tenants.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use omc_core::{Error, Result};
use tokio::net::lookup_host;
use url::{Host, Url};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Response surface the callers need: status plus body text.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Clone)]
pub struct SafeHttpClient {
    allow_internal: bool,
    user_agent: String,
}

impl SafeHttpClient {
    pub fn new(allow_internal: bool, user_agent: impl Into<String>) -> Self {
        Self {
            allow_internal,
            user_agent: user_agent.into(),
        }
    }

    /// Structural validation, also used at webhook CRUD time: http(s) only,
    /// non-empty hostname, and no literal internal hosts.
    pub fn validate_url(&self, raw: &str) -> Result<Url> {
        let url = Url::parse(raw)
            .map_err(|err| Error::invalid_input("invalid URL").with_source(err))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(Error::invalid_input("URL scheme must be http or https"));
        }

        let host = url
            .host()
            .ok_or_else(|| Error::invalid_input("URL must have a hostname"))?;

        if !self.allow_internal {
            match host {
                Host::Domain(name) => {
                    let lower = name.to_ascii_lowercase();
                    if lower == "localhost"
                        || lower.ends_with(".local")
                        || lower.ends_with(".internal")
                    {
                        return Err(internal_address_error());
                    }
                }
                Host::Ipv4(ip) => {
                    if is_internal_ip(IpAddr::V4(ip)) {
                        return Err(internal_address_error());
                    }
                }
                Host::Ipv6(ip) => {
                    if is_internal_ip(IpAddr::V6(ip)) {
                        return Err(internal_address_error());
                    }
                }
            }
        }

        Ok(url)
    }

    /// POSTs a JSON body with per-webhook headers. `headers` are applied
    /// after the defaults so a configured header can override them.
    pub async fn post_json(
        &self,
        raw_url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<HttpResponse> {
        let url = self.validate_url(raw_url)?;
        let client = self.pinned_client(&url, timeout).await?;

        let mut request = client
            .post(url)
            .header("Content-Type", "application/json")
            .header("User-Agent", &self.user_agent);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|err| Error::upstream("request failed").with_source(err))?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(HttpResponse { status, body })
    }

    /// GET used by AI API contexts to pull supplementary data.
    pub async fn get(&self, raw_url: &str, timeout: Duration) -> Result<HttpResponse> {
        let url = self.validate_url(raw_url)?;
        let client = self.pinned_client(&url, timeout).await?;

        let response = client
            .get(url)
            .header("User-Agent", &self.user_agent)
            .send()
            .await
            .map_err(|err| Error::upstream("request failed").with_source(err))?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(HttpResponse { status, body })
    }

    /// Resolves the host, rejects if any address is internal, and returns a
    /// client pinned to the first allowed address so the connection cannot
    /// be re-resolved elsewhere between check and dial.
    async fn pinned_client(&self, url: &Url, timeout: Duration) -> Result<reqwest::Client> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::invalid_input("URL must have a hostname"))?
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();
        let port = url.port_or_known_default().unwrap_or(443);

        let mut builder = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout);

        if !self.allow_internal {
            let addrs: Vec<SocketAddr> = lookup_host((host.as_str(), port))
                .await
                .map_err(|err| Error::upstream("DNS resolution failed").with_source(err))?
                .collect();
            if addrs.is_empty() {
                return Err(Error::upstream("hostname resolved to no addresses"));
            }
            if let Some(blocked) = addrs.iter().find(|a| is_internal_ip(a.ip())) {
                tracing::warn!(host = %host, addr = %blocked.ip(), "blocked request to internal address");
                return Err(internal_address_error());
            }
            builder = builder.resolve_to_addrs(&host, &addrs[..1]);
        }

        builder
            .build()
            .map_err(|err| Error::internal("http client build failed").with_source(err))
    }
}

fn internal_address_error() -> Error {
    Error::invalid_input("URL must not point to internal addresses")
}

fn is_internal_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_internal_ip(IpAddr::V4(mapped));
            }
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique-local
                || (segments[0] & 0xfe00) == 0xfc00
                // fe80::/10 link-local
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SafeHttpClient {
        SafeHttpClient::new(false, "omnichat-test/0")
    }

    #[test]
    fn rejects_loopback_and_metadata_literals() {
        for url in [
            "http://127.0.0.1/hook",
            "http://[::1]/hook",
            "http://localhost/hook",
            "http://169.254.169.254/latest/meta-data",
            "http://10.0.0.1/hook",
            "http://192.168.1.5/hook",
            "http://0.0.0.0/hook",
            "http://internal.service.local/hook",
            "http://db.prod.internal/hook",
        ] {
            assert!(client().validate_url(url).is_err(), "should reject {url}");
        }
    }

    #[test]
    fn rejects_non_http_schemes_and_missing_host() {
        assert!(client().validate_url("ftp://example.com/x").is_err());
        assert!(client().validate_url("file:///etc/passwd").is_err());
        assert!(client().validate_url("not a url").is_err());
    }

    #[test]
    fn accepts_public_urls() {
        assert!(client().validate_url("https://hooks.example.com/x").is_ok());
        assert!(client().validate_url("http://93.184.216.34/x").is_ok());
    }

    #[test]
    fn allow_internal_bypasses_checks() {
        let open = SafeHttpClient::new(true, "omnichat-test/0");
        assert!(open.validate_url("http://127.0.0.1:8080/dev").is_ok());
        assert!(open.validate_url("http://localhost/dev").is_ok());
    }

    #[test]
    fn internal_ip_ranges() {
        for addr in [
            "127.0.0.1",
            "10.0.0.1",
            "172.16.0.1",
            "192.168.0.1",
            "169.254.169.254",
            "0.0.0.0",
            "::1",
            "fe80::1",
            "fc00::1",
            "::ffff:127.0.0.1",
        ] {
            let ip: IpAddr = addr.parse().unwrap();
            assert!(is_internal_ip(ip), "{addr} should be internal");
        }
        for addr in ["93.184.216.34", "2606:2800:220:1::1"] {
            let ip: IpAddr = addr.parse().unwrap();
            assert!(!is_internal_ip(ip), "{addr} should be public");
        }
    }
}
