use url::Url;

/// A parsed `stun:` / `turn:` style server reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUri {
    pub host: String,
    pub port: Option<u16>,
    /// `?transport=` query, when the URI pins one.
    pub transport: Option<String>,
}

/// Parse a server reference.
///
/// Accepts RFC 7064/7065 style URIs (`stun:host:port`,
/// `turn:host?transport=tcp`) as well as bare `host[:port]` strings.
///
/// ```
/// use icelink::uri::parse_server_uri;
///
/// let uri = parse_server_uri("turn:relay.example.org:3478?transport=tcp").unwrap();
/// assert_eq!(uri.host, "relay.example.org");
/// assert_eq!(uri.port, Some(3478));
/// assert_eq!(uri.transport.as_deref(), Some("tcp"));
///
/// let uri = parse_server_uri("stun.example.org").unwrap();
/// assert_eq!(uri.host, "stun.example.org");
/// assert_eq!(uri.port, None);
/// ```
pub fn parse_server_uri(uri: &str) -> anyhow::Result<ServerUri> {
    if let Ok(url) = Url::parse(uri)
        && matches!(url.scheme(), "stun" | "stuns" | "turn" | "turns")
    {
        let transport = url.query().and_then(|query| {
            query
                .split('&')
                .find_map(|pair| pair.strip_prefix("transport="))
                .map(str::to_string)
        });

        let (host, port) = split_host_port(url.path())?;
        return Ok(ServerUri {
            host,
            port,
            transport,
        });
    }

    let (host, port) = split_host_port(uri)?;
    Ok(ServerUri {
        host,
        port,
        transport: None,
    })
}

fn split_host_port(source: &str) -> anyhow::Result<(String, Option<u16>)> {
    let source = source.trim();
    if source.is_empty() {
        anyhow::bail!("empty server reference");
    }

    // bracketed ipv6 literal.
    if let Some(rest) = source.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow::anyhow!("unterminated ipv6 literal"))?;

        let port = match rest.strip_prefix(':') {
            Some(p) => Some(p.parse()?),
            None => None,
        };

        return Ok((host.to_string(), port));
    }

    // a single colon separates host and port; more than one means a
    // bare ipv6 literal with no port.
    match source.split_once(':') {
        Some((host, port)) if !port.contains(':') => Ok((host.to_string(), Some(port.parse()?))),
        _ => Ok((source.to_string(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_and_port() {
        let uri = parse_server_uri("1.2.3.4:3478").unwrap();
        assert_eq!(uri.host, "1.2.3.4");
        assert_eq!(uri.port, Some(3478));
    }

    #[test]
    fn ipv6_literals() {
        let uri = parse_server_uri("[2001:db8::1]:3478").unwrap();
        assert_eq!(uri.host, "2001:db8::1");
        assert_eq!(uri.port, Some(3478));

        let uri = parse_server_uri("2001:db8::1").unwrap();
        assert_eq!(uri.host, "2001:db8::1");
        assert_eq!(uri.port, None);
    }
}
