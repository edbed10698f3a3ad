//! Dialing through an optional egress proxy (HTTP CONNECT or SOCKS5)

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

use crate::config::{EgressProxyConfig, EgressProxyProtocol};
use crate::error::{InterposeError, Result};

/// Upper bound on a CONNECT response head from the egress proxy
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Connect to `host:port`, tunnelling through `egress` when configured
pub async fn dial(egress: Option<&EgressProxyConfig>, host: &str, port: u16) -> Result<TcpStream> {
    let target = authority(host, port);

    let Some(egress) = egress else {
        return TcpStream::connect(&target)
            .await
            .map_err(|e| InterposeError::UpstreamDial(format!("connect to {} failed: {}", target, e)));
    };

    let via = authority(&egress.host, egress.port);
    let result = match egress.protocol {
        EgressProxyProtocol::Http => http_connect(egress, &via, host, port).await,
        EgressProxyProtocol::Socks5 => socks5_connect(egress, &via, host, port).await,
    };

    result.map_err(|e| {
        InterposeError::UpstreamDial(format!(
            "connect to {} via {} failed: {}",
            target,
            egress.redacted(),
            e
        ))
    })
}

async fn http_connect(
    proxy: &EgressProxyConfig,
    via: &str,
    host: &str,
    port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let mut stream = TcpStream::connect(via).await?;

    let target = authority(host, port);
    let mut head = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(username) = &proxy.username {
        let credentials = format!("{}:{}", username, proxy.password.as_deref().unwrap_or(""));
        head.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(credentials.as_bytes())
        ));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await?;

    // Read byte-wise so nothing past the response head is consumed.
    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= MAX_CONNECT_RESPONSE {
            anyhow::bail!("CONNECT response head too large");
        }
        if stream.read(&mut byte).await? == 0 {
            anyhow::bail!("egress proxy closed the connection during CONNECT");
        }
        response.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&response);
    let status_line = head.lines().next().unwrap_or_default();
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);

    if !(200..300).contains(&status) {
        anyhow::bail!("CONNECT rejected: {}", status_line);
    }

    Ok(stream)
}

async fn socks5_connect(
    proxy: &EgressProxyConfig,
    via: &str,
    host: &str,
    port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let socket = TcpStream::connect(via).await?;

    let stream = match (&proxy.username, &proxy.password) {
        (Some(username), Some(password)) => {
            Socks5Stream::connect_with_password_and_socket(socket, (host, port), username, password)
                .await?
        }
        _ => Socks5Stream::connect_with_socket(socket, (host, port)).await?,
    };

    Ok(stream.into_inner())
}

/// `host:port`, bracketing bare IPv6 literals
pub fn authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
