use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(750);
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Checks whether something answers on `localhost:<port>`, retrying a few
/// times so a transient hiccup does not flip a healthy service.
pub async fn check_port(port: u16) -> bool {
    check_port_with_retries(port, DEFAULT_RETRIES, DEFAULT_RETRY_DELAY, DEFAULT_DIAL_TIMEOUT).await
}

/// Single-attempt variant for hot paths.
pub async fn check_port_quick(port: u16) -> bool {
    check_port_with_retries(port, 1, Duration::ZERO, Duration::from_secs(1)).await
}

/// Dials `localhost:<port>` up to `retries` times, `delay` apart, each
/// attempt bounded by `timeout`. Returns true on the first success.
pub async fn check_port_with_retries(
    port: u16,
    retries: u32,
    delay: Duration,
    timeout: Duration,
) -> bool {
    let addr = format!("localhost:{port}");
    for attempt in 1..=retries {
        match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => return true,
            Ok(Err(e)) => debug!("TCP probe failed for {}: {}", addr, e),
            Err(_) => debug!("TCP probe timed out for {}", addr),
        }
        if attempt < retries {
            tokio::time::sleep(delay).await;
        }
    }
    false
}

/// Checks if an HTTP URL is reachable and returns a success status code.
pub async fn check_http(url: &str) -> bool {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build();

    match client {
        Ok(client) => match client.get(url).send().await {
            Ok(res) => res.status().is_success(),
            Err(e) => {
                debug!("HTTP probe failed for {}: {}", url, e);
                false
            }
        },
        Err(e) => {
            debug!("Failed to build HTTP client: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe_succeeds_against_a_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        assert!(check_port_quick(port).await);
        assert!(check_port(port).await);
    }

    #[tokio::test]
    async fn quick_probe_fails_when_nothing_listens() {
        // Bind and immediately drop to find a port that is closed right now.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        assert!(!check_port_quick(port).await);
    }
}
