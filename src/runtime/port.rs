use tokio::net::TcpListener;

/// Find the first port >= `preferred` that accepts a trial bind on loopback.
///
/// Ports are probed one after another. After `max_attempts` failed probes the last
/// probed port is returned anyway, so the dev server itself fails later with the OS
/// error instead of this function inventing one.
///
/// The probe listener is dropped before the dev server binds, so another process can
/// claim the port in between. That race is accepted for a single-user local tool.
pub async fn find_available_port(preferred: u16, max_attempts: u16) -> u16 {
    let mut port = preferred;
    let attempts = max_attempts.max(1);
    for attempt in 0..attempts {
        if is_port_free(port).await {
            return port;
        }
        tracing::debug!("port {port} is busy");
        if attempt + 1 == attempts || port == u16::MAX {
            break;
        }
        port += 1;
    }
    tracing::warn!(
        "no free port found in {attempts} attempts from {preferred}; falling back to {port}"
    );
    port
}

async fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ephemeral_port() -> Option<u16> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.ok()?;
        listener.local_addr().ok().map(|addr| addr.port())
    }

    #[tokio::test]
    async fn returns_preferred_port_when_free() {
        let Some(port) = ephemeral_port().await else {
            return;
        };
        assert_eq!(find_available_port(port, 5).await, port);
    }

    #[tokio::test]
    async fn skips_occupied_ports() {
        let Some(base) = ephemeral_port().await else {
            return;
        };
        if base > u16::MAX - 10 {
            return;
        }
        let mut held = Vec::new();
        for port in base..base + 5 {
            let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await else {
                // Someone else owns part of the range; nothing deterministic to assert.
                return;
            };
            held.push(listener);
        }
        if !is_port_free(base + 5).await {
            return;
        }

        assert_eq!(find_available_port(base, 10).await, base + 5);
        drop(held);
    }

    #[tokio::test]
    async fn returns_last_probed_port_after_exhausting_attempts() {
        let Some(base) = ephemeral_port().await else {
            return;
        };
        if base > u16::MAX - 4 {
            return;
        }
        let mut held = Vec::new();
        for port in base..base + 3 {
            let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await else {
                return;
            };
            held.push(listener);
        }

        assert_eq!(find_available_port(base, 3).await, base + 2);
        drop(held);
    }
}
