use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::error::ProxyError;
use crate::registrar::Registrar;
use crate::registry::InMemoryRegistry;
use crate::sip::{parse_message, Request, SipMessage, Via};

/// Largest datagram we accept; anything bigger is truncated by the kernel
const MAX_DATAGRAM: usize = 65535;

/// Authorization callback: `(message, host, port) -> allow?`
pub type RegistrarHandler = Arc<dyn Fn(&Request, &str, u16) -> bool + Send + Sync>;

/// Whether and how registrations are gated before they reach the registrar
#[derive(Clone, Default)]
pub enum RegistrarPolicy {
    /// No callback installed: every registration is accepted
    #[default]
    NoPolicy,
    Policy(RegistrarHandler),
}

impl RegistrarPolicy {
    pub fn from_fn<F>(handler: F) -> Self
    where
        F: Fn(&Request, &str, u16) -> bool + Send + Sync + 'static,
    {
        RegistrarPolicy::Policy(Arc::new(handler))
    }
}

impl fmt::Debug for RegistrarPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrarPolicy::NoPolicy => write!(f, "NoPolicy"),
            RegistrarPolicy::Policy(_) => write!(f, "Policy(<fn>)"),
        }
    }
}

/// UDP registrar proxy that consults a [`RegistrarPolicy`] before letting a
/// REGISTER through to the wrapped [`Registrar`].
pub struct SipProxy {
    registrar: Registrar,
    policy: RegistrarPolicy,
}

impl SipProxy {
    pub fn new(registrar: Registrar, policy: RegistrarPolicy) -> Self {
        Self { registrar, policy }
    }

    /// Bind a UDP socket and build a proxy serving `domain` on it
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        domain: &str,
        default_expiry: Duration,
        policy: RegistrarPolicy,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!("[SIP] Registrar listening on {}", socket.local_addr()?);
        let registry = Arc::new(InMemoryRegistry::new(domain));
        let registrar = Registrar::new(Arc::new(socket), registry, default_expiry);
        Ok(Self::new(registrar, policy))
    }

    pub fn registry(&self) -> &InMemoryRegistry {
        self.registrar.registry()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.registrar.socket().local_addr()
    }

    /// Gate one registration attempt. The callback runs before anything
    /// touches the registry. A panicking callback is reported as a 500 and
    /// leaves the registry untouched.
    pub async fn register(&self, message: &Request, host: &str, port: u16) -> Result<(), ProxyError> {
        match &self.policy {
            RegistrarPolicy::Policy(handler) => {
                let allowed = panic::catch_unwind(AssertUnwindSafe(|| handler(message, host, port)))
                    .map_err(|_| ProxyError::sip(500, "registrar handler panicked"))?;
                if allowed {
                    self.registrar.register(message, host, port).await
                } else {
                    self.registrar.unauthorized(message, host, port).await
                }
            }
            RegistrarPolicy::NoPolicy => self.registrar.register(message, host, port).await,
        }
    }

    /// Handle one inbound datagram from `from`
    pub async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        match parse_message(data) {
            Ok(SipMessage::Request(mut request)) => {
                if let Err(e) = fixup_nat(&mut request, from) {
                    tracing::warn!("[SIP] Dropping request from {} with bad Via: {}", from, e);
                    return;
                }
                self.handle_request(request, from).await;
            }
            Ok(SipMessage::Response(response)) => {
                tracing::debug!(
                    "[SIP] Ignoring response {} {} from {}",
                    response.code,
                    response.reason,
                    from
                );
            }
            Err(e) => {
                tracing::warn!("[SIP] Dropping unparseable datagram from {}: {}", from, e);
            }
        }
    }

    async fn handle_request(&self, request: Request, from: SocketAddr) {
        let host = from.ip().to_string();
        let port = from.port();
        tracing::info!("[SIP] {} {} from {}", request.method, request.uri, from);

        let result = match request.method.as_str() {
            "REGISTER" => self.register(&request, &host, port).await,
            // ACK never gets a response
            "ACK" => Ok(()),
            other => Err(ProxyError::sip(501, format!("method {} not supported", other))),
        };

        if let Err(e) = result {
            let Some(code) = e.status_code() else {
                tracing::warn!("[SIP] Failed to handle {} from {}: {}", request.method, from, e);
                return;
            };
            tracing::info!("[SIP] Answering {} from {} with {}: {}", request.method, from, code, e);
            let response = self.registrar.response_from_request(code, &request);
            if let Err(e) = self.registrar.deliver_response(&response).await {
                tracing::warn!("[SIP] Failed to send {} to {}: {}", code, from, e);
            }
        }
    }

    /// Receive loop: one datagram at a time, each handled to completion
    pub async fn serve(&self) -> io::Result<()> {
        let socket = self.registrar.socket().clone();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (size, from) = socket.recv_from(&mut buf).await?;
            self.handle_datagram(&buf[..size], from).await;
        }
    }

    /// Run [`serve`](Self::serve) on its own task
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let proxy = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = proxy.serve().await {
                tracing::error!("[SIP] Receive loop stopped: {}", e);
            }
        })
    }
}

/// Record where the request really came from in its top Via (RFC 3581)
fn fixup_nat(request: &mut Request, from: SocketAddr) -> Result<(), ProxyError> {
    let Some(top) = request.headers.get("via") else {
        return Err(ProxyError::sip(400, "missing Via header"));
    };
    let mut via = Via::parse(top)?;
    let src_host = from.ip().to_string();

    if via.host != src_host {
        via.set_received(&src_host);
        if via.port != Some(from.port()) {
            via.set_rport(from.port());
        }
    } else if via.rport() == Some(None) {
        via.set_received(&src_host);
        via.set_rport(from.port());
    } else {
        return Ok(());
    }

    request.headers.replace_first("via", via.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registrar::DEFAULT_EXPIRY;
    use crate::sip::{Response, SipUri};
    use std::sync::Mutex;

    fn register_bytes(client: SocketAddr, call_id: &str) -> Vec<u8> {
        register_bytes_expiring(client, call_id, "3600")
    }

    fn register_bytes_expiring(client: SocketAddr, call_id: &str, expires: &str) -> Vec<u8> {
        format!(
            "REGISTER sip:127.0.0.1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP {};branch=z9hG4bK{}\r\n\
             From: <sip:testacc@127.0.0.1>;tag=42\r\n\
             To: <sip:testacc@127.0.0.1>\r\n\
             Call-ID: {}\r\n\
             CSeq: 1 REGISTER\r\n\
             Contact: <sip:testacc@{}>\r\n\
             Expires: {}\r\n\
             Content-Length: 0\r\n\
             \r\n",
            client, call_id, call_id, client, expires
        )
        .into_bytes()
    }

    async fn start(policy: RegistrarPolicy) -> (Arc<SipProxy>, JoinHandle<()>, UdpSocket) {
        let proxy = Arc::new(
            SipProxy::bind("127.0.0.1:0", "127.0.0.1", DEFAULT_EXPIRY, policy)
                .await
                .unwrap(),
        );
        let server = proxy.spawn();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (proxy, server, client)
    }

    async fn exchange(proxy: &SipProxy, client: &UdpSocket, bytes: &[u8]) -> Response {
        client.send_to(bytes, proxy.local_addr().unwrap()).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("timed out waiting for response")
            .unwrap();
        match parse_message(&buf[..n]).unwrap() {
            SipMessage::Response(r) => r,
            other => panic!("expected a response, got {:?}", other),
        }
    }

    fn aor() -> SipUri {
        SipUri::parse("sip:testacc@127.0.0.1").unwrap()
    }

    #[tokio::test]
    async fn test_policy_accepts() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let policy = RegistrarPolicy::from_fn(move |msg, host, port| {
            seen.lock()
                .unwrap()
                .push((msg.headers.get("call-id").unwrap_or("").to_string(), host.to_string(), port));
            true
        });
        let (proxy, server, client) = start(policy).await;
        let client_addr = client.local_addr().unwrap();

        let resp = exchange(&proxy, &client, &register_bytes(client_addr, "accept-1")).await;
        assert_eq!(resp.code, 200);
        assert!(proxy.registry().get_address(&aor()).await.is_ok());

        let calls = calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![("accept-1".to_string(), "127.0.0.1".to_string(), client_addr.port())]
        );
        server.abort();
    }

    #[tokio::test]
    async fn test_policy_rejects() {
        let calls = Arc::new(Mutex::new(0usize));
        let seen = calls.clone();
        let policy = RegistrarPolicy::from_fn(move |_, _, _| {
            *seen.lock().unwrap() += 1;
            false
        });
        let (proxy, server, client) = start(policy).await;
        let client_addr = client.local_addr().unwrap();

        let resp = exchange(&proxy, &client, &register_bytes(client_addr, "reject-1")).await;
        assert_eq!(resp.code, 401);
        assert!(resp.headers.get("www-authenticate").is_some());
        assert!(proxy.registry().is_empty().await);
        assert_eq!(*calls.lock().unwrap(), 1);
        server.abort();
    }

    #[tokio::test]
    async fn test_no_policy_allows() {
        let (proxy, server, client) = start(RegistrarPolicy::NoPolicy).await;
        let client_addr = client.local_addr().unwrap();

        let resp = exchange(&proxy, &client, &register_bytes(client_addr, "open-1")).await;
        assert_eq!(resp.code, 200);
        assert!(proxy.registry().get_address(&aor()).await.is_ok());
        server.abort();
    }

    #[tokio::test]
    async fn test_panicking_handler_answers_500_and_keeps_serving() {
        let policy = RegistrarPolicy::from_fn(|msg, _, _| {
            if msg.headers.get("call-id") == Some("boom") {
                panic!("handler failure");
            }
            true
        });
        let (proxy, server, client) = start(policy).await;
        let client_addr = client.local_addr().unwrap();

        let resp = exchange(&proxy, &client, &register_bytes(client_addr, "boom")).await;
        assert_eq!(resp.code, 500);
        assert!(proxy.registry().is_empty().await);
        assert!(!server.is_finished());

        let resp = exchange(&proxy, &client, &register_bytes(client_addr, "after-boom")).await;
        assert_eq!(resp.code, 200);
        assert!(proxy.registry().get_address(&aor()).await.is_ok());
        server.abort();
    }

    #[tokio::test]
    async fn test_huge_expires_keeps_serving() {
        let (proxy, server, client) = start(RegistrarPolicy::NoPolicy).await;
        let client_addr = client.local_addr().unwrap();

        let resp = exchange(
            &proxy,
            &client,
            &register_bytes_expiring(client_addr, "huge", "18446744073709551615"),
        )
        .await;
        assert_eq!(resp.code, 200);
        assert_eq!(resp.headers.get("expires"), Some(u32::MAX.to_string().as_str()));
        assert!(!server.is_finished());

        let resp = exchange(
            &proxy,
            &client,
            &register_bytes_expiring(client_addr, "normal", "60"),
        )
        .await;
        assert_eq!(resp.code, 200);
        assert_eq!(resp.headers.get("expires"), Some("60"));
        server.abort();
    }

    #[tokio::test]
    async fn test_other_methods_not_implemented() {
        let (proxy, server, client) = start(RegistrarPolicy::NoPolicy).await;
        let client_addr = client.local_addr().unwrap();
        let options = format!(
            "OPTIONS sip:127.0.0.1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP {};branch=z9hG4bKopt\r\n\
             From: <sip:testacc@127.0.0.1>;tag=1\r\n\
             To: <sip:127.0.0.1>\r\n\
             Call-ID: opt-1\r\n\
             CSeq: 1 OPTIONS\r\n\
             \r\n",
            client_addr
        );

        let resp = exchange(&proxy, &client, options.as_bytes()).await;
        assert_eq!(resp.code, 501);
        assert_eq!(resp.headers.get("call-id"), Some("opt-1"));
        server.abort();
    }

    #[tokio::test]
    async fn test_garbage_is_dropped() {
        let (proxy, server, client) = start(RegistrarPolicy::NoPolicy).await;
        let client_addr = client.local_addr().unwrap();
        client
            .send_to(b"not sip at all", proxy.local_addr().unwrap())
            .await
            .unwrap();

        // The loop survives and still answers the next request
        let resp = exchange(&proxy, &client, &register_bytes(client_addr, "after-garbage")).await;
        assert_eq!(resp.code, 200);
        assert_eq!(resp.headers.get("call-id"), Some("after-garbage"));
        server.abort();
    }

    #[test]
    fn test_fixup_nat_records_source() {
        let mut req = Request::new("REGISTER", "sip:127.0.0.1");
        req.headers
            .add("via", "SIP/2.0/UDP 10.0.0.5:5062;branch=z9hG4bK1");
        req.headers.add("via", "SIP/2.0/UDP 10.0.0.9;branch=z9hG4bK0");
        let from: SocketAddr = "192.0.2.7:40000".parse().unwrap();

        fixup_nat(&mut req, from).unwrap();

        let vias: Vec<&str> = req.headers.get_all("via").collect();
        assert_eq!(
            vias[0],
            "SIP/2.0/UDP 10.0.0.5:5062;branch=z9hG4bK1;received=192.0.2.7;rport=40000"
        );
        assert_eq!(vias[1], "SIP/2.0/UDP 10.0.0.9;branch=z9hG4bK0");
    }

    #[test]
    fn test_fixup_nat_fills_requested_rport() {
        let mut req = Request::new("REGISTER", "sip:127.0.0.1");
        req.headers.add("via", "SIP/2.0/UDP 127.0.0.1:5062;branch=z9hG4bK1;rport");
        let from: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        fixup_nat(&mut req, from).unwrap();

        let via = Via::parse(req.headers.get("via").unwrap()).unwrap();
        assert_eq!(via.rport(), Some(Some(40000)));
        assert_eq!(via.received(), Some("127.0.0.1"));
    }
}
