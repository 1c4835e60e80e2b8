use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use md5::compute as md5_compute;
use tokio::net::UdpSocket;
use tokio::time::Duration;

use crate::error::ProxyError;
use crate::registry::{InMemoryRegistry, Registration};
use crate::sip::{self, parse_address, Request, Response, SipUri, Via};

/// Expiry granted when the REGISTER names none
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(3600);

/// Longest binding granted; larger requests are cut down to this
pub const MAX_EXPIRY: Duration = Duration::from_secs(u32::MAX as u64);

/// Base registrar behaviour: records bindings, answers with 200, 401 or an
/// error status. Allows every user that reaches it; gating is done by the
/// proxy that owns it.
pub struct Registrar {
    socket: Arc<UdpSocket>,
    registry: Arc<InMemoryRegistry>,
    default_expiry: Duration,
}

impl Registrar {
    pub fn new(socket: Arc<UdpSocket>, registry: Arc<InMemoryRegistry>, default_expiry: Duration) -> Self {
        Self {
            socket,
            registry,
            default_expiry,
        }
    }

    pub fn registry(&self) -> &Arc<InMemoryRegistry> {
        &self.registry
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    /// Domain the registrar serves, also used as the digest realm
    pub fn host(&self) -> &str {
        self.registry.domain()
    }

    /// Accept a registration: record the Contact binding (or report the
    /// current one when there is no Contact) and answer 200.
    /// `Expires: 0` removes the binding instead.
    pub async fn register(&self, message: &Request, host: &str, port: u16) -> Result<(), ProxyError> {
        tracing::debug!("[Registrar] REGISTER from {}:{}", host, port);
        let to = message
            .headers
            .get("to")
            .ok_or_else(|| ProxyError::sip(400, "missing To header"))?;
        let to_uri = parse_address(to)?.uri;
        let contact = message.headers.get("contact");

        let expires_header = message.headers.get("expires").map(str::trim);
        if expires_header == Some("0") {
            return self.unregister(message, &to_uri, contact).await;
        }

        let registration = match contact {
            Some(contact) => {
                let mut contact = parse_address(contact)?;
                // A Contact without port is reachable where the datagram came from
                if contact.uri.port.is_none() {
                    contact.uri.port = Some(port);
                }

                let expires = match expires_header {
                    Some(value) => Duration::from_secs(
                        value
                            .parse()
                            .map_err(|_| ProxyError::sip(400, format!("invalid Expires: {}", value)))?,
                    ),
                    None => sip::param(&contact.params, "expires")
                        .flatten()
                        .and_then(|v| v.parse().ok())
                        .map(Duration::from_secs)
                        .unwrap_or(self.default_expiry),
                }
                .min(MAX_EXPIRY);
                if expires.is_zero() {
                    return self
                        .unregister(message, &to_uri, message.headers.get("contact"))
                        .await;
                }

                let domain_uri = SipUri::parse(&message.uri)?;
                self.registry
                    .register_address(&domain_uri, &to_uri, &contact.uri, expires)
                    .await?
            }
            None => self.registry.get_registration_info(&to_uri).await?,
        };

        self.send_registration(200, message, &registration).await
    }

    pub async fn unregister(
        &self,
        message: &Request,
        to_uri: &SipUri,
        contact: Option<&str>,
    ) -> Result<(), ProxyError> {
        if let Some(expires) = message.headers.get("expires") {
            expires
                .trim()
                .parse::<u64>()
                .map_err(|_| ProxyError::sip(400, format!("invalid Expires: {}", expires)))?;
        }
        tracing::debug!(
            "[Registrar] Unregister {} (contact {})",
            to_uri,
            contact.unwrap_or("none")
        );

        let registration = self.registry.unregister_address(to_uri).await?;
        let mut response = self.response_from_request(200, message);
        response.headers.add("contact", format!("<{}>", registration.contact));
        response.headers.add("expires", "0");
        self.deliver_response(&response).await
    }

    /// Reject a registration with 401 and a Digest challenge
    pub async fn unauthorized(&self, message: &Request, host: &str, port: u16) -> Result<(), ProxyError> {
        tracing::info!("[Registrar] Rejecting REGISTER from {}:{}", host, port);
        let mut response = self.response_from_request(401, message);
        response.headers.add("www-authenticate", self.digest_challenge());
        self.deliver_response(&response).await
    }

    fn digest_challenge(&self) -> String {
        let nonce = format!("{:x}", md5_compute(uuid::Uuid::new_v4().as_bytes()));
        let opaque = format!("{:x}", md5_compute(uuid::Uuid::new_v4().as_bytes()));
        format!(
            "Digest nonce=\"{}\",opaque=\"{}\",qop=\"auth\",algorithm=\"MD5\",realm=\"{}\"",
            nonce,
            opaque,
            self.host()
        )
    }

    async fn send_registration(
        &self,
        code: u16,
        message: &Request,
        registration: &Registration,
    ) -> Result<(), ProxyError> {
        let mut response = self.response_from_request(code, message);
        response.headers.add("contact", format!("<{}>", registration.contact));
        response
            .headers
            .add("expires", registration.seconds_to_expiry.to_string());
        self.deliver_response(&response).await
    }

    /// Response skeleton echoing the request's dialog-identifying headers
    pub fn response_from_request(&self, code: u16, request: &Request) -> Response {
        let mut response = Response::new(code);
        response.headers.copy_from(&request.headers, "via");
        response.headers.copy_from(&request.headers, "from");
        if let Some(to) = request.headers.get("to") {
            let to = if to.contains(";tag=") || code == 100 {
                to.to_string()
            } else {
                format!("{};tag={}", to, &uuid::Uuid::new_v4().simple().to_string()[..16])
            };
            response.headers.add("to", to);
        }
        response.headers.copy_from(&request.headers, "call-id");
        response.headers.copy_from(&request.headers, "cseq");
        response
    }

    /// Send a response to the address named by its top Via
    /// (`received`/`rport` win over the sent-by address, RFC 3581)
    pub async fn deliver_response(&self, response: &Response) -> Result<(), ProxyError> {
        let via = response
            .headers
            .get("via")
            .ok_or_else(|| ProxyError::sip(400, "response has no Via"))?;
        let via = Via::parse(via)?;
        let host = via.received().unwrap_or(&via.host).to_string();
        let port = via.rport().flatten().or(via.port).unwrap_or(sip::DEFAULT_PORT);

        let dest: SocketAddr = match host.parse::<std::net::IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, port),
            Err(_) => tokio::net::lookup_host((host.as_str(), port))
                .await?
                .next()
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no addresses found for {}", host),
                    )
                })?,
        };

        let bytes = response.to_bytes();
        self.socket.send_to(&bytes, dest).await?;
        tracing::debug!(
            "[Registrar] Sent {} {} to {} ({} bytes)",
            response.code,
            response.reason,
            dest,
            bytes.len()
        );
        Ok(())
    }
}
