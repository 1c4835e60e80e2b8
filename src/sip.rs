use std::fmt;

use crate::error::ParseError;

pub const SIP_VERSION: &str = "SIP/2.0";
pub const DEFAULT_PORT: u16 = 5060;

/// URI and header parameters, in order of appearance. Flag parameters such as
/// `;lr` or `;rport` carry no value.
pub type Params = Vec<(String, Option<String>)>;

/// Header list keyed by lower-case long-form names.
///
/// SIP allows a header to appear several times and order matters for Via, so
/// this is a plain ordered list rather than a map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value of a header, if present
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = normalize_name(name);
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        let name = normalize_name(name);
        self.entries
            .iter()
            .filter(move |(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((normalize_name(name), value.into()));
    }

    /// Replace every value of `name` with a single one
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.add(name, value);
    }

    /// Replace the first occurrence only, keeping its position
    pub fn replace_first(&mut self, name: &str, value: impl Into<String>) {
        let name = normalize_name(name);
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value.into(),
            None => self.entries.push((name, value.into())),
        }
    }

    pub fn remove(&mut self, name: &str) {
        let name = normalize_name(name);
        self.entries.retain(|(n, _)| *n != name);
    }

    /// Copy all values of `name` from another header list
    pub fn copy_from(&mut self, other: &Headers, name: &str) {
        for value in other.get_all(name) {
            self.add(name, value);
        }
    }

    fn write_to(&self, out: &mut String, body_len: usize) {
        for (name, value) in &self.entries {
            if name == "content-length" {
                continue;
            }
            out.push_str(&canonical_name(name));
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n", body_len));
    }
}

/// Expand compact header forms (RFC 3261 section 7.3.3) and lower-case
fn normalize_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    let long = match lower.as_str() {
        "v" => "via",
        "f" => "from",
        "t" => "to",
        "i" => "call-id",
        "m" => "contact",
        "l" => "content-length",
        "c" => "content-type",
        "k" => "supported",
        "s" => "subject",
        "e" => "content-encoding",
        _ => return lower,
    };
    long.to_string()
}

fn canonical_name(name: &str) -> String {
    match name {
        "call-id" => "Call-ID".to_string(),
        "cseq" => "CSeq".to_string(),
        "www-authenticate" => "WWW-Authenticate".to_string(),
        _ => name
            .split('-')
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join("-"),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub uri: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: &str, uri: &str) -> Self {
        Self {
            method: method.to_string(),
            uri: uri.to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub code: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    /// Response with the standard reason phrase for `code`
    pub fn new(code: u16) -> Self {
        Self {
            code,
            reason: reason_phrase(code).to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", SIP_VERSION, self.code, self.reason);
        self.headers.write_to(&mut out, self.body.len());
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        423 => "Interval Too Brief",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Parse a single SIP message from one datagram.
///
/// Accepts CRLF or bare LF line endings and folded header lines. The body is
/// cut to `Content-Length` when the header is present.
pub fn parse_message(data: &[u8]) -> Result<SipMessage, ParseError> {
    // Leading CRLFs are keep-alives (RFC 5626) and carry no message
    let start = data
        .iter()
        .position(|b| *b != b'\r' && *b != b'\n')
        .ok_or_else(|| ParseError::new("empty datagram"))?;
    let data = &data[start..];

    let (head, body) = split_head(data);
    let head = std::str::from_utf8(head).map_err(|_| ParseError::new("message head is not UTF-8"))?;

    let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
    let start_line = lines.next().ok_or_else(|| ParseError::new("missing start line"))?;

    let mut headers = Headers::new();
    let mut current: Option<(String, String)> = None;
    for line in lines {
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            match current.as_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => return Err(ParseError::new("continuation line before any header")),
            }
            continue;
        }
        if let Some((name, value)) = current.take() {
            headers.add(&name, value);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::new(format!("malformed header line: {}", line)))?;
        current = Some((name.trim().to_string(), value.trim().to_string()));
    }
    if let Some((name, value)) = current.take() {
        headers.add(&name, value);
    }

    let body = match headers.get("content-length") {
        Some(len) => {
            let len: usize = len
                .trim()
                .parse()
                .map_err(|_| ParseError::new(format!("invalid Content-Length: {}", len)))?;
            body[..len.min(body.len())].to_vec()
        }
        None => body.to_vec(),
    };

    if start_line.starts_with("SIP/") {
        let mut parts = start_line.splitn(3, ' ');
        let _version = parts.next();
        let code = parts
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| ParseError::new(format!("invalid status line: {}", start_line)))?;
        let reason = parts.next().unwrap_or("").trim().to_string();
        Ok(SipMessage::Response(Response {
            code,
            reason,
            headers,
            body,
        }))
    } else {
        let parts: Vec<&str> = start_line.split_whitespace().collect();
        if parts.len() != 3 || !parts[2].starts_with("SIP/") {
            return Err(ParseError::new(format!("invalid request line: {}", start_line)));
        }
        Ok(SipMessage::Request(Request {
            method: parts[0].to_string(),
            uri: parts[1].to_string(),
            headers,
            body,
        }))
    }
}

fn split_head(data: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find(data, b"\r\n\r\n") {
        return (&data[..pos], &data[pos + 4..]);
    }
    if let Some(pos) = find(data, b"\n\n") {
        return (&data[..pos], &data[pos + 2..]);
    }
    (data, &data[data.len()..])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub fn parse_params(text: &str) -> Params {
    text.split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.trim().to_ascii_lowercase(), Some(v.trim().trim_matches('"').to_string())),
            None => (p.to_ascii_lowercase(), None),
        })
        .collect()
}

/// Look up a parameter; `Some(None)` means a flag without value
pub fn param<'a>(params: &'a Params, name: &str) -> Option<Option<&'a str>> {
    params
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_deref())
}

fn set_param(params: &mut Params, name: &str, value: Option<String>) {
    match params.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        Some(entry) => entry.1 = value,
        None => params.push((name.to_string(), value)),
    }
}

fn write_params(f: &mut fmt::Formatter<'_>, params: &Params) -> fmt::Result {
    for (k, v) in params {
        match v {
            Some(v) => write!(f, ";{}={}", k, v)?,
            None => write!(f, ";{}", k)?,
        }
    }
    Ok(())
}

/// Split `host[:port]`, handling bracketed IPv6 literals
fn split_host_port(text: &str) -> Result<(String, Option<u16>), ParseError> {
    let text = text.trim();
    let (host, port) = if let Some(rest) = text.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| ParseError::new(format!("unterminated IPv6 host: {}", text)))?;
        let port = rest[end + 1..].strip_prefix(':');
        (rest[..end].to_string(), port)
    } else {
        match text.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), Some(p)),
            None => (text.to_string(), None),
        }
    };
    if host.is_empty() {
        return Err(ParseError::new(format!("missing host in {}", text)));
    }
    let port = match port {
        Some(p) => Some(
            p.parse::<u16>()
                .map_err(|_| ParseError::new(format!("invalid port: {}", p)))?,
        ),
        None => None,
    };
    Ok((host, port))
}

fn write_host(f: &mut fmt::Formatter<'_>, host: &str, port: Option<u16>) -> fmt::Result {
    if host.contains(':') {
        write!(f, "[{}]", host)?;
    } else {
        write!(f, "{}", host)?;
    }
    if let Some(port) = port {
        write!(f, ":{}", port)?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct SipUri {
    pub scheme: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
    pub headers: Option<String>,
}

impl SipUri {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let text = text.trim();
        let (scheme, rest) = text
            .split_once(':')
            .ok_or_else(|| ParseError::new(format!("not a SIP URI: {}", text)))?;
        let scheme = scheme.to_ascii_lowercase();
        if scheme != "sip" && scheme != "sips" {
            return Err(ParseError::new(format!("unsupported URI scheme: {}", scheme)));
        }

        let (rest, headers) = match rest.split_once('?') {
            Some((r, h)) => (r, Some(h.to_string())),
            None => (rest, None),
        };
        let (rest, params) = match rest.split_once(';') {
            Some((r, p)) => (r, parse_params(p)),
            None => (rest, Vec::new()),
        };
        let (userinfo, hostport) = match rest.rsplit_once('@') {
            Some((u, h)) => (Some(u), h),
            None => (None, rest),
        };
        let (username, password) = match userinfo {
            Some(u) => match u.split_once(':') {
                Some((name, pw)) => (Some(name.to_string()), Some(pw.to_string())),
                None => (Some(u.to_string()), None),
            },
            None => (None, None),
        };
        let (host, port) = split_host_port(hostport)?;

        Ok(Self {
            scheme,
            username,
            password,
            host,
            port,
            params,
            headers,
        })
    }

    /// Registry key for the address-of-record
    pub fn user_key(&self) -> String {
        self.username.clone().unwrap_or_default()
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.username {
            write!(f, "{}", user)?;
            if let Some(pw) = &self.password {
                write!(f, ":{}", pw)?;
            }
            write!(f, "@")?;
        }
        write_host(f, &self.host, self.port)?;
        write_params(f, &self.params)?;
        if let Some(h) = &self.headers {
            write!(f, "?{}", h)?;
        }
        Ok(())
    }
}

/// A parsed name-addr or addr-spec, as found in To, From and Contact
#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    pub display_name: String,
    pub uri: SipUri,
    pub params: Params,
}

/// Parse `"Name" <sip:uri;uri-params>;header-params` or a bare
/// `sip:uri;header-params`. In the bare form everything after the first `;`
/// belongs to the header (RFC 3261 section 20).
pub fn parse_address(text: &str) -> Result<Address, ParseError> {
    let text = text.trim();
    if let Some(open) = text.find('<') {
        let close = text[open..]
            .find('>')
            .map(|c| c + open)
            .ok_or_else(|| ParseError::new(format!("unterminated address: {}", text)))?;
        let display_name = text[..open].trim().trim_matches('"').to_string();
        let uri = SipUri::parse(&text[open + 1..close])?;
        let params = parse_params(&text[close + 1..]);
        Ok(Address {
            display_name,
            uri,
            params,
        })
    } else {
        let (uri, params) = match text.split_once(';') {
            Some((u, p)) => (u, parse_params(p)),
            None => (text, Vec::new()),
        };
        Ok(Address {
            display_name: String::new(),
            uri: SipUri::parse(uri)?,
            params,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Via {
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl Via {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let text = text.trim();
        let (protocol, rest) = text
            .split_once(char::is_whitespace)
            .ok_or_else(|| ParseError::new(format!("malformed Via: {}", text)))?;
        let transport = protocol
            .rsplit('/')
            .next()
            .filter(|_| protocol.to_ascii_uppercase().starts_with("SIP/2.0/"))
            .ok_or_else(|| ParseError::new(format!("malformed Via protocol: {}", protocol)))?
            .to_ascii_uppercase();
        let (sent_by, params) = match rest.split_once(';') {
            Some((s, p)) => (s, parse_params(p)),
            None => (rest, Vec::new()),
        };
        let (host, port) = split_host_port(sent_by)?;
        Ok(Self {
            transport,
            host,
            port,
            params,
        })
    }

    pub fn received(&self) -> Option<&str> {
        param(&self.params, "received").flatten()
    }

    /// `None` when absent, `Some(None)` when requested without a value
    pub fn rport(&self) -> Option<Option<u16>> {
        param(&self.params, "rport").map(|v| v.and_then(|p| p.parse().ok()))
    }

    pub fn set_received(&mut self, host: &str) {
        set_param(&mut self.params, "received", Some(host.to_string()));
    }

    pub fn set_rport(&mut self, port: u16) {
        set_param(&mut self.params, "rport", Some(port.to_string()));
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ", SIP_VERSION, self.transport)?;
        write_host(f, &self.host, self.port)?;
        write_params(f, &self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &str = "REGISTER sip:127.0.0.1 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 10.0.0.5:5062;branch=z9hG4bK776;rport\r\n\
        From: <sip:testacc@127.0.0.1>;tag=abc\r\n\
        To: \"Test\" <sip:testacc@127.0.0.1>\r\n\
        Call-ID: 1234@host\r\n\
        CSeq: 1 REGISTER\r\n\
        Contact: <sip:testacc@10.0.0.5:5062;transport=udp>;expires=600\r\n\
        Content-Length: 0\r\n\
        \r\n";

    #[test]
    fn test_parse_register() {
        let msg = parse_message(REGISTER.as_bytes()).unwrap();
        let SipMessage::Request(req) = msg else {
            panic!("expected a request");
        };
        assert_eq!(req.method, "REGISTER");
        assert_eq!(req.uri, "sip:127.0.0.1");
        assert_eq!(req.headers.get("call-id"), Some("1234@host"));
        assert_eq!(req.headers.get("CSeq"), Some("1 REGISTER"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_compact_headers_and_bare_lf() {
        let raw = "REGISTER sip:example.com SIP/2.0\n\
            v: SIP/2.0/UDP host;branch=z9hG4bK1\n\
            t: sip:bob@example.com\n\
            i: abc\n\
            m: *\n\
            \n";
        let SipMessage::Request(req) = parse_message(raw.as_bytes()).unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(req.headers.get("to"), Some("sip:bob@example.com"));
        assert_eq!(req.headers.get("contact"), Some("*"));
        assert_eq!(req.headers.get("Call-ID"), Some("abc"));
    }

    #[test]
    fn test_folded_header() {
        let raw = "OPTIONS sip:a@b SIP/2.0\r\nSubject: hello\r\n world\r\n\r\n";
        let SipMessage::Request(req) = parse_message(raw.as_bytes()).unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(req.headers.get("subject"), Some("hello world"));
    }

    #[test]
    fn test_body_cut_to_content_length() {
        let raw = "MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 5\r\n\r\nhello trailing";
        let SipMessage::Request(req) = parse_message(raw.as_bytes()).unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(req.body, b"hello");
    }

    #[test]
    fn test_parse_response() {
        let raw = "SIP/2.0 401 Unauthorized\r\nCall-ID: x\r\n\r\n";
        let SipMessage::Response(resp) = parse_message(raw.as_bytes()).unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(resp.code, 401);
        assert_eq!(resp.reason, "Unauthorized");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_message(b"\r\n\r\n").is_err());
        assert!(parse_message(b"hello world\r\n\r\n").is_err());
        assert!(parse_message(b"SIP/2.0 abc OK\r\n\r\n").is_err());
        assert!(parse_message(b"REGISTER sip:a SIP/2.0\r\nNoColonHere\r\n\r\n").is_err());
    }

    #[test]
    fn test_response_serialization() {
        let mut resp = Response::new(200);
        resp.headers.add("call-id", "abc");
        resp.headers.add("cseq", "1 REGISTER");
        resp.headers.add("www-authenticate", "Digest realm=\"x\"");
        let text = String::from_utf8(resp.to_bytes()).unwrap();
        assert!(text.starts_with("SIP/2.0 200 OK\r\n"));
        assert!(text.contains("Call-ID: abc\r\n"));
        assert!(text.contains("CSeq: 1 REGISTER\r\n"));
        assert!(text.contains("WWW-Authenticate: Digest realm=\"x\"\r\n"));
        assert!(text.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn test_sip_uri() {
        let uri = SipUri::parse("sip:testacc:secret@127.0.0.1:5060;transport=udp").unwrap();
        assert_eq!(uri.username.as_deref(), Some("testacc"));
        assert_eq!(uri.password.as_deref(), Some("secret"));
        assert_eq!(uri.host, "127.0.0.1");
        assert_eq!(uri.port, Some(5060));
        assert_eq!(param(&uri.params, "transport"), Some(Some("udp")));
        assert_eq!(uri.to_string(), "sip:testacc:secret@127.0.0.1:5060;transport=udp");

        let v6 = SipUri::parse("sip:alice@[::1]:5070").unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "sip:alice@[::1]:5070");

        assert!(SipUri::parse("http://example.com").is_err());
        assert!(SipUri::parse("sip:alice@host:notaport").is_err());
    }

    #[test]
    fn test_parse_address_forms() {
        let addr = parse_address("\"Test\" <sip:testacc@127.0.0.1;lr>;tag=xyz").unwrap();
        assert_eq!(addr.display_name, "Test");
        assert_eq!(addr.uri.user_key(), "testacc");
        assert_eq!(param(&addr.uri.params, "lr"), Some(None));
        assert_eq!(param(&addr.params, "tag"), Some(Some("xyz")));

        let bare = parse_address("sip:bob@example.com;tag=1").unwrap();
        assert!(bare.uri.params.is_empty());
        assert_eq!(param(&bare.params, "tag"), Some(Some("1")));
    }

    #[test]
    fn test_via() {
        let mut via = Via::parse("SIP/2.0/UDP 10.0.0.5:5062;branch=z9hG4bK776;rport").unwrap();
        assert_eq!(via.transport, "UDP");
        assert_eq!(via.host, "10.0.0.5");
        assert_eq!(via.port, Some(5062));
        assert_eq!(param(&via.params, "branch"), Some(Some("z9hG4bK776")));
        assert_eq!(via.rport(), Some(None));

        via.set_received("192.0.2.1");
        via.set_rport(4000);
        assert_eq!(via.rport(), Some(Some(4000)));
        assert_eq!(
            via.to_string(),
            "SIP/2.0/UDP 10.0.0.5:5062;branch=z9hG4bK776;rport=4000;received=192.0.2.1"
        );

        assert!(Via::parse("garbage").is_err());
    }
}
