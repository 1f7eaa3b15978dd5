//! Cloud endpoint client.

use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::io::Read;
use std::time::Duration;
use url::Url;

use super::item::Attachment;
use crate::error::CloudError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_RESPONSE_BYTES: u64 = 1024 * 1024;

/// The gateway's only path to the cloud.
pub trait CloudTransport: Send + Sync {
    /// Lightweight reachability check.
    fn health(&self) -> Result<(), CloudError>;

    /// POST a JSON document to `path`.
    fn post_json(&self, path: &str, body: &Value) -> Result<(), CloudError>;

    /// Upload an image and return its cloud URL.
    fn upload_image(&self, filename: &str, attachment: &Attachment) -> Result<String, CloudError>;
}

#[derive(Clone, Debug)]
pub struct CloudSettings {
    pub base_url: String,
    pub api_token: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub health_timeout: Duration,
}

impl CloudSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }
}

/// JSON-over-HTTPS client with bearer-token auth.
pub struct HttpCloudClient {
    base: Url,
    token: Option<String>,
    client: Client,
    health_timeout: Duration,
}

impl HttpCloudClient {
    pub fn new(settings: &CloudSettings) -> anyhow::Result<Self> {
        let mut base = Url::parse(&settings.base_url)?;
        if !matches!(base.scheme(), "http" | "https") {
            anyhow::bail!("cloud url must be http(s), got '{}'", settings.base_url);
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self {
            base,
            token: settings.api_token.clone().filter(|t| !t.is_empty()),
            client,
            health_timeout: settings.health_timeout,
        })
    }

    fn url(&self, path: &str) -> Result<Url, CloudError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| CloudError::InvalidResponse(format!("bad endpoint '{}': {}", path, e)))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send and turn any non-success status into `CloudError::Status`.
    fn send(&self, request: RequestBuilder) -> Result<Response, CloudError> {
        let response = self
            .authorized(request)
            .send()
            .map_err(|e| CloudError::Unreachable(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(CloudError::Status {
            status: status.as_u16(),
            body: read_body(response).unwrap_or_default(),
        })
    }
}

fn read_body(response: Response) -> Result<String, CloudError> {
    let mut body = String::new();
    response
        .take(MAX_RESPONSE_BYTES)
        .read_to_string(&mut body)
        .map_err(|e| CloudError::InvalidResponse(e.to_string()))?;
    Ok(body)
}

fn image_part(filename: &str, attachment: &Attachment) -> Part {
    let part = Part::bytes(attachment.data.clone()).file_name(filename.to_string());
    match part.mime_str(&attachment.content_type) {
        Ok(part) => part,
        Err(err) => {
            log::warn!(
                "image content type '{}' rejected ({}); uploading untyped",
                attachment.content_type,
                err
            );
            Part::bytes(attachment.data.clone()).file_name(filename.to_string())
        }
    }
}

impl CloudTransport for HttpCloudClient {
    fn health(&self) -> Result<(), CloudError> {
        let url = self.url("health")?;
        self.send(self.client.get(url).timeout(self.health_timeout))?;
        Ok(())
    }

    fn post_json(&self, path: &str, body: &Value) -> Result<(), CloudError> {
        let url = self.url(path)?;
        self.send(self.client.post(url).json(body))?;
        Ok(())
    }

    fn upload_image(&self, filename: &str, attachment: &Attachment) -> Result<String, CloudError> {
        let url = self.url("images/upload")?;
        let form = Form::new().part("file", image_part(filename, attachment));
        let response = self.send(self.client.post(url).multipart(form))?;
        let text = read_body(response)?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| CloudError::InvalidResponse(format!("upload response: {}", e)))?;
        value
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CloudError::InvalidResponse("upload response has no url".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::thread::JoinHandle;

    /// Accept one connection, capture the raw request and answer with `status`.
    fn serve_once(status: u16, body: &'static str) -> (CloudSettings, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut settings = CloudSettings::new(format!(
            "http://{}/api/v1",
            listener.local_addr().unwrap()
        ));
        settings.request_timeout = Duration::from_secs(5);
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let request = read_request(&mut stream);
            let reply = format!(
                "HTTP/1.1 {} Test\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(reply.as_bytes()).unwrap();
            request
        });
        (settings, handle)
    }

    fn read_request(stream: &mut TcpStream) -> Vec<u8> {
        let mut raw = Vec::new();
        let mut chunk = [0u8; 4096];
        while !request_complete(&raw) {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => raw.extend_from_slice(&chunk[..n]),
            }
        }
        raw
    }

    fn request_complete(raw: &[u8]) -> bool {
        let Some(end) = raw.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let head = String::from_utf8_lossy(&raw[..end]).to_ascii_lowercase();
        let body = &raw[end + 4..];
        let length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok());
        match length {
            Some(length) => body.len() >= length,
            None if head.contains("transfer-encoding: chunked") => body.ends_with(b"0\r\n\r\n"),
            None => true,
        }
    }

    fn jpeg() -> Attachment {
        Attachment {
            content_type: "image/jpeg".into(),
            data: vec![0xFF, 0xD8, 0xFF, 0xE0],
        }
    }

    #[test]
    fn joins_paths_under_base() {
        let client = HttpCloudClient::new(&CloudSettings::new("https://cloud.example/api/v1")).unwrap();
        assert_eq!(
            client.url("/detections").unwrap().as_str(),
            "https://cloud.example/api/v1/detections"
        );
        assert_eq!(
            client.url("/field_nodes/n1/data").unwrap().as_str(),
            "https://cloud.example/api/v1/field_nodes/n1/data"
        );
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(HttpCloudClient::new(&CloudSettings::new("ftp://cloud.example")).is_err());
    }

    #[test]
    fn upload_sends_multipart_file_with_bearer_token() {
        let (mut settings, server) = serve_once(200, r#"{"url":"https://cdn.example/a.jpg"}"#);
        settings.api_token = Some("field-token".into());
        let client = HttpCloudClient::new(&settings).unwrap();

        let url = client.upload_image("a.jpg", &jpeg()).unwrap();
        assert_eq!(url, "https://cdn.example/a.jpg");

        let request = String::from_utf8_lossy(&server.join().unwrap()).to_ascii_lowercase();
        assert!(request.starts_with("post /api/v1/images/upload "));
        assert!(request.contains("authorization: bearer field-token"));
        assert!(request.contains("content-type: multipart/form-data; boundary="));
        assert!(request.contains("name=\"file\"; filename=\"a.jpg\""));
        assert!(request.contains("content-type: image/jpeg"));
    }

    #[test]
    fn hostile_filename_cannot_inject_part_headers() {
        let (settings, server) = serve_once(200, r#"{"url":"https://cdn.example/x"}"#);
        let client = HttpCloudClient::new(&settings).unwrap();

        client
            .upload_image("x\"\r\nX-Evil: 1\r\n\r\n.jpg", &jpeg())
            .unwrap();

        let request = String::from_utf8_lossy(&server.join().unwrap()).into_owned();
        assert!(!request.contains("\r\nX-Evil"));
        assert!(!request.contains("filename=\"x\"\r\n"));
    }

    #[test]
    fn error_status_is_reported_with_body() {
        let (settings, server) = serve_once(500, r#"{"error":"database down"}"#);
        let client = HttpCloudClient::new(&settings).unwrap();

        let err = client
            .post_json("/detections", &json!({"camera": "trail"}))
            .unwrap_err();
        match err {
            CloudError::Status { status, body } => {
                assert_eq!(status, 500);
                assert!(body.contains("database down"));
            }
            other => panic!("expected status error, got {:?}", other),
        }

        let request = String::from_utf8_lossy(&server.join().unwrap()).into_owned();
        assert!(request.starts_with("POST /api/v1/detections "));
        assert!(request.contains(r#"{"camera":"trail"}"#));
        assert!(!request.to_ascii_lowercase().contains("authorization:"));
    }

    #[test]
    fn unreachable_host_is_classified_as_unreachable() {
        let mut settings = CloudSettings::new("http://127.0.0.1:9");
        settings.connect_timeout = Duration::from_millis(200);
        settings.health_timeout = Duration::from_millis(200);
        let client = HttpCloudClient::new(&settings).unwrap();
        assert!(matches!(client.health(), Err(CloudError::Unreachable(_))));
    }
}
